use std::path::PathBuf;
use std::time::Duration;

use batchload_storage::RetryPolicy;

use crate::matcher::MatchMode;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub chunksize: usize,
    pub low_memory: bool,
    pub retry_delay_secs: u64,
    pub retry_max_attempts: Option<u32>,
    pub retry_exponential: bool,
    pub entities_path: PathBuf,
    pub db_config_path: Option<PathBuf>,
    pub db_section: String,
    pub database_url: Option<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            chunksize: 1000,
            low_memory: false,
            retry_delay_secs: 5,
            retry_max_attempts: None,
            retry_exponential: false,
            entities_path: PathBuf::from("entities.yaml"),
            db_config_path: None,
            db_section: "postgres".to_string(),
            database_url: None,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_parse("BATCHLOAD_BATCH_SIZE").unwrap_or(defaults.batch_size),
            chunksize: env_parse("BATCHLOAD_CHUNKSIZE").unwrap_or(defaults.chunksize),
            low_memory: env_flag("BATCHLOAD_LOW_MEMORY").unwrap_or(defaults.low_memory),
            retry_delay_secs: env_parse("BATCHLOAD_RETRY_DELAY_SECS")
                .unwrap_or(defaults.retry_delay_secs),
            retry_max_attempts: env_parse("BATCHLOAD_RETRY_MAX_ATTEMPTS"),
            retry_exponential: env_flag("BATCHLOAD_RETRY_EXPONENTIAL")
                .unwrap_or(defaults.retry_exponential),
            entities_path: std::env::var("BATCHLOAD_ENTITIES")
                .map(PathBuf::from)
                .unwrap_or(defaults.entities_path),
            db_config_path: std::env::var("BATCHLOAD_DB_CONFIG").ok().map(PathBuf::from),
            db_section: std::env::var("BATCHLOAD_DB_SECTION").unwrap_or(defaults.db_section),
            database_url: std::env::var("DATABASE_URL").ok(),
        }
    }

    pub fn match_mode(&self) -> MatchMode {
        if self.low_memory {
            MatchMode::LowMemory
        } else {
            MatchMode::PerRow
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.retry_delay_secs);
        match (self.retry_max_attempts, self.retry_exponential) {
            (Some(max), true) => {
                RetryPolicy::bounded_exponential(max, delay, delay.saturating_mul(32))
            }
            (Some(max), false) => RetryPolicy {
                max_attempts: Some(max.max(1)),
                ..RetryPolicy::unlimited(delay)
            },
            (None, _) => RetryPolicy::unlimited(delay),
        }
    }
}
