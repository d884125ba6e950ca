//! Connection settings for the relational store.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

/// One section of the connection config file, e.g.
///
/// ```yaml
/// postgres:
///   user: loader
///   password: secret
///   host: db.internal
///   port: 5432
///   database: production
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    /// Database used when running in test mode.
    #[serde(default = "default_test_database")]
    pub test_database: String,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "production".to_string()
}

fn default_test_database() -> String {
    "dev".to_string()
}

fn default_max_connections() -> u32 {
    4
}

impl StoreConfig {
    pub fn from_yaml_section(text: &str, section: &str) -> Result<Self> {
        let mut sections: BTreeMap<String, StoreConfig> =
            serde_yaml::from_str(text).context("parsing store config")?;
        sections
            .remove(section)
            .with_context(|| format!("store config has no section `{section}`"))
    }

    pub fn load_section(path: impl AsRef<Path>, section: &str) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_section(&text, section)
            .with_context(|| format!("loading {}", path.display()))
    }

    pub fn database_name(&self, test_mode: bool) -> &str {
        if test_mode {
            &self.test_database
        } else {
            &self.database
        }
    }

    pub fn connect_options(&self, test_mode: bool) -> Result<PgConnectOptions> {
        check_charset(self.charset.as_deref())?;
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(self.database_name(test_mode))
            .application_name(crate::CRATE_NAME);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }
}

/// Parse a `postgres://` URL, as supplied through `DATABASE_URL`.
pub fn connect_options_from_url(url: &str) -> Result<PgConnectOptions> {
    PgConnectOptions::from_str(url).context("parsing database url")
}

// The Postgres driver always talks UTF-8; other encodings cannot be honoured.
fn check_charset(charset: Option<&str>) -> Result<()> {
    match charset.map(|c| c.to_ascii_lowercase().replace('-', "")) {
        None => Ok(()),
        Some(c) if matches!(c.as_str(), "utf8" | "utf8mb4") => Ok(()),
        Some(other) => bail!("unsupported charset `{other}`; only utf8 is supported"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
postgres:
  user: loader
  password: secret
  host: db.internal
  port: 6543
  charset: utf8mb4
replica:
  user: reader
"#;

    #[test]
    fn sections_are_selected_by_name() {
        let config = StoreConfig::from_yaml_section(CONFIG, "postgres").unwrap();
        assert_eq!(config.user, "loader");
        assert_eq!(config.port, 6543);
        assert_eq!(config.database_name(false), "production");
        assert_eq!(config.database_name(true), "dev");

        let replica = StoreConfig::from_yaml_section(CONFIG, "replica").unwrap();
        assert_eq!(replica.host, "localhost");
        assert_eq!(replica.port, 5432);
        assert_eq!(replica.password, None);

        assert!(StoreConfig::from_yaml_section(CONFIG, "missing").is_err());
    }

    #[test]
    fn connect_options_follow_the_run_mode() {
        let config = StoreConfig::from_yaml_section(CONFIG, "postgres").unwrap();
        let options = config.connect_options(true).unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("dev"));
    }

    #[test]
    fn non_utf8_charsets_are_rejected() {
        let mut config = StoreConfig::from_yaml_section(CONFIG, "replica").unwrap();
        config.charset = Some("latin1".into());
        assert!(config.connect_options(false).is_err());
    }

    #[test]
    fn config_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let config = StoreConfig::load_section(file.path(), "replica").unwrap();
        assert_eq!(config.user, "reader");
    }

    #[test]
    fn urls_parse() {
        let options = connect_options_from_url("postgres://u:p@example.org:5433/warehouse").unwrap();
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("warehouse"));
    }
}
