//! Key → value tables loaded from a stored entity, with explicit refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use batchload_core::{EntityDef, Value};
use batchload_storage::{RecordStore, RetryPolicy};
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use tracing::info;

use crate::reader::{read_all_resuming, ReadOptions};
use crate::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Load once; reload only on [`LookupTable::refresh`].
    Manual,
    /// Reload on access once the table is older than this.
    Every(Duration),
}

pub struct LookupTable {
    store: Arc<dyn RecordStore>,
    entity: EntityDef,
    key_field: String,
    value_field: String,
    chunksize: usize,
    retry: RetryPolicy,
    policy: RefreshPolicy,
    entries: HashMap<String, JsonValue>,
    loaded_at: Option<Instant>,
}

/// Text form used to match lookup keys, so `7` and `"7"` find the same entry.
fn normalize(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl LookupTable {
    pub fn new(
        store: Arc<dyn RecordStore>,
        entity: &EntityDef,
        key_field: impl Into<String>,
        value_field: impl Into<String>,
        policy: RefreshPolicy,
    ) -> Result<Self> {
        let key_field = key_field.into();
        let value_field = value_field.into();
        for field in [&key_field, &value_field] {
            if entity.field(field).is_none() {
                bail!("lookup field `{field}` is not defined on `{}`", entity.name());
            }
        }
        Ok(Self {
            store,
            entity: entity.clone(),
            key_field,
            value_field,
            chunksize: ReadOptions::default().chunksize,
            retry: RetryPolicy::default(),
            policy,
            entries: HashMap::new(),
            loaded_at: None,
        })
    }

    pub fn with_chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = chunksize;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_stale(&self) -> bool {
        match (self.loaded_at, self.policy) {
            (None, _) => true,
            (Some(_), RefreshPolicy::Manual) => false,
            (Some(at), RefreshPolicy::Every(ttl)) => at.elapsed() >= ttl,
        }
    }

    /// Reload every entry through the chunked reader.
    pub async fn refresh(&mut self) -> Result<usize, LoadError> {
        let mut entries = HashMap::new();
        let key_field = self.key_field.as_str();
        let value_field = self.value_field.as_str();
        read_all_resuming(
            self.store.clone(),
            &self.entity,
            ReadOptions {
                chunksize: self.chunksize,
                ..ReadOptions::default()
            },
            self.retry,
            |chunk| {
                for record in chunk {
                    let key = record.get(key_field).map(Value::to_json);
                    if let Some(key) = key.as_ref().and_then(normalize) {
                        let value = record.get(value_field).map_or(JsonValue::Null, Value::to_json);
                        entries.insert(key, value);
                    }
                }
            },
        )
        .await?;
        info!(
            table = self.entity.name(),
            entries = entries.len(),
            "lookup table loaded"
        );
        self.entries = entries;
        self.loaded_at = Some(Instant::now());
        Ok(self.entries.len())
    }

    pub async fn refresh_if_stale(&mut self) -> Result<(), LoadError> {
        if self.is_stale() {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Look a key up without checking freshness.
    pub fn lookup(&self, key: &JsonValue) -> Option<&JsonValue> {
        normalize(key).and_then(|k| self.entries.get(&k))
    }

    pub async fn get(&mut self, key: &JsonValue) -> Result<Option<JsonValue>, LoadError> {
        self.refresh_if_stale().await?;
        Ok(self.lookup(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchload_core::{FieldDef, FieldKind, Record};
    use batchload_storage::MemoryStore;
    use serde_json::json;

    fn countries() -> EntityDef {
        EntityDef::new(
            "countries",
            vec![
                FieldDef::new("alpha2", FieldKind::Text { max_length: Some(2) }),
                FieldDef::new("name", FieldKind::Text { max_length: None }),
            ],
            vec!["alpha2".into()],
        )
        .unwrap()
    }

    fn country(code: &str, name: &str) -> Record {
        [
            ("alpha2".to_string(), Value::Text(code.into())),
            ("name".to_string(), Value::Text(name.into())),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn loads_through_the_reader_and_answers_lookups() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&countries(), [country("gb", "United Kingdom"), country("fr", "France")]);
        let mut table = LookupTable::new(store.clone(), &countries(), "alpha2", "name", RefreshPolicy::Manual)
            .unwrap()
            .with_chunksize(1);

        assert_eq!(table.get(&json!("fr")).await.unwrap(), Some(json!("France")));
        assert_eq!(table.get(&json!("de")).await.unwrap(), None);
        assert_eq!(table.get(&JsonValue::Null).await.unwrap(), None);
        assert_eq!(table.len(), 2);
        assert_eq!(store.counters().page_reads, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_tables_reload_when_stale() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&countries(), [country("gb", "United Kingdom")]);
        let mut table = LookupTable::new(
            store.clone(),
            &countries(),
            "alpha2",
            "name",
            RefreshPolicy::Every(Duration::from_secs(60)),
        )
        .unwrap();
        assert_eq!(table.get(&json!("fr")).await.unwrap(), None);

        store.seed(&countries(), [country("fr", "France")]);
        assert_eq!(table.get(&json!("fr")).await.unwrap(), None);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(table.get(&json!("fr")).await.unwrap(), Some(json!("France")));
    }

    #[tokio::test]
    async fn manual_tables_reload_on_request() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&countries(), [country("gb", "United Kingdom")]);
        let mut table =
            LookupTable::new(store.clone(), &countries(), "alpha2", "name", RefreshPolicy::Manual)
                .unwrap();
        table.refresh().await.unwrap();
        store.seed(&countries(), [country("fr", "France")]);
        assert!(!table.is_stale());
        assert_eq!(table.refresh().await.unwrap(), 2);
        assert_eq!(table.lookup(&json!("fr")), Some(&json!("France")));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        assert!(LookupTable::new(store, &countries(), "alpha3", "name", RefreshPolicy::Manual).is_err());
    }
}
