//! Classifies candidate rows into new, already-stored and invalid.

use std::collections::HashSet;

use batchload_core::{EntityDef, RawRow, Record, RowError};
use batchload_storage::StoreError;
use serde::Serialize;
use tracing::warn;

use crate::matcher::PrimaryKeyMatcher;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRow {
    pub row: RawRow,
    pub reason: String,
}

impl FailedRow {
    fn new(row: RawRow, err: &RowError) -> Self {
        Self {
            row,
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutcome {
    pub to_insert: Vec<Record>,
    pub existing: Vec<RawRow>,
    pub failed: Vec<FailedRow>,
}

impl FilterOutcome {
    pub fn len(&self) -> usize {
        self.to_insert.len() + self.existing.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split `rows` in input order. The first occurrence of a key wins; later
/// rows with the same key count as existing. Nothing is written.
pub async fn filter_duplicates(
    matcher: &PrimaryKeyMatcher,
    entity: &EntityDef,
    rows: Vec<RawRow>,
) -> Result<FilterOutcome, StoreError> {
    let mut outcome = FilterOutcome::default();
    let mut seen = HashSet::new();

    for row in rows {
        let key = if matcher.is_auto_key() {
            None
        } else {
            match entity.primary_key_of(&row) {
                Ok(key) => Some(key),
                Err(err) => {
                    let err = RowError::from(err);
                    warn!(entity = entity.name(), error = %err, "row has no usable primary key");
                    outcome.failed.push(FailedRow::new(row, &err));
                    continue;
                }
            }
        };

        if let Some(key) = &key {
            if seen.contains(key) || matcher.contains(key).await? {
                seen.insert(key.clone());
                outcome.existing.push(row);
                continue;
            }
        }

        match entity.record_from_row(&row) {
            Ok(record) => {
                if let Some(key) = key {
                    seen.insert(key);
                }
                outcome.to_insert.push(record);
            }
            Err(err) => {
                warn!(entity = entity.name(), error = %err, "row failed validation");
                outcome.failed.push(FailedRow::new(row, &err));
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchMode;
    use batchload_core::{FieldDef, FieldKind, Value};
    use batchload_storage::{MemoryStore, RetryPolicy};
    use serde_json::json;
    use std::sync::Arc;

    fn entity() -> EntityDef {
        EntityDef::new(
            "orgs",
            vec![
                FieldDef::new("id", FieldKind::Text { max_length: None }),
                FieldDef::new("name", FieldKind::Text { max_length: None }),
            ],
            vec!["id".into()],
        )
        .unwrap()
    }

    fn rows(values: Vec<serde_json::Value>) -> Vec<RawRow> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    async fn matcher(store: Arc<MemoryStore>, entity: &EntityDef) -> PrimaryKeyMatcher {
        PrimaryKeyMatcher::prepare(store, entity, MatchMode::LowMemory, &RetryPolicy::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_occurrence_wins_within_a_batch() {
        let store = Arc::new(MemoryStore::new());
        let entity = entity();
        store.seed(&entity, Vec::<Record>::new());
        let matcher = matcher(store, &entity).await;

        let outcome = filter_duplicates(
            &matcher,
            &entity,
            rows(vec![
                json!({"id": "a", "name": "first"}),
                json!({"id": "b", "name": "other"}),
                json!({"id": "a", "name": "second"}),
            ]),
        )
        .await
        .unwrap();
        assert_eq!(outcome.to_insert.len(), 2);
        assert_eq!(
            outcome.to_insert[0].get("name"),
            Some(&Value::Text("first".into()))
        );
        assert_eq!(outcome.existing.len(), 1);
        assert_eq!(outcome.existing[0]["name"], json!("second"));
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn stored_keys_are_existing_and_bad_rows_fail() {
        let store = Arc::new(MemoryStore::new());
        let entity = entity();
        let stored: Record = [("id".to_string(), Value::Text("a".into()))]
            .into_iter()
            .collect();
        store.seed(&entity, [stored]);
        let matcher = matcher(store, &entity).await;

        let outcome = filter_duplicates(
            &matcher,
            &entity,
            rows(vec![
                json!({"id": "a", "name": "again"}),
                json!({"name": "no key"}),
                json!({"id": "c", "colour": "red"}),
                json!({"id": "c", "name": "retry"}),
            ]),
        )
        .await
        .unwrap();
        assert_eq!(outcome.existing.len(), 1);
        assert_eq!(outcome.failed.len(), 2);
        assert!(outcome.failed[0].reason.contains("missing primary key field `id`"));
        assert!(outcome.failed[1].reason.contains("unknown field `colour`"));
        // A row that failed validation does not claim its key.
        assert_eq!(outcome.to_insert.len(), 1);
        assert_eq!(outcome.len(), 4);
    }

    #[tokio::test]
    async fn auto_key_rows_are_never_existing() {
        let store = Arc::new(MemoryStore::new());
        let events = EntityDef::new(
            "events",
            vec![
                FieldDef::new("id", FieldKind::Integer).autoincrement(),
                FieldDef::new("body", FieldKind::Json),
            ],
            vec!["id".into()],
        )
        .unwrap();
        let matcher = matcher(store, &events).await;

        let outcome = filter_duplicates(
            &matcher,
            &events,
            rows(vec![json!({"body": 1}), json!({"body": 1}), json!({"id": 4})]),
        )
        .await
        .unwrap();
        assert_eq!(outcome.to_insert.len(), 3);
        assert!(outcome.existing.is_empty());
    }
}
