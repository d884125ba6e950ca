//! Answers "is this primary key already in the store?".

use std::collections::HashSet;
use std::sync::Arc;

use batchload_core::{EntityDef, PrimaryKey};
use batchload_storage::{try_until_allowed, RecordStore, RetryPolicy, StoreError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Load every existing key once; checks are local afterwards.
    LowMemory,
    /// One existence query per check.
    PerRow,
}

enum KnownKeys {
    Loaded(HashSet<PrimaryKey>),
    Queried,
    /// Store-assigned keys never collide with incoming rows.
    AutoKey,
}

pub struct PrimaryKeyMatcher {
    store: Arc<dyn RecordStore>,
    entity: EntityDef,
    retry: RetryPolicy,
    known: KnownKeys,
}

impl PrimaryKeyMatcher {
    pub async fn prepare(
        store: Arc<dyn RecordStore>,
        entity: &EntityDef,
        mode: MatchMode,
        retry: &RetryPolicy,
    ) -> Result<Self, StoreError> {
        let known = if entity.is_auto_pkey() {
            KnownKeys::AutoKey
        } else {
            match mode {
                MatchMode::LowMemory => {
                    let keys = try_until_allowed(retry, "fetch_primary_keys", || {
                        store.fetch_primary_keys(entity)
                    })
                    .await?;
                    debug!(entity = entity.name(), keys = keys.len(), "loaded existing keys");
                    KnownKeys::Loaded(keys)
                }
                MatchMode::PerRow => KnownKeys::Queried,
            }
        };
        Ok(Self {
            store,
            entity: entity.clone(),
            retry: *retry,
            known,
        })
    }

    pub fn is_auto_key(&self) -> bool {
        matches!(self.known, KnownKeys::AutoKey)
    }

    pub async fn contains(&self, key: &PrimaryKey) -> Result<bool, StoreError> {
        match &self.known {
            KnownKeys::AutoKey => Ok(false),
            KnownKeys::Loaded(keys) => Ok(keys.contains(key)),
            KnownKeys::Queried => {
                try_until_allowed(&self.retry, "exists", || self.store.exists(&self.entity, key))
                    .await
            }
        }
    }

    /// Record keys the caller has just committed.
    pub fn remember(&mut self, keys: impl IntoIterator<Item = PrimaryKey>) {
        if let KnownKeys::Loaded(known) = &mut self.known {
            known.extend(keys);
        }
    }
}
