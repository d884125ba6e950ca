//! Chunked bulk writer: filter each batch, commit the new rows, reconcile.

use std::sync::Arc;

use batchload_core::{EntityDef, RawRow, Record};
use batchload_storage::{try_until_allowed, RecordStore, RetryPolicy};
use serde::Serialize;
use tracing::info;

use crate::config::LoaderConfig;
use crate::filter::{filter_duplicates, FailedRow};
use crate::matcher::{MatchMode, PrimaryKeyMatcher};
use crate::{LoadError, ReconcileScope};

/// Running counts. `batch_total` covers the most recent batch only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertTotals {
    pub inserted: usize,
    pub existing: usize,
    pub failed: usize,
    pub total: usize,
    pub batch_total: usize,
}

impl InsertTotals {
    pub fn absorb(&mut self, other: &InsertTotals) {
        self.inserted += other.inserted;
        self.existing += other.existing;
        self.failed += other.failed;
        self.total += other.total;
        self.batch_total = other.batch_total;
    }
}

#[derive(Debug, Clone, Default)]
pub struct InsertReport {
    pub inserted: Vec<Record>,
    pub existing: Vec<RawRow>,
    pub failed: Vec<FailedRow>,
    pub totals: InsertTotals,
}

pub struct BulkWriter {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
    mode: MatchMode,
    retry: RetryPolicy,
}

impl BulkWriter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        batch_size: usize,
        mode: MatchMode,
        retry: RetryPolicy,
    ) -> Result<Self, LoadError> {
        if batch_size == 0 {
            return Err(LoadError::InvalidBatchSize);
        }
        Ok(Self {
            store,
            batch_size,
            mode,
            retry,
        })
    }

    pub fn from_config(store: Arc<dyn RecordStore>, config: &LoaderConfig) -> Result<Self, LoadError> {
        Self::new(store, config.batch_size, config.match_mode(), config.retry_policy())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Make sure the table exists and prepare key matching for a run.
    pub async fn begin(&self, entity: &EntityDef) -> Result<WriteSession<'_>, LoadError> {
        try_until_allowed(&self.retry, "ensure_table", || self.store.ensure_table(entity)).await?;
        let matcher =
            PrimaryKeyMatcher::prepare(self.store.clone(), entity, self.mode, &self.retry).await?;
        Ok(WriteSession {
            writer: self,
            entity: entity.clone(),
            matcher,
            batches: 0,
            totals: InsertTotals::default(),
        })
    }

    /// Insert `rows` as one run.
    pub async fn insert(&self, entity: &EntityDef, rows: Vec<RawRow>) -> Result<InsertReport, LoadError> {
        self.begin(entity).await?.write(rows).await
    }
}

/// One run against one entity. Several `write` calls share the prepared
/// matcher, so keys committed earlier in the run count as existing later.
pub struct WriteSession<'w> {
    writer: &'w BulkWriter,
    entity: EntityDef,
    matcher: PrimaryKeyMatcher,
    batches: usize,
    totals: InsertTotals,
}

impl WriteSession<'_> {
    /// Totals over every `write` call of this session.
    pub fn totals(&self) -> InsertTotals {
        self.totals
    }

    pub async fn write(&mut self, rows: Vec<RawRow>) -> Result<InsertReport, LoadError> {
        let expected = rows.len();
        let entity_name = self.entity.name().to_string();
        let mut report = InsertReport::default();
        let mut rows = rows.into_iter();

        loop {
            let batch = rows.by_ref().take(self.writer.batch_size).collect::<Vec<_>>();
            if batch.is_empty() {
                break;
            }
            self.batches += 1;
            let batch_len = batch.len();

            let outcome = filter_duplicates(&self.matcher, &self.entity, batch).await?;
            let committed = if outcome.to_insert.is_empty() {
                0
            } else {
                let store = &self.writer.store;
                let entity = &self.entity;
                let records = outcome.to_insert.as_slice();
                try_until_allowed(&self.writer.retry, "bulk_insert", || {
                    store.bulk_insert(entity, records)
                })
                .await? as usize
            };
            self.matcher.remember(
                outcome
                    .to_insert
                    .iter()
                    .filter_map(|record| self.entity.key_of_record(record)),
            );

            let batch_total = committed + outcome.existing.len() + outcome.failed.len();
            let batch_totals = InsertTotals {
                inserted: committed,
                existing: outcome.existing.len(),
                failed: outcome.failed.len(),
                total: batch_total,
                batch_total,
            };
            report.totals.absorb(&batch_totals);
            self.totals.absorb(&batch_totals);
            info!(
                entity = %entity_name,
                batch = self.batches,
                inserted = report.totals.inserted,
                existing = report.totals.existing,
                failed = report.totals.failed,
                total = report.totals.total,
                batch_total,
                "batch processed"
            );
            if batch_total != batch_len {
                return Err(LoadError::Reconciliation {
                    entity: entity_name,
                    scope: ReconcileScope::Batch(self.batches),
                    expected: batch_len,
                    actual: batch_total,
                });
            }

            report.inserted.extend(outcome.to_insert);
            report.existing.extend(outcome.existing);
            report.failed.extend(outcome.failed);
        }

        if report.totals.total != expected {
            return Err(LoadError::Reconciliation {
                entity: entity_name,
                scope: ReconcileScope::Run,
                expected,
                actual: report.totals.total,
            });
        }
        Ok(report)
    }
}
