//! In-process [`RecordStore`] with query counters and fault injection.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use batchload_core::{EntityDef, PrimaryKey, Record, Value};

use crate::{PageRequest, RecordStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    EnsureTable,
    FetchKeys,
    Exists,
    BulkInsert,
    ReadPage,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::EnsureTable => "ensure_table",
            Operation::FetchKeys => "fetch_primary_keys",
            Operation::Exists => "exists",
            Operation::BulkInsert => "bulk_insert",
            Operation::ReadPage => "read_page",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Surfaces as [`StoreError::Transient`].
    Transient,
    /// Surfaces as [`StoreError::Malformed`].
    Malformed,
}

/// Calls seen per operation, faulted calls included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCounters {
    pub ensure_table: u64,
    pub key_scans: u64,
    pub exists_queries: u64,
    pub bulk_inserts: u64,
    pub page_reads: u64,
}

#[derive(Debug)]
struct ScheduledFault {
    operation: Operation,
    kind: FaultKind,
    skip: usize,
}

#[derive(Debug)]
struct Table {
    entity: EntityDef,
    rows: BTreeMap<PrimaryKey, Record>,
    next_id: i64,
}

impl Table {
    fn new(entity: &EntityDef) -> Self {
        Self {
            entity: entity.clone(),
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn assign_ids(&mut self, record: &mut Record) {
        for field in self.entity.fields().iter().filter(|f| f.autoincrement) {
            if record.get(&field.name).map_or(true, Value::is_null) {
                record.set(field.name.clone(), Value::Integer(self.next_id));
                self.next_id += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, Table>,
    faults: Vec<ScheduledFault>,
    drop_on_commit: usize,
    counters: QueryCounters,
}

impl Inner {
    fn take_fault(&mut self, operation: Operation) -> Result<(), StoreError> {
        let Some(index) = self.faults.iter().position(|f| f.operation == operation) else {
            return Ok(());
        };
        if self.faults[index].skip > 0 {
            self.faults[index].skip -= 1;
            return Ok(());
        }
        let fault = self.faults.remove(index);
        let operation = operation.name();
        Err(match fault.kind {
            FaultKind::Transient => StoreError::Transient {
                operation,
                message: "injected connection failure".to_string(),
            },
            FaultKind::Malformed => StoreError::Malformed {
                operation,
                message: "injected truncated response".to_string(),
            },
        })
    }

    fn table(&self, operation: Operation, entity: &EntityDef) -> Result<&Table, StoreError> {
        self.tables
            .get(entity.name())
            .ok_or_else(|| missing_table(operation, entity))
    }

    fn table_mut(
        &mut self,
        operation: Operation,
        entity: &EntityDef,
    ) -> Result<&mut Table, StoreError> {
        self.tables
            .get_mut(entity.name())
            .ok_or_else(|| missing_table(operation, entity))
    }
}

fn missing_table(operation: Operation, entity: &EntityDef) -> StoreError {
    StoreError::Rejected {
        operation: operation.name(),
        table: entity.name().to_string(),
        message: "relation does not exist".to_string(),
    }
}

/// Ordered in-memory tables. Each call behaves like one committed
/// transaction: a bulk insert either lands entirely or not at all.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next call of `operation` once.
    pub fn fail_next(&self, operation: Operation, kind: FaultKind) {
        self.schedule_fault(operation, kind, 0);
    }

    /// Let `skip` calls of `operation` succeed, then fail the following one.
    pub fn schedule_fault(&self, operation: Operation, kind: FaultKind, skip: usize) {
        self.lock().faults.push(ScheduledFault {
            operation,
            kind,
            skip,
        });
    }

    /// The next successful bulk insert silently discards its last `n` records
    /// and reports only what it kept.
    pub fn drop_rows_on_next_commit(&self, n: usize) {
        self.lock().drop_on_commit = n;
    }

    pub fn counters(&self) -> QueryCounters {
        self.lock().counters
    }

    /// Create the table if needed and store `records` without touching the
    /// counters or fault schedule.
    pub fn seed(&self, entity: &EntityDef, records: impl IntoIterator<Item = Record>) {
        let mut inner = self.lock();
        let table = inner
            .tables
            .entry(entity.name().to_string())
            .or_insert_with(|| Table::new(entity));
        for mut record in records {
            table.assign_ids(&mut record);
            if let Some(key) = entity.key_of_record(&record) {
                table.rows.insert(key, record);
            }
        }
    }

    /// Stored rows in key order; empty if the table does not exist.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.lock().tables.contains_key(table)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn ensure_table(&self, entity: &EntityDef) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.counters.ensure_table += 1;
        inner.take_fault(Operation::EnsureTable)?;
        inner
            .tables
            .entry(entity.name().to_string())
            .or_insert_with(|| Table::new(entity));
        Ok(())
    }

    async fn fetch_primary_keys(
        &self,
        entity: &EntityDef,
    ) -> Result<HashSet<PrimaryKey>, StoreError> {
        let mut inner = self.lock();
        inner.counters.key_scans += 1;
        inner.take_fault(Operation::FetchKeys)?;
        let table = inner.table(Operation::FetchKeys, entity)?;
        Ok(table.rows.keys().cloned().collect())
    }

    async fn exists(&self, entity: &EntityDef, key: &PrimaryKey) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.counters.exists_queries += 1;
        inner.take_fault(Operation::Exists)?;
        let table = inner.table(Operation::Exists, entity)?;
        Ok(table.rows.contains_key(key))
    }

    async fn bulk_insert(&self, entity: &EntityDef, records: &[Record]) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        inner.counters.bulk_inserts += 1;
        inner.take_fault(Operation::BulkInsert)?;
        let dropped = std::mem::take(&mut inner.drop_on_commit).min(records.len());
        let table = inner.table_mut(Operation::BulkInsert, entity)?;

        let mut next_id = table.next_id;
        let mut staged = Vec::with_capacity(records.len());
        let mut batch_keys = HashSet::new();
        for record in &records[..records.len() - dropped] {
            let mut record = record.clone();
            for field in entity.fields().iter().filter(|f| f.autoincrement) {
                if record.get(&field.name).map_or(true, Value::is_null) {
                    record.set(field.name.clone(), Value::Integer(next_id));
                    next_id += 1;
                }
            }
            let key = entity
                .key_of_record(&record)
                .ok_or_else(|| StoreError::Rejected {
                    operation: "bulk_insert",
                    table: entity.name().to_string(),
                    message: "null value in primary key".to_string(),
                })?;
            if table.rows.contains_key(&key) || !batch_keys.insert(key.clone()) {
                return Err(StoreError::Rejected {
                    operation: "bulk_insert",
                    table: entity.name().to_string(),
                    message: format!("duplicate key value {key} violates unique constraint"),
                });
            }
            staged.push((key, record));
        }

        let committed = staged.len() as u64;
        table.next_id = next_id;
        table.rows.extend(staged);
        Ok(committed)
    }

    async fn read_page(
        &self,
        entity: &EntityDef,
        page: &PageRequest,
    ) -> Result<Vec<Record>, StoreError> {
        let mut inner = self.lock();
        inner.counters.page_reads += 1;
        inner.take_fault(Operation::ReadPage)?;
        let table = inner.table(Operation::ReadPage, entity)?;
        let rows = table
            .rows
            .iter()
            .filter(|(key, _)| page.after.as_ref().map_or(true, |after| *key > after))
            .skip(page.offset as usize)
            .take(page.limit)
            .map(|(_, record)| record.clone())
            .collect();
        Ok(rows)
    }
}
