//! Relational store access for batchload: the `RecordStore` seam, its Postgres
//! and in-memory implementations, and the transient-failure retry wrapper.

use std::collections::HashSet;

use async_trait::async_trait;
use batchload_core::{EntityDef, PrimaryKey, Record};
use thiserror::Error;

pub mod config;
pub mod memory;
pub mod postgres;
pub mod retry;

pub use config::StoreConfig;
pub use memory::{FaultKind, MemoryStore, Operation, QueryCounters};
pub use postgres::PgStore;
pub use retry::{try_until_allowed, Backoff, RetryPolicy};

pub const CRATE_NAME: &str = "batchload-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Connectivity or operational failure; the same call can simply be retried.
    Retryable,
    /// A response arrived corrupted. Reads restart from the last good cursor.
    Resumable,
    NonRetryable,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient failure during {operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },
    #[error("malformed response during {operation}: {message}")]
    Malformed {
        operation: &'static str,
        message: String,
    },
    #[error("{operation} failed: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} on `{table}` rejected: {message}")]
    Rejected {
        operation: &'static str,
        table: String,
        message: String,
    },
    #[error("{operation} gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },
}

impl StoreError {
    pub fn from_sqlx(operation: &'static str, err: sqlx::Error) -> Self {
        match classify_sqlx_error(&err) {
            RetryDisposition::Retryable => StoreError::Transient {
                operation,
                message: err.to_string(),
            },
            RetryDisposition::Resumable => StoreError::Malformed {
                operation,
                message: err.to_string(),
            },
            RetryDisposition::NonRetryable => StoreError::Database {
                operation,
                source: err,
            },
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Transient { .. } => RetryDisposition::Retryable,
            StoreError::Malformed { .. } => RetryDisposition::Resumable,
            StoreError::Database { .. }
            | StoreError::Rejected { .. }
            | StoreError::ExhaustedRetries { .. } => RetryDisposition::NonRetryable,
        }
    }

    /// Whether a chunked read may restart from its cursor after this error.
    pub fn is_resumable(&self) -> bool {
        self.disposition() != RetryDisposition::NonRetryable
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        sqlx::Error::Protocol(_) | sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            RetryDisposition::Resumable
        }
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if is_transient_sqlstate(&code) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

/// Connection exceptions, too many connections, operator shutdowns and
/// serialization/deadlock rollbacks.
pub fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || matches!(code, "53300" | "57P01" | "57P02" | "57P03" | "40001" | "40P01")
}

/// One page of a key-ordered read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Only rows with a key strictly greater than this one.
    pub after: Option<PrimaryKey>,
    /// Rows to skip after the key filter. Only used to honour offset cursors.
    pub offset: u64,
    pub limit: usize,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the entity's table if it does not exist yet.
    async fn ensure_table(&self, entity: &EntityDef) -> Result<(), StoreError>;

    async fn fetch_primary_keys(&self, entity: &EntityDef)
        -> Result<HashSet<PrimaryKey>, StoreError>;

    async fn exists(&self, entity: &EntityDef, key: &PrimaryKey) -> Result<bool, StoreError>;

    /// Persist all records in one transaction and return the committed row count.
    async fn bulk_insert(&self, entity: &EntityDef, records: &[Record]) -> Result<u64, StoreError>;

    /// Rows ordered by primary key ascending.
    async fn read_page(
        &self,
        entity: &EntityDef,
        page: &PageRequest,
    ) -> Result<Vec<Record>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_errors_are_classified() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert_eq!(classify_sqlx_error(&io), RetryDisposition::Retryable);
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::PoolTimedOut),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::Protocol("unexpected message".into())),
            RetryDisposition::Resumable
        );
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::RowNotFound),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn sqlstates_for_dropped_connections_are_transient() {
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("53300"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("42P01"));
    }

    #[test]
    fn store_errors_map_to_dispositions() {
        let err = StoreError::from_sqlx("exists", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Transient { operation: "exists", .. }));
        assert_eq!(err.disposition(), RetryDisposition::Retryable);

        let err = StoreError::from_sqlx("read_page", sqlx::Error::Protocol("bad frame".into()));
        assert!(err.is_resumable());

        let err = StoreError::from_sqlx("bulk_insert", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database { .. }));
        assert!(!err.is_resumable());
    }
}
