//! Duplicate-safe bulk loading and resumable chunked reads on top of a
//! [`RecordStore`](batchload_storage::RecordStore).

use std::fmt;

use batchload_storage::StoreError;
use thiserror::Error;

pub mod config;
pub mod filter;
pub mod lookup;
pub mod matcher;
pub mod pipeline;
pub mod reader;
pub mod transform;
pub mod writer;

pub use config::LoaderConfig;
pub use filter::{filter_duplicates, FailedRow, FilterOutcome};
pub use lookup::{LookupTable, RefreshPolicy};
pub use matcher::{MatchMode, PrimaryKeyMatcher};
pub use pipeline::{copy_entity, load_rows, parse_rows, read_rows_file, CopySummary, RunSummary};
pub use reader::{
    read_all_resuming, ChunkedReader, ReadCursor, ReadOptions, ReadProgress, ReadState,
    ResumingReader,
};
pub use transform::{LookupRule, NoopTransform, RowTransform, RuleSet, RuleTransform};
pub use writer::{BulkWriter, InsertReport, InsertTotals, WriteSession};

pub const CRATE_NAME: &str = "batchload-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileScope {
    Batch(usize),
    Run,
}

impl fmt::Display for ReconcileScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileScope::Batch(n) => write!(f, "batch {n}"),
            ReconcileScope::Run => f.write_str("run"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error("chunksize must be at least 1")]
    InvalidChunksize,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(
        "`{entity}` {scope} does not reconcile: expected {expected} rows, accounted for {actual}"
    )]
    Reconciliation {
        entity: String,
        scope: ReconcileScope,
        expected: usize,
        actual: usize,
    },
}
