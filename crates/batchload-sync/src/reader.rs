//! Key-ordered chunked reads with a resumable cursor.
//!
//! Each chunk is one [`RecordStore::read_page`] call, so no connection scope
//! outlives a chunk. The cursor always points just past the last row handed
//! to the caller; a new reader built from it continues with no repeats and no
//! gaps.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use batchload_core::{EntityDef, PrimaryKey, Record};
use batchload_storage::{PageRequest, RecordStore, RetryPolicy, StoreError};
use tracing::{debug, info_span, warn, Instrument};

use crate::LoadError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReadCursor {
    #[default]
    Start,
    /// Continue with rows whose key sorts after this one.
    AfterKey(PrimaryKey),
    /// Skip this many rows. Deprecated: only the first chunk is read by
    /// offset, the reader continues by key afterwards.
    Offset(u64),
}

impl fmt::Display for ReadCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadCursor::Start => f.write_str("start"),
            ReadCursor::AfterKey(key) => write!(f, "after {key}"),
            ReadCursor::Offset(n) => write!(f, "offset {n}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub chunksize: usize,
    /// Stop after this many rows in total.
    pub limit: Option<usize>,
    /// Stop issuing reads after this many chunks.
    pub max_chunks: Option<usize>,
    pub cursor: ReadCursor,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            chunksize: 1000,
            limit: None,
            max_chunks: None,
            cursor: ReadCursor::Start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Reading,
    /// A chunk came back short; the table has no more rows past the cursor.
    Exhausted,
    LimitReached,
    /// `max_chunks` reads were issued. The cursor is still valid.
    ChunkBudgetSpent,
}

pub struct ChunkedReader {
    store: Arc<dyn RecordStore>,
    entity: EntityDef,
    chunksize: usize,
    limit: Option<usize>,
    max_chunks: Option<usize>,
    cursor: ReadCursor,
    buffer: VecDeque<Record>,
    drained: bool,
    chunks_read: usize,
    rows_yielded: usize,
    state: ReadState,
}

impl ChunkedReader {
    pub fn new(
        store: Arc<dyn RecordStore>,
        entity: &EntityDef,
        options: ReadOptions,
    ) -> Result<Self, LoadError> {
        if options.chunksize == 0 {
            return Err(LoadError::InvalidChunksize);
        }
        Ok(Self {
            store,
            entity: entity.clone(),
            chunksize: options.chunksize,
            limit: options.limit,
            max_chunks: options.max_chunks,
            cursor: options.cursor,
            buffer: VecDeque::new(),
            drained: false,
            chunks_read: 0,
            rows_yielded: 0,
            state: ReadState::Reading,
        })
    }

    /// Where a new reader should start to continue after the last yielded row.
    pub fn cursor(&self) -> &ReadCursor {
        &self.cursor
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn chunks_read(&self) -> usize {
        self.chunks_read
    }

    pub fn rows_yielded(&self) -> usize {
        self.rows_yielded
    }

    /// Options for a fresh reader that picks up where this one stopped,
    /// with whatever is left of the row limit and chunk budget.
    pub fn remaining_options(&self) -> ReadOptions {
        ReadOptions {
            chunksize: self.chunksize,
            limit: self.limit.map(|l| l.saturating_sub(self.rows_yielded)),
            max_chunks: self.max_chunks.map(|m| m.saturating_sub(self.chunks_read)),
            cursor: self.cursor.clone(),
        }
    }

    fn restarted(&self) -> ChunkedReader {
        let options = self.remaining_options();
        debug!(
            entity = self.entity.name(),
            cursor = %options.cursor,
            "restarting chunked read"
        );
        ChunkedReader {
            store: self.store.clone(),
            entity: self.entity.clone(),
            chunksize: options.chunksize,
            limit: options.limit,
            max_chunks: options.max_chunks,
            cursor: options.cursor,
            buffer: VecDeque::new(),
            drained: false,
            chunks_read: 0,
            rows_yielded: 0,
            state: ReadState::Reading,
        }
    }

    pub async fn next_row(&mut self) -> Result<Option<Record>, StoreError> {
        if self.buffer.is_empty() {
            self.fill().await?;
        }
        let Some(record) = self.buffer.pop_front() else {
            return Ok(None);
        };
        self.advance_past(&record);
        self.rows_yielded += 1;
        Ok(Some(record))
    }

    /// The rest of the buffered chunk, or the next chunk from the store.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<Record>>, StoreError> {
        if self.buffer.is_empty() {
            self.fill().await?;
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let chunk = self.buffer.drain(..).collect::<Vec<_>>();
        if let Some(last) = chunk.last() {
            self.advance_past(last);
        }
        self.rows_yielded += chunk.len();
        Ok(Some(chunk))
    }

    fn advance_past(&mut self, record: &Record) {
        if let Some(key) = self.entity.key_of_record(record) {
            self.cursor = ReadCursor::AfterKey(key);
        }
    }

    async fn fill(&mut self) -> Result<(), StoreError> {
        if self.state != ReadState::Reading {
            return Ok(());
        }
        if self.drained {
            self.state = ReadState::Exhausted;
            return Ok(());
        }
        let remaining = self.limit.map(|l| l.saturating_sub(self.rows_yielded));
        if remaining == Some(0) {
            self.state = ReadState::LimitReached;
            return Ok(());
        }
        if self.max_chunks.is_some_and(|max| self.chunks_read >= max) {
            self.state = ReadState::ChunkBudgetSpent;
            return Ok(());
        }

        let request = remaining.map_or(self.chunksize, |r| r.min(self.chunksize));
        let page = match &self.cursor {
            ReadCursor::Start => PageRequest {
                after: None,
                offset: 0,
                limit: request,
            },
            ReadCursor::AfterKey(key) => PageRequest {
                after: Some(key.clone()),
                offset: 0,
                limit: request,
            },
            ReadCursor::Offset(offset) => PageRequest {
                after: None,
                offset: *offset,
                limit: request,
            },
        };
        let rows = self.store.read_page(&self.entity, &page).await?;
        self.chunks_read += 1;
        debug!(
            entity = self.entity.name(),
            chunk = self.chunks_read,
            rows = rows.len(),
            cursor = %self.cursor,
            "chunk read"
        );
        if rows.len() < request {
            self.drained = true;
        }
        if rows.is_empty() {
            self.state = ReadState::Exhausted;
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

/// Drives a [`ChunkedReader`], rebuilding it from its cursor after transient
/// or malformed-response failures.
pub struct ResumingReader {
    reader: ChunkedReader,
    retry: RetryPolicy,
    resumes: u32,
}

impl ResumingReader {
    pub fn new(
        store: Arc<dyn RecordStore>,
        entity: &EntityDef,
        options: ReadOptions,
        retry: RetryPolicy,
    ) -> Result<Self, LoadError> {
        Ok(Self {
            reader: ChunkedReader::new(store, entity, options)?,
            retry,
            resumes: 0,
        })
    }

    pub fn cursor(&self) -> &ReadCursor {
        self.reader.cursor()
    }

    pub fn state(&self) -> ReadState {
        self.reader.state()
    }

    /// Times the underlying reader was rebuilt.
    pub fn resumes(&self) -> u32 {
        self.resumes
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Vec<Record>>, StoreError> {
        let mut failures = 0u32;
        loop {
            match self.reader.next_chunk().await {
                Ok(chunk) => return Ok(chunk),
                Err(err) if err.is_resumable() => {
                    failures += 1;
                    if !self.retry.allows_another(failures) {
                        return Err(StoreError::ExhaustedRetries {
                            operation: "read_page",
                            attempts: failures,
                            last: Box::new(err),
                        });
                    }
                    let delay = self.retry.delay_for_attempt(failures as usize - 1);
                    warn!(
                        entity = self.reader.entity.name(),
                        cursor = %self.reader.cursor(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chunked read interrupted; resuming from cursor"
                    );
                    tokio::time::sleep(delay).await;
                    self.reader = self.reader.restarted();
                    self.resumes += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadProgress {
    pub rows: usize,
    pub chunks: usize,
    pub resumes: u32,
    pub cursor: ReadCursor,
    pub state: ReadState,
}

/// Read `entity` chunk by chunk, handing every chunk to `on_chunk` and
/// resuming from the cursor after transient failures.
pub async fn read_all_resuming<F>(
    store: Arc<dyn RecordStore>,
    entity: &EntityDef,
    options: ReadOptions,
    retry: RetryPolicy,
    mut on_chunk: F,
) -> Result<ReadProgress, LoadError>
where
    F: FnMut(Vec<Record>),
{
    let span = info_span!("chunked_read", entity = entity.name());
    async move {
        let mut reader = ResumingReader::new(store, entity, options, retry)?;
        let mut rows = 0;
        let mut chunks = 0;
        while let Some(chunk) = reader.next_chunk().await? {
            rows += chunk.len();
            chunks += 1;
            on_chunk(chunk);
        }
        Ok(ReadProgress {
            rows,
            chunks,
            resumes: reader.resumes(),
            cursor: reader.cursor().clone(),
            state: reader.state(),
        })
    }
    .instrument(span)
    .await
}
