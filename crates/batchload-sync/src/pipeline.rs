//! Run-level entry points: load a dump, or copy one entity into another.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use batchload_core::{EntityDef, RawRow};
use batchload_storage::{RecordStore, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::reader::{ReadCursor, ReadOptions, ReadState, ResumingReader};
use crate::transform::RowTransform;
use crate::writer::{BulkWriter, InsertReport, InsertTotals};
use crate::LoadError;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub entity: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: InsertTotals,
}

#[derive(Debug, Clone)]
pub struct CopySummary {
    pub run: RunSummary,
    pub chunks: usize,
    pub rows_read: usize,
    pub resumes: u32,
    /// Resume point for a follow-up copy.
    pub cursor: ReadCursor,
    pub state: ReadState,
}

/// Parse a dump file: either one JSON array of objects or JSON lines.
pub fn parse_rows(text: &str) -> Result<Vec<RawRow>> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text).context("parsing JSON array of rows");
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<RawRow>(line)
                .with_context(|| format!("line {} is not a JSON object", i + 1))
        })
        .collect()
}

pub async fn read_rows_file(path: &Path) -> Result<Vec<RawRow>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_rows(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Insert a batch of rows from a file dump or an upstream task.
pub async fn load_rows(
    writer: &BulkWriter,
    entity: &EntityDef,
    rows: Vec<RawRow>,
) -> Result<(RunSummary, InsertReport), LoadError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("bulk_insert", entity = entity.name(), %run_id);
    async move {
        let input = rows.len();
        let report = writer.insert(entity, rows).await?;
        let summary = RunSummary {
            run_id,
            entity: entity.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            totals: report.totals,
        };
        info!(
            input,
            inserted = summary.totals.inserted,
            existing = summary.totals.existing,
            failed = summary.totals.failed,
            "load finished"
        );
        Ok((summary, report))
    }
    .instrument(span)
    .await
}

/// Stream `from` out of `source` chunk by chunk, transform each chunk and
/// write it into `to`. Every chunk is reconciled by the writer before the
/// next one is read.
pub async fn copy_entity(
    source: Arc<dyn RecordStore>,
    writer: &BulkWriter,
    from: &EntityDef,
    to: &EntityDef,
    options: ReadOptions,
    retry: RetryPolicy,
    transform: &mut dyn RowTransform,
) -> Result<CopySummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("bulk_insert", entity = to.name(), source = from.name(), %run_id);
    async move {
        let mut reader = ResumingReader::new(source, from, options, retry)?;
        let mut session = writer.begin(to).await?;
        let mut chunks = 0;
        let mut rows_read = 0;

        while let Some(chunk) = reader.next_chunk().await? {
            chunks += 1;
            rows_read += chunk.len();
            let rows = chunk.iter().map(|record| record.to_json()).collect::<Vec<_>>();
            let rows = transform
                .apply(rows)
                .await
                .with_context(|| format!("transforming chunk {chunks} of `{}`", from.name()))?;
            session.write(rows).await?;
        }

        let totals = session.totals();
        let summary = CopySummary {
            run: RunSummary {
                run_id,
                entity: to.name().to_string(),
                started_at,
                finished_at: Utc::now(),
                totals,
            },
            chunks,
            rows_read,
            resumes: reader.resumes(),
            cursor: reader.cursor().clone(),
            state: reader.state(),
        };
        info!(
            chunks,
            rows_read,
            inserted = totals.inserted,
            existing = totals.existing,
            failed = totals.failed,
            cursor = %summary.cursor,
            "copy finished"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn dumps_parse_as_array_or_lines() {
        let array = parse_rows(r#"[{"id": 1}, {"id": 2}]"#).unwrap();
        assert_eq!(array.len(), 2);

        let lines = parse_rows("{\"id\": 1}\n\n{\"id\": 2}\n").unwrap();
        assert_eq!(lines, array);

        let err = parse_rows("{\"id\": 1}\n[1, 2]\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[tokio::test]
    async fn dump_files_are_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"id\": 7}}").unwrap();
        let rows = read_rows_file(file.path()).await.unwrap();
        assert_eq!(rows[0]["id"], serde_json::json!(7));
        assert!(read_rows_file(Path::new("/nonexistent/rows.jsonl")).await.is_err());
    }
}
