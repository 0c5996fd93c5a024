use crate::blob::BlobStore;
use crate::db;
use crate::roster::{normalize_row, SkipReason, StudentRecord};
use chrono::Utc;
use csv::ByteRecord;
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Storage side of an ingestion run. Implementations must drop records whose
/// id number already exists without failing the call.
pub trait StudentSink {
    /// Returns the number of records actually stored.
    fn insert_ignore_duplicates(&mut self, records: &[StudentRecord]) -> anyhow::Result<usize>;
}

impl<S: StudentSink + ?Sized> StudentSink for &mut S {
    fn insert_ignore_duplicates(&mut self, records: &[StudentRecord]) -> anyhow::Result<usize> {
        (**self).insert_ignore_duplicates(records)
    }
}

pub struct SqliteStudentSink<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStudentSink<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl StudentSink for SqliteStudentSink<'_> {
    fn insert_ignore_duplicates(&mut self, records: &[StudentRecord]) -> anyhow::Result<usize> {
        db::insert_students_ignore_duplicates(self.conn, records)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowWarning {
    pub line: u64,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub rows_read: usize,
    pub produced: usize,
    pub skipped: usize,
    pub batches: usize,
    pub inserted: usize,
    pub duplicates_ignored: usize,
    pub source_removed: bool,
    pub warnings: Vec<RowWarning>,
}

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("source file not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("failed to read source file {}: {source}", path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("batch {batch} of {total_batches} failed to insert ({committed_batches} committed): {source}")]
    BatchInsert {
        batch: usize,
        total_batches: usize,
        committed_batches: usize,
        inserted: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceNotFound { .. } => "source_not_found",
            Self::SourceUnreadable { .. } => "source_unreadable",
            Self::BatchInsert { .. } => "batch_insert_failed",
        }
    }

    /// A missing source will still be missing on the next attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::SourceNotFound { .. })
    }
}

#[derive(thiserror::Error, Debug)]
enum RowError {
    #[error("cell {cell} is not valid UTF-8: {source}")]
    InvalidUtf8 {
        cell: usize,
        #[source]
        source: std::str::Utf8Error,
    },
}

fn decode_cells(record: &ByteRecord) -> Result<Vec<&str>, RowError> {
    record
        .iter()
        .enumerate()
        .map(|(cell, bytes)| {
            std::str::from_utf8(bytes).map_err(|source| RowError::InvalidUtf8 { cell, source })
        })
        .collect()
}

fn raw_content(record: &ByteRecord) -> String {
    record
        .iter()
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(",")
}

fn is_blank_line(record: &ByteRecord) -> bool {
    record.len() <= 1 && record.iter().all(|cell| cell.iter().all(u8::is_ascii_whitespace))
}

/// Reads an uploaded roster CSV into normalized student records and writes
/// them through a [`StudentSink`] in fixed-size batches.
pub struct CsvStudentIngestor<B, S> {
    blobs: B,
    sink: S,
    batch_size: usize,
}

impl<B: BlobStore, S: StudentSink> CsvStudentIngestor<B, S> {
    pub fn new(blobs: B, sink: S) -> Self {
        Self {
            blobs,
            sink,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Runs one ingestion of `path`, tagging every record with `campus`.
    ///
    /// Malformed rows are skipped and reported in the summary. Once the
    /// source is known to exist it is deleted at the end of the run, whether
    /// or not the run succeeded. Batches written before a failing batch stay
    /// committed.
    pub fn ingest(&mut self, path: &Path, campus: &str) -> Result<IngestSummary, IngestError> {
        if !self.blobs.exists(path) {
            return Err(IngestError::SourceNotFound {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), campus, "roster ingest started");

        let outcome = self.read_and_store(path, campus);
        let removed = self.remove_source(path);

        let mut summary = outcome?;
        summary.source_removed = removed;
        info!(
            path = %path.display(),
            campus,
            rows = summary.rows_read,
            produced = summary.produced,
            skipped = summary.skipped,
            inserted = summary.inserted,
            batches = summary.batches,
            "roster ingest finished"
        );
        Ok(summary)
    }

    fn read_and_store(&mut self, path: &Path, campus: &str) -> Result<IngestSummary, IngestError> {
        let unreadable = |source: std::io::Error| IngestError::SourceUnreadable {
            path: path.to_path_buf(),
            source,
        };
        let reader = self.blobs.open(path).map_err(unreadable)?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut summary = IngestSummary::default();
        let mut record = ByteRecord::new();

        // Header: column names are not checked.
        if !rdr
            .read_byte_record(&mut record)
            .map_err(|e| unreadable(e.into()))?
        {
            return Ok(summary);
        }

        let now = Utc::now();
        let mut records: Vec<StudentRecord> = Vec::new();
        let mut line = 1u64;
        while rdr
            .read_byte_record(&mut record)
            .map_err(|e| unreadable(e.into()))?
        {
            line = record.position().map(|p| p.line()).unwrap_or(line + 1);
            if is_blank_line(&record) {
                // Same as the empty lines the reader already drops.
                continue;
            }
            summary.rows_read += 1;

            let cells = match decode_cells(&record) {
                Ok(cells) => cells,
                Err(e) => {
                    let raw = raw_content(&record);
                    warn!(line, raw = %raw, error = %e, "roster row skipped: processing error");
                    summary.warnings.push(RowWarning {
                        line,
                        code: SkipReason::RowError.code(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            match normalize_row(&cells, campus, now) {
                Ok(r) => records.push(r),
                Err(reason) => {
                    warn!(line, reason = reason.code(), "roster row skipped");
                    summary.warnings.push(RowWarning {
                        line,
                        code: reason.code(),
                        message: reason.message().to_string(),
                    });
                }
            }
        }

        summary.produced = records.len();
        summary.skipped = summary.rows_read - summary.produced;

        let total_batches = records.len().div_ceil(self.batch_size);
        for (i, chunk) in records.chunks(self.batch_size).enumerate() {
            match self.sink.insert_ignore_duplicates(chunk) {
                Ok(n) => {
                    summary.batches += 1;
                    summary.inserted += n;
                    debug!(batch = i + 1, total_batches, size = chunk.len(), inserted = n, "batch written");
                }
                Err(e) => {
                    warn!(batch = i + 1, total_batches, error = %e, "batch insert failed");
                    return Err(IngestError::BatchInsert {
                        batch: i + 1,
                        total_batches,
                        committed_batches: i,
                        inserted: summary.inserted,
                        source: e.into(),
                    });
                }
            }
        }
        summary.duplicates_ignored = summary.produced - summary.inserted;
        Ok(summary)
    }

    fn remove_source(&self, path: &Path) -> bool {
        match self.blobs.delete(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove roster source");
                false
            }
        }
    }
}
