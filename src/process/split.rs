// src/process/split.rs
use csv::{ReaderBuilder, StringRecordsIntoIter};
use std::io::{Cursor, Read};
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::IngestError;
use crate::process::schema::ColumnIndex;
use crate::process::RawRow;

/// Default rows per chunk.
pub const DEFAULT_CHUNK_ROWS: usize = 500_000;

/// An in-memory period archive holding exactly one CSV payload.
pub struct CouponArchive {
    archive: ZipArchive<Cursor<Vec<u8>>>,
    entry: String,
}

impl CouponArchive {
    /// Open `bytes` as a ZIP and locate its single `.csv` entry.
    pub fn open(bytes: Vec<u8>) -> Result<Self, IngestError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| IngestError::MalformedArchive(format!("not a readable ZIP: {}", e)))?;

        let mut candidates = Vec::new();
        for i in 0..archive.len() {
            let entry = archive.by_index(i).map_err(|e| {
                IngestError::MalformedArchive(format!("unreadable entry #{}: {}", i, e))
            })?;
            if entry.is_file() && entry.name().to_lowercase().ends_with(".csv") {
                candidates.push(entry.name().to_string());
            }
        }

        let entry = match candidates.len() {
            1 => candidates.remove(0),
            0 => {
                return Err(IngestError::MalformedArchive(
                    "archive holds no .csv entry".into(),
                ))
            }
            n => {
                return Err(IngestError::MalformedArchive(format!(
                    "archive holds {} .csv entries ({}), expected exactly one",
                    n,
                    candidates.join(", ")
                )))
            }
        };
        info!(entry = %entry, "found CSV");
        Ok(CouponArchive { archive, entry })
    }

    pub fn entry_name(&self) -> &str {
        &self.entry
    }

    /// Start a forward-only pass over the payload in batches of at most `chunk_rows` rows.
    /// The header is validated here, before any rows are read.
    pub fn chunks(&mut self, chunk_rows: usize) -> Result<ChunkedRowSource<'_>, IngestError> {
        let entry = self
            .archive
            .by_name(&self.entry)
            .map_err(|e| IngestError::MalformedArchive(format!("{}: {}", self.entry, e)))?;
        let reader: Box<dyn Read + '_> = Box::new(entry);

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let headers = rdr.headers().map_err(csv_error)?.clone();
        let columns = ColumnIndex::resolve(&headers)?;
        debug!(columns = headers.len(), "header validated");

        Ok(ChunkedRowSource {
            records: rdr.into_records(),
            columns,
            chunk_rows: chunk_rows.max(1),
            next_index: 0,
            line: 1,
            done: false,
        })
    }
}

/// One bounded batch of projected rows.
#[derive(Debug)]
pub struct RowChunk {
    /// Zero-based position of this chunk in the payload.
    pub index: usize,
    pub rows: Vec<RawRow>,
}

/// Lazy, non-restartable sequence of row chunks. After the first error it yields nothing more.
pub struct ChunkedRowSource<'a> {
    records: StringRecordsIntoIter<Box<dyn Read + 'a>>,
    columns: ColumnIndex,
    chunk_rows: usize,
    next_index: usize,
    line: u64,
    done: bool,
}

impl Iterator for ChunkedRowSource<'_> {
    type Item = Result<RowChunk, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut rows = Vec::with_capacity(self.chunk_rows.min(64 * 1024));
        while rows.len() < self.chunk_rows {
            match self.records.next() {
                Some(Ok(record)) => {
                    self.line += 1;
                    match self.columns.project(&record, self.line) {
                        Ok(row) => rows.push(row),
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(csv_error(e)));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if rows.is_empty() {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        Some(Ok(RowChunk { index, rows }))
    }
}

fn csv_error(e: csv::Error) -> IngestError {
    IngestError::MalformedArchive(format!("CSV read error: {}", e))
}
