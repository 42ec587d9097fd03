// src/error.rs
use thiserror::Error;

/// Errors that end one period's ingestion.
///
/// Each variant is isolated to the period that raised it: the orchestrator records it as that
/// period's outcome and sibling periods carry on.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Network or HTTP failure, including non-success status and timeouts.
    #[error("transport error fetching {url}: {reason}")]
    Transport { url: String, reason: String },

    /// Certificate validation failed while verification was enabled.
    #[error("TLS verification failed for {url}: {reason}")]
    Tls { url: String, reason: String },

    /// The archive could not be opened, or it does not hold exactly one CSV payload.
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    /// A declared column is missing from the header or from a row.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Write or commit failure in the keyed store.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The blocking worker for this period panicked or was aborted.
    #[error("worker failed: {0}")]
    Worker(String),

    /// Cooperative cancellation was observed.
    #[error("cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled)
    }
}

/// A row-level validation failure. The row is skipped and logged; the chunk carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid ItinID format: {0:?}")]
    ItinId(String),

    #[error("invalid {column} value {value:?}")]
    Field { column: &'static str, value: String },
}
