// src/ingest/task.rs
use std::{fmt, sync::Arc};
use tracing::{debug, error, info, instrument, warn, Span};

use crate::{
    cancel::CancelFlag,
    error::IngestError,
    fetch::ArchiveSource,
    period::Period,
    process::{transform_chunk, CouponArchive, RowChunk},
    store::{CommitReport, CouponStore, PeriodTransaction},
};

use super::Outcome;

/// Lifecycle of one period task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodState {
    Pending,
    Fetching,
    Extracting,
    Loading,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

/// Where a period's data stands after the task ends without committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// No transaction was opened.
    NotStarted,
    /// A transaction was opened and rolled back; nothing from this run is visible.
    RolledBack,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitState::NotStarted => f.write_str("not committed"),
            CommitState::RolledBack => f.write_str("rolled back"),
        }
    }
}

type Abort = (IngestError, CommitState);

/// Progress of one period, carried across the async fetch and the blocking load.
#[derive(Debug)]
pub(crate) struct PeriodRun {
    period: Period,
    state: PeriodState,
    chunks_loaded: u64,
    rows_loaded: u64,
    rows_skipped: u64,
}

impl PeriodRun {
    pub(crate) fn new(period: Period) -> Self {
        PeriodRun {
            period,
            state: PeriodState::Pending,
            chunks_loaded: 0,
            rows_loaded: 0,
            rows_skipped: 0,
        }
    }

    pub(crate) fn state(&self) -> PeriodState {
        self.state
    }

    fn enter(&mut self, next: PeriodState) {
        debug!(period = %self.period, from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    fn complete(mut self, report: CommitReport) -> Outcome {
        self.enter(PeriodState::Committed);
        info!(
            period = %self.period,
            rows = report.rows,
            skipped = self.rows_skipped,
            chunks = report.chunks,
            "processing complete"
        );
        Outcome::Completed {
            rows: report.rows,
            skipped: self.rows_skipped,
            chunks: report.chunks,
        }
    }

    fn abort(mut self, err: IngestError, commit: CommitState) -> Outcome {
        if err.is_cancelled() {
            warn!(
                period = %self.period,
                chunks_loaded = self.chunks_loaded,
                commit = %commit,
                "interrupted, period {}",
                commit
            );
            return Outcome::Cancelled {
                chunks_loaded: self.chunks_loaded,
                commit,
            };
        }
        self.enter(PeriodState::Failed);
        error!(
            period = %self.period,
            chunks_loaded = self.chunks_loaded,
            rows_staged = self.rows_loaded,
            commit = %commit,
            "error processing {} after {} chunk(s), {}: {}",
            self.period,
            self.chunks_loaded,
            commit,
            err
        );
        Outcome::Failed {
            error: err,
            chunks_loaded: self.chunks_loaded,
            commit,
        }
    }
}

/// Fetch, extract, transform and load one period. Always ends in exactly one outcome.
#[instrument(level = "info", skip_all, fields(period = %period))]
pub(crate) async fn run_period<S: ArchiveSource>(
    period: Period,
    source: Arc<S>,
    store: Arc<CouponStore>,
    cancel: CancelFlag,
    chunk_rows: usize,
) -> Outcome {
    let mut run = PeriodRun::new(period);
    info!("processing {} data", period);

    run.enter(PeriodState::Fetching);
    let bytes = match source.fetch(period, &cancel).await {
        Ok(bytes) => bytes,
        Err(e) => return run.abort(e, CommitState::NotStarted),
    };
    info!(bytes = bytes.len(), "archive downloaded");

    // decompression, parsing and SQLite writes all block
    let span = Span::current();
    let worker = tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        let res = load_archive(&mut run, bytes, &store, &cancel, chunk_rows);
        (run, res)
    });

    match worker.await {
        Ok((run, Ok(report))) => run.complete(report),
        Ok((run, Err((e, commit)))) => run.abort(e, commit),
        Err(join_err) => {
            // unwinding dropped the open transaction, which rolls it back
            error!("worker for {} did not finish: {}", period, join_err);
            Outcome::Failed {
                error: IngestError::Worker(join_err.to_string()),
                chunks_loaded: 0,
                commit: CommitState::RolledBack,
            }
        }
    }
}

/// Open the archive and load all of its chunks under one transaction.
pub(crate) fn load_archive(
    run: &mut PeriodRun,
    bytes: Vec<u8>,
    store: &CouponStore,
    cancel: &CancelFlag,
    chunk_rows: usize,
) -> Result<CommitReport, Abort> {
    let not_started = |e| (e, CommitState::NotStarted);

    run.enter(PeriodState::Extracting);
    info!("extracting data");
    let mut archive = CouponArchive::open(bytes).map_err(not_started)?;
    let chunks = archive.chunks(chunk_rows).map_err(not_started)?;
    load_chunks(run, chunks, store, cancel)
}

/// Stage every chunk in order, then commit. Any error or cancellation rolls the whole period back.
pub(crate) fn load_chunks<I>(
    run: &mut PeriodRun,
    chunks: I,
    store: &CouponStore,
    cancel: &CancelFlag,
) -> Result<CommitReport, Abort>
where
    I: Iterator<Item = Result<RowChunk, IngestError>>,
{
    let mut tx = store
        .begin_period(run.period, cancel.clone())
        .map_err(|e| (e, CommitState::NotStarted))?;
    run.enter(PeriodState::Loading);

    for chunk in chunks {
        let step = chunk.and_then(|chunk| load_one(run, &mut tx, cancel, chunk));
        if let Err(e) = step {
            return Err(roll_back(run, tx, e));
        }
    }
    if let Err(e) = cancel.check() {
        return Err(roll_back(run, tx, e));
    }

    run.enter(PeriodState::Committing);
    match tx.commit(run.rows_skipped) {
        Ok(report) => Ok(report),
        Err(e) => {
            // the handle was dropped inside commit, rolling back
            run.enter(PeriodState::RolledBack);
            Err((e, CommitState::RolledBack))
        }
    }
}

fn load_one(
    run: &mut PeriodRun,
    tx: &mut PeriodTransaction,
    cancel: &CancelFlag,
    chunk: RowChunk,
) -> Result<(), IngestError> {
    cancel.check()?;
    let index = chunk.index;
    let out = transform_chunk(run.period, chunk.rows);
    run.rows_skipped += out.skipped.len() as u64;

    tx.load_chunk(&out.records)?;
    run.chunks_loaded = tx.chunks_loaded();
    run.rows_loaded = tx.rows_loaded();
    info!(
        chunk = index,
        rows = run.rows_loaded,
        skipped = run.rows_skipped,
        "processed {} records",
        run.rows_loaded
    );
    cancel.check()
}

fn roll_back(run: &mut PeriodRun, tx: PeriodTransaction, err: IngestError) -> Abort {
    run.enter(PeriodState::RollingBack);
    if err.is_cancelled() {
        info!("interrupt received during processing, rolling back");
    }
    if let Err(e) = tx.rollback() {
        // closing the connection discards the open transaction anyway
        error!("explicit rollback failed: {}", e);
    }
    run.enter(PeriodState::RolledBack);
    (err, CommitState::RolledBack)
}
