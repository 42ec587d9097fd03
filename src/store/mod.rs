// src/store/mod.rs
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    cancel::CancelFlag,
    error::IngestError,
    history::{self, IngestRecord},
    period::Period,
    process::{FlightCouponRecord, ItinKey},
};

pub mod schema;

/// How long one `BEGIN IMMEDIATE` attempt waits before the cancel flag is polled again.
const LOCK_POLL: Duration = Duration::from_millis(250);

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// The keyed coupon store: one SQLite file shared by all period tasks.
///
/// Every period opens its own connection; the database's write lock is the only coordination
/// between concurrent periods.
#[derive(Debug, Clone)]
pub struct CouponStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl CouponStore {
    /// Open (creating if needed) the store at `path` and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, IngestError> {
        let store = CouponStore {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
        };
        let conn = store.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        schema::initialize(&conn)?;
        info!(path = %store.path.display(), "database initialized");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, IngestError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Open a transaction that will hold every chunk of `period`.
    ///
    /// Waits for the store's write lock for as long as another period holds it, polling `cancel`
    /// between attempts. Returns `Cancelled` if the flag is set while waiting.
    pub fn begin_period(
        &self,
        period: Period,
        cancel: CancelFlag,
    ) -> Result<PeriodTransaction, IngestError> {
        cancel.check()?;
        let conn = self.connect()?;
        conn.busy_timeout(LOCK_POLL)?;
        let mut attempts = 0u64;
        loop {
            match conn.execute_batch("BEGIN IMMEDIATE") {
                Ok(()) => break,
                Err(e) if is_busy(&e) => {
                    attempts += 1;
                    if attempts % 40 == 1 {
                        debug!(period = %period, attempts, "waiting for the write lock");
                    }
                    cancel.check()?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        conn.busy_timeout(self.busy_timeout)?;
        debug!(period = %period, "transaction opened");
        Ok(PeriodTransaction {
            conn,
            period,
            cancel,
            started_at: Utc::now(),
            chunks: 0,
            rows: 0,
            state: TxState::Open,
        })
    }

    pub fn count_period(&self, period: Period) -> Result<u64, IngestError> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM flights WHERE year = ?1 AND quarter = ?2",
            params![period.year, period.quarter],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn count_all(&self) -> Result<u64, IngestError> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM flights", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Every stored coupon for one itinerary key, across periods, ordered by period then sequence.
    pub fn lookup_itinerary(&self, key: &ItinKey) -> Result<Vec<FlightCouponRecord>, IngestError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT year, quarter, ItinID, SeqNum, Coupons, Origin, Dest, CouponType,
                    TkCarrier, OpCarrier, RPCarrier, Passengers
             FROM flights WHERE ItinID = ?1
             ORDER BY year, quarter, SeqNum",
        )?;
        let rows = stmt.query_map(params![key.as_str()], |row| {
            Ok(FlightCouponRecord {
                period: Period {
                    year: row.get(0)?,
                    quarter: row.get(1)?,
                },
                itin_key: ItinKey::from_encoded(row.get::<_, String>(2)?),
                seq_num: row.get(3)?,
                coupons: row.get(4)?,
                origin: row.get(5)?,
                dest: row.get(6)?,
                coupon_type: row.get(7)?,
                tk_carrier: row.get(8)?,
                op_carrier: row.get(9)?,
                rp_carrier: row.get(10)?,
                passengers: row.get(11)?,
            })
        })?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn completed_periods(&self) -> Result<BTreeSet<Period>, IngestError> {
        let conn = self.connect()?;
        Ok(history::completed_periods(&conn)?)
    }

    pub fn last_ingest(&self, period: Period) -> Result<Option<IngestRecord>, IngestError> {
        let conn = self.connect()?;
        Ok(history::last_ingest(&conn, period)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// Counts reported by a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReport {
    pub rows: u64,
    pub chunks: u64,
}

/// All chunks of one period, staged under a single SQLite transaction.
///
/// Nothing is visible to other connections until `commit`. Dropping the handle without
/// committing rolls back.
pub struct PeriodTransaction {
    conn: Connection,
    period: Period,
    cancel: CancelFlag,
    started_at: DateTime<Utc>,
    chunks: u64,
    rows: u64,
    state: TxState,
}

impl PeriodTransaction {
    pub fn period(&self) -> Period {
        self.period
    }

    pub fn chunks_loaded(&self) -> u64 {
        self.chunks
    }

    pub fn rows_loaded(&self) -> u64 {
        self.rows
    }

    /// Upsert one chunk of records. Refuses the chunk once cancellation has been requested.
    pub fn load_chunk(&mut self, records: &[FlightCouponRecord]) -> Result<usize, IngestError> {
        self.cancel.check()?;
        let mut stmt = self.conn.prepare_cached(schema::UPSERT_COUPON)?;
        for rec in records {
            stmt.execute(params![
                rec.period.year,
                rec.period.quarter,
                rec.itin_key.as_str(),
                rec.seq_num,
                rec.coupons,
                rec.origin,
                rec.dest,
                rec.coupon_type,
                rec.tk_carrier,
                rec.op_carrier,
                rec.rp_carrier,
                rec.passengers,
            ])?;
        }
        self.chunks += 1;
        self.rows += records.len() as u64;
        debug!(period = %self.period, chunk = self.chunks, rows = records.len(), "chunk staged");
        Ok(records.len())
    }

    /// Record the ledger row and commit. `skipped` is the number of rows excluded by validation.
    pub fn commit(mut self, skipped: u64) -> Result<CommitReport, IngestError> {
        let ledger = IngestRecord {
            period: self.period,
            rows_loaded: self.rows,
            rows_skipped: skipped,
            chunks: self.chunks,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        history::record(&self.conn, &ledger)?;
        self.conn.execute_batch("COMMIT")?;
        self.state = TxState::Committed;
        Ok(CommitReport {
            rows: self.rows,
            chunks: self.chunks,
        })
    }

    pub fn rollback(mut self) -> Result<(), IngestError> {
        self.state = TxState::RolledBack;
        self.conn.execute_batch("ROLLBACK")?;
        debug!(period = %self.period, chunks = self.chunks, "transaction rolled back");
        Ok(())
    }
}

impl Drop for PeriodTransaction {
    fn drop(&mut self) {
        if self.state != TxState::Open {
            return;
        }
        // A failed COMMIT leaves the transaction open; this also covers that case.
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(period = %self.period, "rollback on drop failed: {}", e);
            }
        }
    }
}
