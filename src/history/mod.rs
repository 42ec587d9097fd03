// src/history/mod.rs
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;

use crate::period::Period;

const CREATE_HISTORY: &str = "
CREATE TABLE IF NOT EXISTS ingest_history (
    year          INTEGER NOT NULL,
    quarter       INTEGER NOT NULL CHECK (quarter BETWEEN 1 AND 4),
    rows_loaded   INTEGER NOT NULL,
    rows_skipped  INTEGER NOT NULL,
    chunks        INTEGER NOT NULL,
    started_at    TEXT NOT NULL,
    finished_at   TEXT NOT NULL,
    PRIMARY KEY (year, quarter)
);
";

/// Ledger row for one committed period. Written in the same transaction as the period's rows.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRecord {
    pub period: Period,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
    pub chunks: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_HISTORY)
}

/// Insert or replace the ledger row for `rec.period`.
pub fn record(conn: &Connection, rec: &IngestRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO ingest_history
            (year, quarter, rows_loaded, rows_skipped, chunks, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            rec.period.year,
            rec.period.quarter,
            rec.rows_loaded as i64,
            rec.rows_skipped as i64,
            rec.chunks as i64,
            rec.started_at.to_rfc3339(),
            rec.finished_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn last_ingest(conn: &Connection, period: Period) -> rusqlite::Result<Option<IngestRecord>> {
    conn.query_row(
        "SELECT rows_loaded, rows_skipped, chunks, started_at, finished_at
         FROM ingest_history WHERE year = ?1 AND quarter = ?2",
        params![period.year, period.quarter],
        |row| {
            Ok(IngestRecord {
                period,
                rows_loaded: row.get::<_, i64>(0)? as u64,
                rows_skipped: row.get::<_, i64>(1)? as u64,
                chunks: row.get::<_, i64>(2)? as u64,
                started_at: parse_timestamp(row.get(3)?, 3)?,
                finished_at: parse_timestamp(row.get(4)?, 4)?,
            })
        },
    )
    .optional()
}

pub fn completed_periods(conn: &Connection) -> rusqlite::Result<BTreeSet<Period>> {
    let mut stmt = conn.prepare("SELECT year, quarter FROM ingest_history")?;
    let rows = stmt.query_map([], |row| {
        Ok(Period {
            year: row.get(0)?,
            quarter: row.get(1)?,
        })
    })?;
    rows.collect()
}

fn parse_timestamp(text: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn records_and_reads_back_ledger_rows() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        initialize(&conn)?;

        let period = Period::new(2016, 2)?;
        assert!(last_ingest(&conn, period)?.is_none());

        let started = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")?.with_timezone(&Utc);
        let finished = DateTime::parse_from_rfc3339("2024-05-01T10:07:30Z")?.with_timezone(&Utc);
        let rec = IngestRecord {
            period,
            rows_loaded: 1_234,
            rows_skipped: 2,
            chunks: 3,
            started_at: started,
            finished_at: finished,
        };
        record(&conn, &rec)?;
        assert_eq!(last_ingest(&conn, period)?, Some(rec.clone()));

        let rerun = IngestRecord {
            rows_loaded: 1_300,
            ..rec
        };
        record(&conn, &rerun)?;
        assert_eq!(last_ingest(&conn, period)?.map(|r| r.rows_loaded), Some(1_300));
        assert_eq!(
            completed_periods(&conn)?.into_iter().collect::<Vec<_>>(),
            vec![period]
        );
        Ok(())
    }
}
