// src/process/chunk.rs
use rayon::prelude::*;
use tracing::warn;

use crate::error::RecordError;
use crate::period::Period;
use crate::process::{convert::transform, FlightCouponRecord, RawRow};

/// A row excluded from its chunk, with the identifier it carried and why.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRow {
    pub raw_itin_id: String,
    pub reason: RecordError,
}

#[derive(Debug, Default)]
pub struct TransformedChunk {
    pub records: Vec<FlightCouponRecord>,
    pub skipped: Vec<SkippedRow>,
}

/// Transform every row of one chunk in parallel, keeping input order.
///
/// Rows that fail are logged and excluded; they never affect their siblings.
pub fn transform_chunk(period: Period, rows: Vec<RawRow>) -> TransformedChunk {
    let results: Vec<Result<FlightCouponRecord, SkippedRow>> = rows
        .into_par_iter()
        .map(|row| {
            transform(period, &row).map_err(|reason| SkippedRow {
                raw_itin_id: row.itin_id,
                reason,
            })
        })
        .collect();

    let mut out = TransformedChunk {
        records: Vec::with_capacity(results.len()),
        skipped: Vec::new(),
    };
    for res in results {
        match res {
            Ok(rec) => out.records.push(rec),
            Err(skip) => {
                warn!(period = %period, itin_id = %skip.raw_itin_id, "skipping record: {}", skip.reason);
                out.skipped.push(skip);
            }
        }
    }
    out
}
