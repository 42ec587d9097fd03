// src/process/schema.rs
use csv::StringRecord;

use crate::error::IngestError;
use crate::process::RawRow;

/// Columns projected from the coupon CSV, in `RawRow` field order.
pub const COUPON_COLUMNS: [&str; 10] = [
    "ItinID",
    "SeqNum",
    "Coupons",
    "Origin",
    "Dest",
    "CouponType",
    "TkCarrier",
    "OpCarrier",
    "RPCarrier",
    "Passengers",
];

/// Positions of the declared columns within one file's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnIndex {
    positions: [usize; COUPON_COLUMNS.len()],
}

impl ColumnIndex {
    /// Resolve every declared column against `headers`. Header names are trimmed and matched
    /// case-sensitively, as published.
    pub fn resolve(headers: &StringRecord) -> Result<Self, IngestError> {
        let mut positions = [0usize; COUPON_COLUMNS.len()];
        let mut missing = Vec::new();
        for (slot, name) in positions.iter_mut().zip(COUPON_COLUMNS) {
            match headers.iter().position(|h| h.trim() == name) {
                Some(idx) => *slot = idx,
                None => missing.push(name),
            }
        }
        if !missing.is_empty() {
            return Err(IngestError::SchemaMismatch(format!(
                "header is missing column(s): {}",
                missing.join(", ")
            )));
        }
        Ok(ColumnIndex { positions })
    }

    /// Project one CSV record onto a `RawRow`. A record too short to hold every declared column
    /// is a schema error for the whole period.
    pub fn project(&self, record: &StringRecord, line: u64) -> Result<RawRow, IngestError> {
        let field = |i: usize| -> Result<String, IngestError> {
            record
                .get(self.positions[i])
                .map(|v| v.trim().to_string())
                .ok_or_else(|| {
                    IngestError::SchemaMismatch(format!(
                        "line {}: missing column {} ({} fields present)",
                        line,
                        COUPON_COLUMNS[i],
                        record.len()
                    ))
                })
        };
        Ok(RawRow {
            itin_id: field(0)?,
            seq_num: field(1)?,
            coupons: field(2)?,
            origin: field(3)?,
            dest: field(4)?,
            coupon_type: field(5)?,
            tk_carrier: field(6)?,
            op_carrier: field(7)?,
            rp_carrier: field(8)?,
            passengers: field(9)?,
        })
    }
}
