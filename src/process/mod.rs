// src/process/mod.rs
use std::fmt;

use crate::period::Period;

pub mod chunk;
pub mod convert;
pub mod schema;
pub mod split;

pub use chunk::{transform_chunk, SkippedRow, TransformedChunk};
pub use convert::transform;
pub use split::{ChunkedRowSource, CouponArchive, RowChunk};

/// One coupon row as published, trimmed but otherwise untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub itin_id: String,
    pub seq_num: String,
    pub coupons: String,
    pub origin: String,
    pub dest: String,
    pub coupon_type: String,
    pub tk_carrier: String,
    pub op_carrier: String,
    pub rp_carrier: String,
    pub passengers: String,
}

/// Fixed-width itinerary key: the raw ItinID without its year prefix, as zero-padded uppercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItinKey(String);

impl ItinKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already-encoded key, e.g. one read back from the store.
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        ItinKey(encoded.into())
    }
}

impl fmt::Display for ItinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The stored unit. Primary key is `(period, itin_key, seq_num)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightCouponRecord {
    pub period: Period,
    pub itin_key: ItinKey,
    pub seq_num: i64,
    pub coupons: i64,
    pub origin: String,
    pub dest: String,
    pub coupon_type: String,
    pub tk_carrier: String,
    pub op_carrier: String,
    pub rp_carrier: String,
    pub passengers: f64,
}
