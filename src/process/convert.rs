// src/process/convert.rs
use crate::error::RecordError;
use crate::period::Period;
use crate::process::{FlightCouponRecord, ItinKey, RawRow};

const YEAR_PREFIX_LEN: usize = 4;
const KEY_WIDTH: usize = 6;

impl ItinKey {
    /// Strip the 4-digit year prefix and re-encode the remaining decimal digits as uppercase hex,
    /// zero-padded to at least 6 characters. One-way; not meant to be decoded.
    pub fn encode(raw: &str) -> Result<Self, RecordError> {
        let raw = raw.trim();
        let bad = || RecordError::ItinId(raw.to_string());

        if raw.len() <= YEAR_PREFIX_LEN || !raw.is_ascii() {
            return Err(bad());
        }
        let suffix = &raw[YEAR_PREFIX_LEN..];
        if !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let value: u128 = suffix.parse().map_err(|_| bad())?;
        Ok(ItinKey(format!("{:0width$X}", value, width = KEY_WIDTH)))
    }
}

/// Convert one raw row into a typed record for `period`.
///
/// Pure and stateless. Any field that fails coercion rejects the whole row.
pub fn transform(period: Period, raw: &RawRow) -> Result<FlightCouponRecord, RecordError> {
    Ok(FlightCouponRecord {
        period,
        itin_key: ItinKey::encode(&raw.itin_id)?,
        seq_num: parse_count("SeqNum", &raw.seq_num)?,
        coupons: parse_count("Coupons", &raw.coupons)?,
        origin: require_code("Origin", &raw.origin)?,
        dest: require_code("Dest", &raw.dest)?,
        coupon_type: require_code("CouponType", &raw.coupon_type)?,
        tk_carrier: require_code("TkCarrier", &raw.tk_carrier)?,
        op_carrier: require_code("OpCarrier", &raw.op_carrier)?,
        rp_carrier: require_code("RPCarrier", &raw.rp_carrier)?,
        passengers: parse_weight("Passengers", &raw.passengers)?,
    })
}

/// Integer text, or integral decimal text such as `"2.00"`.
fn parse_count(column: &'static str, value: &str) -> Result<i64, RecordError> {
    let v = value.trim();
    if let Ok(n) = v.parse::<i64>() {
        return Ok(n);
    }
    match v.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
        _ => Err(field_error(column, value)),
    }
}

fn parse_weight(column: &'static str, value: &str) -> Result<f64, RecordError> {
    match value.trim().parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(f),
        _ => Err(field_error(column, value)),
    }
}

fn require_code(column: &'static str, value: &str) -> Result<String, RecordError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(field_error(column, value));
    }
    Ok(v.to_string())
}

fn field_error(column: &'static str, value: &str) -> RecordError {
    RecordError::Field {
        column,
        value: value.to_string(),
    }
}
