// src/period.rs
use anyhow::{bail, Result};
use std::fmt;

/// One (year, quarter) reporting unit and its archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    pub year: i32,
    pub quarter: u8,
}

impl Period {
    pub fn new(year: i32, quarter: u8) -> Result<Self> {
        if !(1..=4).contains(&quarter) {
            bail!("quarter must be between 1 and 4, got {}", quarter);
        }
        Ok(Period { year, quarter })
    }

    /// `{base_url}_{year}_{quarter}.zip`
    pub fn archive_url(&self, base_url: &str) -> String {
        format!(
            "{}_{}_{}.zip",
            base_url.trim_end_matches('/'),
            self.year,
            self.quarter
        )
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Q{}", self.year, self.quarter)
    }
}
