// src/config.rs
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::period::Period;

/// Top-level YAML configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub download: DownloadConfig,
    pub db1b_coupon: CouponSourceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_concurrent: usize,
    pub verify_ssl: bool,
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            max_concurrent: 4,
            verify_ssl: true,
            timeout_secs: 30,
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CouponSourceConfig {
    pub base_url: String,
    pub years: Vec<RangeItem>,
    pub quarters: Vec<RangeItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("flights.db"),
            busy_timeout_secs: 3600,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub chunk_size: usize,
    pub skip_completed: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            chunk_size: 500_000,
            skip_completed: false,
        }
    }
}

/// A literal value (`2018`, `"2018"`) or an inclusive range (`"2012...2015"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RangeItem {
    Single(i64),
    Text(String),
}

/// Widest inclusive range a single item may span.
const MAX_RANGE_SPAN: i64 = 1_000;

/// Years the coupon survey can plausibly be requested for.
const YEAR_WINDOW: std::ops::RangeInclusive<i32> = 1990..=2100;

/// Expand literals and inclusive ranges into a sorted, de-duplicated list.
pub fn parse_range(items: &[RangeItem]) -> Result<Vec<i64>> {
    let mut out = BTreeSet::new();
    for item in items {
        match item {
            RangeItem::Single(v) => {
                out.insert(*v);
            }
            RangeItem::Text(s) => {
                if let Some((start, end)) = s.split_once("...") {
                    let start: i64 = start
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid range start in {:?}", s))?;
                    let end: i64 = end
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid range end in {:?}", s))?;
                    if start > end {
                        bail!("range {:?} is reversed", s);
                    }
                    if end.saturating_sub(start) >= MAX_RANGE_SPAN {
                        bail!("range {:?} spans more than {} values", s, MAX_RANGE_SPAN);
                    }
                    out.extend(start..=end);
                } else {
                    let v: i64 = s
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid value {:?}", s))?;
                    out.insert(v);
                }
            }
        }
    }
    Ok(out.into_iter().collect())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text).context("invalid YAML configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.download.max_concurrent == 0 {
            bail!("download.max_concurrent must be at least 1");
        }
        if self.ingest.chunk_size == 0 {
            bail!("ingest.chunk_size must be at least 1");
        }
        Url::parse(&self.db1b_coupon.base_url)
            .with_context(|| format!("invalid base_url {:?}", self.db1b_coupon.base_url))?;
        self.periods()?;
        Ok(())
    }

    pub fn years(&self) -> Result<Vec<i32>> {
        parse_range(&self.db1b_coupon.years)?
            .into_iter()
            .map(|y| match i32::try_from(y) {
                Ok(year) if YEAR_WINDOW.contains(&year) => Ok(year),
                _ => bail!(
                    "year {} outside {}..={}",
                    y,
                    YEAR_WINDOW.start(),
                    YEAR_WINDOW.end()
                ),
            })
            .collect()
    }

    pub fn quarters(&self) -> Result<Vec<u8>> {
        parse_range(&self.db1b_coupon.quarters)?
            .into_iter()
            .map(|q| match u8::try_from(q) {
                Ok(q @ 1..=4) => Ok(q),
                _ => bail!("quarter must be between 1 and 4, got {}", q),
            })
            .collect()
    }

    /// All (year, quarter) pairs, year-major ascending.
    pub fn periods(&self) -> Result<Vec<Period>> {
        let quarters = self.quarters()?;
        let mut periods = Vec::new();
        for year in self.years()? {
            for &quarter in &quarters {
                periods.push(Period::new(year, quarter)?);
            }
        }
        Ok(periods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
download:
  max_concurrent: 2
  verify_ssl: false
db1b_coupon:
  base_url: https://transtats.bts.gov/PREZIP/Origin_and_Destination_Survey_DB1BCoupon
  years: ["2012...2014", 2018, "2013"]
  quarters: ["3...4", 1]
"#;

    #[test]
    fn expands_ranges_and_literals() -> Result<()> {
        let items = vec![
            RangeItem::Text("2012...2015".into()),
            RangeItem::Single(2018),
            RangeItem::Text(" 2014 ".into()),
        ];
        assert_eq!(parse_range(&items)?, vec![2012, 2013, 2014, 2015, 2018]);
        Ok(())
    }

    #[test]
    fn rejects_reversed_and_garbage_ranges() {
        assert!(parse_range(&[RangeItem::Text("2015...2012".into())]).is_err());
        assert!(parse_range(&[RangeItem::Text("20x2".into())]).is_err());
        assert!(parse_range(&[RangeItem::Text("2012...".into())]).is_err());
    }

    #[test]
    fn parses_sample_with_defaults() -> Result<()> {
        let config = Config::from_yaml_str(SAMPLE)?;
        assert_eq!(config.download.max_concurrent, 2);
        assert!(!config.download.verify_ssl);
        assert_eq!(config.download.timeout_secs, 30);
        assert_eq!(config.database.path, PathBuf::from("flights.db"));
        assert_eq!(config.ingest.chunk_size, 500_000);
        assert!(!config.ingest.skip_completed);

        assert_eq!(config.years()?, vec![2012, 2013, 2014, 2018]);
        assert_eq!(config.quarters()?, vec![1, 3, 4]);

        let periods = config.periods()?;
        assert_eq!(periods.len(), 12);
        assert_eq!(periods[0], Period::new(2012, 1)?);
        assert_eq!(periods[1], Period::new(2012, 3)?);
        assert_eq!(periods[11], Period::new(2018, 4)?);
        Ok(())
    }

    #[test]
    fn rejects_invalid_quarters_and_limits() {
        let bad_quarter = SAMPLE.replace(r#"["3...4", 1]"#, r#"["4...5"]"#);
        assert!(Config::from_yaml_str(&bad_quarter).is_err());

        let zero_workers = SAMPLE.replace("max_concurrent: 2", "max_concurrent: 0");
        assert!(Config::from_yaml_str(&zero_workers).is_err());
    }

    #[test]
    fn rejects_runaway_ranges_and_implausible_years() {
        assert!(parse_range(&[RangeItem::Text("1...1000000000".into())]).is_err());

        let typo = SAMPLE.replace(r#""2012...2014""#, r#""2012...20150""#);
        assert!(Config::from_yaml_str(&typo).is_err());

        let far_future = SAMPLE.replace(r#""2012...2014""#, r#""2999""#);
        assert!(Config::from_yaml_str(&far_future).is_err());
    }

    #[test]
    fn requires_source_section() {
        assert!(Config::from_yaml_str("download:\n  max_concurrent: 2\n").is_err());
    }
}
