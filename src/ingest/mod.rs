// src/ingest/mod.rs
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    cancel::CancelFlag,
    error::IngestError,
    fetch::ArchiveSource,
    period::Period,
    process::split::DEFAULT_CHUNK_ROWS,
    store::CouponStore,
};

pub mod task;

pub use task::{CommitState, PeriodState};

/// Terminal result of one period task.
#[derive(Debug)]
pub enum Outcome {
    Completed {
        rows: u64,
        skipped: u64,
        chunks: u64,
    },
    Failed {
        error: IngestError,
        chunks_loaded: u64,
        commit: CommitState,
    },
    Cancelled {
        chunks_loaded: u64,
        commit: CommitState,
    },
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled { .. })
    }

    fn not_started() -> Self {
        Outcome::Cancelled {
            chunks_loaded: 0,
            commit: CommitState::NotStarted,
        }
    }
}

/// Outcome of every requested period, keyed and ordered by period.
#[derive(Debug)]
pub struct RunSummary {
    pub outcomes: BTreeMap<Period, Outcome>,
    pub cancelled: bool,
    /// Most period tasks alive at once, from dispatch until their outcome was produced.
    pub peak_concurrency: usize,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_failed()).count()
    }

    pub fn cancelled_periods(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_cancelled()).count()
    }

    pub fn rows_loaded(&self) -> u64 {
        self.outcomes
            .values()
            .map(|o| match o {
                Outcome::Completed { rows, .. } => *rows,
                _ => 0,
            })
            .sum()
    }

    /// 0 on full success, 1 when the run was interrupted, 2 when any period failed.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            1
        } else if self.failed() > 0 {
            2
        } else {
            0
        }
    }

    pub fn log(&self) {
        for (period, outcome) in &self.outcomes {
            match outcome {
                Outcome::Completed {
                    rows,
                    skipped,
                    chunks,
                } => info!(
                    "{}: committed {} rows in {} chunk(s), {} skipped",
                    period, rows, chunks, skipped
                ),
                Outcome::Failed {
                    error,
                    chunks_loaded,
                    commit,
                } => error!(
                    "{}: failed after {} chunk(s), {}: {}",
                    period, chunks_loaded, commit, error
                ),
                Outcome::Cancelled {
                    chunks_loaded,
                    commit,
                } => warn!(
                    "{}: cancelled after {} chunk(s), {}",
                    period, chunks_loaded, commit
                ),
            }
        }

        if self.cancelled {
            warn!(
                "Process interrupted. In-progress periods were rolled back; {} completed period(s) remain committed.",
                self.completed()
            );
        } else if self.failed() > 0 {
            error!(
                "{} of {} period(s) failed; {} row(s) committed",
                self.failed(),
                self.outcomes.len(),
                self.rows_loaded()
            );
        } else {
            info!(
                "All {} period(s) completed; {} row(s) committed",
                self.outcomes.len(),
                self.rows_loaded()
            );
        }
        debug!(peak_concurrency = self.peak_concurrency, "worker pool drained");
    }
}

/// Number of period tasks currently running, and the high-water mark.
#[derive(Debug, Default)]
struct ActiveTasks {
    now: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveGuard(Arc<ActiveTasks>);

impl ActiveTasks {
    fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(self.clone())
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.now.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs period tasks on a bounded pool, sharing one source, one store and one cancellation flag.
pub struct Orchestrator<S: ArchiveSource> {
    source: Arc<S>,
    store: Arc<CouponStore>,
    cancel: CancelFlag,
    max_concurrency: usize,
    chunk_rows: usize,
}

impl<S: ArchiveSource> Orchestrator<S> {
    pub fn new(source: S, store: CouponStore, cancel: CancelFlag) -> Self {
        Orchestrator {
            source: Arc::new(source),
            store: Arc::new(store),
            cancel,
            max_concurrency: 4,
            chunk_rows: DEFAULT_CHUNK_ROWS,
        }
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_chunk_rows(mut self, n: usize) -> Self {
        self.chunk_rows = n.max(1);
        self
    }

    /// Run every period and collect exactly one outcome for each.
    ///
    /// Once cancellation is observed no further period is started; those periods report
    /// `Cancelled`. Running periods stop at their next checkpoint and roll back.
    pub async fn run_all(&self, periods: &[Period]) -> RunSummary {
        info!(
            "Starting ingestion of {} period(s) with {} concurrent workers",
            periods.len(),
            self.max_concurrency
        );
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut outcomes = BTreeMap::new();
        let mut dispatched = Vec::with_capacity(periods.len());
        let active = Arc::new(ActiveTasks::default());

        for &period in periods {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("worker pool closed: {}", e);
                    break;
                }
            };
            if self.cancel.is_cancelled() {
                break;
            }
            dispatched.push(period);

            let source = self.source.clone();
            let store = self.store.clone();
            let cancel = self.cancel.clone();
            let chunk_rows = self.chunk_rows;
            let active = active.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let _running = active.enter();
                let outcome = task::run_period(period, source, store, cancel, chunk_rows).await;
                (period, outcome)
            });
        }

        for &period in &periods[dispatched.len()..] {
            outcomes.insert(period, Outcome::not_started());
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((period, outcome)) => {
                    outcomes.insert(period, outcome);
                }
                Err(e) => error!("period task aborted: {}", e),
            }
        }

        // a task that panicked outside its blocking worker never reported
        for period in dispatched {
            outcomes.entry(period).or_insert_with(|| Outcome::Failed {
                error: IngestError::Worker("period task did not report an outcome".into()),
                chunks_loaded: 0,
                commit: CommitState::RolledBack,
            });
        }

        RunSummary {
            outcomes,
            cancelled: self.cancel.is_cancelled(),
            peak_concurrency: active.peak(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::split::tests::{coupon_csv, coupon_line, zip_of, HEADER};
    use crate::process::ItinKey;
    use anyhow::Result;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;
    use tempfile::TempDir;
    use tracing_subscriber::{fmt, EnvFilter};

    fn init_logging() {
        let _ = fmt()
            .with_env_filter(EnvFilter::new("debug"))
            .with_test_writer()
            .try_init();
    }

    /// In-memory archives with optional failures and a fetch delay.
    #[derive(Default)]
    struct FakeSource {
        archives: HashMap<Period, Vec<u8>>,
        failing: HashSet<Period>,
        delay: Duration,
    }

    impl FakeSource {
        fn with(mut self, period: Period, csv: &str) -> Self {
            self.archives.insert(period, zip_of(&[("coupons.csv", csv)]));
            self
        }
    }

    impl ArchiveSource for FakeSource {
        async fn fetch(&self, period: Period, cancel: &CancelFlag) -> Result<Vec<u8>, IngestError> {
            cancel.check()?;
            tokio::time::sleep(self.delay).await;

            let url = period.archive_url("https://fake.invalid/Origin_and_Destination_Survey_DB1BCoupon");
            if self.failing.contains(&period) {
                return Err(IngestError::Transport {
                    url,
                    reason: "connection reset".into(),
                });
            }
            self.archives
                .get(&period)
                .cloned()
                .ok_or_else(|| IngestError::Transport {
                    url,
                    reason: "404 Not Found".into(),
                })
        }
    }

    fn temp_store() -> Result<(TempDir, CouponStore)> {
        let dir = tempfile::tempdir()?;
        let store = CouponStore::open(dir.path().join("flights.db"), Duration::from_secs(60))?;
        Ok((dir, store))
    }

    fn q(year: i32, quarter: u8) -> Period {
        Period { year, quarter }
    }

    #[tokio::test]
    async fn failing_period_does_not_affect_others() -> Result<()> {
        init_logging();
        let (_dir, store) = temp_store()?;
        let mut source = FakeSource::default()
            .with(q(2020, 2), &coupon_csv(6))
            .with(q(2020, 3), &coupon_csv(9));
        source.failing.insert(q(2020, 1));

        let orchestrator = Orchestrator::new(source, store.clone(), CancelFlag::new())
            .with_max_concurrency(3)
            .with_chunk_rows(4);
        let summary = orchestrator
            .run_all(&[q(2020, 1), q(2020, 2), q(2020, 3)])
            .await;

        assert!(matches!(
            summary.outcomes[&q(2020, 1)],
            Outcome::Failed {
                error: IngestError::Transport { .. },
                chunks_loaded: 0,
                commit: CommitState::NotStarted,
            }
        ));
        assert!(matches!(
            summary.outcomes[&q(2020, 2)],
            Outcome::Completed { rows: 6, skipped: 0, chunks: 2 }
        ));
        assert!(matches!(
            summary.outcomes[&q(2020, 3)],
            Outcome::Completed { rows: 9, skipped: 0, chunks: 3 }
        ));
        assert_eq!(summary.exit_code(), 2);

        assert_eq!(store.count_period(q(2020, 1))?, 0);
        assert_eq!(store.count_period(q(2020, 2))?, 6);
        assert_eq!(store.count_period(q(2020, 3))?, 9);
        Ok(())
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_bound() -> Result<()> {
        init_logging();
        let (_dir, store) = temp_store()?;
        let periods: Vec<Period> = (1..=4)
            .map(|quarter| q(2019, quarter))
            .chain([q(2020, 1)])
            .collect();
        let mut source = FakeSource {
            delay: Duration::from_millis(50),
            ..Default::default()
        };
        for &period in &periods {
            source = source.with(period, &coupon_csv(2));
        }

        let summary = Orchestrator::new(source, store.clone(), CancelFlag::new())
            .with_max_concurrency(2)
            .run_all(&periods)
            .await;

        assert_eq!(summary.completed(), 5);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.peak_concurrency, 2);
        assert_eq!(store.count_all()?, 10);
        Ok(())
    }

    #[tokio::test]
    async fn bound_holds_while_extracting_and_loading() -> Result<()> {
        init_logging();
        let (_dir, store) = temp_store()?;
        let periods: Vec<Period> = (1..=4)
            .map(|quarter| q(2016, quarter))
            .chain([q(2017, 1)])
            .collect();
        // no fetch delay, so tasks spend their time in extraction and chunked loading
        let mut source = FakeSource::default();
        for &period in &periods {
            source = source.with(period, &coupon_csv(3_000));
        }

        let summary = Orchestrator::new(source, store.clone(), CancelFlag::new())
            .with_max_concurrency(2)
            .with_chunk_rows(100)
            .run_all(&periods)
            .await;

        assert_eq!(summary.completed(), 5);
        assert!(
            (1..=2).contains(&summary.peak_concurrency),
            "peak concurrency {} outside 1..=2",
            summary.peak_concurrency
        );
        assert_eq!(store.count_all()?, 15_000);
        Ok(())
    }

    #[tokio::test]
    async fn waiting_on_a_sibling_write_lock_still_commits() -> Result<()> {
        init_logging();
        let dir = tempfile::tempdir()?;
        let store = CouponStore::open(dir.path().join("flights.db"), Duration::from_millis(300))?;

        let held = q(2019, 1);
        let mut tx = store.begin_period(held, CancelFlag::new())?;
        let csv = coupon_csv(2);
        let mut archive = crate::process::CouponArchive::open(zip_of(&[("c.csv", csv.as_str())]))?;
        for chunk in archive.chunks(10)? {
            let out = crate::process::transform_chunk(held, chunk?.rows);
            tx.load_chunk(&out.records)?;
        }
        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1_000));
            tx.commit(0)
        });

        let period = q(2020, 1);
        let source = FakeSource::default().with(period, &coupon_csv(4));
        let summary = Orchestrator::new(source, store.clone(), CancelFlag::new())
            .run_all(&[period])
            .await;

        assert!(matches!(
            summary.outcomes[&period],
            Outcome::Completed { rows: 4, .. }
        ));
        holder.join().expect("holder thread")?;
        assert_eq!(store.count_all()?, 6);
        Ok(())
    }

    #[tokio::test]
    async fn reingesting_a_period_is_idempotent() -> Result<()> {
        init_logging();
        let (_dir, store) = temp_store()?;
        let period = q(2018, 4);
        let csv = coupon_csv(25);

        for _ in 0..2 {
            let source = FakeSource::default().with(period, &csv);
            let summary = Orchestrator::new(source, store.clone(), CancelFlag::new())
                .with_chunk_rows(7)
                .run_all(&[period])
                .await;
            assert!(matches!(
                summary.outcomes[&period],
                Outcome::Completed { rows: 25, .. }
            ));
        }
        let first = store.lookup_itinerary(&ItinKey::encode("2020100000")?)?;

        let source = FakeSource::default().with(period, &csv);
        Orchestrator::new(source, store.clone(), CancelFlag::new())
            .run_all(&[period])
            .await;

        assert_eq!(store.count_period(period)?, 25);
        assert_eq!(store.lookup_itinerary(&ItinKey::encode("2020100000")?)?, first);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].itin_key.as_str(), "0186A0");
        Ok(())
    }

    #[tokio::test]
    async fn bad_rows_are_skipped_not_fatal() -> Result<()> {
        init_logging();
        let (_dir, store) = temp_store()?;
        let period = q(2017, 1);

        let mut csv = String::from(HEADER);
        csv.push('\n');
        for i in 0..10_000u32 {
            let itin = if i == 5_000 {
                "2017ABC".to_string()
            } else {
                format!("2017{}", 200_000 + i)
            };
            csv.push_str(&coupon_line(&itin, 1));
            csv.push('\n');
        }

        let source = FakeSource::default().with(period, &csv);
        let summary = Orchestrator::new(source, store.clone(), CancelFlag::new())
            .with_chunk_rows(3_000)
            .run_all(&[period])
            .await;

        assert!(matches!(
            summary.outcomes[&period],
            Outcome::Completed { rows: 9_999, skipped: 1, chunks: 4 }
        ));
        assert_eq!(store.count_period(period)?, 9_999);
        let ledger = store.last_ingest(period)?.expect("ledger row");
        assert_eq!(ledger.rows_skipped, 1);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() -> Result<()> {
        init_logging();
        let (_dir, store) = temp_store()?;
        let periods = [q(2021, 1), q(2021, 2), q(2021, 3)];
        let mut source = FakeSource::default();
        for &period in &periods {
            source = source.with(period, &coupon_csv(4));
        }

        let cancel = CancelFlag::new();
        cancel.cancel();
        let summary = Orchestrator::new(source, store.clone(), cancel)
            .run_all(&periods)
            .await;

        assert!(summary.cancelled);
        assert_eq!(summary.cancelled_periods(), 3);
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(store.count_all()?, 0);
        assert!(store.completed_periods()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_mid_run_keeps_committed_periods() -> Result<()> {
        init_logging();
        let (_dir, store) = temp_store()?;
        let cancel = CancelFlag::new();

        let first = q(2022, 1);
        let source = FakeSource::default().with(first, &coupon_csv(8));
        let summary = Orchestrator::new(source, store.clone(), cancel.clone())
            .run_all(&[first])
            .await;
        assert!(summary.outcomes[&first].is_completed());

        // the flag flips while the next periods are still fetching
        let periods = [q(2022, 2), q(2022, 3), q(2022, 4)];
        let mut source = FakeSource {
            delay: Duration::from_millis(200),
            ..Default::default()
        };
        for &period in &periods {
            source = source.with(period, &coupon_csv(8));
        }
        let orchestrator =
            Orchestrator::new(source, store.clone(), cancel.clone()).with_max_concurrency(1);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let summary = orchestrator.run_all(&periods).await;

        assert!(summary.cancelled);
        assert_eq!(summary.completed(), 0);
        assert_eq!(summary.cancelled_periods(), 3);
        assert_eq!(store.count_all()?, 8);
        assert_eq!(
            store.completed_periods()?.into_iter().collect::<Vec<_>>(),
            vec![first]
        );
        Ok(())
    }
}
