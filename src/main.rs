use anyhow::{Context, Result};
use db1b_ingest::{
    cancel::{install_signal_handlers, CancelFlag},
    config::Config,
    fetch::HttpArchiveSource,
    ingest::Orchestrator,
    period::Period,
    store::CouponStore,
};
use std::{env, process};
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(env).init();

    // ─── 2) load config ──────────────────────────────────────────────
    let config_path = env::args().nth(1).unwrap_or_else(|| "config.yml".to_string());
    let config = Config::load(&config_path)?;
    let mut periods = config.periods()?;
    info!(config = %config_path, "{} period(s) requested", periods.len());

    // ─── 3) cancellation ─────────────────────────────────────────────
    let cancel = CancelFlag::new();
    let _signals = install_signal_handlers(cancel.clone());
    info!("Press Ctrl+C to stop processing");

    // ─── 4) store + skip already-ingested periods ────────────────────
    let store = CouponStore::open(&config.database.path, config.database.busy_timeout())
        .with_context(|| format!("opening database {}", config.database.path.display()))?;
    if config.ingest.skip_completed {
        let done = store.completed_periods()?;
        periods.retain(|p: &Period| !done.contains(p));
        info!("{} period(s) already ingested; {} left", done.len(), periods.len());
    }
    if periods.is_empty() {
        info!("nothing to ingest; exit");
        return Ok(());
    }

    // ─── 5) run ──────────────────────────────────────────────────────
    let source = HttpArchiveSource::new(
        &config.db1b_coupon.base_url,
        config.download.verify_ssl,
        config.download.timeout(),
    )?;
    let orchestrator = Orchestrator::new(source, store, cancel)
        .with_max_concurrency(config.download.max_concurrent)
        .with_chunk_rows(config.ingest.chunk_size);

    let start = Instant::now();
    let summary = orchestrator.run_all(&periods).await;
    summary.log();
    info!(elapsed = ?start.elapsed(), "done");

    let code = summary.exit_code();
    if code != 0 {
        process::exit(code);
    }
    Ok(())
}
