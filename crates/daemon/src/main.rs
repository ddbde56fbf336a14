//! svnmerge daemon entry point.
//!
//! Loads configuration, opens the database, builds the reconciliation
//! scheduler, starts the poll loop and handles graceful shutdown.

mod poller;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use svnmerge_core::config::AppConfig;
use svnmerge_core::db::Database;
use svnmerge_core::svn::SvnClient;
use svnmerge_core::{Reconciler, ReconciliationScheduler};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// svnmerge reconciliation daemon.
#[derive(Parser, Debug)]
#[command(
    name = "svnmerge-daemon",
    version,
    about = "Feature branch rebase/integration daemon for Subversion"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

/// Install the global subscriber. The returned guard flushes the log file
/// on drop and must live as long as the process.
fn init_tracing(config: &AppConfig, level: &str) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false);

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "svnmerge-daemon.log");
            let (file, guard) = tracing_appender::non_blocking(appender);
            builder.with_writer(std::io::stdout.and(file)).init();
            Ok(Some(guard))
        }
        None => {
            builder.init();
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let _log_guard = init_tracing(&config, &log_level)?;

    info!("========================================");
    info!("  svnmerge daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Task slots    : {}", config.scheduler.max_concurrent_tasks);
    info!("svn binary    : {}", config.svn.binary);
    info!("Log level     : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    let db_path = config.daemon.database_path();
    let db = Arc::new(Database::open(&db_path).context("failed to open database")?);
    let interrupted = db
        .fail_interrupted_task_runs()
        .context("failed to reset interrupted task runs")?;
    if interrupted > 0 {
        warn!(interrupted, "marked tasks left over from the previous run as failed");
    }
    info!("Database ready at {}", db_path.display());

    let svn = Arc::new(SvnClient::from_config(&config.svn));
    match svn.version().await {
        Ok(version) => info!("svn client version {}", version),
        Err(e) => warn!("svn client check failed: {}", e),
    }

    let reconciler = Arc::new(Reconciler::new(Arc::clone(&db), svn, &config));
    let scheduler = ReconciliationScheduler::new(reconciler, config.scheduler.max_concurrent_tasks);
    let poller = poller::Poller::new(
        scheduler,
        Duration::from_secs(config.daemon.poll_interval_secs),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let poller_handle = tokio::spawn(async move {
        poller.run(shutdown_rx).await;
    });

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");
    let _ = shutdown_tx.send(true);

    // Running tasks finish on their own; the poll cycle gets 10s.
    match tokio::time::timeout(Duration::from_secs(10), poller_handle).await {
        Ok(Ok(())) => info!("poller stopped gracefully"),
        Ok(Err(e)) => warn!("poller task error: {}", e),
        Err(_) => warn!("poller did not stop within 10s, forcing shutdown"),
    }

    info!("svnmerge daemon stopped.");
    Ok(())
}
