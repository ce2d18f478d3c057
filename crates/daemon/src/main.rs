//! kubesnap daemon entry point.
//!
//! Loads configuration, builds the backup engine, runs the backup scheduler
//! and handles graceful shutdown.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kubesnap_core::config::AppConfig;
use kubesnap_core::{BackupEngine, ManifestDirSource};

/// How long shutdown waits for an in-flight cycle.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// kubesnap backup daemon.
#[derive(Parser, Debug)]
#[command(
    name = "kubesnap",
    version,
    about = "Periodically back up Kubernetes resources into a Git repository"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single backup cycle and exit.
    #[arg(long)]
    once: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load and resolve configuration
    let mut config =
        AppConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;
    config
        .validate()
        .context("configuration validation failed")?;

    // Initialize tracing
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    // Startup banner
    info!("========================================");
    info!("  kubesnap v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    if config.daemon.dump_only {
        info!("Mode          : dump only (no git)");
    } else {
        info!("Remote        : {}", config.git.remote_url);
        info!("Branch        : {}", config.git.branch);
        info!("Auth          : {:?}", config.git.effective_auth_method());
    }
    info!("Work dir      : {}", config.daemon.work_dir.display());
    info!("Listings      : {}", config.source.manifest_dir.display());
    info!("Interval      : {}s", config.daemon.interval_secs);
    info!("Log level     : {}", log_level);
    info!("========================================");

    // Build the engine. Bad credentials settings are fatal here.
    let source = ManifestDirSource::new(&config.source.manifest_dir);
    let engine = Arc::new(
        BackupEngine::from_config(&config, Box::new(source))
            .context("failed to initialize backup engine")?,
    );

    // Repository problems at startup are retried by the first cycle.
    {
        let engine = engine.clone();
        match tokio::task::spawn_blocking(move || engine.initialize()).await {
            Ok(Ok(())) => info!("snapshot target initialized"),
            Ok(Err(e)) => warn!(error = %e, "snapshot target initialization failed, will retry on first cycle"),
            Err(e) => warn!(error = %e, "snapshot target initialization task failed"),
        }
    }

    let sched = Arc::new(scheduler::Scheduler::new(
        engine.clone(),
        Duration::from_secs(config.daemon.interval_secs),
        Duration::from_secs(config.daemon.cycle_timeout_secs),
    ));

    if args.once {
        let report = sched
            .run_cycle()
            .await
            .map_err(|e| anyhow::anyhow!("backup cycle failed: {e}"))?;
        info!(
            commit = report.commit_sha.as_deref().unwrap_or("-"),
            "single backup cycle finished"
        );
        return Ok(());
    }

    // Create a shutdown notify for cooperative cancellation
    let shutdown = Arc::new(tokio::sync::Notify::new());

    let scheduler_handle = {
        let sched = sched.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sched.run(shutdown).await })
    };

    // Wait for shutdown signal
    signals::wait_for_shutdown().await;

    info!("Shutdown signal received, stopping...");

    // A stored permit reaches the scheduler even mid-cycle.
    shutdown.notify_one();

    // Wait for the scheduler to finish its current cycle
    match tokio::time::timeout(SHUTDOWN_GRACE, scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!(
            "scheduler did not stop within {}s, forcing shutdown",
            SHUTDOWN_GRACE.as_secs()
        ),
    }

    let stats = sched.stats();
    info!(
        cycles = stats.total_cycles.load(std::sync::atomic::Ordering::SeqCst),
        commits = stats.total_commits.load(std::sync::atomic::Ordering::SeqCst),
        errors = stats.total_errors.load(std::sync::atomic::Ordering::SeqCst),
        "kubesnap daemon stopped"
    );
    Ok(())
}
