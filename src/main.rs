use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use bpfchaind::chain::ChainManager;
use bpfchaind::config::Config;
use bpfchaind::export::HealthMetrics;
use bpfchaind::model::DesiredState;

/// Control daemon for chains of XDP/TC eBPF programs.
#[derive(Parser)]
#[command(name = "bpfchaind", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("bpfchaind {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the daemon run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting bpfchaind",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let cfg = Arc::new(cfg);

    // Health server comes up first so probes respond during bring-up.
    let health = Arc::new(
        HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
    );
    health.start().await.context("starting health server")?;

    let manager = Arc::new(
        ChainManager::new(Arc::clone(&cfg), Arc::clone(&health))
            .context("creating chain manager")?,
    );

    // Apply the startup desired-state snapshot, if configured. The delivery
    // surface for later updates calls ChainManager::reconcile directly.
    if let Some(state_file) = &cfg.desired_state_file {
        let hostname = cfg.resolved_hostname().context("resolving hostname")?;
        let data = std::fs::read_to_string(state_file)
            .with_context(|| format!("reading desired state from {}", state_file.display()))?;
        let state: DesiredState = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing desired state from {}", state_file.display()))?;

        // A failed reconcile leaves the affected chain in its last consistent
        // state; the daemon stays up so a later delivery can retry.
        match manager.apply_desired_state(&state, &hostname).await {
            Ok(()) => tracing::info!(hostname = %hostname, "startup desired state applied"),
            Err(e) => tracing::error!(error = %e, "startup desired state failed"),
        }
    }

    // Background monitor-map sampling.
    let sampler = {
        let manager = Arc::clone(&manager);
        let interval = cfg.monitor.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.sample_monitor_metrics().await;
            }
        })
    };

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown: stop sampling, tear every chain down, then the
    // health server.
    sampler.abort();
    manager.close().await;
    health.stop().await?;

    tracing::info!("bpfchaind stopped");

    Ok(())
}
