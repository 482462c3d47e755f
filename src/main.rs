//! Cycle engine: entry point.
//!
//! Loads configuration, initialises structured logging, opens the JSON
//! store, optionally opens a new cycle from a snapshot file, then polls
//! for due iterations until Ctrl+C.
//!
//! Usage:
//!   cycle-engine [--config PATH] [--open SNAPSHOT.json] [--duration-ms N] [--rebuild-calibration]

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use cycle_engine::calibration::CalibrationEngine;
use cycle_engine::config::{self, InvestConfig, TradingMode};
use cycle_engine::engine::executor::Executor;
use cycle_engine::engine::scheduler::Scheduler;
use cycle_engine::engine::{CycleManager, IterationOrchestrator};
use cycle_engine::prices;
use cycle_engine::storage::JsonStore;
use cycle_engine::types::AssetSnapshot;

const BANNER: &str = r#"
  ______   ______ _     _____
 / ___\ \ / / ___| |   | ____|
| |    \ V / |   | |   |  _|
| |___  | || |___| |___| |___
 \____| |_| \____|_____|_____|

  Cycle Investment Engine
  v0.1.0
"#;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Snapshot file: either a bare asset list or an object with a duration.
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Assets(Vec<AssetSnapshot>),
    Cycle {
        #[serde(rename = "durationMs", default)]
        duration_ms: Option<i64>,
        assets: Vec<AssetSnapshot>,
    },
}

#[derive(Parser, Debug)]
#[command(name = "cycle-engine", version, about = "Cycle investment engine")]
struct Cli {
    /// Open a new cycle from a snapshot JSON file
    #[arg(long, value_name = "SNAPSHOT")]
    open: Option<PathBuf>,
    /// Cycle duration in milliseconds, overriding the snapshot and config
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(i64).range(1..))]
    duration_ms: Option<i64>,
    /// Replay every closed position into a fresh calibration state
    #[arg(long)]
    rebuild_calibration: bool,
    /// Config file path
    #[arg(short, long, env = "CYCLE_ENGINE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let cfg = config::AppConfig::load(&cli.config.to_string_lossy())?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        mode = ?cfg.invest.mode,
        capital_total = format!("${:.2}", cfg.invest.capital_total),
        poll_interval_secs = cfg.agent.poll_interval_secs,
        state_dir = %cfg.agent.state_dir,
        "Cycle engine starting up"
    );

    // -- Initialise components -------------------------------------------

    let store = Arc::new(JsonStore::open(&cfg.agent.state_dir).await?);
    let resolver = prices::resolver_from_config(&cfg.prices)?;

    let executor = build_executor(&cfg.invest)?;

    let manager = Arc::new(
        CycleManager::new(
            store,
            IterationOrchestrator::new(resolver, cfg.invest.clone()),
            executor,
            CalibrationEngine::new(cfg.calibration.clone()),
        )
        .await?,
    );

    if cli.rebuild_calibration {
        manager.rebuild_calibration().await?;
    }

    if let Some(path) = &cli.open {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        let (assets, file_duration) = match serde_json::from_str::<SnapshotFile>(&json)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))?
        {
            SnapshotFile::Assets(assets) => (assets, None),
            SnapshotFile::Cycle { duration_ms, assets } => (assets, duration_ms),
        };
        let duration_ms = cli
            .duration_ms
            .or(file_duration)
            .unwrap_or(cfg.agent.default_cycle_duration_ms);

        let opened = manager.open_cycle(assets, duration_ms, Utc::now()).await?;
        info!(
            cycle = %opened.cycle.id,
            positions = opened.positions.len(),
            failed_orders = opened.failed_orders.len(),
            reason = %opened.selection.reason,
            "Snapshot loaded"
        );
    }

    // -- Main loop -------------------------------------------------------

    let mut scheduler = Scheduler::new("due-iterations");
    let job_manager = manager.clone();
    scheduler.start(Duration::from_secs(cfg.agent.poll_interval_secs.max(1)), move || {
        let manager = job_manager.clone();
        async move {
            let now = Utc::now();
            if let Err(e) = manager.run_due_cycles(now).await {
                error!(error = %e, "Due-cycle pass failed, continuing");
            }
            if let Err(e) = manager.sweep_open_positions(now).await {
                error!(error = %e, "Watchdog sweep failed, continuing");
            }
        }
    });

    info!(
        interval_secs = cfg.agent.poll_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received.");
    scheduler.stop();

    let report = manager.capital_report(Utc::now()).await?;
    info!(
        equity = format!("${}", report.equity),
        realized = format!("${}", report.realized_pnl),
        open = report.open_positions,
        closed = report.closed_positions,
        "Cycle engine shut down cleanly."
    );

    Ok(())
}

/// Only the simulated gateway ships with the binary; real mode is refused
/// before anything touches the store or the network.
fn build_executor(invest: &InvestConfig) -> Result<Executor> {
    if invest.mode == TradingMode::Real {
        anyhow::bail!(
            "Real mode on {} needs an exchange gateway, and this binary only has the simulated one",
            invest.exchange
        );
    }
    Ok(Executor::simulated(invest))
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cycle_engine=info"));

    let json_logging = std::env::var("CYCLE_ENGINE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
