//! clawjudge - alert strategy evaluator
//!
//! Pulls alerting strategies from the catalog, evaluates them against the
//! time-series backend and publishes alert and recovery events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use claw_judge::{Registry, StrategyCatalog, StrategyPlan, build_publisher, load_strategy_file};
use claw_series::{HttpSeriesQuery, StorageBuffer};
use clawjudge::JudgeConfig;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "clawjudge")]
#[command(about = "Alert strategy evaluator")]
#[command(version)]
struct Cli {
    /// Log as JSON lines
    #[arg(long, global = true, env = "CLAWJUDGE_LOG_JSON")]
    log_json: bool,

    /// Log level of the clawjudge crates (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the evaluator until Ctrl-C
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/clawjudge/config.toml")]
        config: PathBuf,
    },

    /// Validate a config file and its local strategy catalog
    Check {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/clawjudge/config.toml")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/clawjudge/config.toml")]
        output: PathBuf,
    },
}

fn init_tracing(json: bool, level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!(
            "clawjudge={level},claw_judge={level},claw_series={level}"
        ))?,
    };

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json, &cli.log_level)?;

    match cli.command {
        Commands::Run { config } => {
            run_judge(config).await?;
        }

        Commands::Check { config } => {
            check_config(config).await?;
        }

        Commands::InitConfig { output } => {
            init_config(output)?;
        }
    }

    Ok(())
}

async fn run_judge(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting clawjudge");

    let config = JudgeConfig::from_file(&config_path)?;
    let identity = config.identity()?;
    info!(
        identity = %identity,
        publisher = %config.publisher.kind,
        "loaded config"
    );

    let remote = HttpSeriesQuery::new(config.query.clone())?;
    let storage = Arc::new(StorageBuffer::new(config.storage.clone(), Arc::new(remote)));
    let publisher = build_publisher(&config.publisher)?;
    let index_interval = Duration::from_millis(config.strategy.index_interval_ms.max(1));
    let registry = Arc::new(Registry::new(storage, publisher, index_interval));
    let catalog = Arc::new(StrategyCatalog::new(config.strategy.clone(), identity)?);

    match registry.bootstrap(&catalog).await {
        Ok(report) => info!(total = report.total, added = report.added, "strategies loaded"),
        Err(e) => warn!(error = %e, "initial strategy load failed, waiting for next pull"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manage = {
        let registry = Arc::clone(&registry);
        let catalog = Arc::clone(&catalog);
        tokio::spawn(async move {
            registry.run_manage_loop(&catalog, shutdown_rx).await;
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    shutdown_tx.send_replace(true);
    if let Err(e) = manage.await {
        error!(error = %e, "strategy manage loop failed");
    }
    let summary = registry.summary();
    registry.shutdown().await;
    info!(
        strategies = summary.strategy_count,
        series = summary.series_count,
        "clawjudge stopped"
    );

    Ok(())
}

async fn check_config(config_path: PathBuf) -> anyhow::Result<()> {
    let config = JudgeConfig::from_file(&config_path)?;
    println!("Config {} is valid", config_path.display());
    println!();
    println!("  Identity: {}", config.identity()?);
    println!("  Publisher: {}", config.publisher.kind);
    println!("  Query addresses: {}", config.query.addrs.len());
    println!("  Index addresses: {}", config.query.index_addrs.len());

    let Some(file) = config.strategy.file.as_deref() else {
        println!("  Strategy catalog: {} remote address(es)", config.strategy.addrs.len());
        return Ok(());
    };

    let strategies = load_strategy_file(file).await?;
    let total = strategies.len();
    let mut rejected = 0;
    for strategy in strategies {
        let sid = strategy.id;
        if let Err(e) = StrategyPlan::new(strategy) {
            rejected += 1;
            println!("  strategy {sid} rejected: {e}");
        }
    }

    println!("  Strategy file: {file}");
    println!("  Accepted: {}", total - rejected);
    println!("  Rejected: {rejected}");

    Ok(())
}

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    JudgeConfig::sample().save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the query and strategy addresses, then run:");
    println!("  clawjudge run --config {}", output.display());

    Ok(())
}
