use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use insights_core::{
    runtime::{InsightsServices, WorkerRuntime},
    scan::{CatalogScanDriverType, CatalogScanState, CatalogScanUpdate},
    table_scan::{TablePrefixScanStartParameters, TableScan, TableScanDriverType},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::{ConfigLoad, ConfigLoader};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "insights-worker")]
#[command(about = "Incremental catalog scan orchestrator")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
struct GlobalArgs {
    /// Path to the TOML configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Identifies this process in lease records
    #[arg(long, global = true, env = "INSIGHTS_LEASE_OWNER")]
    lease_owner: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run queue workers and the timer loop until interrupted
    Run {
        /// Only consume queues; never run timers
        #[arg(long, default_value_t = false)]
        no_timers: bool,
    },
    /// Start an update scan for one driver
    Update {
        driver: CatalogScanDriverType,
        /// Upper bound (RFC 3339); defaults to the dependency cursor
        #[arg(long)]
        max: Option<DateTime<Utc>>,
        /// Process the scan in this process and wait for it to finish
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Start update scans for every registered driver
    UpdateAll {
        #[arg(long)]
        max: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Reprocess the leaves a driver already knows about
    Reprocess {
        driver: CatalogScanDriverType,
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Show cursors and recent scans
    State {
        /// Limit output to one driver
        driver: Option<CatalogScanDriverType>,
    },
    /// Copy every row under a partition key prefix into another table
    CopyTable {
        source: String,
        destination: String,
        /// Partition key prefix; empty copies the whole table
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(long, default_value_t = 1)]
        segments_per_first_prefix: usize,
        #[arg(long, default_value_t = 1)]
        segments_per_subsequent_prefix: usize,
        /// Process the copy in this process and wait for it to finish
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    #[command(subcommand)]
    Timer(TimerCommand),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Subcommand)]
enum TimerCommand {
    /// List timers and their stored state
    List,
    /// Allow a timer to run on its schedule
    Enable { name: String },
    /// Stop a timer from running on its schedule
    Disable { name: String },
    /// Run a timer now, ignoring its schedule
    Run { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = cli.global.config.clone() {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = cli.global.env_file.clone() {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad {
        config,
        warnings,
        config_path,
        env_file_loaded,
    } = loader.load().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,insights_core::storage=warn,insights_core::queue=warn,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded configuration file");
    }
    for warning in warnings.iter() {
        warn!("{warning}");
    }

    if let Command::Config = cli.command {
        let rendered =
            toml::to_string_pretty(&config).context("failed to render configuration")?;
        println!("{rendered}");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let mut builder = InsightsServices::builder(config).with_shutdown(shutdown.clone());
    if let Some(owner) = cli.global.lease_owner.clone() {
        builder = builder.with_lease_owner(owner);
    }
    let services = builder
        .with_configured_storage()
        .await
        .context("failed to open storage")?
        .build()
        .context("failed to build services")?;
    services
        .initialize()
        .await
        .context("failed to initialize storage")?;
    let services = Arc::new(services);

    match cli.command {
        Command::Run { no_timers } => run(services, !no_timers).await,
        Command::Update { driver, max, wait } => {
            let result = services
                .scan_service()
                .update(driver, max)
                .await
                .with_context(|| format!("failed to update {driver}"))?;
            println!("{driver}: {}", describe(&result));
            if wait && result.is_new_started() {
                wait_for_scans(&services, &[driver]).await?;
            }
            Ok(())
        }
        Command::UpdateAll { max, wait } => {
            let results = services.scan_service().update_all(max).await;
            let mut started = Vec::new();
            let mut failed = 0;
            for (driver, result) in &results {
                match result {
                    Ok(result) => {
                        println!("{driver}: {}", describe(result));
                        if result.is_new_started() {
                            started.push(*driver);
                        }
                    }
                    Err(err) => {
                        println!("{driver}: failed: {err}");
                        failed += 1;
                    }
                }
            }
            if wait && !started.is_empty() {
                wait_for_scans(&services, &started).await?;
            }
            if failed > 0 {
                anyhow::bail!("{failed} driver(s) failed to update");
            }
            Ok(())
        }
        Command::Reprocess { driver, wait } => {
            let result = services
                .scan_service()
                .reprocess(driver)
                .await
                .with_context(|| format!("failed to reprocess {driver}"))?;
            println!("{driver}: {}", describe(&result));
            if wait && result.is_new_started() {
                wait_for_scans(&services, &[driver]).await?;
            }
            Ok(())
        }
        Command::State { driver } => {
            let states = match driver {
                Some(driver) => vec![services.scan_service().get_state(driver).await?],
                None => services.scan_service().get_all_states().await?,
            };
            for state in &states {
                print_state(state);
            }
            Ok(())
        }
        Command::CopyTable {
            source,
            destination,
            prefix,
            segments_per_first_prefix,
            segments_per_subsequent_prefix,
            wait,
        } => {
            let start = TablePrefixScanStartParameters {
                segments_per_first_prefix,
                segments_per_subsequent_prefix,
            };
            let scan = services
                .table_scans()
                .start(
                    TableScanDriverType::TableCopy,
                    &source,
                    &prefix,
                    start,
                    serde_json::json!({ "destination_table_name": destination }),
                )
                .await
                .with_context(|| format!("failed to start copy of {source}"))?;
            println!("started table scan {} ({source} -> {destination})", scan.scan_id);
            if wait {
                wait_for_table_scan(&services, &scan).await?;
            }
            Ok(())
        }
        Command::Timer(command) => timer_command(&services, command).await,
        Command::Config => Ok(()),
    }
}

async fn run(services: Arc<InsightsServices>, with_timers: bool) -> anyhow::Result<()> {
    let runtime = WorkerRuntime::new(Arc::clone(&services));
    runtime
        .start(with_timers)
        .await
        .context("failed to start worker runtime")?;
    info!("worker running; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    runtime.shutdown().await?;
    Ok(())
}

/// Runs queue workers in-process until none of `drivers` has a running scan.
async fn wait_for_scans(
    services: &Arc<InsightsServices>,
    drivers: &[CatalogScanDriverType],
) -> anyhow::Result<()> {
    let runtime = WorkerRuntime::new(Arc::clone(services));
    runtime.start(false).await?;

    let outcome = loop {
        let mut running = false;
        for driver in drivers {
            running |= services.scan_service().is_running(*driver).await?;
        }
        if !running {
            break Ok(());
        }
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                break signal
                    .context("failed to listen for shutdown signal")
                    .and_then(|()| Err(anyhow::anyhow!("interrupted before scans completed")));
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    };

    runtime.shutdown().await?;
    outcome?;
    for driver in drivers {
        print_state(&services.scan_service().get_state(*driver).await?);
    }
    Ok(())
}

async fn wait_for_table_scan(
    services: &Arc<InsightsServices>,
    scan: &TableScan,
) -> anyhow::Result<()> {
    let runtime = WorkerRuntime::new(Arc::clone(services));
    runtime.start(false).await?;

    let outcome = loop {
        match services.table_scans().complete(scan).await {
            Ok(true) => break Ok(()),
            Ok(false) => {}
            Err(err) => break Err(anyhow::Error::from(err)),
        }
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                break signal
                    .context("failed to listen for shutdown signal")
                    .and_then(|()| Err(anyhow::anyhow!("interrupted before the copy completed")));
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    };

    runtime.shutdown().await?;
    outcome?;
    println!("table scan {} complete", scan.scan_id);
    Ok(())
}

async fn timer_command(services: &InsightsServices, command: TimerCommand) -> anyhow::Result<()> {
    let timers = services.timers();
    match command {
        TimerCommand::List => {
            for state in timers.get_state().await? {
                let last = state
                    .last_executed
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_owned());
                println!(
                    "{:<24} every {:<10} config={} stored={} running={} last={}",
                    state.name,
                    humantime::format_duration(state.frequency).to_string(),
                    on_off(state.is_enabled_in_config),
                    on_off(state.is_enabled_in_storage),
                    state.is_running,
                    last,
                );
            }
        }
        TimerCommand::Enable { name } => {
            timers.set_is_enabled(&name, true).await?;
            println!("{name}: enabled");
        }
        TimerCommand::Disable { name } => {
            timers.set_is_enabled(&name, false).await?;
            println!("{name}: disabled");
        }
        TimerCommand::Run { name } => {
            if timers.execute_now(&name).await? {
                println!("{name}: executed");
            } else {
                anyhow::bail!("{name}: run skipped, the timer lease is held by another worker");
            }
        }
    }
    Ok(())
}

fn describe(result: &CatalogScanUpdate) -> String {
    match result {
        CatalogScanUpdate::NewStarted(scan) => format!(
            "started scan {} over ({}, {}]",
            scan.scan_id, scan.min, scan.max
        ),
        CatalogScanUpdate::AlreadyRunning(scan) => {
            format!("scan {} is already running ({:?})", scan.scan_id, scan.state)
        }
        CatalogScanUpdate::Disabled => "disabled".to_owned(),
        CatalogScanUpdate::BlockedByDependency { dependency } => {
            format!("blocked by {dependency}")
        }
        CatalogScanUpdate::MinAfterMax { min, max } => {
            format!("cursor {min} is already past {max}")
        }
        CatalogScanUpdate::FullyCaughtUpWithDependency { dependency } => {
            format!("caught up with {dependency}")
        }
        CatalogScanUpdate::FullyCaughtUpWithMax => "caught up with the requested max".to_owned(),
    }
}

fn print_state(state: &CatalogScanState) {
    println!(
        "{} cursor={} enabled={} registered={}",
        state.driver_type,
        state.cursor_value.to_rfc3339(),
        state.is_enabled,
        state.is_registered,
    );
    for scan in &state.latest_scans {
        println!(
            "  {} {:?} {:?} ({}, {}]",
            scan.scan_id, scan.kind, scan.state, scan.min, scan.max
        );
    }
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}
