//! AQMS Node - Offline-first air quality monitoring
//!
//! Samples the sensors once per cycle, timestamps the reading against NTP
//! and the persistent clock, and uploads it or keeps it in a durable
//! backlog until the collector is reachable again.

mod host;

use anyhow::Context;
use aqms_core::{
    BacklogStore, ConfigLoader, CycleController, CycleOutcome, DataLog, FsDurableFile, NodeConfig,
    PersistentClock, PublishOrchestrator, TimeReconciler, Transport, Uptime,
};
use aqms_uplink::{CollectorClient, SntpTimeSource, ThingSpeakClient};
use clap::{Parser, Subcommand};
use host::{FileClock, JsonFileSensor, SystemUptime};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "aqms-node")]
#[command(author = "AQMS Contributors")]
#[command(version)]
#[command(about = "Offline-first air quality monitoring node", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "AQMS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sampling cycle
    Run {
        /// Keep cycling, sleeping between cycles
        #[arg(long)]
        forever: bool,
    },

    /// Show node configuration and backlog state
    Status,

    /// Replay the backlog to the collector without sampling
    Drain {
        /// Successful publishes allowed (defaults to the configured budget)
        #[arg(short, long)]
        max: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, load_error) = match ConfigLoader::new().with_cli_path(cli.config.clone()).load() {
        Ok(config) => (config, None),
        Err(e) => (NodeConfig::default(), Some(e)),
    };

    // Setup logging - CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.node.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(e) = load_error {
        warn!("Failed to load configuration: {}, using defaults", e);
    }

    match cli.command {
        Commands::Run { forever } => run_command(&config, forever).await,
        Commands::Status => status_command(&config),
        Commands::Drain { max } => drain_command(&config, max).await,
    }
}

fn collector(config: &NodeConfig) -> anyhow::Result<Arc<CollectorClient>> {
    let client = CollectorClient::new(
        &config.uplink.collector_url,
        config.request_timeout(),
        config.connect_timeout(),
    )
    .with_context(|| format!("invalid collector URL {}", config.uplink.collector_url))?;
    Ok(Arc::new(client))
}

fn backlog(config: &NodeConfig, file: Arc<FsDurableFile>) -> BacklogStore {
    BacklogStore::new(file, config.backlog_path()).with_policy(config.storage.corrupt_policy)
}

fn orchestrator(config: &NodeConfig, file: Arc<FsDurableFile>) -> anyhow::Result<PublishOrchestrator> {
    let mut orchestrator =
        PublishOrchestrator::new(collector(config)?, backlog(config, file), config.publish_config());

    let thingspeak = &config.uplink.thingspeak;
    if thingspeak.enabled {
        let api_key = thingspeak
            .api_key
            .clone()
            .context("ThingSpeak mirror enabled without an api_key")?;
        let mirror = ThingSpeakClient::new(&thingspeak.endpoint, api_key, config.request_timeout())
            .context("invalid ThingSpeak configuration")?;
        orchestrator = orchestrator.with_mirror(Arc::new(mirror));
    }

    Ok(orchestrator)
}

/// Assemble a fresh controller, as after a wake from deep sleep
fn controller(config: &NodeConfig, uptime: Arc<dyn Uptime>) -> anyhow::Result<CycleController> {
    let file = Arc::new(FsDurableFile::new());

    let time = TimeReconciler::new(
        Arc::new(SntpTimeSource::new(config.time.ntp_server.clone())),
        Arc::new(FileClock::new(config.clock_path())),
        config.time_config(),
    );
    let sensors = Arc::new(JsonFileSensor::new(
        config.sensor.sample_path.as_ref().map(PathBuf::from),
    ));

    let mut controller = CycleController::new(
        sensors,
        time,
        orchestrator(config, file.clone())?,
        uptime,
        config.cycle_config(),
    );
    if config.storage.data_log_enabled {
        controller = controller.with_data_log(DataLog::new(file, config.data_log_path()));
    }

    Ok(controller)
}

async fn run_command(config: &NodeConfig, forever: bool) -> anyhow::Result<()> {
    info!("AQMS node v{} starting", aqms_core::NODE_VERSION);
    let uptime: Arc<dyn Uptime> = Arc::new(SystemUptime::new());

    loop {
        let report = controller(config, uptime.clone())?.run().await;
        report.status.log();

        match report.outcome {
            CycleOutcome::Published => info!("Reading published"),
            CycleOutcome::Backlogged => info!("Reading stored in backlog"),
            CycleOutcome::Lost => warn!("Reading lost"),
        }

        if !forever {
            break;
        }

        info!("Next cycle in {:.0}s", report.sleep_time.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(report.sleep_time) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn status_command(config: &NodeConfig) -> anyhow::Result<()> {
    println!();
    println!("AQMS Node v{}", aqms_core::NODE_VERSION);
    println!();

    println!("Collector:      {}", config.uplink.collector_url);
    println!(
        "ThingSpeak:     {}",
        if config.uplink.thingspeak.enabled { "enabled" } else { "disabled" }
    );
    println!("NTP server:     {}", config.time.ntp_server);
    println!("Cycle period:   {}s", config.cycle.period_secs);
    println!("Data directory: {}", config.data_dir().display());
    println!();

    let store = backlog(config, Arc::new(FsDurableFile::new()));
    match store.len() {
        Ok(n) => println!("Backlog:        {} reading(s) in {}", n, store.path().display()),
        Err(e) => println!("Backlog:        unavailable ({})", e),
    }
    if store.quarantine_path().exists() {
        println!("Quarantine:     {}", store.quarantine_path().display());
    }

    let clock = FileClock::new(config.clock_path());
    match clock.read() {
        Ok(reading) if reading.power_lost => {
            println!("Clock:          not set ({})", clock.path().display())
        }
        Ok(reading) => println!("Clock:          {}", reading.time),
        Err(e) => println!("Clock:          unavailable ({})", e),
    }
    println!();

    Ok(())
}

async fn drain_command(config: &NodeConfig, max: Option<usize>) -> anyhow::Result<()> {
    let collector = collector(config)?;
    if !collector.is_connected().await {
        anyhow::bail!("collector {} is unreachable", collector.url());
    }

    let orchestrator = PublishOrchestrator::new(
        collector,
        backlog(config, Arc::new(FsDurableFile::new())),
        config.publish_config(),
    );
    let budget = max.unwrap_or(config.uplink.drain_max_items);
    let report = orchestrator
        .drain_backlog(budget)
        .await
        .context("backlog drain failed")?;

    println!(
        "Published {}, failed {}, deferred {}, corrupt {}",
        report.published,
        report.failed,
        report.deferred,
        report.corrupt.len()
    );
    Ok(())
}
