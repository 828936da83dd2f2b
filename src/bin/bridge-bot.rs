// Bridge Trading Bot - command line entry point
// Live bridge over JSON lines, paper replays, config and state inspection

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use bridge_trader::core::instruments::{FileInstrumentSource, StaticInstrumentSource};
use bridge_trader::core::liveness::FileHeartbeatSink;
use bridge_trader::core::position_store::{JsonFileStore, MemoryStore, PositionStateStore};
use bridge_trader::simulation::{load_bars, PaperBroker, Replay};
use bridge_trader::strategy::StrategyRegistry;
use bridge_trader::transport::{JsonLinesTransport, RecordingTransport};
use bridge_trader::types::{ManualClock, SystemClock};
use bridge_trader::{BrokerEvent, Config, ConfigError, TradeManager, TradingEngine, TradingError};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "bridge-bot")]
#[command(version = "0.3.0")]
#[command(about = "Strategy-driven order management for a broker bridge", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Load and validate the configuration
    Check,

    /// Print the persisted state for a strategy tag
    State {
        /// Strategy tag (defaults to the configured one)
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Trade live: broker events on stdin, order requests on stdout
    Run,

    /// Replay a JSON-lines bar file against the paper broker
    Replay {
        /// Bar file, one {"symbol": ..., "timestamp": ..., "open": ...} object per line
        #[arg(short, long)]
        bars: PathBuf,

        /// Starting account balance
        #[arg(long, default_value = "10000")]
        balance: f64,

        /// Spread added to the close to form the ask
        #[arg(long, default_value = "0.0002")]
        spread: f64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Init writes the config, so it cannot depend on it
    if let Commands::Init { force } = cli.command {
        init_logging(if cli.verbose { "debug" } else { "info" });
        if let Err(e) = init_config(&cli.config, force) {
            error!("❌ {}", e);
            process::exit(1);
        }
        return;
    }

    let config = load_config_or_exit(&cli.config, cli.verbose);
    info!("🚀 Bridge Trading Bot v0.3.0");
    info!("📁 Config: {}", cli.config);

    let outcome = match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Check => check(&config),
        Commands::State { tag } => show_state(&config, tag.as_deref()),
        Commands::Run => run_live(config).await,
        Commands::Replay { bars, balance, spread } => replay(&config, &bars, balance, spread),
    };

    if let Err(e) = outcome {
        match e.downcast_ref::<TradingError>() {
            Some(trading) => error!("❌ {}", trading.user_message()),
            None => error!("❌ {}", e),
        }
        process::exit(1);
    }
}

/// Logs go to stderr; stdout carries the order stream
fn init_logging(level: &str) {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

/// Load config or exit with helpful error message
fn load_config_or_exit(path: &str, verbose: bool) -> Config {
    match Config::from_file(path) {
        Ok(config) => {
            init_logging(if verbose { "debug" } else { &config.logging.level });
            config
        }
        Err(e) => {
            init_logging("info");
            error!("❌ Configuration Error");
            error!("{}", e);

            if matches!(e, ConfigError::FileRead(_)) {
                error!("");
                error!("💡 Quick fix:");
                error!("   1. Run: bridge-bot init");
                error!("   2. Edit config.toml for your strategy and symbols");
                error!("   3. Try again");
            }

            process::exit(1);
        }
    }
}

fn init_config(path: &str, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if Path::new(path).exists() && !force {
        warn!("⚠️  {} already exists, skipping (use --force to overwrite)", path);
        return Ok(());
    }
    let config = Config::default();
    config.to_file(path)?;
    std::fs::create_dir_all(&config.persistence.state_dir)?;
    info!("📝 Created {}", path);
    info!("💡 Next steps:");
    info!("   1. Edit {} for your strategy and symbols", path);
    info!("   2. Run: bridge-bot check");
    info!("   3. Run: bridge-bot replay --bars bars.jsonl");
    Ok(())
}

fn check(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let registry = StrategyRegistry::with_builtins();
    registry.create(&config.strategy.name, &config.strategy.params)?;

    info!("✅ Configuration valid");
    info!("   Tag: {} (magic {})", config.strategy.tag, config.strategy.magic);
    info!(
        "   Strategy: {} on {} [{}]",
        config.strategy.name,
        config.strategy.symbols.join(", "),
        config.strategy.timeframe
    );
    info!("   Risk per trade: {:.2}%", config.risk.risk_per_trade * 100.0);
    info!("   State dir: {}", config.persistence.state_dir.display());
    let names: Vec<&str> = registry.names().collect();
    info!("   Available strategies: {}", names.join(", "));
    Ok(())
}

fn file_store(config: &Config) -> JsonFileStore {
    JsonFileStore::new(
        config.persistence.state_dir.clone(),
        Duration::from_millis(config.persistence.io_timeout_ms),
    )
}

fn show_state(config: &Config, tag: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let tag = tag.unwrap_or(&config.strategy.tag);
    match file_store(config).load(tag)? {
        Some(state) => {
            info!("📂 {} position(s) for {}", state.positions.len(), tag);
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        None => info!("📂 No persisted state for {}", tag),
    }
    Ok(())
}

async fn run_live(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.persistence.state_dir)?;

    let registry = StrategyRegistry::with_builtins();
    let mut manager = TradeManager::new(
        &config,
        &registry,
        Box::new(file_store(&config)),
        Box::new(JsonLinesTransport::stdout()),
    )?;
    if let Some(dir) = &config.instruments.rules_dir {
        info!("📐 Instrument rules fetched from {}", dir.display());
        manager = manager.with_instrument_source(Box::new(FileInstrumentSource::new(
            dir.clone(),
            config.instruments.max_age(),
        )));
    }
    if let Err(e) = manager.recover() {
        warn!("⚠️  Starting with new orders halted: {}", e);
    }

    let mut engine = TradingEngine::new(manager, &config.liveness, Arc::new(SystemClock));
    if let Some(path) = &config.liveness.heartbeat_file {
        engine = engine.with_heartbeat_sink(Box::new(FileHeartbeatSink::new(path.clone())));
    }

    let (event_tx, event_rx) = mpsc::channel(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match BrokerEvent::from_json_line(&line) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("⚠️  Unreadable broker message dropped: {}", e),
                },
                Ok(None) => {
                    info!("📭 Broker input closed");
                    break;
                }
                Err(e) => {
                    error!("❌ Failed reading broker input: {}", e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Received Ctrl+C");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(event_rx, shutdown_rx).await?;
    Ok(())
}

fn replay(config: &Config, bars_path: &Path, balance: f64, spread: f64) -> Result<(), Box<dyn std::error::Error>> {
    let bars = load_bars(bars_path)?;
    info!("📊 Loaded {} bars from {}", bars.len(), bars_path.display());

    let start = bars.first().map(|b| b.bar.timestamp).unwrap_or_else(Utc::now);
    let clock = Arc::new(ManualClock::new(start));
    let transport = RecordingTransport::new();
    let rules = config.instruments.symbols.clone();

    let manager = TradeManager::new(
        config,
        &StrategyRegistry::with_builtins(),
        Box::new(MemoryStore::new()),
        Box::new(transport.clone()),
    )?
    .with_clock(clock.clone())
    .with_instrument_source(Box::new(StaticInstrumentSource::new(rules.clone())));

    let broker = PaperBroker::new(balance, rules);
    let summary = Replay::new(manager, transport, broker, clock)
        .with_spread(spread)
        .run(&bars)?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
