use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use starguard::config::{LogFormat, LoggingConfig, StarguardConfig};
use starguard::replay::{self, Replayer, Simulation};
use starguard::throttle::StarboardThrottles;

/// Sliding-window admission control for starboard events.
#[derive(Debug, Parser)]
#[command(name = "starguard", version, about)]
struct Cli {
    /// Configuration file (YAML). STARGUARD__* variables override it.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a JSON-lines event log and print one decision per event
    Replay {
        /// Event log path, or `-` for stdin
        #[arg(default_value = "-")]
        input: String,
    },
    /// Run a seeded synthetic workload and print the totals
    Simulate {
        #[arg(long, default_value_t = 100)]
        guilds: u64,
        #[arg(long, default_value_t = 100_000)]
        events: u64,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Events per second across all guilds
        #[arg(long, default_value_t = 2_000.0)]
        rate: f64,
    },
    /// Print the effective configuration as YAML
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(cli));
    // A pending stdin read cannot be cancelled, so don't wait on it forever.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = StarguardConfig::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_tracing(&config.logging)?;

    info!("Starting Starguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Replay { input } => {
            let throttles = Arc::new(replay::offline_throttles(&config)?);
            run_replay(&input, Arc::clone(&throttles)).await?;
            log_registry_sizes(&throttles);
        }
        Command::Simulate {
            guilds,
            events,
            seed,
            rate,
        } => {
            let simulation = Simulation {
                guilds,
                events,
                seed,
                rate,
            };
            let throttles = Arc::new(replay::offline_throttles(&config)?);
            run_simulation(simulation, Arc::clone(&throttles)).await?;
            log_registry_sizes(&throttles);
        }
        Command::Config => {
            print!("{}", config.to_yaml()?);
        }
    }

    info!("Starguard stopped");
    Ok(())
}

async fn run_replay(input: &str, throttles: Arc<StarboardThrottles>) -> anyhow::Result<()> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if input == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        Box::new(BufReader::new(tokio::fs::File::open(input).await?))
    };

    info!(input, "Replaying events");
    let mut replayer = Replayer::new(throttles);
    tokio::select! {
        result = replay::replay(reader, tokio::io::stdout(), &mut replayer) => {
            result?;
        }
        _ = shutdown_signal() => {}
    }
    Ok(())
}

async fn run_simulation(
    simulation: Simulation,
    throttles: Arc<StarboardThrottles>,
) -> anyhow::Result<()> {
    info!(?simulation, "Running simulation");

    let stop = Arc::new(AtomicBool::new(false));
    let mut task = tokio::task::spawn_blocking({
        let stop = Arc::clone(&stop);
        move || replay::simulate(&throttles, &simulation, &stop)
    });

    // A blocking task cannot be aborted; it polls the stop flag instead.
    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = shutdown_signal() => {
            stop.store(true, Ordering::Relaxed);
            task.await
        }
    };

    let summary = joined??;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn log_registry_sizes(throttles: &StarboardThrottles) {
    for stats in throttles.stats() {
        info!(
            registry = stats.name,
            active = stats.active,
            retiring = stats.retiring,
            "Final registry size"
        );
    }
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)?,
    };

    // Logs go to stderr; stdout carries decisions and reports.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
