//! FlowBridge CLI entry point. The actual engine lives in the library
//! crate; this binary is just argument parsing, logging setup, and exit
//! codes.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flowbridge::config::Config;
use flowbridge::engine::Engine;
use flowbridge::flow::FlowState;

#[derive(Parser, Debug)]
#[command(name = "flowbridge")]
#[command(author = "FlowBridge Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "High-throughput pub-sub bridge with pluggable topologies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Load configuration from this .env-style file instead of the process
    /// environment / a discovered `.env`.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overridden by RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Starts the flow and runs until a shutdown signal arrives.
    Run,

    /// Validates configuration without starting the flow.
    Validate,
}

fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.env_file.as_deref())?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    setup_logging(log_level, cli.json_logs || config.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), mode = ?config.mode, "starting flowbridge");

    match cli.command {
        Commands::Validate => {
            info!("configuration is valid");
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let mut engine = Engine::build(&config).await?;
    let final_state = engine.run().await?;

    let snapshot = engine.flow().metrics().snapshot();
    for topic in &snapshot {
        info!(
            topic = %topic.topic,
            side = ?topic.side,
            messages = topic.message_count,
            bytes = topic.total_bytes,
            errors = topic.error_count,
            rate_per_second = topic.rate_per_second,
            "final topic metrics"
        );
    }

    match final_state {
        FlowState::Stopped => {
            info!("flowbridge stopped cleanly");
            Ok(())
        }
        other => {
            error!(state = ?other, "flowbridge stopped in a non-clean state");
            std::process::exit(1);
        }
    }
}
