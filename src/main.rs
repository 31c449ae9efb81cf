mod commands;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mawaqit::config::Config;

use commands::{GroupAction, Services};

#[derive(Parser)]
#[command(
    name = "mawaqit",
    version,
    about = "Prayer-event scheduler with resilient multi-source prayer times",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file; environment variables are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configured format
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher, maintenance loops and the operational server
    Run,

    /// Resolve and print prayer times for a date
    Fetch {
        /// Civil date (YYYY-MM-DD); today in the default timezone when omitted
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },

    /// Print a group's upcoming events
    Schedule {
        #[arg(short, long)]
        group: i64,

        /// Instant to compute from (RFC 3339); now when omitted
        #[arg(long)]
        date_time: Option<DateTime<Utc>>,
    },

    /// Print the health snapshot as JSON
    Health,

    /// Purge expired cache entries and old ledger rows
    Purge,

    /// Group policy administration
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate().context("Invalid configuration")?;

    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mawaqit starting");

    let services = Services::build(config).await?;

    match cli.command {
        Commands::Run => commands::run(services).await?,
        Commands::Fetch { date } => {
            tracing::info!(date = ?date, "Starting fetch command");
            commands::fetch(&services, date).await?;
        }
        Commands::Schedule { group, date_time } => {
            tracing::info!(group, date_time = ?date_time, "Starting schedule command");
            commands::schedule(&services, group, date_time).await?;
        }
        Commands::Health => commands::health(&services).await?,
        Commands::Purge => commands::purge(&services).await?,
        Commands::Group { action } => commands::group(&services, action).await?,
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("mawaqit=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(format!("mawaqit={level},warn")))
            .context("Invalid log level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
