//! `quotes`: query the quote engine from the terminal.
//!
//! - `quote`: latest quotes for one or more identifiers
//! - `history`: a price series
//! - `at`: the value nearest to a date
//! - `fx`: the USD/ILS rate
//! - `resolve`: show the canonical id for an input

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use quote_engine_core::config::EngineConfig;
use quote_engine_core::models::history::{HistoryRange, Interval};
use quote_engine_core::QuoteEngine;

#[derive(Parser)]
#[command(name = "quotes")]
#[command(about = "Multi-provider market quotes: crypto, global equities and TASE")]
#[command(version)]
struct Cli {
    /// JSON configuration file; `QUOTE_ENGINE_*` variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Latest quotes, one JSON record per id
    Quote {
        /// Identifiers: `cg:bitcoin`, `yahoo:AAPL`, `tase:1183441`, `AAPL`, `1183441`, ...
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Price series for one id
    History {
        id: String,
        #[arg(long, default_value = "1mo")]
        range: HistoryRange,
        #[arg(long)]
        interval: Option<Interval>,
    },
    /// Value nearest to a date (YYYY-MM-DD or RFC 3339)
    At { id: String, date: String },
    /// Current USD/ILS rate
    Fx,
    /// Canonical id for an input, without any network call
    Resolve { input: String },
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn parse_date(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("'{raw}' is neither YYYY-MM-DD nor RFC 3339"))?;
    let noon = date.and_hms_opt(12, 0, 0).context("invalid time of day")?;
    Ok(noon.and_utc())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Resolve { input } => match quote_engine_core::services::resolver::resolve_str(&input) {
            Some(id) => println!("{id}"),
            None => bail!("cannot resolve '{input}'"),
        },
        Commands::Quote { ids } => {
            let engine = QuoteEngine::new(config)?;
            print_json(&engine.fetch_batch(&ids).await)?;
        }
        Commands::History { id, range, interval } => {
            let engine = QuoteEngine::new(config)?;
            let resolved = engine.resolve(&id).with_context(|| format!("cannot resolve '{id}'"))?;
            print_json(&engine.fetch_history(&resolved, range, interval).await)?;
        }
        Commands::At { id, date } => {
            let engine = QuoteEngine::new(config)?;
            let resolved = engine.resolve(&id).with_context(|| format!("cannot resolve '{id}'"))?;
            let point = engine.price_at(&resolved, parse_date(&date)?).await?;
            print_json(&point)?;
        }
        Commands::Fx => {
            let engine = QuoteEngine::new(config)?;
            println!("{}", engine.usd_ils_rate().await?);
        }
    }

    Ok(())
}
