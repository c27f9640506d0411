use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use factor_engine::commands::{backtest, check, recipe, splits};
use factor_engine::proposer::TEMPLATE_IDS;
use log::info;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "factor-engine")]
#[command(about = "Factor evaluation with purged walk-forward backtests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest one factor spec and write the report as JSON
    Backtest {
        /// Factor spec (YAML, or JSON by extension)
        #[arg(long, value_name = "PATH")]
        spec: PathBuf,
        /// Price panel JSON
        #[arg(long, value_name = "PATH")]
        prices: PathBuf,
        /// Return panel JSON (derived from prices when omitted)
        #[arg(long, value_name = "PATH")]
        returns: Option<PathBuf>,
        /// Engine settings JSON
        #[arg(long, value_name = "PATH")]
        settings: Option<PathBuf>,
        /// Destination for the report (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Parse a factor spec and run the static leakage check without data
    Check {
        #[arg(long, value_name = "PATH")]
        spec: PathBuf,
    },
    /// Print the walk-forward split plan for a spec over a price panel
    Splits {
        #[arg(long, value_name = "PATH")]
        spec: PathBuf,
        #[arg(long, value_name = "PATH")]
        prices: PathBuf,
        #[arg(long, value_name = "PATH")]
        settings: Option<PathBuf>,
    },
    /// Print the YAML of a built-in factor template
    Recipe {
        /// Template ID (tsmom, low_volatility, short_term_reversal, vol_scaled_momentum)
        template_id: String,
        /// Universe tag written into the spec
        #[arg(long)]
        universe: Option<String>,
        /// Template parameter override, e.g. --param lookback=126
        #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_parameter)]
        params: Vec<(String, f64)>,
    },
}

fn parse_parameter(raw: &str) -> Result<(String, f64)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=VALUE (value: {})", raw))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|_| anyhow!("parameter {} must be a number (value: {})", name, value))?;
    Ok((name.trim().to_string(), value))
}

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!(
        "Starting factor-engine ({} built-in templates). Backtests are not predictions.",
        TEMPLATE_IDS.len()
    );

    match command {
        Commands::Backtest {
            spec,
            prices,
            returns,
            settings,
            output,
        } => {
            backtest::run(
                &spec,
                &prices,
                returns.as_deref(),
                settings.as_deref(),
                output.as_deref(),
            )?;
        }
        Commands::Check { spec } => {
            check::run(&spec)?;
        }
        Commands::Splits {
            spec,
            prices,
            settings,
        } => {
            splits::run(&spec, &prices, settings.as_deref())?;
        }
        Commands::Recipe {
            template_id,
            universe,
            params,
        } => {
            let parameters: HashMap<String, f64> = params.into_iter().collect();
            recipe::run(&template_id, universe, parameters)?;
        }
    }

    Ok(())
}
