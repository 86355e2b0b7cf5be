//! `sipdrill`: run the scenario suite against the simulated core

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sipdrill_infra_common::logging::parse_log_level;
use sipdrill_infra_common::{setup_logging, LoggingConfig};
use sipdrill_scenario_suite::{run, RunnerConfig};

/// Concurrent multi-actor SIP scenario runner
#[derive(Parser, Debug)]
#[command(name = "sipdrill", author, version, about, long_about = None)]
struct Cli {
    /// TOML file with [harness] and [sim] sections
    #[arg(short, long, env = "SIPDRILL_CONFIG")]
    config: Option<PathBuf>,

    /// Only run tests whose name contains this (case-insensitive)
    #[arg(short, long)]
    filter: Option<String>,

    /// trace, debug, info, warn or error
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// The device swallows repeated provisional responses
    #[arg(long)]
    absorb_provisional: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = parse_log_level(&cli.log_level)?;
    setup_logging(LoggingConfig::new(level, "sipdrill")).context("failed to initialise logging")?;

    let mut config = RunnerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.absorb_provisional {
        config = config.with_absorbed_provisionals();
    }

    let report = run(&config, cli.filter.as_deref()).await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
