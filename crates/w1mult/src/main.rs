//! Entry point of the w1mult daemon.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger as _;
use log::error;
use serde as _;
use w1mult::{init_logging, load, run, Cli};
use w1mult_core as _;
#[cfg(test)]
use tempfile as _;

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match try_main(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

fn try_main(cli: &Cli) -> Result<()> {
    let config = load(&cli.config)?;
    let summary = run(&config, cli.options())?;
    let json = serde_json::to_string_pretty(&summary).context("encoding the summary")?;
    println!("{json}");
    Ok(())
}
