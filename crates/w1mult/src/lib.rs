//! The w1mult daemon: configuration file, command line and run loop around
//! the [`w1mult_core`] engine.

use std::path::PathBuf;

use clap::Parser;

/// JSON configuration file.
pub mod config;
pub use config::{
    load, parse, parse_rom, DaemonConfig, DeviceEntry, InitialRequest, SimReading, Simulation,
};

/// Engine loop and run summary.
pub mod runner;
pub use runner::{run, DeviceSummary, LogSummary, RunOptions, Summary};

#[cfg(test)]
use tempfile as _;

/// Command line of the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(
    name = "w1mult",
    version,
    about = "Samples a tree of 1-Wire devices behind branch couplers"
)]
pub struct Cli {
    /// JSON configuration file describing the bus.
    pub config: PathBuf,

    /// Heartbeats to run before printing the summary.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub heartbeats: u32,

    /// Advance a virtual clock instead of sleeping between timers.
    #[arg(long = "virtual")]
    pub virtual_clock: bool,
}

impl Cli {
    /// Run options selected on the command line.
    #[must_use]
    pub const fn options(&self) -> RunOptions {
        RunOptions {
            heartbeats: self.heartbeats,
            virtual_clock: self.virtual_clock,
        }
    }
}

/// Installs the stderr logger. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
