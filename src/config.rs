//! Command-line configuration.
//!
//! The CLI surface is deliberately tiny: one optional positional port.
//! Everything else the runtime needs is a fixed constant resolved into
//! [`Config`] here, so the event loop reads sizes from one place.

use clap::Parser;

/// Connection slots in the connection table.
const MAX_CONNECTIONS: usize = 512;

/// Capacity of the io_uring submission/completion ring.
const RING_ENTRIES: u32 = 1024;

const DEFAULT_PORT: u16 = 8000;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "echo-ring")]
#[command(about = "A zero-copy TCP echo server built on io_uring", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_connections: usize,
    pub ring_entries: u32,
}

impl Config {
    /// Resolve configuration from the command line.
    ///
    /// Invalid input (a non-numeric or out-of-range port) makes clap exit
    /// the process with a non-zero status.
    pub fn load() -> Self {
        let cli = CliArgs::parse();

        Config {
            port: cli.port,
            max_connections: MAX_CONNECTIONS,
            ring_entries: RING_ENTRIES,
        }
    }
}
