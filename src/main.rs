//! echo-ring: a zero-copy TCP echo server.
//!
//! Accepts TCP connections and writes every byte it reads straight back to
//! the peer. The interesting part is how: each connection owns a one-page
//! ring buffer whose backing memory is mapped twice contiguously, so the
//! kernel reads from and writes to it without any wrap-around handling,
//! and all I/O is driven through a single io_uring instance on a single
//! thread with exactly one operation in flight per connection.

mod config;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(port = config.port, "Starting echo-ring server");

    runtime::run(config)?;

    Ok(())
}
