//! Single-threaded completion-based runtime.
//!
//! Three pieces, leaves first:
//! - `buffer`: mirrored ring buffer, one page double-mapped so filled and
//!   free regions are always contiguous slices
//! - `connection`: fixed-capacity table of socket + buffer slots addressed
//!   by integer handles
//! - `uring`: the io_uring event loop driving accept/recv/send against the
//!   table

mod buffer;
mod connection;
mod token;
mod uring;

use crate::config::Config;

/// Run the server on the io_uring backend until a fatal error.
pub fn run(config: Config) -> std::io::Result<()> {
    uring::run(&config)
}
