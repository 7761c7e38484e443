//! Proxy Sieve - proxy list validator
//!
//! Scans directories of proxy lists in several formats, probes every
//! candidate for reachability and throughput through the proxy itself, and
//! reports the usable ones grouped by protocol and exit country.

pub mod config;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod proxy;
pub mod report;
pub mod tui;

pub use config::Config;
pub use pipeline::{Pipeline, RunStatus};
pub use proxy::*;

use std::path::Path;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Install the global tracing subscriber.
///
/// An explicit `level` wins over `RUST_LOG`; without either the filter is
/// `info`. With `log_file` set, output goes there instead of stderr.
pub fn init_logger(level: Option<&str>, log_file: Option<&Path>) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = fmt().with_env_filter(filter).with_target(true);

    let installed = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))
}
