pub mod config;
pub mod distributed;
pub mod distributions;
pub mod error;
pub mod generator;
pub mod inference;
pub mod replicas;
pub mod runner;
pub mod sampling;
pub mod simulator;
pub mod stats;

mod progress;
#[cfg(test)]
mod test_support;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging with a default filter.
///
/// Use the `RUST_LOG` environment variable to override the default filter.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,epi_calibrate=debug"));

    fmt().with_env_filter(filter).with_target(false).init();
}
