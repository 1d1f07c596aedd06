//! Tracing initialisation for hosts embedding the console.

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber: `RUST_LOG` filtering (default `info`) and
/// the fmt layer.
///
/// # Errors
///
/// Returns an error when `RUST_LOG` cannot be parsed or a global subscriber
/// is already installed.
pub fn init() -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives).context("parsing RUST_LOG")?,
        Err(_) => EnvFilter::new(DEFAULT_FILTER),
    };

    Registry::default()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .context("installing tracing subscriber")
}
