//! Tracing setup
//!
//! Stdout carries the handshake line, so every log line goes to stderr as
//! JSON, which is what plugin hosts relay from their children.

use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Initialize JSON tracing on stderr
///
/// `RUST_LOG` wins over `plugin.log_level`. Calling this twice is an error
/// but leaves the first subscriber in place.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&config.plugin.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize tracing: {e}")))?;

    tracing::debug!(
        health_service = %config.plugin.health_service,
        "Tracing initialized"
    );

    Ok(())
}
