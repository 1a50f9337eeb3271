//! Structured logging setup.

use grantvault_types::{Result, VaultError, constants};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. With `json` set, events
/// are emitted as one JSON object per line.
///
/// # Errors
/// `Configuration` for an unparsable filter or if a global subscriber is
/// already installed.
pub fn init(default_filter: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| VaultError::Configuration(format!("log filter: {e}")))?;

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| VaultError::Configuration(format!("tracing init: {e}")))?;

    tracing::info!(
        engine = constants::ENGINE_NAME,
        version = constants::VERSION,
        json,
        "telemetry initialized"
    );
    Ok(())
}
