//! Process-wide tracing setup

use crate::error::{BusError, BusResult};
use bus_config::{LogFormat, LoggingConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG` when allowed and set, otherwise from `level`
pub fn env_filter(config: &LoggingConfig) -> BusResult<EnvFilter> {
    if config.respect_rust_log {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| BusError::configuration(format!("invalid log filter '{}': {e}", config.level)))
}

/// Install the global subscriber; fails if one is already installed
pub fn init(config: &LoggingConfig) -> BusResult<()> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(tracing_subscriber::fmt::layer().compact()).try_init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
    };
    installed.map_err(|e| BusError::configuration(format!("tracing already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_malformed_filter() {
        let config = LoggingConfig {
            level: "bus=notalevel".into(),
            respect_rust_log: false,
            ..Default::default()
        };
        assert!(matches!(env_filter(&config), Err(BusError::Configuration { .. })));
    }

    #[test]
    fn test_accepts_per_crate_directives() {
        let config = LoggingConfig {
            level: "bus=debug,network=info".into(),
            respect_rust_log: false,
            ..Default::default()
        };
        assert!(env_filter(&config).is_ok());
    }
}
