//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::CloudcheckConfig;

/// Install a plain-text subscriber at the configured log level.
pub fn init_from_config(config: &CloudcheckConfig) {
    init(&config.log_level, false);
}

/// Install a global subscriber: `RUST_LOG` wins over `default_level`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let config = CloudcheckConfig {
            log_level: "keel_cloudcheck=trace".to_string(),
            ..CloudcheckConfig::default()
        };
        init_from_config(&config);
        init_from_config(&config);
        tracing::info!("still logging");
    }
}
