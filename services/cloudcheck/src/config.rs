//! Configuration for the recovery engine.

use std::time::Duration;

use anyhow::{Context, Result};

/// Default agent timeout.
///
/// Kept short so a cloudcheck over a whole fleet stays bounded; ten seconds
/// is still generous for a healthy agent.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Recovery engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudcheckConfig {
    /// Root domain appended to every DNS record name.
    pub root_domain: String,

    /// Bound on every agent call.
    pub agent_timeout: Duration,

    /// Extra attempts for `get_state` after a timeout.
    pub agent_get_state_retries: u32,

    /// Skip cloud-side VM deletion and only drop the reference.
    pub enable_virtual_delete_vms: bool,

    /// Leave a freshly created VM in place when it fails to come up.
    pub keep_unreachable_vms: bool,

    /// Log level (trace, debug, info, warn, error) or an `EnvFilter`
    /// directive, used by [`crate::telemetry::init_from_config`].
    pub log_level: String,
}

impl Default for CloudcheckConfig {
    fn default() -> Self {
        Self {
            root_domain: "bosh".to_string(),
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            agent_get_state_retries: 0,
            enable_virtual_delete_vms: false,
            keep_unreachable_vms: false,
            log_level: "info".to_string(),
        }
    }
}

impl CloudcheckConfig {
    /// Load configuration from `KEEL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let root_domain = std::env::var("KEEL_ROOT_DOMAIN").unwrap_or(defaults.root_domain);

        let agent_timeout = match std::env::var("KEEL_AGENT_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.parse()
                    .with_context(|| format!("invalid KEEL_AGENT_TIMEOUT_SECS '{raw}'"))?,
            ),
            Err(_) => defaults.agent_timeout,
        };

        let agent_get_state_retries = match std::env::var("KEEL_AGENT_GET_STATE_RETRIES") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid KEEL_AGENT_GET_STATE_RETRIES '{raw}'"))?,
            Err(_) => defaults.agent_get_state_retries,
        };

        let enable_virtual_delete_vms = env_flag("KEEL_ENABLE_VIRTUAL_DELETE_VMS");
        let keep_unreachable_vms = env_flag("KEEL_KEEP_UNREACHABLE_VMS");

        let log_level = std::env::var("KEEL_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            root_domain,
            agent_timeout,
            agent_get_state_retries,
            enable_virtual_delete_vms,
            keep_unreachable_vms,
            log_level,
        })
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CloudcheckConfig::default();
        assert_eq!(config.agent_timeout, Duration::from_secs(10));
        assert_eq!(config.agent_get_state_retries, 0);
        assert_eq!(config.root_domain, "bosh");
        assert!(!config.enable_virtual_delete_vms);
        assert_eq!(config.log_level, "info");
    }
}
