use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Coordination config
// ---------------------------------------------------------------------------

/// Tuning knobs for the coordination layer.  Every field has a default, so
/// an empty document is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    /// TTL (seconds) of segment leases and node locks.  A crashed holder
    /// blocks peers for at most this long.
    #[serde(default = "default_lead_ttl")]
    pub lead_ttl_secs: u32,
    /// Interval (seconds) between liveness heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// TTL (seconds) on the liveness row; must exceed the interval or the
    /// instance flickers out of the directory between ticks.
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_secs: u32,
}

fn default_lead_ttl() -> u32 {
    90
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_ttl() -> u32 {
    60
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lead_ttl_secs: default_lead_ttl(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_ttl_secs: default_heartbeat_ttl(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`CoordinationConfig`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CoordinationConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: CoordinationConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &CoordinationConfig) -> Result<()> {
    anyhow::ensure!(config.lead_ttl_secs > 0, "lead_ttl_secs must be positive");
    anyhow::ensure!(
        u64::from(config.heartbeat_ttl_secs) > config.heartbeat_interval_secs,
        "heartbeat_ttl_secs must exceed heartbeat_interval_secs"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: CoordinationConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.lead_ttl_secs, 90);
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.heartbeat_ttl_secs, 60);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: CoordinationConfig =
            serde_yaml::from_str("lead_ttl_secs: 120\nheartbeat_interval_secs: 5\n").unwrap();
        assert_eq!(config.lead_ttl_secs, 120);
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn heartbeat_ttl_must_exceed_interval() {
        let config = CoordinationConfig {
            heartbeat_interval_secs: 60,
            heartbeat_ttl_secs: 60,
            ..CoordinationConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }
}
