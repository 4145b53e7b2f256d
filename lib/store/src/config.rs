//! Store configuration.

use chime_core::NodeAddress;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Configuration for a clustered store instance.
///
/// Every field has a default, so an empty source deserializes to a usable
/// single-node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Address recorded as owner of the triggers this node acquires.
    /// Must be stable across restarts for orphan recovery to find its triggers.
    #[serde(default = "default_node_address")]
    pub node_address: NodeAddress,

    /// How late a trigger may be, in milliseconds, before it counts as misfired.
    #[serde(default = "default_misfire_threshold_ms")]
    pub misfire_threshold_ms: u64,

    /// Interval between consistency sweeps, in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Reported to the host engine as the time a release-and-reacquire takes.
    #[serde(default = "default_estimated_release_acquire_ms")]
    pub estimated_release_acquire_ms: u64,

    /// Name of the cluster-wide lock guarding compound operations.
    #[serde(default = "default_lock_name")]
    pub lock_name: String,

    /// Prefix for every shared map and set the store creates.
    #[serde(default = "default_map_prefix")]
    pub map_prefix: String,
}

fn default_node_address() -> NodeAddress {
    NodeAddress::new("localhost")
}

fn default_misfire_threshold_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    15_000
}

fn default_estimated_release_acquire_ms() -> u64 {
    25
}

fn default_lock_name() -> String {
    "chime-cluster-lock".to_string()
}

fn default_map_prefix() -> String {
    "chime".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            node_address: default_node_address(),
            misfire_threshold_ms: default_misfire_threshold_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            estimated_release_acquire_ms: default_estimated_release_acquire_ms(),
            lock_name: default_lock_name(),
            map_prefix: default_map_prefix(),
        }
    }
}

impl StoreConfig {
    /// Creates a default configuration for the given node address.
    #[must_use]
    pub fn for_node(node_address: impl Into<NodeAddress>) -> Self {
        Self {
            node_address: node_address.into(),
            ..Self::default()
        }
    }

    /// Returns the misfire threshold.
    #[must_use]
    pub fn misfire_threshold(&self) -> Duration {
        Duration::try_milliseconds(i64::try_from(self.misfire_threshold_ms).unwrap_or(i64::MAX))
            .unwrap_or(Duration::MAX)
    }

    /// Returns whether a trigger due at `next_fire_time` is more than the
    /// misfire threshold late at `now`.
    #[must_use]
    pub fn is_misfired(&self, next_fire_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.checked_sub_signed(self.misfire_threshold())
            .is_some_and(|cutoff| next_fire_time < cutoff)
    }

    /// Returns the sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }

    pub(crate) fn map_name(&self, map: &str) -> String {
        format!("{}-{map}", self.map_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_config_has_correct_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.misfire_threshold_ms, 60_000);
        assert_eq!(config.sweep_interval_ms, 15_000);
        assert_eq!(config.lock_name, "chime-cluster-lock");
    }

    #[test]
    fn empty_source_uses_defaults() {
        let config: StoreConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(config.node_address.as_str(), "localhost");
        assert_eq!(config.map_name("triggers"), "chime-triggers");
    }

    #[test]
    fn misfire_threshold_converts_to_duration() {
        let config = StoreConfig {
            misfire_threshold_ms: 1_500,
            ..StoreConfig::default()
        };
        assert_eq!(config.misfire_threshold(), Duration::milliseconds(1_500));
    }

    #[test]
    fn trigger_exactly_at_threshold_is_not_misfired() {
        let config = StoreConfig {
            misfire_threshold_ms: 1_000,
            ..StoreConfig::default()
        };
        let now = DateTime::<Utc>::UNIX_EPOCH + Duration::hours(1);

        assert!(!config.is_misfired(now - Duration::milliseconds(1_000), now));
        assert!(config.is_misfired(now - Duration::milliseconds(1_001), now));
        assert!(!config.is_misfired(now, now));
    }
}
