//! Node configuration.
//!
//! Composes the store and grid configs with the driver's own settings,
//! loaded via the `config` crate from `CHIME_`-prefixed environment
//! variables. Nested fields use a `__` separator, so the grid URL is read
//! from `CHIME_NATS__URL` and the node address from
//! `CHIME_STORE__NODE_ADDRESS`.

use chime_grid::NatsGridConfig;
use chime_store::StoreConfig;
use serde::Deserialize;

/// Environment variable prefix.
const ENV_PREFIX: &str = "CHIME";

/// Node configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Trigger store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// NATS grid configuration.
    pub nats: NatsGridConfig,

    /// Driver loop configuration.
    #[serde(default)]
    pub driver: DriverConfig,
}

/// Settings for the acquire, fire, complete loop.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Interval between acquisition rounds, in milliseconds.
    /// Also how far ahead each round looks for due triggers.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum number of triggers acquired per round.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How far past the first acquired trigger a batch may reach, in milliseconds.
    #[serde(default)]
    pub batch_time_window_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    1
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            batch_time_window_ms: 0,
        }
    }
}

impl DriverConfig {
    /// Returns the poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the acquisition look-ahead.
    #[must_use]
    pub fn look_ahead(&self) -> chrono::Duration {
        millis(self.poll_interval_ms)
    }

    /// Returns the batch time window.
    #[must_use]
    pub fn batch_time_window(&self) -> chrono::Duration {
        millis(self.batch_time_window_ms)
    }
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::try_milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
        .unwrap_or(chrono::Duration::MAX)
}

impl NodeConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
