//! NATS JetStream key-value data grid.
//!
//! - Each named map is its own KV bucket, `{bucket_prefix}-{map}`
//! - Keys are base64url-encoded to stay inside the KV key alphabet
//! - `put_if_absent` is a KV `create`, which fails if the key is live
//! - Cluster locks are `create`d keys in a lock bucket whose `max_age` is the
//!   lease TTL, so a holder that dies without unlocking is expired by NATS

use crate::backend::{ClusterLock, GridBackend};
use crate::error::GridError;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chime_core::Result;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

/// Default bucket prefix.
const DEFAULT_BUCKET_PREFIX: &str = "chime";

/// Suffix of the bucket that holds cluster locks.
const LOCK_BUCKET_SUFFIX: &str = "locks";

/// Attempts made by `put_if_absent` when the occupant vanishes between calls.
const PUT_IF_ABSENT_ATTEMPTS: usize = 3;

/// Configuration for the NATS-backed grid.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsGridConfig {
    /// NATS server URL.
    pub url: String,

    /// Prefix for every bucket this grid creates.
    #[serde(default = "default_bucket_prefix")]
    pub bucket_prefix: String,

    /// Lease TTL for cluster locks, in milliseconds.
    /// A lock held longer than this is expired by NATS and may be taken by another node.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Delay between attempts to take a contended lock, in milliseconds.
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
}

fn default_bucket_prefix() -> String {
    DEFAULT_BUCKET_PREFIX.to_string()
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_lock_poll_ms() -> u64 {
    25
}

impl NatsGridConfig {
    /// Creates a config with the given NATS URL and default settings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bucket_prefix: default_bucket_prefix(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_poll_ms: default_lock_poll_ms(),
        }
    }

    fn bucket_name(&self, map: &str) -> String {
        format!("{}-{map}", self.bucket_prefix)
    }

    fn lock_bucket_name(&self) -> String {
        self.bucket_name(LOCK_BUCKET_SUFFIX)
    }
}

/// A data grid backed by NATS JetStream key-value buckets.
#[derive(Clone)]
pub struct NatsGrid {
    shared: Arc<NatsShared>,
}

struct NatsShared {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsGridConfig,
    buckets: Mutex<HashMap<String, kv::Store>>,
}

impl NatsGrid {
    /// Connects to NATS.
    ///
    /// # Errors
    ///
    /// Returns `GridError::Unavailable` if the server cannot be reached.
    pub async fn connect(config: NatsGridConfig) -> Result<Self, GridError> {
        let client =
            async_nats::connect(&config.url)
                .await
                .map_err(|e| GridError::Unavailable {
                    details: format!("failed to connect to {}: {e}", config.url),
                })?;
        let jetstream = jetstream::new(client.clone());

        debug!(url = %config.url, prefix = %config.bucket_prefix, "connected to NATS grid");

        Ok(Self {
            shared: Arc::new(NatsShared {
                client,
                jetstream,
                config,
                buckets: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn encode_key(key: &str) -> String {
        URL_SAFE_NO_PAD.encode(key)
    }

    fn decode_key(map: &str, encoded: &str) -> Result<String, GridError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| GridError::Encoding {
                map: map.to_string(),
                details: e.to_string(),
            })?;
        String::from_utf8(bytes).map_err(|e| {
            GridError::Encoding {
                map: map.to_string(),
                details: e.to_string(),
            }
            .into()
        })
    }
}

impl NatsShared {
    /// Returns the bucket backing a map, creating it on first use.
    async fn bucket(&self, map: &str) -> Result<kv::Store, GridError> {
        let name = self.config.bucket_name(map);
        self.open_bucket(map, name, Duration::ZERO).await
    }

    async fn lock_bucket(&self) -> Result<kv::Store, GridError> {
        let ttl = Duration::from_millis(self.config.lock_ttl_ms);
        self.open_bucket(LOCK_BUCKET_SUFFIX, self.config.lock_bucket_name(), ttl)
            .await
    }

    async fn open_bucket(
        &self,
        map: &str,
        bucket: String,
        max_age: Duration,
    ) -> Result<kv::Store, GridError> {
        let mut buckets = self.buckets.lock().await;
        if let Some(store) = buckets.get(&bucket) {
            return Ok(store.clone());
        }

        let store = match self.jetstream.get_key_value(bucket.clone()).await {
            Ok(store) => store,
            Err(_) => self
                .jetstream
                .create_key_value(kv::Config {
                    bucket: bucket.clone(),
                    history: 1,
                    max_age,
                    ..Default::default()
                })
                .await
                .map_err(|e| GridError::OperationFailed {
                    map: map.to_string(),
                    details: format!("failed to create bucket {bucket}: {e}"),
                })?,
        };

        buckets.insert(bucket, store.clone());
        Ok(store)
    }
}

fn operation_failed(map: &str, error: impl std::fmt::Display) -> GridError {
    GridError::OperationFailed {
        map: map.to_string(),
        details: error.to_string(),
    }
}

#[async_trait]
impl GridBackend for NatsGrid {
    async fn ping(&self) -> Result<(), GridError> {
        self.shared
            .client
            .flush()
            .await
            .map_err(|e| GridError::Unavailable {
                details: e.to_string(),
            })?;
        Ok(())
    }

    async fn get(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>, GridError> {
        let store = self.shared.bucket(map).await?;
        let value = store
            .get(Self::encode_key(key))
            .await
            .map_err(|e| operation_failed(map, e))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    async fn put(&self, map: &str, key: &str, value: Vec<u8>) -> Result<(), GridError> {
        let store = self.shared.bucket(map).await?;
        store
            .put(Self::encode_key(key), value.into())
            .await
            .map_err(|e| operation_failed(map, e))?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        map: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, GridError> {
        let store = self.shared.bucket(map).await?;
        let encoded = Self::encode_key(key);

        for _ in 0..PUT_IF_ABSENT_ATTEMPTS {
            match store.create(&encoded, value.clone().into()).await {
                Ok(_) => return Ok(None),
                Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => {
                    let existing = store
                        .get(encoded.clone())
                        .await
                        .map_err(|e| operation_failed(map, e))?;
                    if let Some(existing) = existing {
                        return Ok(Some(existing.to_vec()));
                    }
                    // Deleted between create and get; try again.
                }
                Err(e) => return Err(operation_failed(map, e).into()),
            }
        }

        Err(operation_failed(map, "key kept changing during put_if_absent").into())
    }

    async fn remove(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>, GridError> {
        let store = self.shared.bucket(map).await?;
        let encoded = Self::encode_key(key);
        let previous = store
            .get(encoded.clone())
            .await
            .map_err(|e| operation_failed(map, e))?;
        if previous.is_some() {
            store
                .delete(&encoded)
                .await
                .map_err(|e| operation_failed(map, e))?;
        }
        Ok(previous.map(|bytes| bytes.to_vec()))
    }

    async fn contains_key(&self, map: &str, key: &str) -> Result<bool, GridError> {
        Ok(self.get(map, key).await?.is_some())
    }

    async fn entries(&self, map: &str) -> Result<Vec<(String, Vec<u8>)>, GridError> {
        let store = self.shared.bucket(map).await?;
        let mut keys = store.keys().await.map_err(|e| operation_failed(map, e))?;

        let mut encoded_keys = Vec::new();
        while let Some(key) = keys.next().await {
            encoded_keys.push(key.map_err(|e| operation_failed(map, e))?);
        }

        let mut entries = Vec::with_capacity(encoded_keys.len());
        for encoded in encoded_keys {
            let value = store
                .get(encoded.clone())
                .await
                .map_err(|e| operation_failed(map, e))?;
            // Keys removed after the listing are simply skipped.
            if let Some(value) = value {
                entries.push((Self::decode_key(map, &encoded)?, value.to_vec()));
            }
        }
        Ok(entries)
    }

    async fn clear(&self, map: &str) -> Result<(), GridError> {
        let store = self.shared.bucket(map).await?;
        let mut keys = store.keys().await.map_err(|e| operation_failed(map, e))?;

        let mut encoded_keys = Vec::new();
        while let Some(key) = keys.next().await {
            encoded_keys.push(key.map_err(|e| operation_failed(map, e))?);
        }
        for encoded in encoded_keys {
            store
                .purge(&encoded)
                .await
                .map_err(|e| operation_failed(map, e))?;
        }
        Ok(())
    }

    fn lock(&self, name: &str) -> Arc<dyn ClusterLock> {
        Arc::new(NatsLock {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
            key: Self::encode_key(name),
            token: Ulid::new().to_string(),
        })
    }
}

/// A cluster lock held as a live key in the lock bucket.
struct NatsLock {
    shared: Arc<NatsShared>,
    name: String,
    key: String,
    /// Written as the key's value so only this handle releases it.
    token: String,
}

#[async_trait]
impl ClusterLock for NatsLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self) -> Result<(), GridError> {
        let store = self.shared.lock_bucket().await.map_err(|_| {
            GridError::LockInterrupted {
                lock: self.name.clone(),
            }
        })?;
        let poll = Duration::from_millis(self.shared.config.lock_poll_ms);

        loop {
            match store.create(&self.key, self.token.clone().into()).await {
                Ok(_) => return Ok(()),
                Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => {
                    tokio::time::sleep(poll).await;
                }
                Err(e) => {
                    warn!(lock = %self.name, error = %e, "cluster lock acquisition failed");
                    return Err(GridError::LockInterrupted {
                        lock: self.name.clone(),
                    }
                    .into());
                }
            }
        }
    }

    async fn unlock(&self) -> Result<(), GridError> {
        let release_failed = |details: String| GridError::LockReleaseFailed {
            lock: self.name.clone(),
            details,
        };

        let store = self
            .shared
            .lock_bucket()
            .await
            .map_err(|e| release_failed(e.to_string()))?;
        let holder = store
            .get(self.key.clone())
            .await
            .map_err(|e| release_failed(e.to_string()))?;

        match holder {
            Some(value) if &value[..] == self.token.as_bytes() => {
                store
                    .delete(&self.key)
                    .await
                    .map_err(|e| release_failed(e.to_string()))?;
                Ok(())
            }
            Some(_) => Err(release_failed("lock is held by another node".to_string()).into()),
            None => Err(release_failed("lock lease expired before release".to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nats_grid_config_defaults() {
        let config = NatsGridConfig::new("nats://localhost:4222");

        assert_eq!(config.bucket_prefix, DEFAULT_BUCKET_PREFIX);
        assert_eq!(config.lock_ttl_ms, 30_000);
        assert_eq!(config.lock_poll_ms, 25);
    }

    #[test]
    fn bucket_names_use_prefix() {
        let config = NatsGridConfig {
            bucket_prefix: "prod".to_string(),
            ..NatsGridConfig::new("nats://localhost:4222")
        };

        assert_eq!(config.bucket_name("triggers"), "prod-triggers");
        assert_eq!(config.lock_bucket_name(), "prod-locks");
    }

    #[test]
    fn key_encoding_roundtrip() {
        let raw = r#"{"group":"DEFAULT","name":"nightly report"}"#;
        let encoded = NatsGrid::encode_key(raw);

        assert!(
            encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_eq!(NatsGrid::decode_key("jobs", &encoded).unwrap(), raw);
    }
}
