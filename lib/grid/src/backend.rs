//! The data-grid seam.
//!
//! Backends store opaque bytes under string keys in named maps and hand out
//! named cluster locks. Every map operation is atomic for its single key;
//! nothing spans keys or maps. Compound updates must hold a `ClusterLock`.

use crate::error::GridError;
use async_trait::async_trait;
use chime_core::Result;
use std::sync::Arc;

/// Raw key-value access to a distributed data grid.
#[async_trait]
pub trait GridBackend: Send + Sync {
    /// Checks that the grid service is reachable.
    async fn ping(&self) -> Result<(), GridError>;

    /// Gets the value stored under a key.
    async fn get(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>, GridError>;

    /// Stores a value, replacing any existing one.
    async fn put(&self, map: &str, key: &str, value: Vec<u8>) -> Result<(), GridError>;

    /// Stores a value only if the key is vacant.
    ///
    /// Returns the existing value when the key was occupied.
    async fn put_if_absent(
        &self,
        map: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, GridError>;

    /// Removes a key, returning its previous value.
    async fn remove(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>, GridError>;

    /// Returns whether a key is present.
    async fn contains_key(&self, map: &str, key: &str) -> Result<bool, GridError>;

    /// Returns every entry of a map.
    async fn entries(&self, map: &str) -> Result<Vec<(String, Vec<u8>)>, GridError>;

    /// Removes every entry of a map.
    async fn clear(&self, map: &str) -> Result<(), GridError>;

    /// Returns the cluster-wide lock with the given name.
    fn lock(&self, name: &str) -> Arc<dyn ClusterLock>;
}

/// A named, cluster-wide exclusive lock.
///
/// Not reentrant: a holder that calls `lock` again waits on itself.
#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Returns the lock name.
    fn name(&self) -> &str;

    /// Waits until the lock is held by the caller.
    async fn lock(&self) -> Result<(), GridError>;

    /// Releases the lock.
    async fn unlock(&self) -> Result<(), GridError>;
}
