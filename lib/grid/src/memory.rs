//! In-process data grid.
//!
//! All clones of a `MemoryGrid` share the same maps and locks, so several
//! store instances built on clones behave like nodes of one cluster. Used in
//! tests and for single-process deployments.

use crate::backend::{ClusterLock, GridBackend};
use crate::error::GridError;
use async_trait::async_trait;
use chime_core::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{RwLock, Semaphore};

type MapContents = BTreeMap<String, Vec<u8>>;

/// A data grid held in process memory.
#[derive(Clone, Default)]
pub struct MemoryGrid {
    inner: Arc<MemoryGridInner>,
}

#[derive(Default)]
struct MemoryGridInner {
    maps: RwLock<HashMap<String, MapContents>>,
    locks: Mutex<HashMap<String, Arc<MemoryLock>>>,
    unavailable: AtomicBool,
}

impl MemoryGrid {
    /// Creates an empty grid.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the grid as reachable or not; `ping` fails while unreachable.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Closes every lock, interrupting current and future waiters.
    pub fn close_locks(&self) {
        let locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for lock in locks.values() {
            lock.permit.close();
        }
    }
}

#[async_trait]
impl GridBackend for MemoryGrid {
    async fn ping(&self) -> Result<(), GridError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(GridError::Unavailable {
                details: "in-memory grid marked unavailable".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn get(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>, GridError> {
        let maps = self.inner.maps.read().await;
        Ok(maps.get(map).and_then(|entries| entries.get(key)).cloned())
    }

    async fn put(&self, map: &str, key: &str, value: Vec<u8>) -> Result<(), GridError> {
        let mut maps = self.inner.maps.write().await;
        maps.entry(map.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(
        &self,
        map: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, GridError> {
        let mut maps = self.inner.maps.write().await;
        let entries = maps.entry(map.to_string()).or_default();
        if let Some(existing) = entries.get(key) {
            return Ok(Some(existing.clone()));
        }
        entries.insert(key.to_string(), value);
        Ok(None)
    }

    async fn remove(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>, GridError> {
        let mut maps = self.inner.maps.write().await;
        Ok(maps.get_mut(map).and_then(|entries| entries.remove(key)))
    }

    async fn contains_key(&self, map: &str, key: &str) -> Result<bool, GridError> {
        let maps = self.inner.maps.read().await;
        Ok(maps.get(map).is_some_and(|entries| entries.contains_key(key)))
    }

    async fn entries(&self, map: &str) -> Result<Vec<(String, Vec<u8>)>, GridError> {
        let maps = self.inner.maps.read().await;
        Ok(maps
            .get(map)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear(&self, map: &str) -> Result<(), GridError> {
        let mut maps = self.inner.maps.write().await;
        maps.remove(map);
        Ok(())
    }

    fn lock(&self, name: &str) -> Arc<dyn ClusterLock> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryLock::new(name)));
        Arc::clone(lock) as Arc<dyn ClusterLock>
    }
}

/// A cluster lock backed by a single-permit semaphore.
struct MemoryLock {
    name: String,
    permit: Semaphore,
}

impl MemoryLock {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            permit: Semaphore::new(1),
        }
    }
}

#[async_trait]
impl ClusterLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self) -> Result<(), GridError> {
        let permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| GridError::LockInterrupted {
                lock: self.name.clone(),
            })?;
        // Held until `unlock` hands the permit back.
        permit.forget();
        Ok(())
    }

    async fn unlock(&self) -> Result<(), GridError> {
        if self.permit.available_permits() > 0 {
            return Err(GridError::LockReleaseFailed {
                lock: self.name.clone(),
                details: "lock is not held".to_string(),
            }
            .into());
        }
        self.permit.add_permits(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clones_share_state() {
        let grid = MemoryGrid::new();
        let other = grid.clone();

        grid.put("m", "k", b"v".to_vec()).await.unwrap();
        assert_eq!(other.get("m", "k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn same_name_yields_same_lock() {
        let grid = MemoryGrid::new();
        let first = grid.lock("cluster");
        let second = grid.clone().lock("cluster");

        first.lock().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), second.lock()).await;
        assert!(blocked.is_err(), "second holder should wait");

        first.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_millis(200), second.lock())
            .await
            .expect("lock should be granted after release")
            .unwrap();
        second.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn unlock_without_holding_fails() {
        let grid = MemoryGrid::new();
        let lock = grid.lock("cluster");
        assert!(lock.unlock().await.is_err());
    }

    #[tokio::test]
    async fn closed_lock_interrupts_waiters() {
        let grid = MemoryGrid::new();
        let lock = grid.lock("cluster");
        grid.close_locks();

        let err = lock.lock().await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            GridError::LockInterrupted { .. }
        ));
    }

    #[tokio::test]
    async fn ping_reflects_availability() {
        let grid = MemoryGrid::new();
        assert!(grid.ping().await.is_ok());

        grid.set_available(false);
        assert!(grid.ping().await.is_err());
    }
}
