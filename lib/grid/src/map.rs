//! Typed views over a grid backend.
//!
//! Keys and values are JSON-encoded so any backend that stores bytes can hold
//! structured records. Predicate queries decode each entry and keep the ones
//! the predicate accepts.

use crate::backend::GridBackend;
use crate::error::GridError;
use chime_core::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A distributed map from `K` to `V`.
pub struct GridMap<K, V> {
    backend: Arc<dyn GridBackend>,
    name: String,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for GridMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            name: self.name.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> fmt::Debug for GridMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridMap").field("name", &self.name).finish()
    }
}

impl<K, V> GridMap<K, V>
where
    K: Serialize + DeserializeOwned + Send + Sync,
    V: Serialize + DeserializeOwned + Send + Sync,
{
    /// Creates a typed view of the named map.
    #[must_use]
    pub fn new(backend: Arc<dyn GridBackend>, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
            _types: PhantomData,
        }
    }

    /// Returns the map name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the value for a key.
    pub async fn get(&self, key: &K) -> Result<Option<V>, GridError> {
        let key = self.encode_key(key)?;
        match self.backend.get(&self.name, &key).await? {
            Some(bytes) => Ok(Some(self.decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stores a value, replacing any existing one.
    pub async fn set(&self, key: &K, value: &V) -> Result<(), GridError> {
        let key = self.encode_key(key)?;
        let value = self.encode_value(value)?;
        self.backend.put(&self.name, &key, value).await
    }

    /// Stores a value only if the key is vacant, returning the occupant otherwise.
    pub async fn put_if_absent(&self, key: &K, value: &V) -> Result<Option<V>, GridError> {
        let key = self.encode_key(key)?;
        let value = self.encode_value(value)?;
        match self.backend.put_if_absent(&self.name, &key, value).await? {
            Some(existing) => Ok(Some(self.decode_value(&existing)?)),
            None => Ok(None),
        }
    }

    /// Removes a key, returning its previous value.
    pub async fn remove(&self, key: &K) -> Result<Option<V>, GridError> {
        let key = self.encode_key(key)?;
        match self.backend.remove(&self.name, &key).await? {
            Some(previous) => Ok(Some(self.decode_value(&previous)?)),
            None => Ok(None),
        }
    }

    /// Returns whether a key is present.
    pub async fn contains_key(&self, key: &K) -> Result<bool, GridError> {
        let key = self.encode_key(key)?;
        self.backend.contains_key(&self.name, &key).await
    }

    /// Returns every entry.
    pub async fn entries(&self) -> Result<Vec<(K, V)>, GridError> {
        self.entries_where(|_, _| true).await
    }

    /// Returns the entries accepted by a predicate.
    pub async fn entries_where<P>(&self, predicate: P) -> Result<Vec<(K, V)>, GridError>
    where
        P: Fn(&K, &V) -> bool + Send,
    {
        let raw = self.backend.entries(&self.name).await?;
        let mut matched = Vec::new();
        for (key, value) in raw {
            let key: K = self.decode_key(&key)?;
            let value: V = self.decode_value(&value)?;
            if predicate(&key, &value) {
                matched.push((key, value));
            }
        }
        Ok(matched)
    }

    /// Returns the keys whose entries are accepted by a predicate.
    pub async fn keys_where<P>(&self, predicate: P) -> Result<Vec<K>, GridError>
    where
        P: Fn(&K, &V) -> bool + Send,
    {
        Ok(self
            .entries_where(predicate)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Returns the values accepted by a predicate.
    pub async fn values_where<P>(&self, predicate: P) -> Result<Vec<V>, GridError>
    where
        P: Fn(&V) -> bool + Send,
    {
        Ok(self
            .entries_where(move |_, value| predicate(value))
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Returns every key.
    pub async fn keys(&self) -> Result<Vec<K>, GridError> {
        self.keys_where(|_, _| true).await
    }

    /// Returns every value.
    pub async fn values(&self) -> Result<Vec<V>, GridError> {
        self.values_where(|_| true).await
    }

    /// Returns the number of entries.
    pub async fn len(&self) -> Result<usize, GridError> {
        Ok(self.backend.entries(&self.name).await?.len())
    }

    /// Returns whether the map has no entries.
    pub async fn is_empty(&self) -> Result<bool, GridError> {
        Ok(self.len().await? == 0)
    }

    /// Removes every entry.
    pub async fn clear(&self) -> Result<(), GridError> {
        self.backend.clear(&self.name).await
    }

    fn encode_key(&self, key: &K) -> Result<String, GridError> {
        serde_json::to_string(key).map_err(|e| self.encoding_error(e).into())
    }

    fn decode_key(&self, key: &str) -> Result<K, GridError> {
        serde_json::from_str(key).map_err(|e| self.encoding_error(e).into())
    }

    fn encode_value(&self, value: &V) -> Result<Vec<u8>, GridError> {
        serde_json::to_vec(value).map_err(|e| self.encoding_error(e).into())
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<V, GridError> {
        serde_json::from_slice(bytes).map_err(|e| self.encoding_error(e).into())
    }

    fn encoding_error(&self, error: serde_json::Error) -> GridError {
        GridError::Encoding {
            map: self.name.clone(),
            details: error.to_string(),
        }
    }
}

/// A distributed set of `T`.
pub struct GridSet<T> {
    members: GridMap<T, ()>,
}

impl<T> Clone for GridSet<T> {
    fn clone(&self) -> Self {
        Self {
            members: self.members.clone(),
        }
    }
}

impl<T> fmt::Debug for GridSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridSet")
            .field("name", &self.members.name)
            .finish()
    }
}

impl<T> GridSet<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Creates a typed view of the named set.
    #[must_use]
    pub fn new(backend: Arc<dyn GridBackend>, name: impl Into<String>) -> Self {
        Self {
            members: GridMap::new(backend, name),
        }
    }

    /// Adds a member. Returns `true` if it was not already present.
    pub async fn add(&self, member: &T) -> Result<bool, GridError> {
        Ok(self.members.put_if_absent(member, &()).await?.is_none())
    }

    /// Removes a member. Returns `true` if it was present.
    pub async fn remove(&self, member: &T) -> Result<bool, GridError> {
        Ok(self.members.remove(member).await?.is_some())
    }

    /// Returns whether a member is present.
    pub async fn contains(&self, member: &T) -> Result<bool, GridError> {
        self.members.contains_key(member).await
    }

    /// Returns every member.
    pub async fn members(&self) -> Result<Vec<T>, GridError> {
        self.members.keys().await
    }

    /// Removes every member.
    pub async fn clear(&self) -> Result<(), GridError> {
        self.members.clear().await
    }
}
