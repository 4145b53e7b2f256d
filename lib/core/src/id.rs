//! Strongly-typed identifiers for cluster participants and fire instances.
//!
//! Fire-instance ids use ULID (Universally Unique Lexicographically Sortable
//! Identifier) format, produced by a per-store monotonic generator so that ids
//! issued by one store instance are strictly increasing and ids issued after
//! a restart start from the current wall-clock time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use ulid::{Generator, Ulid};

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Identifies one firing of a trigger.
///
/// Assigned when a trigger is acquired and carried through to the fired
/// bundle handed to the host engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FireInstanceId(Ulid);

impl FireInstanceId {
    /// Creates an ID from a ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the prefix used for display formatting.
    #[must_use]
    pub const fn prefix() -> &'static str {
        "fire"
    }
}

impl fmt::Display for FireInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::prefix(), self.0)
    }
}

impl FromStr for FireInstanceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid_str = s.strip_prefix("fire_").unwrap_or(s);
        Ulid::from_str(ulid_str)
            .map(Self)
            .map_err(|e| ParseIdError {
                id_type: "FireInstanceId",
                reason: e.to_string(),
            })
    }
}

/// Issues monotonically increasing fire-instance ids for one store instance.
///
/// Seeded from wall-clock time on every `generate`, so a restarted process
/// never reissues ids handed out by its previous incarnation.
pub struct FireInstanceIdGenerator {
    inner: Mutex<Generator>,
}

impl Default for FireInstanceIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FireInstanceIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FireInstanceIdGenerator").finish_non_exhaustive()
    }
}

impl FireInstanceIdGenerator {
    /// Creates a new generator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> FireInstanceId {
        let mut generator = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // The random component only overflows after 2^80 ids in one millisecond.
        let ulid = generator.generate().unwrap_or_else(|_| Ulid::new());
        FireInstanceId(ulid)
    }
}

/// The identifying address of a node in the cluster.
///
/// Recorded as the owner of ACQUIRED/EXECUTING triggers. A node that restarts
/// must come back with the same address for its orphaned triggers to be
/// recovered by its consistency sweep.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Creates a node address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for NodeAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_instance_id_display_format() {
        let id = FireInstanceIdGenerator::new().next_id();
        assert!(id.to_string().starts_with("fire_"));
    }

    #[test]
    fn generator_is_monotonic() {
        let generator = FireInstanceIdGenerator::new();
        let ids: Vec<_> = (0..100).map(|_| generator.next_id()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn parse_with_prefix() {
        let id = FireInstanceIdGenerator::new().next_id();
        let parsed: FireInstanceId = id.to_string().parse().expect("should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_invalid_ulid() {
        let err = "fire_nope".parse::<FireInstanceId>().unwrap_err();
        assert_eq!(err.id_type, "FireInstanceId");
    }

    #[test]
    fn node_address_serializes_as_plain_string() {
        let address = NodeAddress::new("10.0.0.7:5701");
        let json = serde_json::to_string(&address).expect("serialize");
        assert_eq!(json, "\"10.0.0.7:5701\"");
    }
}
