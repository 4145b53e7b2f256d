//! Core identity types and utilities for the chime clustered trigger store.
//!
//! This crate provides the keys that name jobs and triggers across the
//! cluster, the node address recorded as trigger owner, fire-instance ids,
//! and the shared rootcause-based `Result` alias.

pub mod error;
pub mod id;
pub mod key;

pub use error::Result;
pub use id::{FireInstanceId, FireInstanceIdGenerator, NodeAddress, ParseIdError};
pub use key::{DEFAULT_GROUP, JobKey, ParseKeyError, TriggerKey};
