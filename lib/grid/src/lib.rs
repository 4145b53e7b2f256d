//! Distributed data-grid bindings for the chime clustered trigger store.
//!
//! The store treats the grid as an opaque service offering per-key atomic
//! maps, sets, and named cluster-wide exclusive locks. This crate provides:
//!
//! - **Backend seam**: `GridBackend` and `ClusterLock` traits over raw bytes
//! - **Typed views**: `GridMap` and `GridSet`, JSON-encoded on top of a backend
//! - **In-process grid**: `MemoryGrid`, shared by clones, for tests and single-node use
//! - **NATS grid**: `NatsGrid`, backed by JetStream key-value buckets

pub mod backend;
pub mod error;
pub mod map;
pub mod memory;
pub mod nats;

pub use backend::{ClusterLock, GridBackend};
pub use error::GridError;
pub use map::{GridMap, GridSet};
pub use memory::MemoryGrid;
pub use nats::{NatsGrid, NatsGridConfig};
