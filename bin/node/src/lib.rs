//! A chime scheduler node.
//!
//! Hosts a `ClusteredJobStore` on a NATS grid and drives it through
//! acquire, fire, and complete rounds.

pub mod config;
pub mod driver;
pub mod signaler;
