//! Error types for the grid crate.
//!
//! Errors carry only what the grid layer knows (map or lock name and the
//! backend's own message). Callers add their operation context with
//! rootcause's `.context()`.

use std::fmt;

/// Errors from data-grid operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    /// The grid service could not be reached.
    Unavailable { details: String },
    /// A map operation failed in the backend.
    OperationFailed { map: String, details: String },
    /// A key or value could not be encoded or decoded.
    Encoding { map: String, details: String },
    /// Waiting for a cluster lock was interrupted.
    LockInterrupted { lock: String },
    /// A cluster lock could not be released.
    LockReleaseFailed { lock: String, details: String },
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { details } => write!(f, "data grid unavailable: {details}"),
            Self::OperationFailed { map, details } => {
                write!(f, "grid operation on '{map}' failed: {details}")
            }
            Self::Encoding { map, details } => {
                write!(f, "grid encoding for '{map}' failed: {details}")
            }
            Self::LockInterrupted { lock } => {
                write!(f, "interrupted while waiting for cluster lock '{lock}'")
            }
            Self::LockReleaseFailed { lock, details } => {
                write!(f, "failed to release cluster lock '{lock}': {details}")
            }
        }
    }
}

impl std::error::Error for GridError {}
