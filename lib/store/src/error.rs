//! Error types for the store crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `ScheduleError`: invalid schedules and calendars, raised by the model
//! - `StoreError`: store operations, including context wrappers for grid
//!   and cluster-lock failures raised one layer down

use chime_core::{JobKey, TriggerKey};
use chime_grid::GridError;
use rootcause::prelude::ResultExt;
use std::fmt;

/// Errors from schedule and calendar validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The schedule cannot produce a consistent series of fire times.
    InvalidSchedule { reason: String },
    /// The calendar rule is malformed.
    InvalidCalendar { reason: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSchedule { reason } => write!(f, "invalid schedule: {reason}"),
            Self::InvalidCalendar { reason } => write!(f, "invalid calendar: {reason}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A job with this key is already stored.
    JobAlreadyExists { key: JobKey },
    /// A trigger with this key is already stored.
    TriggerAlreadyExists { key: TriggerKey },
    /// A calendar with this name is already stored.
    CalendarAlreadyExists { name: String },
    /// The referenced job is not stored.
    JobNotFound { key: JobKey },
    /// The referenced trigger is not stored.
    TriggerNotFound { key: TriggerKey },
    /// The referenced calendar is not stored.
    CalendarNotFound { name: String },
    /// The calendar is still referenced by at least one trigger.
    CalendarInUse { name: String, trigger: TriggerKey },
    /// A replacement trigger points at a different job than the one it replaces.
    JobMismatch {
        trigger: TriggerKey,
        expected: JobKey,
        found: JobKey,
    },
    /// The trigger or job is invalid.
    InvalidInput { reason: String },
    /// Grid operation failed (use as context wrapper).
    Grid { operation: &'static str },
    /// Interrupted while waiting for the cluster lock (use as context wrapper).
    Interrupted { operation: &'static str },
    /// The cluster lock could not be released after an operation.
    LockReleaseFailed { operation: &'static str },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobAlreadyExists { key } => write!(f, "job already exists: {key}"),
            Self::TriggerAlreadyExists { key } => write!(f, "trigger already exists: {key}"),
            Self::CalendarAlreadyExists { name } => {
                write!(f, "calendar already exists: {name}")
            }
            Self::JobNotFound { key } => write!(f, "job not found: {key}"),
            Self::TriggerNotFound { key } => write!(f, "trigger not found: {key}"),
            Self::CalendarNotFound { name } => write!(f, "calendar not found: {name}"),
            Self::CalendarInUse { name, trigger } => {
                write!(f, "calendar {name} is referenced by trigger {trigger}")
            }
            Self::JobMismatch {
                trigger,
                expected,
                found,
            } => {
                write!(
                    f,
                    "replacement for trigger {trigger} targets job {found}, expected {expected}"
                )
            }
            Self::InvalidInput { reason } => write!(f, "invalid input: {reason}"),
            Self::Grid { operation } => write!(f, "grid access failed during {operation}"),
            Self::Interrupted { operation } => {
                write!(f, "interrupted waiting for cluster lock during {operation}")
            }
            Self::LockReleaseFailed { operation } => {
                write!(f, "cluster lock not released after {operation}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Wraps grid failures in `StoreError::Grid` naming the store operation.
pub(crate) trait GridResultExt<T> {
    fn during(self, operation: &'static str) -> chime_core::Result<T, StoreError>;
}

impl<T> GridResultExt<T> for chime_core::Result<T, GridError> {
    fn during(self, operation: &'static str) -> chime_core::Result<T, StoreError> {
        self.context(StoreError::Grid { operation })
    }
}
