//! Clustered trigger store for chime.
//!
//! Jobs, triggers, and calendars live in a distributed data grid shared by
//! every scheduler node. This crate provides:
//!
//! - **Model**: `JobDetail`, `Trigger` with `SimpleSchedule`, `Calendar`,
//!   `GroupMatcher`
//! - **Stored records**: `TriggerWrapper` with its `TriggerState`, and the
//!   `fire_order` comparator that makes acquisition deterministic
//! - **Engine contract**: the `JobStore` and `SchedulerSignaler` traits
//! - **Store**: `ClusteredJobStore`, which serializes compound operations
//!   through one cluster-wide lock
//! - **Recovery**: a periodic consistency sweep that returns triggers
//!   orphaned by a node restart to the schedule

pub mod calendar;
pub mod config;
pub mod error;
mod firing;
pub mod job;
pub mod job_store;
pub mod matcher;
pub mod schedule;
pub mod signaler;
pub mod store;
mod sweep;
#[cfg(test)]
mod testing;
pub mod trigger;
pub mod wrapper;

pub use calendar::{Calendar, CalendarRule};
pub use config::StoreConfig;
pub use error::{ScheduleError, StoreError};
pub use job::{JobDataMap, JobDetail};
pub use job_store::{
    CompletedExecutionInstruction, JobStore, TriggerFiredBundle, TriggerFiredResult,
};
pub use matcher::GroupMatcher;
pub use schedule::{MisfireInstruction, RepeatCount, SimpleSchedule};
pub use signaler::{NoopSignaler, RecordingSignaler, SchedulerSignaler, Signal};
pub use store::ClusteredJobStore;
pub use trigger::{DEFAULT_PRIORITY, Trigger};
pub use wrapper::{TriggerState, TriggerStatus, TriggerWrapper, fire_order};
