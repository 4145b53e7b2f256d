//! The store contract the host scheduling engine drives.

use crate::calendar::Calendar;
use crate::error::StoreError;
use crate::job::JobDetail;
use crate::matcher::GroupMatcher;
use crate::signaler::SchedulerSignaler;
use crate::trigger::Trigger;
use crate::wrapper::TriggerStatus;
use async_trait::async_trait;
use chime_core::{JobKey, Result, TriggerKey};
use chrono::{DateTime, Duration, Utc};
use rootcause::Report;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Everything the host engine needs to run one firing.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    /// The job to run.
    pub job: JobDetail,
    /// The trigger, already advanced past this firing.
    pub trigger: Trigger,
    /// The trigger's calendar, if it has one.
    pub calendar: Option<Calendar>,
    /// Whether this firing re-runs a job interrupted by a crash.
    pub recovering: bool,
    /// When the firing happened.
    pub fire_time: DateTime<Utc>,
    /// When the firing was scheduled to happen.
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    /// The trigger's fire time before this one.
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// The trigger's next fire time after this one.
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// Per-trigger outcome of `triggers_fired`.
#[derive(Debug)]
pub enum TriggerFiredResult {
    /// The trigger fired; run the bundled job.
    Fired(Box<TriggerFiredBundle>),
    /// The trigger was no longer acquired by this node, or its calendar is
    /// gone; nothing to run.
    Skipped { trigger_key: TriggerKey },
    /// The trigger could not fire; it has been moved to the error state
    /// where possible.
    Failed {
        trigger_key: TriggerKey,
        error: Report<StoreError>,
    },
}

impl TriggerFiredResult {
    /// The key of the trigger this outcome is for.
    #[must_use]
    pub fn trigger_key(&self) -> &TriggerKey {
        match self {
            Self::Fired(bundle) => &bundle.trigger.key,
            Self::Skipped { trigger_key } | Self::Failed { trigger_key, .. } => trigger_key,
        }
    }

    /// Returns the bundle if the trigger fired.
    #[must_use]
    pub fn bundle(&self) -> Option<&TriggerFiredBundle> {
        match self {
            Self::Fired(bundle) => Some(bundle),
            _ => None,
        }
    }
}

/// What the engine asks the store to do with a trigger after its job ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    /// Return the trigger to the schedule.
    #[default]
    Noop,
    /// The engine re-runs the job itself; the store treats this like `Noop`.
    ReExecuteJob,
    /// Remove the trigger (if it will not fire again).
    DeleteTrigger,
    /// Mark this trigger complete.
    SetTriggerComplete,
    /// Mark this trigger errored.
    SetTriggerError,
    /// Mark every trigger of the job complete.
    SetAllJobTriggersComplete,
    /// Mark every trigger of the job errored.
    SetAllJobTriggersError,
}

/// Storage and coordination of jobs, triggers, and calendars for a
/// trigger-based scheduling engine.
#[async_trait]
pub trait JobStore: Send + Sync {
    // Lifecycle

    /// Prepares the store; fails if the backing service is unreachable.
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> Result<(), StoreError>;

    /// The engine started; background maintenance begins.
    async fn scheduler_started(&self) -> Result<(), StoreError>;

    /// The engine paused; background maintenance stops.
    async fn scheduler_paused(&self);

    /// The engine resumed; background maintenance restarts.
    async fn scheduler_resumed(&self);

    /// The engine is shutting down.
    async fn shutdown(&self);

    /// Whether state survives a full cluster restart.
    fn supports_persistence(&self) -> bool;

    /// Whether several engine instances may share this store.
    fn is_clustered(&self) -> bool;

    /// Typical time to release and reacquire a trigger.
    fn estimated_time_to_release_and_acquire_trigger(&self) -> Duration;

    /// Records the engine instance id.
    async fn set_instance_id(&self, instance_id: String);

    /// Records the engine instance name.
    async fn set_instance_name(&self, instance_name: String);

    // Jobs and triggers

    async fn store_job(&self, job: JobDetail, replace_existing: bool) -> Result<(), StoreError>;

    async fn store_trigger(&self, trigger: Trigger, replace_existing: bool) -> Result<(), StoreError>;

    async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<(), StoreError>;

    /// Stores each job with its triggers. Without `replace`, nothing is
    /// written if any job or trigger already exists.
    async fn store_jobs_and_triggers(
        &self,
        jobs: Vec<(JobDetail, Vec<Trigger>)>,
        replace: bool,
    ) -> Result<(), StoreError>;

    /// Removes a job and all of its triggers. Returns whether anything was removed.
    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError>;

    /// Returns whether every job was found and removed.
    async fn remove_jobs(&self, keys: &[JobKey]) -> Result<bool, StoreError>;

    /// Removes a trigger, and its job if that was the job's last trigger and
    /// the job is not durable.
    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError>;

    /// Returns whether every trigger was found and removed.
    async fn remove_triggers(&self, keys: &[TriggerKey]) -> Result<bool, StoreError>;

    /// Replaces a trigger with one for the same job. Returns false if no
    /// trigger was stored under `key`.
    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool, StoreError>;

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError>;

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError>;

    async fn check_job_exists(&self, key: &JobKey) -> Result<bool, StoreError>;

    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool, StoreError>;

    /// Removes every job, trigger, calendar, and pause and block record.
    async fn clear_all_scheduling_data(&self) -> Result<(), StoreError>;

    // Calendars

    async fn store_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<(), StoreError>;

    /// Removes a calendar no trigger references.
    async fn remove_calendar(&self, name: &str) -> Result<bool, StoreError>;

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>, StoreError>;

    async fn check_calendar_exists(&self, name: &str) -> Result<bool, StoreError>;

    // Queries

    async fn number_of_jobs(&self) -> Result<usize, StoreError>;

    async fn number_of_triggers(&self) -> Result<usize, StoreError>;

    async fn number_of_calendars(&self) -> Result<usize, StoreError>;

    async fn job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>, StoreError>;

    async fn trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>, StoreError>;

    async fn job_group_names(&self) -> Result<Vec<String>, StoreError>;

    async fn trigger_group_names(&self) -> Result<Vec<String>, StoreError>;

    async fn calendar_names(&self) -> Result<Vec<String>, StoreError>;

    async fn triggers_for_job(&self, job_key: &JobKey) -> Result<Vec<Trigger>, StoreError>;

    async fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerStatus, StoreError>;

    /// Moves an errored trigger back into the schedule.
    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<(), StoreError>;

    // Pause and resume

    /// Pauses one trigger.
    ///
    /// A trigger that is executing is left as it is; once its run completes
    /// it returns to the schedule unpaused unless its group is paused.
    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError>;

    /// Pauses matching trigger groups. Returns the groups paused.
    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError>;

    async fn pause_job(&self, key: &JobKey) -> Result<(), StoreError>;

    /// Pauses matching job groups. Returns the groups paused.
    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError>;

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StoreError>;

    /// Resumes matching trigger groups. Returns the groups resumed.
    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError>;

    async fn resume_job(&self, key: &JobKey) -> Result<(), StoreError>;

    /// Resumes matching job groups. Returns the groups resumed.
    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError>;

    async fn pause_all(&self) -> Result<(), StoreError>;

    async fn resume_all(&self) -> Result<(), StoreError>;

    async fn paused_trigger_groups(&self) -> Result<BTreeSet<String>, StoreError>;

    async fn is_job_group_paused(&self, group: &str) -> Result<bool, StoreError>;

    async fn is_trigger_group_paused(&self, group: &str) -> Result<bool, StoreError>;

    // Firing protocol

    /// Claims up to `max_count` due triggers for this node.
    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>, StoreError>;

    /// Returns an acquired trigger to the schedule without firing it.
    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<(), StoreError>;

    /// Fires acquired triggers. Each trigger's outcome is reported separately.
    async fn triggers_fired(&self, triggers: &[Trigger]) -> Result<Vec<TriggerFiredResult>, StoreError>;

    /// Records the end of a job run started by `triggers_fired`.
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StoreError>;
}
