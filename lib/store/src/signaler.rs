//! Callbacks from the store into the host scheduling engine.

use crate::trigger::Trigger;
use async_trait::async_trait;
use chime_core::{JobKey, TriggerKey};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};

/// Notifications the store raises toward the host engine.
///
/// Calls are made while the store may hold the cluster lock, so
/// implementations must return promptly and must not call back into the store.
#[async_trait]
pub trait SchedulerSignaler: Send + Sync {
    /// A trigger missed its fire time by more than the misfire threshold.
    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger);

    /// A trigger will never fire again.
    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger);

    /// A job was deleted because its last trigger went away.
    async fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey);

    /// The set of due triggers changed; the engine should re-plan.
    /// `None` means "sometime, recheck".
    async fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>);
}

/// A signaler that ignores every notification.
pub struct NoopSignaler;

#[async_trait]
impl SchedulerSignaler for NoopSignaler {
    async fn notify_trigger_listeners_misfired(&self, _trigger: &Trigger) {}

    async fn notify_scheduler_listeners_finalized(&self, _trigger: &Trigger) {}

    async fn notify_scheduler_listeners_job_deleted(&self, _job_key: &JobKey) {}

    async fn signal_scheduling_change(&self, _candidate: Option<DateTime<Utc>>) {}
}

/// A notification captured by `RecordingSignaler`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Misfired(TriggerKey),
    Finalized(TriggerKey),
    JobDeleted(JobKey),
    SchedulingChanged(Option<DateTime<Utc>>),
}

/// A signaler that records every notification, for inspecting store behavior.
#[derive(Debug, Default)]
pub struct RecordingSignaler {
    signals: Mutex<Vec<Signal>>,
}

impl RecordingSignaler {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every notification received so far.
    #[must_use]
    pub fn signals(&self) -> Vec<Signal> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, signal: Signal) {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signal);
    }
}

#[async_trait]
impl SchedulerSignaler for RecordingSignaler {
    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
        self.record(Signal::Misfired(trigger.key.clone()));
    }

    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
        self.record(Signal::Finalized(trigger.key.clone()));
    }

    async fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey) {
        self.record(Signal::JobDeleted(job_key.clone()));
    }

    async fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        self.record(Signal::SchedulingChanged(candidate));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_signaler_keeps_order() {
        let signaler = RecordingSignaler::new();
        let job = JobKey::in_default_group("j");

        signaler.notify_scheduler_listeners_job_deleted(&job).await;
        signaler.signal_scheduling_change(None).await;

        assert_eq!(
            signaler.signals(),
            vec![Signal::JobDeleted(job), Signal::SchedulingChanged(None)]
        );
    }
}
