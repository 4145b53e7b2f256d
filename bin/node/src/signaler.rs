//! A signaler that reports store notifications to the log.

use async_trait::async_trait;
use chime_core::JobKey;
use chime_store::{SchedulerSignaler, Trigger};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Logs every notification the store raises.
///
/// The node has no listener registry, so the log is the only audience.
#[derive(Debug, Default)]
pub struct LoggingSignaler;

#[async_trait]
impl SchedulerSignaler for LoggingSignaler {
    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
        warn!(
            trigger = %trigger.key,
            next_fire_time = ?trigger.next_fire_time,
            "trigger misfired"
        );
    }

    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
        info!(trigger = %trigger.key, "trigger finalized");
    }

    async fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey) {
        info!(job = %job_key, "job deleted");
    }

    async fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>) {
        debug!(candidate = ?candidate_new_next_fire_time, "scheduling changed");
    }
}
