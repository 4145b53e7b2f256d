//! The node's acquire, fire, complete loop.
//!
//! Each round acquires the triggers due within the look-ahead, waits for the
//! earliest of them, fires the batch, runs the jobs, and reports completion.
//! The node has no job registry: running a job means logging it.

use crate::config::DriverConfig;
use chime_core::Result;
use chime_store::{
    CompletedExecutionInstruction, JobStore, StoreError, TriggerFiredBundle, TriggerFiredResult,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};

/// Drives a job store through repeated firing rounds.
pub struct Driver {
    store: Arc<dyn JobStore>,
    config: DriverConfig,
}

impl Driver {
    /// Creates a driver over a store.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, config: DriverConfig) -> Self {
        Self { store, config }
    }

    /// Runs rounds on the poll interval until `stop` turns true or its
    /// sender is dropped.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "driver started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match self.run_once(Utc::now()).await {
                Ok(0) => {}
                Ok(ran) => debug!(ran, "driver round complete"),
                Err(e) => warn!(error = %e, "driver round failed"),
            }
        }

        info!("driver stopped");
    }

    /// Runs one round and returns the number of jobs run.
    ///
    /// # Errors
    ///
    /// Returns an error if acquiring or firing fails. A failed completion
    /// report is logged and does not abort the rest of the batch.
    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let triggers = self
            .store
            .acquire_next_triggers(
                now + self.config.look_ahead(),
                self.config.batch_size.max(1),
                self.config.batch_time_window(),
            )
            .await?;
        if triggers.is_empty() {
            return Ok(0);
        }

        let earliest = triggers.iter().filter_map(|t| t.next_fire_time).min();
        if let Some(wait) = earliest.and_then(|at| (at - Utc::now()).to_std().ok()) {
            tokio::time::sleep(wait).await;
        }

        let mut ran = 0;
        for result in self.store.triggers_fired(&triggers).await? {
            match result {
                TriggerFiredResult::Fired(bundle) => {
                    let instruction = execute(&bundle);
                    ran += 1;
                    if let Err(e) = self
                        .store
                        .triggered_job_complete(&bundle.trigger, &bundle.job, instruction)
                        .await
                    {
                        warn!(trigger = %bundle.trigger.key, error = %e, "failed to record job completion");
                    }
                }
                TriggerFiredResult::Skipped { trigger_key } => {
                    debug!(trigger = %trigger_key, "trigger skipped");
                }
                TriggerFiredResult::Failed { trigger_key, error } => {
                    warn!(trigger = %trigger_key, error = %error, "trigger failed to fire");
                }
            }
        }
        Ok(ran)
    }
}

fn execute(bundle: &TriggerFiredBundle) -> CompletedExecutionInstruction {
    info!(
        job = %bundle.job.key,
        job_type = %bundle.job.job_type,
        trigger = %bundle.trigger.key,
        scheduled_fire_time = ?bundle.scheduled_fire_time,
        recovering = bundle.recovering,
        "running job"
    );
    if bundle.next_fire_time.is_none() {
        CompletedExecutionInstruction::DeleteTrigger
    } else {
        CompletedExecutionInstruction::Noop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chime_core::{JobKey, NodeAddress, TriggerKey};
    use chime_grid::MemoryGrid;
    use chime_store::{
        ClusteredJobStore, JobDetail, NoopSignaler, RepeatCount, SimpleSchedule, StoreConfig,
        Trigger, TriggerStatus,
    };
    use chrono::{Duration, DurationRound};

    async fn node(grid: &MemoryGrid) -> ClusteredJobStore {
        let config = StoreConfig::for_node(NodeAddress::new("node-a"));
        let store = ClusteredJobStore::new(Arc::new(grid.clone()), config);
        store
            .initialize(Arc::new(NoopSignaler))
            .await
            .expect("initialize");
        store
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
            .duration_trunc(Duration::seconds(1))
            .expect("truncate")
    }

    fn driver(store: &ClusteredJobStore) -> Driver {
        Driver::new(Arc::new(store.clone()), DriverConfig::default())
    }

    #[tokio::test]
    async fn one_shot_trigger_runs_once_and_is_cleaned_up() {
        let grid = MemoryGrid::new();
        let store = node(&grid).await;
        let job_key = JobKey::in_default_group("report");
        let trigger_key = TriggerKey::in_default_group("report-once");
        let fire_at = now() - Duration::seconds(1);
        store
            .store_job_and_trigger(
                JobDetail::new(job_key.clone(), "reports.Generate"),
                Trigger::new(trigger_key.clone(), job_key.clone(), SimpleSchedule::once(fire_at)),
            )
            .await
            .expect("store");

        let ran = driver(&store).run_once(now()).await.expect("round");

        assert_eq!(ran, 1);
        assert!(!store.check_trigger_exists(&trigger_key).await.expect("check"));
        assert!(!store.check_job_exists(&job_key).await.expect("check"));
    }

    #[tokio::test]
    async fn repeating_trigger_returns_to_waiting() {
        let grid = MemoryGrid::new();
        let store = node(&grid).await;
        let job_key = JobKey::in_default_group("poll");
        let trigger_key = TriggerKey::in_default_group("poll-hourly");
        let start = now() - Duration::seconds(1);
        let schedule = SimpleSchedule::repeating(start, Duration::hours(1), RepeatCount::Indefinitely);
        store
            .store_job_and_trigger(
                JobDetail::new(job_key.clone(), "feeds.Poll"),
                Trigger::new(trigger_key.clone(), job_key, schedule),
            )
            .await
            .expect("store");

        let ran = driver(&store).run_once(now()).await.expect("round");

        assert_eq!(ran, 1);
        assert_eq!(
            store.trigger_state(&trigger_key).await.expect("state"),
            TriggerStatus::Normal
        );
        let trigger = store
            .retrieve_trigger(&trigger_key)
            .await
            .expect("retrieve")
            .expect("present");
        assert_eq!(trigger.next_fire_time, Some(start + Duration::hours(1)));
        assert_eq!(trigger.times_triggered, 1);
    }

    #[tokio::test]
    async fn nothing_due_runs_nothing() {
        let grid = MemoryGrid::new();
        let store = node(&grid).await;
        let job_key = JobKey::in_default_group("later");
        store
            .store_job_and_trigger(
                JobDetail::new(job_key.clone(), "later.Job"),
                Trigger::new(
                    TriggerKey::in_default_group("later-once"),
                    job_key,
                    SimpleSchedule::once(now() + Duration::hours(1)),
                ),
            )
            .await
            .expect("store");

        assert_eq!(driver(&store).run_once(now()).await.expect("round"), 0);
    }

    #[tokio::test]
    async fn run_exits_when_stopped() {
        let grid = MemoryGrid::new();
        let store = node(&grid).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(driver(&store).run(stop_rx));

        stop_tx.send(true).expect("send");

        handle.await.expect("driver task");
    }
}
