//! Periodic recovery of triggers orphaned by a restart of this node.
//!
//! A trigger the shared map records as acquired or executing by this node's
//! address, but which this process does not track, was claimed by an earlier
//! incarnation of the node. The sweep puts such triggers back into the
//! schedule.

use crate::error::{GridResultExt, StoreError};
use crate::store::ClusteredJobStore;
use crate::wrapper::TriggerState;
use chime_core::{JobKey, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// A running sweep loop.
pub(crate) struct SweepTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ClusteredJobStore {
    /// Starts the periodic sweep if it is not already running.
    pub(crate) async fn start_sweep(&self) {
        let mut slot = self.inner.sweep.lock().await;
        if slot.is_some() {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let store = self.clone();
        let period = self.inner.config.sweep_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                // Runs outside the select so a stop request never cancels a sweep mid-flight.
                if let Err(e) = store.run_consistency_sweep().await {
                    warn!(error = %e, "consistency sweep failed");
                }
            }
        });

        *slot = Some(SweepTask { stop, handle });
        info!(interval_ms = self.inner.config.sweep_interval_ms, "consistency sweep started");
    }

    /// Stops the periodic sweep and waits for an in-flight run to finish.
    pub(crate) async fn stop_sweep(&self) {
        let task = self.inner.sweep.lock().await.take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "consistency sweep task ended abnormally");
            }
            info!("consistency sweep stopped");
        }
    }

    /// Returns whether the periodic sweep is running.
    pub async fn is_sweep_running(&self) -> bool {
        self.inner.sweep.lock().await.is_some()
    }

    /// Runs one sweep under the cluster lock. Returns how many triggers were
    /// recovered.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster lock or the grid is unavailable.
    #[instrument(skip(self), fields(node = %self.inner.config.node_address))]
    pub async fn run_consistency_sweep(&self) -> Result<usize, StoreError> {
        self.with_cluster_lock("consistency_sweep", self.recover_orphans_locked())
            .await
    }

    async fn recover_orphans_locked(&self) -> Result<usize, StoreError> {
        let node = self.node_address().clone();
        let owned = self
            .inner
            .triggers
            .entries_where(|_, wrapper| wrapper.is_held_by(&node))
            .await
            .during("consistency_sweep")?;
        let orphans: Vec<_> = {
            let local = self.inner.local.lock().await;
            owned
                .into_iter()
                .filter(|(key, _)| !local.tracks(key))
                .collect()
        };
        if orphans.is_empty() {
            return Ok(0);
        }

        let signaler = self.signaler();
        let now = Utc::now();
        let mut affected_jobs: BTreeSet<JobKey> = BTreeSet::new();
        let recovered = orphans.len();

        for (key, mut wrapper) in orphans {
            let was = wrapper.state();
            // A claim whose fire time is still ahead simply goes back to waiting.
            if wrapper.trigger.next_fire_time.is_some_and(|next| next < now) {
                let calendar = self.calendar_for(&wrapper.trigger).await?;
                wrapper.trigger.update_after_misfire(calendar.as_ref(), now);
                signaler.notify_trigger_listeners_misfired(&wrapper.trigger).await;
            }
            if wrapper.trigger.next_fire_time.is_none() {
                wrapper.set_state(TriggerState::Complete);
                self.write_wrapper(&wrapper).await?;
                signaler
                    .notify_scheduler_listeners_finalized(&wrapper.trigger)
                    .await;
            } else {
                wrapper.set_state(TriggerState::Waiting);
                self.write_wrapper(&wrapper).await?;
            }
            debug!(trigger = %key, %was, state = %wrapper.state(), "recovered orphaned trigger");
            affected_jobs.insert(wrapper.trigger.job_key);
        }

        for job_key in &affected_jobs {
            self.settle_recovered_job(job_key).await?;
        }
        info!(recovered, "recovered orphaned triggers");
        Ok(recovered)
    }

    /// Reconciles a job's execution block after its orphans were recovered.
    ///
    /// The block is lifted only when no trigger of the job is still held
    /// anywhere in the cluster; otherwise the recovered triggers stay blocked
    /// behind the run that is still in progress.
    async fn settle_recovered_job(&self, job_key: &JobKey) -> Result<(), StoreError> {
        if !self
            .inner
            .blocked_jobs
            .contains(job_key)
            .await
            .during("consistency_sweep")?
        {
            return Ok(());
        }

        let triggers = self.wrappers_for_job(job_key).await?;
        let still_running = triggers.iter().any(|(_, wrapper)| wrapper.state().is_held());
        if !still_running {
            self.unblock_job(job_key).await?;
            debug!(job = %job_key, "lifted block on recovered job");
            return Ok(());
        }

        for (_, mut wrapper) in triggers {
            let blocked = wrapper.state().blocked();
            if blocked != wrapper.state() {
                wrapper.set_state(blocked);
                self.write_wrapper(&wrapper).await?;
            }
        }
        debug!(job = %job_key, "job still running elsewhere; recovered triggers stay blocked");
        Ok(())
    }
}
