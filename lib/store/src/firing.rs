//! The acquisition, firing, and completion protocol.
//!
//! Every function here runs while the caller holds the cluster lock.

use crate::error::{GridResultExt, StoreError};
use crate::job::JobDetail;
use crate::job_store::{CompletedExecutionInstruction, TriggerFiredBundle, TriggerFiredResult};
use crate::store::ClusteredJobStore;
use crate::trigger::Trigger;
use crate::wrapper::{TriggerState, TriggerWrapper, fire_order};
use chime_core::{JobKey, Result, TriggerKey};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

impl ClusteredJobStore {
    /// Claims due triggers for this node.
    ///
    /// Candidates are waiting triggers due by `no_later_than + time_window`,
    /// walked in fire order. A trigger is only accepted if it is due by
    /// `no_later_than` and within `time_window` of the first accepted one.
    pub(crate) async fn acquire_next_triggers_locked(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>, StoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let horizon = no_later_than
            .checked_add_signed(time_window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut candidates = self
            .inner
            .triggers
            .values_where(move |wrapper| match wrapper.state() {
                TriggerState::Waiting => wrapper
                    .trigger
                    .next_fire_time
                    .is_none_or(|next| next <= horizon),
                TriggerState::Complete => wrapper.trigger.next_fire_time.is_none(),
                _ => false,
            })
            .await
            .during("acquire_next_triggers")?;
        candidates.sort_by(|a, b| fire_order(&a.trigger, &b.trigger));

        let busy_jobs: HashSet<JobKey> = self
            .inner
            .triggers
            .values_where(|wrapper| wrapper.state().is_held())
            .await
            .during("acquire_next_triggers")?
            .into_iter()
            .map(|wrapper| wrapper.trigger.job_key)
            .collect();

        let node = self.node_address().clone();
        let mut jobs: HashMap<JobKey, Option<JobDetail>> = HashMap::new();
        let mut exclusive_in_batch: HashSet<JobKey> = HashSet::new();
        let mut batch_end: Option<DateTime<Utc>> = None;
        let mut acquired = Vec::new();

        for mut wrapper in candidates {
            let key = wrapper.key().clone();
            if wrapper.trigger.next_fire_time.is_none() || wrapper.state() == TriggerState::Complete {
                debug!(trigger = %key, "removing trigger that will not fire again");
                self.remove_trigger_locked(&key, true).await?;
                continue;
            }

            if self.apply_misfire(&mut wrapper).await? {
                self.inner
                    .triggers
                    .set(&key, &wrapper)
                    .await
                    .during("acquire_next_triggers")?;
                continue;
            }

            let Some(next) = wrapper.trigger.next_fire_time else {
                continue;
            };
            if next > no_later_than || batch_end.is_some_and(|end| next > end) {
                break;
            }

            let job_key = wrapper.job_key().clone();
            if !jobs.contains_key(&job_key) {
                let job = self
                    .inner
                    .jobs
                    .get(&job_key)
                    .await
                    .during("acquire_next_triggers")?;
                jobs.insert(job_key.clone(), job);
            }
            let Some(Some(job)) = jobs.get(&job_key) else {
                warn!(trigger = %key, job = %job_key, "skipping trigger whose job is missing");
                continue;
            };
            if job.concurrent_execution_disallowed {
                if busy_jobs.contains(&job_key) || exclusive_in_batch.contains(&job_key) {
                    debug!(trigger = %key, job = %job_key, "job already running; trigger left waiting");
                    continue;
                }
                exclusive_in_batch.insert(job_key);
            }

            wrapper.trigger.fire_instance_id = Some(self.inner.fire_ids.next_id());
            wrapper.claim(TriggerState::Acquired, node.clone());
            self.inner
                .triggers
                .set(&key, &wrapper)
                .await
                .during("acquire_next_triggers")?;
            self.inner.local.lock().await.acquired.insert(key.clone());
            debug!(trigger = %key, %next, "acquired trigger");

            if batch_end.is_none() {
                batch_end = next.checked_add_signed(time_window);
            }
            acquired.push(wrapper.trigger);
            if acquired.len() >= max_count {
                break;
            }
        }
        Ok(acquired)
    }

    pub(crate) async fn release_acquired_trigger_locked(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let wrapper = self
            .inner
            .triggers
            .get(key)
            .await
            .during("release_acquired_trigger")?;
        if let Some(mut wrapper) = wrapper {
            if wrapper.is_held_by(self.node_address()) && wrapper.state() == TriggerState::Acquired {
                wrapper.set_state(TriggerState::Waiting);
                self.inner
                    .triggers
                    .set(key, &wrapper)
                    .await
                    .during("release_acquired_trigger")?;
                debug!(trigger = %key, "released acquired trigger");
            }
        }
        self.inner.local.lock().await.acquired.remove(key);
        Ok(())
    }

    pub(crate) async fn triggers_fired_locked(
        &self,
        triggers: &[Trigger],
    ) -> Result<Vec<TriggerFiredResult>, StoreError> {
        let mut results = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let outcome = match self.fire_trigger(&trigger.key).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    warn!(trigger = %trigger.key, %error, "trigger failed to fire");
                    TriggerFiredResult::Failed {
                        trigger_key: trigger.key.clone(),
                        error,
                    }
                }
            };
            results.push(outcome);
        }
        Ok(results)
    }

    async fn fire_trigger(&self, key: &TriggerKey) -> Result<TriggerFiredResult, StoreError> {
        let skipped = || TriggerFiredResult::Skipped {
            trigger_key: key.clone(),
        };
        let Some(mut wrapper) = self.inner.triggers.get(key).await.during("triggers_fired")? else {
            debug!(trigger = %key, "trigger removed before firing");
            return Ok(skipped());
        };
        if !(wrapper.state() == TriggerState::Acquired && wrapper.is_held_by(self.node_address())) {
            debug!(trigger = %key, state = %wrapper.state(), "trigger no longer acquired by this node");
            self.inner.local.lock().await.acquired.remove(key);
            return Ok(skipped());
        }

        let calendar = match &wrapper.trigger.calendar_name {
            Some(name) => match self.inner.calendars.get(name).await.during("triggers_fired")? {
                Some(calendar) => Some(calendar),
                None => {
                    warn!(trigger = %key, calendar = %name, "calendar removed; trigger not fired");
                    return Ok(skipped());
                }
            },
            None => None,
        };

        let job_key = wrapper.job_key().clone();
        let Some(job) = self.inner.jobs.get(&job_key).await.during("triggers_fired")? else {
            wrapper.set_state(TriggerState::Error);
            self.inner
                .triggers
                .set(key, &wrapper)
                .await
                .during("triggers_fired")?;
            self.inner.local.lock().await.acquired.remove(key);
            warn!(trigger = %key, job = %job_key, "job missing; trigger moved to error state");
            return Ok(TriggerFiredResult::Failed {
                trigger_key: key.clone(),
                error: StoreError::JobNotFound { key: job_key }.into(),
            });
        };

        let previous_fire_time = wrapper.trigger.previous_fire_time;
        wrapper.trigger.triggered(calendar.as_ref());
        wrapper.claim(TriggerState::Executing, self.node_address().clone());
        self.inner
            .triggers
            .set(key, &wrapper)
            .await
            .during("triggers_fired")?;
        {
            let mut local = self.inner.local.lock().await;
            local.acquired.remove(key);
            local.executing.insert(key.clone());
        }

        if job.concurrent_execution_disallowed {
            self.block_job(&job_key, key).await?;
        }
        debug!(trigger = %key, job = %job_key, "trigger fired");

        Ok(TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
            job,
            scheduled_fire_time: wrapper.trigger.previous_fire_time,
            previous_fire_time,
            next_fire_time: wrapper.trigger.next_fire_time,
            fire_time: Utc::now(),
            recovering: false,
            calendar,
            trigger: wrapper.trigger,
        })))
    }

    /// Holds back every other trigger of a job while `running` executes it.
    async fn block_job(&self, job_key: &JobKey, running: &TriggerKey) -> Result<(), StoreError> {
        let others = self
            .inner
            .triggers
            .entries_where(|key, wrapper| wrapper.job_key() == job_key && key != running)
            .await
            .during("triggers_fired")?;
        for (key, mut wrapper) in others {
            let blocked = wrapper.state().blocked();
            if blocked != wrapper.state() {
                wrapper.set_state(blocked);
                self.inner
                    .triggers
                    .set(&key, &wrapper)
                    .await
                    .during("triggers_fired")?;
            }
        }
        self.inner
            .blocked_jobs
            .add(job_key)
            .await
            .during("triggers_fired")?;
        Ok(())
    }

    /// Lifts a job's execution block from its other triggers.
    pub(crate) async fn unblock_job(&self, job_key: &JobKey) -> Result<(), StoreError> {
        self.inner
            .blocked_jobs
            .remove(job_key)
            .await
            .during("unblock_job")?;
        for (key, mut wrapper) in self.wrappers_for_job(job_key).await? {
            let unblocked = wrapper.state().unblocked();
            if unblocked != wrapper.state() {
                wrapper.set_state(unblocked);
                self.inner
                    .triggers
                    .set(&key, &wrapper)
                    .await
                    .during("unblock_job")?;
            }
        }
        Ok(())
    }

    pub(crate) async fn triggered_job_complete_locked(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StoreError> {
        let signaler = self.signaler();

        if job.persist_job_data_after_execution {
            let stored = self
                .inner
                .jobs
                .get(&job.key)
                .await
                .during("triggered_job_complete")?;
            if let Some(mut stored) = stored {
                stored.data = job.data.clone();
                self.inner
                    .jobs
                    .set(&job.key, &stored)
                    .await
                    .during("triggered_job_complete")?;
            }
        }
        self.inner.local.lock().await.forget(&trigger.key);

        let wrapper = self
            .inner
            .triggers
            .get(&trigger.key)
            .await
            .during("triggered_job_complete")?;
        // Recovered and claimed again by another node while this run was in flight.
        if let Some(current) = &wrapper {
            if current.state().is_held() && !current.is_held_by(self.node_address()) {
                warn!(
                    trigger = %trigger.key,
                    owner = ?current.owner(),
                    "trigger now held by another node; completion not applied"
                );
                return Ok(());
            }
        }

        if job.concurrent_execution_disallowed {
            self.unblock_job(&job.key).await?;
            signaler.signal_scheduling_change(None).await;
        }
        let Some(mut wrapper) = wrapper else {
            return Ok(());
        };

        match instruction {
            CompletedExecutionInstruction::DeleteTrigger => {
                // A trigger rescheduled during execution has a fire time again.
                if trigger.next_fire_time.is_some() || wrapper.trigger.next_fire_time.is_none() {
                    self.remove_trigger_locked(&trigger.key, true).await?;
                }
                signaler.signal_scheduling_change(None).await;
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                wrapper.set_state(TriggerState::Complete);
                self.write_wrapper(&wrapper).await?;
                signaler.signal_scheduling_change(None).await;
            }
            CompletedExecutionInstruction::SetTriggerError => {
                warn!(trigger = %trigger.key, "trigger set to error state after execution");
                wrapper.set_state(TriggerState::Error);
                self.write_wrapper(&wrapper).await?;
                signaler.signal_scheduling_change(None).await;
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                self.set_all_job_triggers(&job.key, TriggerState::Complete)
                    .await?;
                signaler.signal_scheduling_change(None).await;
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                warn!(job = %job.key, "all triggers of job set to error state after execution");
                self.set_all_job_triggers(&job.key, TriggerState::Error)
                    .await?;
                signaler.signal_scheduling_change(None).await;
            }
            CompletedExecutionInstruction::Noop | CompletedExecutionInstruction::ReExecuteJob => {
                if wrapper.state() == TriggerState::Executing {
                    let state = self.resting_state(&wrapper.trigger).await?;
                    wrapper.set_state(state);
                    self.write_wrapper(&wrapper).await?;
                }
            }
        }
        Ok(())
    }

    async fn set_all_job_triggers(&self, job_key: &JobKey, state: TriggerState) -> Result<(), StoreError> {
        for (_, mut wrapper) in self.wrappers_for_job(job_key).await? {
            wrapper.set_state(state);
            self.write_wrapper(&wrapper).await?;
        }
        Ok(())
    }

    pub(crate) async fn write_wrapper(&self, wrapper: &TriggerWrapper) -> Result<(), StoreError> {
        self.inner
            .triggers
            .set(wrapper.key(), wrapper)
            .await
            .during("write_trigger")
    }
}

#[cfg(test)]
mod tests {
    use crate::job_store::{CompletedExecutionInstruction, JobStore, TriggerFiredResult};
    use crate::schedule::{RepeatCount, SimpleSchedule};
    use crate::signaler::Signal;
    use crate::testing::{base_time, job, once, initialized_node};
    use crate::trigger::Trigger;
    use crate::wrapper::{TriggerState, TriggerStatus};
    use chime_core::{JobKey, NodeAddress, TriggerKey};
    use chime_grid::MemoryGrid;
    use chrono::{Duration, Utc};

    fn ms(n: i64) -> Duration {
        Duration::milliseconds(n)
    }

    #[tokio::test]
    async fn blocking_scenario_follows_execution_of_exclusive_job() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("j").disallow_concurrent_execution();
        let t1 = once("t1", &job.key, base + ms(100));
        let t2 = once("t2", &job.key, base + ms(200));
        store.store_job(job.clone(), false).await.unwrap();
        store.store_trigger(t1.clone(), false).await.unwrap();
        store.store_trigger(t2.clone(), false).await.unwrap();

        let acquired = store
            .acquire_next_triggers(base + ms(150), 10, ms(1000))
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].key, t1.key);

        let fired = store.triggers_fired(&acquired).await.unwrap();
        let bundle = fired[0].bundle().expect("t1 should fire");
        assert_eq!(bundle.scheduled_fire_time, Some(base + ms(100)));
        assert_eq!(store.trigger_state(&t2.key).await.unwrap(), TriggerStatus::Blocked);
        assert!(store.inner.blocked_jobs.contains(&job.key).await.unwrap());

        store
            .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
            .await
            .unwrap();
        assert_eq!(store.trigger_state(&t2.key).await.unwrap(), TriggerStatus::Normal);
        assert!(!store.inner.blocked_jobs.contains(&job.key).await.unwrap());
        let t2_record = store.inner.triggers.get(&t2.key).await.unwrap().unwrap();
        assert_eq!(t2_record.state(), TriggerState::Waiting);
    }

    #[tokio::test]
    async fn paused_sibling_of_running_exclusive_job_returns_to_paused() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("j").disallow_concurrent_execution();
        let running = once("running", &job.key, base);
        let waiting = once("waiting", &job.key, base + ms(500));
        let paused = once("paused", &job.key, base + ms(500));
        store.store_job(job.clone(), false).await.unwrap();
        for trigger in [&running, &waiting, &paused] {
            store.store_trigger(trigger.clone(), false).await.unwrap();
        }
        store.pause_trigger(&paused.key).await.unwrap();

        let acquired = store.acquire_next_triggers(base, 10, Duration::zero()).await.unwrap();
        assert_eq!(acquired.len(), 1);
        let fired = store.triggers_fired(&acquired).await.unwrap();
        let bundle = fired[0].bundle().expect("running should fire");

        let state_of = |key: TriggerKey| {
            let store = store.clone();
            async move { store.inner.triggers.get(&key).await.unwrap().unwrap().state() }
        };
        assert_eq!(state_of(waiting.key.clone()).await, TriggerState::Blocked);
        assert_eq!(state_of(paused.key.clone()).await, TriggerState::PausedBlocked);

        store
            .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
            .await
            .unwrap();
        assert_eq!(state_of(waiting.key.clone()).await, TriggerState::Waiting);
        assert_eq!(state_of(paused.key.clone()).await, TriggerState::Paused);
        assert!(!store.inner.blocked_jobs.contains(&job.key).await.unwrap());
    }

    #[tokio::test]
    async fn pause_during_execution_does_not_stick() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("j");
        let trigger = Trigger::new(
            TriggerKey::in_default_group("t"),
            job.key.clone(),
            SimpleSchedule::repeating(base, Duration::minutes(1), RepeatCount::Indefinitely),
        );
        store.store_job_and_trigger(job, trigger.clone()).await.unwrap();
        let acquired = store.acquire_next_triggers(base, 1, Duration::zero()).await.unwrap();
        let fired = store.triggers_fired(&acquired).await.unwrap();
        let bundle = fired[0].bundle().expect("t should fire");

        store.pause_trigger(&trigger.key).await.unwrap();
        let record = store.inner.triggers.get(&trigger.key).await.unwrap().unwrap();
        assert_eq!(record.state(), TriggerState::Executing);

        store
            .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
            .await
            .unwrap();
        let record = store.inner.triggers.get(&trigger.key).await.unwrap().unwrap();
        assert_eq!(record.state(), TriggerState::Waiting);
    }

    #[tokio::test]
    async fn late_completion_leaves_another_nodes_claim_alone() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("j").disallow_concurrent_execution();
        let trigger = Trigger::new(
            TriggerKey::in_default_group("t"),
            job.key.clone(),
            SimpleSchedule::repeating(base, Duration::minutes(1), RepeatCount::Indefinitely),
        );
        store.store_job_and_trigger(job.clone(), trigger.clone()).await.unwrap();
        let acquired = store.acquire_next_triggers(base, 1, Duration::zero()).await.unwrap();
        let fired = store.triggers_fired(&acquired).await.unwrap();
        let bundle = fired[0].bundle().expect("t should fire");

        let mut record = store.inner.triggers.get(&trigger.key).await.unwrap().unwrap();
        record.claim(TriggerState::Executing, NodeAddress::new("node-b"));
        store.inner.triggers.set(&trigger.key, &record).await.unwrap();

        for instruction in [
            CompletedExecutionInstruction::Noop,
            CompletedExecutionInstruction::DeleteTrigger,
            CompletedExecutionInstruction::SetTriggerError,
        ] {
            store
                .triggered_job_complete(&bundle.trigger, &bundle.job, instruction)
                .await
                .unwrap();
        }

        let record = store.inner.triggers.get(&trigger.key).await.unwrap().unwrap();
        assert_eq!(record.state(), TriggerState::Executing);
        assert!(record.is_held_by(&NodeAddress::new("node-b")));
        assert!(store.inner.blocked_jobs.contains(&job.key).await.unwrap());
    }

    #[tokio::test]
    async fn misfired_trigger_is_rescheduled_not_acquired() {
        let grid = MemoryGrid::new();
        let (store, signaler) = initialized_node(&grid, "node-a").await;
        let threshold = store.config().misfire_threshold();
        let missed = Utc::now() - threshold * 10;
        let job = job("j");
        let trigger = Trigger::new(
            TriggerKey::in_default_group("late"),
            job.key.clone(),
            SimpleSchedule::repeating(missed, Duration::hours(1), RepeatCount::Indefinitely),
        );
        store.store_job_and_trigger(job, trigger.clone()).await.unwrap();

        let acquired = store
            .acquire_next_triggers(Utc::now(), 10, Duration::zero())
            .await
            .unwrap();

        assert!(acquired.is_empty());
        let stored = store.retrieve_trigger(&trigger.key).await.unwrap().unwrap();
        assert!(stored.next_fire_time.unwrap() > missed);
        assert_eq!(store.trigger_state(&trigger.key).await.unwrap(), TriggerStatus::Normal);
        assert!(signaler.signals().contains(&Signal::Misfired(trigger.key)));
    }

    #[tokio::test]
    async fn acquisition_orders_by_time_priority_and_key() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("j");
        store.store_job(job.clone(), false).await.unwrap();
        for trigger in [
            once("c", &job.key, base + ms(10)),
            once("b", &job.key, base + ms(10)),
            once("a", &job.key, base + ms(20)),
            once("high", &job.key, base + ms(10)).with_priority(9),
        ] {
            store.store_trigger(trigger, false).await.unwrap();
        }

        let acquired = store
            .acquire_next_triggers(base + ms(50), 10, ms(1000))
            .await
            .unwrap();

        let names: Vec<_> = acquired.iter().map(|t| t.key.name().to_string()).collect();
        assert_eq!(names, ["high", "b", "c", "a"]);
        assert!(acquired.iter().all(|t| t.fire_instance_id.is_some()));
    }

    #[tokio::test]
    async fn acquisition_respects_ceiling_count_and_window() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("j");
        store.store_job(job.clone(), false).await.unwrap();
        for (name, offset) in [("t0", 0), ("t1", 10), ("t2", 20), ("t3", 500), ("t4", 5_000)] {
            store
                .store_trigger(once(name, &job.key, base + ms(offset)), false)
                .await
                .unwrap();
        }

        let capped = store
            .acquire_next_triggers(base + ms(1_000), 2, ms(100))
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);

        let windowed = store
            .acquire_next_triggers(base + ms(1_000), 10, ms(100))
            .await
            .unwrap();
        let names: Vec<_> = windowed.iter().map(|t| t.key.name().to_string()).collect();
        assert_eq!(names, ["t2"]);

        let rest = store
            .acquire_next_triggers(base + ms(1_000), 10, ms(100))
            .await
            .unwrap();
        let names: Vec<_> = rest.iter().map(|t| t.key.name().to_string()).collect();
        assert_eq!(names, ["t3"]);
    }

    #[tokio::test]
    async fn exclusive_job_fires_once_per_round_across_nodes() {
        let grid = MemoryGrid::new();
        let (node_a, _) = initialized_node(&grid, "node-a").await;
        let (node_b, _) = initialized_node(&grid, "node-b").await;
        let base = base_time();
        let job = job("exclusive").disallow_concurrent_execution();
        node_a.store_job(job.clone(), false).await.unwrap();
        node_a
            .store_trigger(once("t1", &job.key, base + ms(10)), false)
            .await
            .unwrap();
        node_a
            .store_trigger(once("t2", &job.key, base + ms(10)), false)
            .await
            .unwrap();

        let (from_a, from_b) = tokio::join!(
            node_a.acquire_next_triggers(base + ms(100), 10, ms(100)),
            node_b.acquire_next_triggers(base + ms(100), 10, ms(100)),
        );
        let from_a = from_a.unwrap();
        let from_b = from_b.unwrap();
        assert_eq!(from_a.len() + from_b.len(), 1);

        let held = node_a
            .inner
            .triggers
            .values_where(|w| w.state().is_held())
            .await
            .unwrap();
        assert_eq!(held.len(), 1);
    }

    #[tokio::test]
    async fn trigger_acquired_elsewhere_is_skipped() {
        let grid = MemoryGrid::new();
        let (node_a, _) = initialized_node(&grid, "node-a").await;
        let (node_b, _) = initialized_node(&grid, "node-b").await;
        let base = base_time();
        let job = job("j");
        let trigger = once("t", &job.key, base);
        node_a.store_job_and_trigger(job, trigger).await.unwrap();

        let acquired = node_a
            .acquire_next_triggers(base + ms(10), 1, Duration::zero())
            .await
            .unwrap();
        let results = node_b.triggers_fired(&acquired).await.unwrap();

        assert!(matches!(results[0], TriggerFiredResult::Skipped { .. }));
    }

    #[tokio::test]
    async fn missing_job_fails_only_that_trigger() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let doomed = job("doomed").durable();
        let healthy = job("healthy");
        store.store_job(doomed.clone(), false).await.unwrap();
        store.store_job(healthy.clone(), false).await.unwrap();
        store
            .store_trigger(once("t-doomed", &doomed.key, base), false)
            .await
            .unwrap();
        store
            .store_trigger(once("t-healthy", &healthy.key, base + ms(1)), false)
            .await
            .unwrap();

        let acquired = store
            .acquire_next_triggers(base + ms(10), 10, ms(100))
            .await
            .unwrap();
        assert_eq!(acquired.len(), 2);
        store.inner.jobs.remove(&doomed.key).await.unwrap();

        let results = store.triggers_fired(&acquired).await.unwrap();
        match &results[0] {
            TriggerFiredResult::Failed { trigger_key, error } => {
                assert_eq!(trigger_key.name(), "t-doomed");
                assert!(matches!(
                    error.current_context(),
                    crate::error::StoreError::JobNotFound { .. }
                ));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(results[1].bundle().is_some());
        assert_eq!(
            store
                .trigger_state(&TriggerKey::in_default_group("t-doomed"))
                .await
                .unwrap(),
            TriggerStatus::Error
        );
    }

    #[tokio::test]
    async fn released_trigger_returns_to_waiting() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("j");
        let trigger = once("t", &job.key, base);
        store.store_job_and_trigger(job, trigger.clone()).await.unwrap();

        let acquired = store
            .acquire_next_triggers(base, 1, Duration::zero())
            .await
            .unwrap();
        store.release_acquired_trigger(&acquired[0]).await.unwrap();

        let record = store.inner.triggers.get(&trigger.key).await.unwrap().unwrap();
        assert_eq!(record.state(), TriggerState::Waiting);
        assert!(record.owner().is_none());
        assert!(store.inner.local.lock().await.acquired.is_empty());
    }

    #[tokio::test]
    async fn delete_instruction_removes_finished_trigger_and_orphaned_job() {
        let grid = MemoryGrid::new();
        let (store, signaler) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("j");
        store
            .store_job_and_trigger(job.clone(), once("t", &job.key, base))
            .await
            .unwrap();

        let acquired = store
            .acquire_next_triggers(base, 1, Duration::zero())
            .await
            .unwrap();
        let fired = store.triggers_fired(&acquired).await.unwrap();
        let bundle = fired[0].bundle().unwrap();
        assert!(bundle.next_fire_time.is_none());

        store
            .triggered_job_complete(
                &bundle.trigger,
                &bundle.job,
                CompletedExecutionInstruction::DeleteTrigger,
            )
            .await
            .unwrap();

        assert_eq!(store.number_of_triggers().await.unwrap(), 0);
        assert!(!store.check_job_exists(&job.key).await.unwrap());
        assert!(signaler.signals().contains(&Signal::JobDeleted(job.key)));
    }

    #[tokio::test]
    async fn completion_can_mark_every_job_trigger() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("j");
        store.store_job(job.clone(), false).await.unwrap();
        store
            .store_trigger(once("t1", &job.key, base), false)
            .await
            .unwrap();
        store
            .store_trigger(once("t2", &job.key, base + ms(10_000)), false)
            .await
            .unwrap();

        let acquired = store
            .acquire_next_triggers(base, 1, Duration::zero())
            .await
            .unwrap();
        let fired = store.triggers_fired(&acquired).await.unwrap();
        let bundle = fired[0].bundle().unwrap();
        store
            .triggered_job_complete(
                &bundle.trigger,
                &bundle.job,
                CompletedExecutionInstruction::SetAllJobTriggersError,
            )
            .await
            .unwrap();

        for name in ["t1", "t2"] {
            let key = TriggerKey::in_default_group(name);
            assert_eq!(store.trigger_state(&key).await.unwrap(), TriggerStatus::Error);
        }

        store
            .reset_trigger_from_error_state(&TriggerKey::in_default_group("t2"))
            .await
            .unwrap();
        assert_eq!(
            store
                .trigger_state(&TriggerKey::in_default_group("t2"))
                .await
                .unwrap(),
            TriggerStatus::Normal
        );
    }

    #[tokio::test]
    async fn completion_persists_job_data_when_requested() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("counter").persist_job_data_after_execution();
        store
            .store_job_and_trigger(job.clone(), once("t", &job.key, base))
            .await
            .unwrap();

        let acquired = store
            .acquire_next_triggers(base, 1, Duration::zero())
            .await
            .unwrap();
        let fired = store.triggers_fired(&acquired).await.unwrap();
        let bundle = fired[0].bundle().unwrap();
        let ran = bundle.job.clone().with_data("count", serde_json::json!(1));
        store
            .triggered_job_complete(&bundle.trigger, &ran, CompletedExecutionInstruction::Noop)
            .await
            .unwrap();

        let stored = store.retrieve_job(&JobKey::in_default_group("counter")).await.unwrap().unwrap();
        assert_eq!(stored.data.get("count"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn completed_trigger_without_fire_time_is_collected() {
        let grid = MemoryGrid::new();
        let (store, _) = initialized_node(&grid, "node-a").await;
        let base = base_time();
        let job = job("j");
        let trigger = once("t", &job.key, base);
        store.store_job_and_trigger(job.clone(), trigger.clone()).await.unwrap();

        let mut record = store.inner.triggers.get(&trigger.key).await.unwrap().unwrap();
        record.trigger.next_fire_time = None;
        record.set_state(TriggerState::Complete);
        store.write_wrapper(&record).await.unwrap();

        let acquired = store
            .acquire_next_triggers(base, 1, Duration::zero())
            .await
            .unwrap();

        assert!(acquired.is_empty());
        assert!(!store.check_trigger_exists(&trigger.key).await.unwrap());
        assert!(!store.check_job_exists(&job.key).await.unwrap());
    }
}
