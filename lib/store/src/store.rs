//! The clustered job store.
//!
//! All cluster-visible state lives in grid maps and sets shared by every
//! node. Operations that read and write more than one of them run under the
//! single cluster lock; the only per-process state is the record of which
//! triggers this node believes it has acquired or is executing.

use crate::calendar::Calendar;
use crate::config::StoreConfig;
use crate::error::{GridResultExt, StoreError};
use crate::job::JobDetail;
use crate::job_store::{CompletedExecutionInstruction, JobStore, TriggerFiredResult};
use crate::matcher::GroupMatcher;
use crate::schedule::MisfireInstruction;
use crate::signaler::{NoopSignaler, SchedulerSignaler};
use crate::sweep::SweepTask;
use crate::trigger::Trigger;
use crate::wrapper::{TriggerState, TriggerStatus, TriggerWrapper};
use async_trait::async_trait;
use chime_core::{FireInstanceIdGenerator, JobKey, NodeAddress, Result, TriggerKey};
use chime_grid::{ClusterLock, GridBackend, GridMap, GridSet};
use chrono::{DateTime, Duration, Utc};
use rootcause::prelude::ResultExt;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

/// Triggers this process believes it holds.
///
/// Rebuilt empty on every start; the consistency sweep treats shared records
/// owned by this node's address but missing here as orphans.
#[derive(Debug, Default)]
pub(crate) struct LocalTracking {
    pub(crate) acquired: HashSet<TriggerKey>,
    pub(crate) executing: HashSet<TriggerKey>,
}

impl LocalTracking {
    pub(crate) fn forget(&mut self, key: &TriggerKey) {
        self.acquired.remove(key);
        self.executing.remove(key);
    }

    pub(crate) fn tracks(&self, key: &TriggerKey) -> bool {
        self.acquired.contains(key) || self.executing.contains(key)
    }
}

#[derive(Debug, Default)]
struct InstanceIdentity {
    id: Option<String>,
    name: Option<String>,
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    backend: Arc<dyn GridBackend>,
    pub(crate) jobs: GridMap<JobKey, JobDetail>,
    pub(crate) triggers: GridMap<TriggerKey, TriggerWrapper>,
    pub(crate) calendars: GridMap<String, Calendar>,
    pub(crate) paused_trigger_groups: GridSet<String>,
    pub(crate) paused_job_groups: GridSet<String>,
    pub(crate) blocked_jobs: GridSet<JobKey>,
    cluster_lock: Arc<dyn ClusterLock>,
    pub(crate) local: Mutex<LocalTracking>,
    pub(crate) fire_ids: FireInstanceIdGenerator,
    signaler: OnceLock<Arc<dyn SchedulerSignaler>>,
    instance: RwLock<InstanceIdentity>,
    pub(crate) sweep: Mutex<Option<SweepTask>>,
}

/// A job store whose state is shared by every node through a data grid.
///
/// Cloning is cheap; clones share the same local tracking and sweep.
#[derive(Clone)]
pub struct ClusteredJobStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl fmt::Debug for ClusteredJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusteredJobStore")
            .field("node_address", &self.inner.config.node_address)
            .field("lock", &self.inner.config.lock_name)
            .finish_non_exhaustive()
    }
}

/// Releases the cluster lock if the holding future is dropped mid-operation.
struct HeldLock {
    lock: Arc<dyn ClusterLock>,
    operation: &'static str,
    released: bool,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = Arc::clone(&self.lock);
        let operation = self.operation;
        warn!(operation, "operation abandoned while holding the cluster lock");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = lock.unlock().await {
                    error!(operation, error = %e, "failed to release abandoned cluster lock");
                }
            });
        }
    }
}

impl ClusteredJobStore {
    /// Creates a store over a grid. Nothing is read or written until the
    /// store is used.
    pub fn new(backend: Arc<dyn GridBackend>, config: StoreConfig) -> Self {
        let map = |name: &str| config.map_name(name);
        let inner = StoreInner {
            jobs: GridMap::new(Arc::clone(&backend), map("jobs")),
            triggers: GridMap::new(Arc::clone(&backend), map("triggers")),
            calendars: GridMap::new(Arc::clone(&backend), map("calendars")),
            paused_trigger_groups: GridSet::new(Arc::clone(&backend), map("paused-trigger-groups")),
            paused_job_groups: GridSet::new(Arc::clone(&backend), map("paused-job-groups")),
            blocked_jobs: GridSet::new(Arc::clone(&backend), map("blocked-jobs")),
            cluster_lock: backend.lock(&config.lock_name),
            local: Mutex::new(LocalTracking::default()),
            fire_ids: FireInstanceIdGenerator::new(),
            signaler: OnceLock::new(),
            instance: RwLock::new(InstanceIdentity::default()),
            sweep: Mutex::new(None),
            backend,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The address this node records as owner of the triggers it acquires.
    #[must_use]
    pub fn node_address(&self) -> &NodeAddress {
        &self.inner.config.node_address
    }

    /// The store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// The engine instance id, once set.
    pub async fn instance_id(&self) -> Option<String> {
        self.inner.instance.read().await.id.clone()
    }

    /// The engine instance name, once set.
    pub async fn instance_name(&self) -> Option<String> {
        self.inner.instance.read().await.name.clone()
    }

    pub(crate) fn signaler(&self) -> Arc<dyn SchedulerSignaler> {
        match self.inner.signaler.get() {
            Some(signaler) => Arc::clone(signaler),
            None => Arc::new(NoopSignaler),
        }
    }

    /// Runs `critical` while holding the cluster lock.
    ///
    /// The future is not polled until the lock is held. A failure to release
    /// the lock is logged and, if the operation itself succeeded, returned.
    pub(crate) async fn with_cluster_lock<T, F>(
        &self,
        operation: &'static str,
        critical: F,
    ) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        self.inner
            .cluster_lock
            .lock()
            .await
            .context(StoreError::Interrupted { operation })?;
        let mut held = HeldLock {
            lock: Arc::clone(&self.inner.cluster_lock),
            operation,
            released: false,
        };

        let outcome = critical.await;

        let released = self.inner.cluster_lock.unlock().await;
        held.released = true;
        match released {
            Ok(()) => outcome,
            Err(e) => {
                error!(operation, error = %e, "failed to release cluster lock");
                match outcome {
                    Ok(_) => Err(e).context(StoreError::LockReleaseFailed { operation }),
                    Err(original) => Err(original),
                }
            }
        }
    }

    /// State a trigger takes when it (re-)enters the schedule, from the
    /// group pause flags and the blocked-job set.
    pub(crate) async fn resting_state(&self, trigger: &Trigger) -> Result<TriggerState, StoreError> {
        let paused = self
            .inner
            .paused_trigger_groups
            .contains(&trigger.key.group().to_string())
            .await
            .during("resting_state")?
            || self
                .inner
                .paused_job_groups
                .contains(&trigger.job_key.group().to_string())
                .await
                .during("resting_state")?;
        let blocked = self
            .inner
            .blocked_jobs
            .contains(&trigger.job_key)
            .await
            .during("resting_state")?;
        Ok(TriggerState::resting(paused, blocked))
    }

    pub(crate) async fn calendar_for(&self, trigger: &Trigger) -> Result<Option<Calendar>, StoreError> {
        match &trigger.calendar_name {
            Some(name) => self
                .inner
                .calendars
                .get(name)
                .await
                .during("calendar_lookup"),
            None => Ok(None),
        }
    }

    pub(crate) async fn wrappers_for_job(
        &self,
        job_key: &JobKey,
    ) -> Result<Vec<(TriggerKey, TriggerWrapper)>, StoreError> {
        self.inner
            .triggers
            .entries_where(|_, wrapper| wrapper.job_key() == job_key)
            .await
            .during("triggers_for_job")
    }

    /// Applies the misfire policy to a trigger more than the misfire
    /// threshold late. Returns whether the trigger was changed; the caller
    /// writes it back.
    pub(crate) async fn apply_misfire(&self, wrapper: &mut TriggerWrapper) -> Result<bool, StoreError> {
        let Some(next) = wrapper.trigger.next_fire_time else {
            return Ok(false);
        };
        if wrapper.trigger.misfire_instruction == MisfireInstruction::Ignore {
            return Ok(false);
        }
        let now = Utc::now();
        if !self.inner.config.is_misfired(next, now) {
            return Ok(false);
        }

        let calendar = self.calendar_for(&wrapper.trigger).await?;
        let signaler = self.signaler();
        signaler.notify_trigger_listeners_misfired(&wrapper.trigger).await;
        wrapper.trigger.update_after_misfire(calendar.as_ref(), now);

        match wrapper.trigger.next_fire_time {
            None => {
                wrapper.set_state(TriggerState::Complete);
                signaler
                    .notify_scheduler_listeners_finalized(&wrapper.trigger)
                    .await;
            }
            Some(rescheduled) if rescheduled == next => return Ok(false),
            Some(_) => {}
        }
        debug!(
            trigger = %wrapper.key(),
            next_fire_time = ?wrapper.trigger.next_fire_time,
            "applied misfire policy"
        );
        Ok(true)
    }

    async fn write_job(&self, job: &JobDetail, replace_existing: bool) -> Result<(), StoreError> {
        if replace_existing {
            self.inner.jobs.set(&job.key, job).await.during("store_job")?;
        } else if self
            .inner
            .jobs
            .put_if_absent(&job.key, job)
            .await
            .during("store_job")?
            .is_some()
        {
            return Err(StoreError::JobAlreadyExists {
                key: job.key.clone(),
            }
            .into());
        }
        debug!(job = %job.key, "stored job");
        Ok(())
    }

    /// Checks a trigger's schedule and that its calendar exists.
    async fn check_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
        trigger.validate().map_err(|e| StoreError::InvalidInput {
            reason: e.to_string(),
        })?;
        if let Some(name) = &trigger.calendar_name {
            if !self
                .inner
                .calendars
                .contains_key(name)
                .await
                .during("store_trigger")?
            {
                return Err(StoreError::CalendarNotFound { name: name.clone() }.into());
            }
        }
        Ok(())
    }

    pub(crate) async fn store_trigger_locked(
        &self,
        trigger: Trigger,
        replace_existing: bool,
    ) -> Result<(), StoreError> {
        self.check_trigger(&trigger).await?;
        if !self
            .inner
            .jobs
            .contains_key(&trigger.job_key)
            .await
            .during("store_trigger")?
        {
            return Err(StoreError::JobNotFound {
                key: trigger.job_key.clone(),
            }
            .into());
        }

        let key = trigger.key.clone();
        let state = self.resting_state(&trigger).await?;
        let wrapper = TriggerWrapper::new(trigger, state);
        if replace_existing {
            self.inner
                .triggers
                .set(&key, &wrapper)
                .await
                .during("store_trigger")?;
            self.inner.local.lock().await.forget(&key);
        } else if self
            .inner
            .triggers
            .put_if_absent(&key, &wrapper)
            .await
            .during("store_trigger")?
            .is_some()
        {
            return Err(StoreError::TriggerAlreadyExists { key }.into());
        }
        debug!(trigger = %key, %state, "stored trigger");
        Ok(())
    }

    /// Removes a trigger. With `remove_orphaned_job`, a non-durable job left
    /// without triggers is removed too.
    pub(crate) async fn remove_trigger_locked(
        &self,
        key: &TriggerKey,
        remove_orphaned_job: bool,
    ) -> Result<bool, StoreError> {
        let Some(wrapper) = self
            .inner
            .triggers
            .remove(key)
            .await
            .during("remove_trigger")?
        else {
            return Ok(false);
        };
        self.inner.local.lock().await.forget(key);

        let job_key = wrapper.job_key();
        if remove_orphaned_job {
            let job = self.inner.jobs.get(job_key).await.during("remove_trigger")?;
            if let Some(job) = job {
                if !job.durable && self.wrappers_for_job(job_key).await?.is_empty() {
                    self.inner.jobs.remove(job_key).await.during("remove_trigger")?;
                    self.inner
                        .blocked_jobs
                        .remove(job_key)
                        .await
                        .during("remove_trigger")?;
                    debug!(job = %job_key, "removed job with no remaining triggers");
                    self.signaler()
                        .notify_scheduler_listeners_job_deleted(job_key)
                        .await;
                }
            }
        }

        let group = key.group();
        let group_members = self
            .inner
            .triggers
            .keys_where(|other, _| other.group() == group)
            .await
            .during("remove_trigger")?;
        if group_members.is_empty() {
            self.inner
                .paused_trigger_groups
                .remove(&group.to_string())
                .await
                .during("remove_trigger")?;
        }
        debug!(trigger = %key, "removed trigger");
        Ok(true)
    }

    async fn remove_job_locked(&self, key: &JobKey) -> Result<bool, StoreError> {
        let mut found = false;
        for (trigger_key, _) in self.wrappers_for_job(key).await? {
            found |= self.remove_trigger_locked(&trigger_key, false).await?;
        }
        found |= self.inner.jobs.remove(key).await.during("remove_job")?.is_some();
        self.inner.blocked_jobs.remove(key).await.during("remove_job")?;
        debug!(job = %key, found, "removed job");
        Ok(found)
    }

    async fn remove_jobs_locked(&self, keys: &[JobKey]) -> Result<bool, StoreError> {
        let mut all_found = true;
        for key in keys {
            all_found &= self.remove_job_locked(key).await?;
        }
        Ok(all_found)
    }

    async fn remove_triggers_locked(&self, keys: &[TriggerKey]) -> Result<bool, StoreError> {
        let mut all_found = true;
        for key in keys {
            all_found &= self.remove_trigger_locked(key, true).await?;
        }
        Ok(all_found)
    }

    async fn store_job_and_trigger_locked(
        &self,
        job: JobDetail,
        trigger: Trigger,
    ) -> Result<(), StoreError> {
        if self
            .inner
            .triggers
            .contains_key(&trigger.key)
            .await
            .during("store_job_and_trigger")?
        {
            return Err(StoreError::TriggerAlreadyExists { key: trigger.key }.into());
        }
        if trigger.job_key != job.key {
            return Err(StoreError::JobMismatch {
                trigger: trigger.key,
                expected: job.key,
                found: trigger.job_key,
            }
            .into());
        }
        self.check_trigger(&trigger).await?;
        self.write_job(&job, false).await?;
        self.store_trigger_locked(trigger, false).await
    }

    /// Checks every trigger, and without `replace` every key, before
    /// writing anything.
    async fn store_jobs_and_triggers_locked(
        &self,
        jobs: Vec<(JobDetail, Vec<Trigger>)>,
        replace: bool,
    ) -> Result<(), StoreError> {
        let batch_jobs: HashSet<&JobKey> = jobs.iter().map(|(job, _)| &job.key).collect();
        for trigger in jobs.iter().flat_map(|(_, triggers)| triggers) {
            self.check_trigger(trigger).await?;
            if !batch_jobs.contains(&trigger.job_key)
                && !self
                    .inner
                    .jobs
                    .contains_key(&trigger.job_key)
                    .await
                    .during("store_jobs_and_triggers")?
            {
                return Err(StoreError::JobNotFound {
                    key: trigger.job_key.clone(),
                }
                .into());
            }
        }
        if !replace {
            for (job, triggers) in &jobs {
                if self
                    .inner
                    .jobs
                    .contains_key(&job.key)
                    .await
                    .during("store_jobs_and_triggers")?
                {
                    return Err(StoreError::JobAlreadyExists {
                        key: job.key.clone(),
                    }
                    .into());
                }
                for trigger in triggers {
                    if self
                        .inner
                        .triggers
                        .contains_key(&trigger.key)
                        .await
                        .during("store_jobs_and_triggers")?
                    {
                        return Err(StoreError::TriggerAlreadyExists {
                            key: trigger.key.clone(),
                        }
                        .into());
                    }
                }
            }
        }
        for (job, triggers) in jobs {
            self.write_job(&job, true).await?;
            for trigger in triggers {
                self.store_trigger_locked(trigger, true).await?;
            }
        }
        Ok(())
    }

    async fn replace_trigger_locked(
        &self,
        key: &TriggerKey,
        new_trigger: Trigger,
    ) -> Result<bool, StoreError> {
        let Some(old) = self
            .inner
            .triggers
            .get(key)
            .await
            .during("replace_trigger")?
        else {
            return Ok(false);
        };
        if old.job_key() != &new_trigger.job_key {
            return Err(StoreError::JobMismatch {
                trigger: key.clone(),
                expected: old.job_key().clone(),
                found: new_trigger.job_key,
            }
            .into());
        }

        self.inner
            .triggers
            .remove(key)
            .await
            .during("replace_trigger")?;
        self.inner.local.lock().await.forget(key);
        if let Err(e) = self.store_trigger_locked(new_trigger, false).await {
            self.inner
                .triggers
                .set(key, &old)
                .await
                .during("replace_trigger")?;
            return Err(e);
        }
        Ok(true)
    }

    async fn store_calendar_locked(
        &self,
        name: &str,
        calendar: Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<(), StoreError> {
        calendar.validate().map_err(|e| StoreError::InvalidInput {
            reason: e.to_string(),
        })?;
        let name_owned = name.to_string();
        if replace_existing {
            self.inner
                .calendars
                .set(&name_owned, &calendar)
                .await
                .during("store_calendar")?;
        } else if self
            .inner
            .calendars
            .put_if_absent(&name_owned, &calendar)
            .await
            .during("store_calendar")?
            .is_some()
        {
            return Err(StoreError::CalendarAlreadyExists { name: name_owned }.into());
        }

        if update_triggers {
            let threshold = self.inner.config.misfire_threshold();
            let now = Utc::now();
            let affected = self
                .inner
                .triggers
                .entries_where(|_, wrapper| wrapper.trigger.calendar_name.as_deref() == Some(name))
                .await
                .during("store_calendar")?;
            for (key, mut wrapper) in affected {
                wrapper
                    .trigger
                    .update_with_new_calendar(&calendar, threshold, now);
                self.inner
                    .triggers
                    .set(&key, &wrapper)
                    .await
                    .during("store_calendar")?;
            }
        }
        debug!(calendar = name, "stored calendar");
        Ok(())
    }

    async fn remove_calendar_locked(&self, name: &str) -> Result<bool, StoreError> {
        let users = self
            .inner
            .triggers
            .keys_where(|_, wrapper| wrapper.trigger.calendar_name.as_deref() == Some(name))
            .await
            .during("remove_calendar")?;
        if let Some(trigger) = users.into_iter().next() {
            return Err(StoreError::CalendarInUse {
                name: name.to_string(),
                trigger,
            }
            .into());
        }
        let removed = self
            .inner
            .calendars
            .remove(&name.to_string())
            .await
            .during("remove_calendar")?;
        Ok(removed.is_some())
    }

    async fn clear_locked(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        inner.triggers.clear().await.during("clear_all_scheduling_data")?;
        inner.jobs.clear().await.during("clear_all_scheduling_data")?;
        inner.calendars.clear().await.during("clear_all_scheduling_data")?;
        inner
            .paused_trigger_groups
            .clear()
            .await
            .during("clear_all_scheduling_data")?;
        inner
            .paused_job_groups
            .clear()
            .await
            .during("clear_all_scheduling_data")?;
        inner
            .blocked_jobs
            .clear()
            .await
            .during("clear_all_scheduling_data")?;
        *inner.local.lock().await = LocalTracking::default();
        Ok(())
    }

    async fn reset_from_error_locked(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let Some(mut wrapper) = self
            .inner
            .triggers
            .get(key)
            .await
            .during("reset_trigger_from_error_state")?
        else {
            return Ok(());
        };
        if wrapper.state() != TriggerState::Error {
            return Ok(());
        }
        let state = self.resting_state(&wrapper.trigger).await?;
        wrapper.set_state(state);
        self.inner
            .triggers
            .set(key, &wrapper)
            .await
            .during("reset_trigger_from_error_state")?;
        debug!(trigger = %key, %state, "reset trigger from error state");
        Ok(())
    }

    async fn trigger_groups_matching(&self, matcher: &GroupMatcher) -> Result<BTreeSet<String>, StoreError> {
        let keys = self
            .inner
            .triggers
            .keys_where(|key, _| matcher.matches(key.group()))
            .await
            .during("trigger_groups")?;
        Ok(keys.iter().map(|key| key.group().to_string()).collect())
    }

    async fn job_groups_matching(&self, matcher: &GroupMatcher) -> Result<BTreeSet<String>, StoreError> {
        let keys = self
            .inner
            .jobs
            .keys_where(|key, _| matcher.matches(key.group()))
            .await
            .during("job_groups")?;
        Ok(keys.iter().map(|key| key.group().to_string()).collect())
    }

    async fn pause_trigger_locked(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let Some(mut wrapper) = self.inner.triggers.get(key).await.during("pause_trigger")? else {
            return Ok(());
        };
        let current = wrapper.state();
        let paused = current.paused();
        if paused == current {
            return Ok(());
        }
        wrapper.set_state(paused);
        self.inner
            .triggers
            .set(key, &wrapper)
            .await
            .during("pause_trigger")?;
        if current == TriggerState::Acquired {
            self.inner.local.lock().await.forget(key);
        }
        debug!(trigger = %key, from = %current, to = %paused, "paused trigger");
        Ok(())
    }

    async fn pause_triggers_locked(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut groups = self.trigger_groups_matching(matcher).await?;
        if let Some(group) = matcher.exact_group() {
            groups.insert(group.to_string());
        }
        for group in &groups {
            self.inner
                .paused_trigger_groups
                .add(group)
                .await
                .during("pause_triggers")?;
            let keys = self
                .inner
                .triggers
                .keys_where(|key, _| key.group() == group)
                .await
                .during("pause_triggers")?;
            for key in keys {
                self.pause_trigger_locked(&key).await?;
            }
        }
        Ok(groups.into_iter().collect())
    }

    async fn pause_job_locked(&self, key: &JobKey) -> Result<(), StoreError> {
        for (trigger_key, _) in self.wrappers_for_job(key).await? {
            self.pause_trigger_locked(&trigger_key).await?;
        }
        Ok(())
    }

    async fn pause_jobs_locked(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut groups = self.job_groups_matching(matcher).await?;
        if let Some(group) = matcher.exact_group() {
            groups.insert(group.to_string());
        }
        for group in &groups {
            self.inner
                .paused_job_groups
                .add(group)
                .await
                .during("pause_jobs")?;
            let keys = self
                .inner
                .jobs
                .keys_where(|key, _| key.group() == group)
                .await
                .during("pause_jobs")?;
            for key in keys {
                self.pause_job_locked(&key).await?;
            }
        }
        Ok(groups.into_iter().collect())
    }

    async fn resume_trigger_locked(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let Some(mut wrapper) = self.inner.triggers.get(key).await.during("resume_trigger")? else {
            return Ok(());
        };
        if !matches!(
            wrapper.state(),
            TriggerState::Paused | TriggerState::PausedBlocked
        ) {
            return Ok(());
        }
        let blocked = self
            .inner
            .blocked_jobs
            .contains(wrapper.job_key())
            .await
            .during("resume_trigger")?;
        wrapper.set_state(if blocked {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        });
        self.apply_misfire(&mut wrapper).await?;
        self.inner
            .triggers
            .set(key, &wrapper)
            .await
            .during("resume_trigger")?;
        debug!(trigger = %key, state = %wrapper.state(), "resumed trigger");
        Ok(())
    }

    async fn resume_triggers_locked(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut groups = self.trigger_groups_matching(matcher).await?;
        let paused = self
            .inner
            .paused_trigger_groups
            .members()
            .await
            .during("resume_triggers")?;
        groups.extend(paused.into_iter().filter(|group| matcher.matches(group)));

        for group in &groups {
            self.inner
                .paused_trigger_groups
                .remove(group)
                .await
                .during("resume_triggers")?;
            let members = self
                .inner
                .triggers
                .entries_where(|key, _| key.group() == group)
                .await
                .during("resume_triggers")?;
            for (key, wrapper) in members {
                let job_group = wrapper.job_key().group().to_string();
                if self
                    .inner
                    .paused_job_groups
                    .contains(&job_group)
                    .await
                    .during("resume_triggers")?
                {
                    continue;
                }
                self.resume_trigger_locked(&key).await?;
            }
        }
        Ok(groups.into_iter().collect())
    }

    async fn resume_job_locked(&self, key: &JobKey) -> Result<(), StoreError> {
        for (trigger_key, _) in self.wrappers_for_job(key).await? {
            self.resume_trigger_locked(&trigger_key).await?;
        }
        Ok(())
    }

    async fn resume_jobs_locked(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut groups = self.job_groups_matching(matcher).await?;
        let paused = self
            .inner
            .paused_job_groups
            .members()
            .await
            .during("resume_jobs")?;
        groups.extend(paused.into_iter().filter(|group| matcher.matches(group)));

        for group in &groups {
            self.inner
                .paused_job_groups
                .remove(group)
                .await
                .during("resume_jobs")?;
            let keys = self
                .inner
                .jobs
                .keys_where(|key, _| key.group() == group)
                .await
                .during("resume_jobs")?;
            for key in keys {
                self.resume_job_locked(&key).await?;
            }
        }
        Ok(groups.into_iter().collect())
    }

    async fn resume_all_locked(&self) -> Result<(), StoreError> {
        self.inner
            .paused_job_groups
            .clear()
            .await
            .during("resume_all")?;
        self.resume_triggers_locked(&GroupMatcher::Anything).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for ClusteredJobStore {
    #[instrument(skip_all, fields(node = %self.inner.config.node_address))]
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> Result<(), StoreError> {
        self.inner.backend.ping().await.during("initialize")?;
        if self.inner.signaler.set(signaler).is_err() {
            warn!("store already initialized; keeping the first signaler");
        }
        info!(lock = %self.inner.config.lock_name, "clustered job store initialized");
        Ok(())
    }

    async fn scheduler_started(&self) -> Result<(), StoreError> {
        self.start_sweep().await;
        Ok(())
    }

    async fn scheduler_paused(&self) {
        self.stop_sweep().await;
    }

    async fn scheduler_resumed(&self) {
        self.start_sweep().await;
    }

    async fn shutdown(&self) {
        self.stop_sweep().await;
        info!(node = %self.inner.config.node_address, "clustered job store shut down");
    }

    fn supports_persistence(&self) -> bool {
        false
    }

    fn is_clustered(&self) -> bool {
        true
    }

    fn estimated_time_to_release_and_acquire_trigger(&self) -> Duration {
        let millis = i64::try_from(self.inner.config.estimated_release_acquire_ms).unwrap_or(i64::MAX);
        Duration::try_milliseconds(millis).unwrap_or(Duration::MAX)
    }

    async fn set_instance_id(&self, instance_id: String) {
        self.inner.instance.write().await.id = Some(instance_id);
    }

    async fn set_instance_name(&self, instance_name: String) {
        self.inner.instance.write().await.name = Some(instance_name);
    }

    #[instrument(skip(self, job), fields(job = %job.key))]
    async fn store_job(&self, job: JobDetail, replace_existing: bool) -> Result<(), StoreError> {
        self.write_job(&job, replace_existing).await
    }

    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    async fn store_trigger(&self, trigger: Trigger, replace_existing: bool) -> Result<(), StoreError> {
        self.with_cluster_lock(
            "store_trigger",
            self.store_trigger_locked(trigger, replace_existing),
        )
        .await
    }

    #[instrument(skip_all, fields(job = %job.key, trigger = %trigger.key))]
    async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<(), StoreError> {
        self.with_cluster_lock(
            "store_job_and_trigger",
            self.store_job_and_trigger_locked(job, trigger),
        )
        .await
    }

    #[instrument(skip(self, jobs), fields(jobs = jobs.len()))]
    async fn store_jobs_and_triggers(
        &self,
        jobs: Vec<(JobDetail, Vec<Trigger>)>,
        replace: bool,
    ) -> Result<(), StoreError> {
        self.with_cluster_lock(
            "store_jobs_and_triggers",
            self.store_jobs_and_triggers_locked(jobs, replace),
        )
        .await
    }

    #[instrument(skip_all, fields(job = %key))]
    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        self.with_cluster_lock("remove_job", self.remove_job_locked(key))
            .await
    }

    #[instrument(skip_all, fields(count = keys.len()))]
    async fn remove_jobs(&self, keys: &[JobKey]) -> Result<bool, StoreError> {
        self.with_cluster_lock("remove_jobs", self.remove_jobs_locked(keys))
            .await
    }

    #[instrument(skip_all, fields(trigger = %key))]
    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        self.with_cluster_lock("remove_trigger", self.remove_trigger_locked(key, true))
            .await
    }

    #[instrument(skip_all, fields(count = keys.len()))]
    async fn remove_triggers(&self, keys: &[TriggerKey]) -> Result<bool, StoreError> {
        self.with_cluster_lock("remove_triggers", self.remove_triggers_locked(keys))
            .await
    }

    #[instrument(skip_all, fields(trigger = %key))]
    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool, StoreError> {
        self.with_cluster_lock(
            "replace_trigger",
            self.replace_trigger_locked(key, new_trigger),
        )
        .await
    }

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError> {
        self.inner.jobs.get(key).await.during("retrieve_job")
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        let wrapper = self.inner.triggers.get(key).await.during("retrieve_trigger")?;
        Ok(wrapper.map(|wrapper| wrapper.trigger))
    }

    async fn check_job_exists(&self, key: &JobKey) -> Result<bool, StoreError> {
        self.inner.jobs.contains_key(key).await.during("check_job_exists")
    }

    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        self.inner
            .triggers
            .contains_key(key)
            .await
            .during("check_trigger_exists")
    }

    #[instrument(skip(self))]
    async fn clear_all_scheduling_data(&self) -> Result<(), StoreError> {
        self.with_cluster_lock("clear_all_scheduling_data", self.clear_locked())
            .await?;
        info!("cleared all scheduling data");
        Ok(())
    }

    #[instrument(skip(self, calendar))]
    async fn store_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<(), StoreError> {
        self.with_cluster_lock(
            "store_calendar",
            self.store_calendar_locked(name, calendar, replace_existing, update_triggers),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn remove_calendar(&self, name: &str) -> Result<bool, StoreError> {
        self.with_cluster_lock("remove_calendar", self.remove_calendar_locked(name))
            .await
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>, StoreError> {
        self.inner
            .calendars
            .get(&name.to_string())
            .await
            .during("retrieve_calendar")
    }

    async fn check_calendar_exists(&self, name: &str) -> Result<bool, StoreError> {
        self.inner
            .calendars
            .contains_key(&name.to_string())
            .await
            .during("check_calendar_exists")
    }

    async fn number_of_jobs(&self) -> Result<usize, StoreError> {
        self.inner.jobs.len().await.during("number_of_jobs")
    }

    async fn number_of_triggers(&self) -> Result<usize, StoreError> {
        self.inner.triggers.len().await.during("number_of_triggers")
    }

    async fn number_of_calendars(&self) -> Result<usize, StoreError> {
        self.inner.calendars.len().await.during("number_of_calendars")
    }

    async fn job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>, StoreError> {
        let mut keys = self
            .inner
            .jobs
            .keys_where(|key, _| matcher.matches(key.group()))
            .await
            .during("job_keys")?;
        keys.sort();
        Ok(keys)
    }

    async fn trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>, StoreError> {
        let mut keys = self
            .inner
            .triggers
            .keys_where(|key, _| matcher.matches(key.group()))
            .await
            .during("trigger_keys")?;
        keys.sort();
        Ok(keys)
    }

    async fn job_group_names(&self) -> Result<Vec<String>, StoreError> {
        let groups = self.job_groups_matching(&GroupMatcher::Anything).await?;
        Ok(groups.into_iter().collect())
    }

    async fn trigger_group_names(&self) -> Result<Vec<String>, StoreError> {
        let groups = self.trigger_groups_matching(&GroupMatcher::Anything).await?;
        Ok(groups.into_iter().collect())
    }

    async fn calendar_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = self.inner.calendars.keys().await.during("calendar_names")?;
        names.sort();
        Ok(names)
    }

    async fn triggers_for_job(&self, job_key: &JobKey) -> Result<Vec<Trigger>, StoreError> {
        let mut triggers: Vec<Trigger> = self
            .wrappers_for_job(job_key)
            .await?
            .into_iter()
            .map(|(_, wrapper)| wrapper.trigger)
            .collect();
        triggers.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(triggers)
    }

    async fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerStatus, StoreError> {
        let wrapper = self.inner.triggers.get(key).await.during("trigger_state")?;
        Ok(wrapper.map_or(TriggerStatus::None, |wrapper| wrapper.state().into()))
    }

    #[instrument(skip_all, fields(trigger = %key))]
    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<(), StoreError> {
        self.with_cluster_lock(
            "reset_trigger_from_error_state",
            self.reset_from_error_locked(key),
        )
        .await
    }

    #[instrument(skip_all, fields(trigger = %key))]
    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        self.with_cluster_lock("pause_trigger", self.pause_trigger_locked(key))
            .await
    }

    #[instrument(skip(self))]
    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        self.with_cluster_lock("pause_triggers", self.pause_triggers_locked(matcher))
            .await
    }

    #[instrument(skip_all, fields(job = %key))]
    async fn pause_job(&self, key: &JobKey) -> Result<(), StoreError> {
        self.with_cluster_lock("pause_job", self.pause_job_locked(key))
            .await
    }

    #[instrument(skip(self))]
    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        self.with_cluster_lock("pause_jobs", self.pause_jobs_locked(matcher))
            .await
    }

    #[instrument(skip_all, fields(trigger = %key))]
    async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        self.with_cluster_lock("resume_trigger", self.resume_trigger_locked(key))
            .await
    }

    #[instrument(skip(self))]
    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        self.with_cluster_lock("resume_triggers", self.resume_triggers_locked(matcher))
            .await
    }

    #[instrument(skip_all, fields(job = %key))]
    async fn resume_job(&self, key: &JobKey) -> Result<(), StoreError> {
        self.with_cluster_lock("resume_job", self.resume_job_locked(key))
            .await
    }

    #[instrument(skip(self))]
    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        self.with_cluster_lock("resume_jobs", self.resume_jobs_locked(matcher))
            .await
    }

    #[instrument(skip(self))]
    async fn pause_all(&self) -> Result<(), StoreError> {
        self.with_cluster_lock(
            "pause_all",
            self.pause_triggers_locked(&GroupMatcher::Anything),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resume_all(&self) -> Result<(), StoreError> {
        self.with_cluster_lock("resume_all", self.resume_all_locked())
            .await
    }

    async fn paused_trigger_groups(&self) -> Result<BTreeSet<String>, StoreError> {
        let groups = self
            .inner
            .paused_trigger_groups
            .members()
            .await
            .during("paused_trigger_groups")?;
        Ok(groups.into_iter().collect())
    }

    async fn is_job_group_paused(&self, group: &str) -> Result<bool, StoreError> {
        self.inner
            .paused_job_groups
            .contains(&group.to_string())
            .await
            .during("is_job_group_paused")
    }

    async fn is_trigger_group_paused(&self, group: &str) -> Result<bool, StoreError> {
        self.inner
            .paused_trigger_groups
            .contains(&group.to_string())
            .await
            .during("is_trigger_group_paused")
    }

    #[instrument(skip(self), fields(node = %self.inner.config.node_address))]
    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>, StoreError> {
        self.with_cluster_lock(
            "acquire_next_triggers",
            self.acquire_next_triggers_locked(no_later_than, max_count, time_window),
        )
        .await
    }

    #[instrument(skip_all, fields(trigger = %trigger.key))]
    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
        self.with_cluster_lock(
            "release_acquired_trigger",
            self.release_acquired_trigger_locked(&trigger.key),
        )
        .await
    }

    #[instrument(skip_all, fields(count = triggers.len()))]
    async fn triggers_fired(&self, triggers: &[Trigger]) -> Result<Vec<TriggerFiredResult>, StoreError> {
        self.with_cluster_lock("triggers_fired", self.triggers_fired_locked(triggers))
            .await
    }

    #[instrument(skip(self, trigger, job), fields(trigger = %trigger.key, job = %job.key))]
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StoreError> {
        self.with_cluster_lock(
            "triggered_job_complete",
            self.triggered_job_complete_locked(trigger, job, instruction),
        )
        .await
    }
}
