//! Fixtures shared by the store's unit tests.

use crate::config::StoreConfig;
use crate::job::JobDetail;
use crate::job_store::JobStore;
use crate::schedule::SimpleSchedule;
use crate::signaler::RecordingSignaler;
use crate::store::ClusteredJobStore;
use crate::trigger::Trigger;
use chime_core::{JobKey, TriggerKey};
use chime_grid::MemoryGrid;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::sync::Arc;

/// A store for `address` on a shared in-memory grid, initialized with a
/// recording signaler. The sweep is not started.
pub(crate) async fn initialized_node(
    grid: &MemoryGrid,
    address: &str,
) -> (ClusteredJobStore, Arc<RecordingSignaler>) {
    let store = ClusteredJobStore::new(Arc::new(grid.clone()), StoreConfig::for_node(address));
    let signaler = Arc::new(RecordingSignaler::new());
    store.initialize(signaler.clone()).await.unwrap();
    (store, signaler)
}

/// A reference instant an hour ahead, so triggers around it are never misfired.
pub(crate) fn base_time() -> DateTime<Utc> {
    (Utc::now() + Duration::hours(1))
        .duration_trunc(Duration::seconds(1))
        .unwrap()
}

pub(crate) fn job(name: &str) -> JobDetail {
    JobDetail::new(JobKey::in_default_group(name), "test.NoopJob")
}

pub(crate) fn once(name: &str, job_key: &JobKey, at: DateTime<Utc>) -> Trigger {
    Trigger::new(
        TriggerKey::in_default_group(name),
        job_key.clone(),
        SimpleSchedule::once(at),
    )
}
