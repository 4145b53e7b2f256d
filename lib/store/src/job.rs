//! Job definitions.
//!
//! A job is the unit of work one or more triggers fire. The store never runs
//! jobs; it hands them to the host engine inside fired bundles.

use chime_core::JobKey;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Key-value data attached to jobs and triggers.
pub type JobDataMap = BTreeMap<String, JsonValue>;

/// A stored job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    /// Job identity.
    pub key: JobKey,
    /// Human-readable description.
    pub description: Option<String>,
    /// Name the host engine resolves to executable work.
    pub job_type: String,
    /// Job data handed to each execution.
    pub data: JobDataMap,
    /// Whether the job stays stored when no trigger references it.
    pub durable: bool,
    /// Whether at most one trigger of this job may execute at a time, cluster-wide.
    pub concurrent_execution_disallowed: bool,
    /// Whether data mutated during execution is written back on completion.
    pub persist_job_data_after_execution: bool,
    /// Whether the host engine should re-run the job after a node failure.
    pub requests_recovery: bool,
}

impl JobDetail {
    /// Creates a non-durable job that allows concurrent execution.
    #[must_use]
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            description: None,
            job_type: job_type.into(),
            data: JobDataMap::new(),
            durable: false,
            concurrent_execution_disallowed: false,
            persist_job_data_after_execution: false,
            requests_recovery: false,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Marks the job durable.
    #[must_use]
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Disallows concurrent execution of this job.
    #[must_use]
    pub fn disallow_concurrent_execution(mut self) -> Self {
        self.concurrent_execution_disallowed = true;
        self
    }

    /// Persists job data after each execution.
    #[must_use]
    pub fn persist_job_data_after_execution(mut self) -> Self {
        self.persist_job_data_after_execution = true;
        self
    }

    /// Requests recovery after a node failure.
    #[must_use]
    pub fn request_recovery(mut self) -> Self {
        self.requests_recovery = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_defaults() {
        let job = JobDetail::new(JobKey::in_default_group("cleanup"), "CleanupJob");

        assert!(!job.durable);
        assert!(!job.concurrent_execution_disallowed);
        assert!(job.data.is_empty());
    }

    #[test]
    fn builder_sets_flags() {
        let job = JobDetail::new(JobKey::new("sync", "integrations"), "SyncJob")
            .durable()
            .disallow_concurrent_execution()
            .persist_job_data_after_execution()
            .with_data("cursor", serde_json::json!(42));

        assert!(job.durable);
        assert!(job.concurrent_execution_disallowed);
        assert!(job.persist_job_data_after_execution);
        assert_eq!(job.data["cursor"], 42);
    }
}
