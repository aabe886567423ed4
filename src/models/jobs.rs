//! The user-facing job model.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub type JobId = i64;

/// One executable job in a configuration.
///
/// `command` is never shell-interpreted: the argv is obtained by splitting
/// on whitespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique within a configuration, 1-based.
    pub job_id: JobId,
    /// Defaults to the decimal rendering of `job_id`; used in the UI, in
    /// output paths, and for matching.
    #[serde(default)]
    pub name: String,
    pub command: String,
    /// Job IDs that must reach a terminal state before this job may start.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub blocked_by: BTreeSet<JobId>,
    /// Cancel this job if one of its blocking jobs fails. The default
    /// (false) runs the job even when a blocker exits non-zero.
    #[serde(default)]
    pub cancel_on_blocking_job_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_run_minutes: Option<u64>,
    /// References a submission group by name. May be omitted when the
    /// configuration defines exactly one group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_group: Option<String>,
    /// Opaque data passed through to pre/post hooks and the job environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ext: BTreeMap<String, serde_json::Value>,
}

impl Job {
    pub fn new(job_id: JobId, command: &str) -> Self {
        Job {
            job_id,
            name: job_id.to_string(),
            command: command.to_string(),
            blocked_by: BTreeSet::new(),
            cancel_on_blocking_job_failure: false,
            estimated_run_minutes: None,
            submission_group: None,
            ext: BTreeMap::new(),
        }
    }

    pub fn with_blocked_by(mut self, blocked_by: impl IntoIterator<Item = JobId>) -> Self {
        self.blocked_by = blocked_by.into_iter().collect();
        self
    }
}
