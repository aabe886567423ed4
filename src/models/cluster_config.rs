//! The shared cluster-state document.
//!
//! One JSON document per output directory describes the whole run: which
//! jobs have been placed into batches, which have terminal results, and
//! which HPC allocations are still active. The document is small; writers
//! rewrite it whole under the cluster lock (see [`crate::jobs::cluster`]).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::models::jobs::JobId;
use crate::result::JobResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchRunState {
    /// Accepted by the HPC queue, not yet observed running.
    Submitted,
    /// Observed running on a node.
    Running,
}

/// One active batch: an HPC allocation that has not yet finalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchState {
    pub hpc_job_id: String,
    /// Compute nodes, once discovered from the scheduler.
    #[serde(default)]
    pub node_names: Vec<String>,
    pub submission_group: String,
    pub job_ids: Vec<JobId>,
    pub state: BatchRunState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterState {
    /// Hash of the configuration this state was created from.
    pub config_id: String,
    /// Hostname of the process that performed the last submitter iteration.
    #[serde(default)]
    pub submitter: Option<String>,
    pub num_jobs: usize,
    /// Job IDs that have been placed into a submitted batch (or reached a
    /// terminal state without running). Grows monotonically.
    pub submitted_jobs: BTreeSet<JobId>,
    /// One entry per job that reached a terminal state.
    pub completed_results: Vec<JobResult>,
    pub active_batches: BTreeMap<u64, BatchState>,
    /// Monotonic batch counter for this output directory.
    pub next_batch_id: u64,
    pub is_complete: bool,
    pub canceled: bool,
    /// Bumped on every write.
    pub version: u64,
}

impl ClusterState {
    pub fn new(config_id: String, num_jobs: usize) -> Self {
        ClusterState {
            config_id,
            submitter: None,
            num_jobs,
            submitted_jobs: BTreeSet::new(),
            completed_results: Vec::new(),
            active_batches: BTreeMap::new(),
            next_batch_id: 1,
            is_complete: false,
            canceled: false,
            version: 0,
        }
    }

    pub fn completed_job_ids(&self) -> BTreeSet<JobId> {
        self.completed_results.iter().map(|x| x.job_id).collect()
    }

    /// Job IDs whose results completed with a non-zero return code
    /// (failures, cancellations, and missing jobs alike).
    pub fn failed_job_ids(&self) -> BTreeSet<JobId> {
        self.completed_results
            .iter()
            .filter(|x| x.return_code != 0)
            .map(|x| x.job_id)
            .collect()
    }

    pub fn is_job_completed(&self, job_id: JobId) -> bool {
        self.completed_results.iter().any(|x| x.job_id == job_id)
    }

    pub fn all_jobs_complete(&self) -> bool {
        self.completed_results.len() >= self.num_jobs
    }

    /// Allocate the next batch ID. IDs are monotonic within an output
    /// directory even when a submission later fails; gaps are harmless.
    pub fn allocate_batch_id(&mut self) -> u64 {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        batch_id
    }
}
