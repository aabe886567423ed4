//! Parameters for submitting batches of jobs to an HPC.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{JadeError, Result};
use crate::models::hpc::HpcConfig;

pub const DEFAULT_PER_NODE_BATCH_SIZE: usize = 500;
pub const DEFAULT_POLL_INTERVAL: u64 = 60;
pub const DEFAULT_SUBMIT_RETRIES: usize = 3;

/// Submitter options selected by the user for one group of jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitterParams {
    pub hpc_config: HpcConfig,
    /// Max number of compute nodes to use simultaneously; unbounded when
    /// unset. Must be identical across all groups in a configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<usize>,
    /// How many jobs to assign to each node.
    #[serde(default = "default_per_node_batch_size")]
    pub per_node_batch_size: usize,
    /// Number of jobs to run in parallel on each node; defaults to the node
    /// CPU count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_parallel_processes_per_node: Option<usize>,
    /// Pack batches by estimated runtime against the walltime instead of by
    /// job count.
    #[serde(default)]
    pub time_based_batching: bool,
    /// Add blocked jobs to a batch if all of their blocking jobs are in the
    /// batch or already complete. Be aware of time constraints.
    #[serde(default = "default_true")]
    pub try_add_blocked_jobs: bool,
    /// Run once per allocated node before any job starts. Non-zero exit
    /// aborts the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_setup_command: Option<String>,
    /// Run once per allocated node after the last job finishes, even on
    /// cancellation. Failure is logged, not fatal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_teardown_command: Option<String>,
    /// Interval in seconds on which to poll HPC job status. Must be
    /// identical across all groups in a configuration.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// When true (the default) every node runner tries to promote itself to
    /// submitter on start and on finish. When false only explicit
    /// `try-submit-jobs` invocations advance the run.
    #[serde(default = "default_true")]
    pub distributed_submitter: bool,
    #[serde(default = "default_true")]
    pub generate_reports: bool,
    /// Attempts for one HPC submission before giving up until the next
    /// submitter iteration. Backoff is 1s, 2s, 4s, ...
    #[serde(default = "default_submit_retries")]
    pub submit_retries: usize,
}

fn default_per_node_batch_size() -> usize {
    DEFAULT_PER_NODE_BATCH_SIZE
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL
}

fn default_submit_retries() -> usize {
    DEFAULT_SUBMIT_RETRIES
}

fn default_true() -> bool {
    true
}

impl SubmitterParams {
    pub fn new(hpc_config: HpcConfig) -> Self {
        SubmitterParams {
            hpc_config,
            max_nodes: None,
            per_node_batch_size: DEFAULT_PER_NODE_BATCH_SIZE,
            num_parallel_processes_per_node: None,
            time_based_batching: false,
            try_add_blocked_jobs: true,
            node_setup_command: None,
            node_teardown_command: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            distributed_submitter: true,
            generate_reports: true,
            submit_retries: DEFAULT_SUBMIT_RETRIES,
        }
    }
}

/// A named submission policy that jobs reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionGroup {
    pub name: String,
    pub submitter_params: SubmitterParams,
}

impl SubmissionGroup {
    pub fn validate(&self) -> Result<()> {
        let params = &self.submitter_params;
        params.hpc_config.validate()?;
        if params.per_node_batch_size == 0 {
            return Err(JadeError::InvalidConfiguration(format!(
                "group {}: per_node_batch_size must be >= 1",
                self.name
            )));
        }
        if params.num_parallel_processes_per_node == Some(0) {
            return Err(JadeError::InvalidConfiguration(format!(
                "group {}: num_parallel_processes_per_node must be >= 1",
                self.name
            )));
        }
        if params.time_based_batching && params.hpc_config.walltime_minutes().is_none() {
            return Err(JadeError::InvalidConfiguration(format!(
                "group {}: time_based_batching requires a walltime",
                self.name
            )));
        }
        Ok(())
    }
}

/// Return the submission groups keyed by name, in deterministic order.
pub fn make_submission_group_lookup(
    groups: &[SubmissionGroup],
) -> BTreeMap<String, SubmissionGroup> {
    groups.iter().map(|x| (x.name.clone(), x.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpc::common::HpcType;
    use crate::models::hpc::{FakeHpcConfig, HpcParams};

    fn fake_hpc_config() -> HpcConfig {
        HpcConfig {
            hpc_type: HpcType::Fake,
            job_prefix: "job".to_string(),
            hpc: HpcParams::Fake(FakeHpcConfig {
                walltime: "04:00:00".to_string(),
            }),
        }
    }

    #[test]
    fn test_defaults() {
        let params = SubmitterParams::new(fake_hpc_config());
        assert_eq!(params.per_node_batch_size, 500);
        assert_eq!(params.poll_interval, 60);
        assert_eq!(params.submit_retries, 3);
        assert!(params.try_add_blocked_jobs);
        assert!(params.distributed_submitter);
        assert!(!params.time_based_batching);
    }

    #[test]
    fn test_validate_batch_size() {
        let mut group = SubmissionGroup {
            name: "default".to_string(),
            submitter_params: SubmitterParams::new(fake_hpc_config()),
        };
        group.validate().unwrap();
        group.submitter_params.per_node_batch_size = 0;
        assert!(group.validate().is_err());
    }
}
