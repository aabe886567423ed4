//! The queueing-system capability interface.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;

use super::common::{HpcJobInfo, HpcJobStatus};

/// Abstracts the HPC queueing system. Implementations compose; nothing
/// inherits. All methods take `&self` so one instance can be shared by a
/// submitter iteration.
pub trait HpcInterface {
    /// Submit a script to the queue. Returns `(return_code, hpc_job_id,
    /// stderr)`; the job ID is only meaningful when the return code is 0.
    fn submit(&self, filename: &Path) -> Result<(i32, String, String)>;

    /// Status of a single job by native ID.
    fn get_status(&self, job_id: &str) -> Result<HpcJobInfo>;

    /// Statuses of all of this user's jobs, keyed by native ID. Jobs absent
    /// from the map are no longer known to the scheduler.
    fn get_statuses(&self) -> Result<HashMap<String, HpcJobStatus>>;

    fn cancel_job(&self, job_id: &str) -> Result<i32>;

    /// The nodes currently participating in the job, in deterministic order.
    fn list_active_nodes(&self, job_id: &str) -> Result<Vec<String>>;

    /// Write a submission script that executes `command` on an allocated
    /// node.
    fn create_submission_script(
        &self,
        name: &str,
        command: &str,
        filename: &Path,
        output: &Path,
    ) -> Result<()>;

    /// The native job ID of the allocation this process is running inside,
    /// if any.
    fn get_current_job_id(&self) -> Option<String>;

    /// True on the node responsible for running the batch (node 0 of a
    /// multi-node allocation).
    fn am_i_manager(&self) -> bool {
        true
    }

    fn get_num_cpus(&self) -> usize;
}
