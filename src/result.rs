//! The per-job result record.
//!
//! One `JobResult` is produced for every job once it reaches a terminal
//! state. Rows are staged in per-batch CSV files by node runners and drained
//! into the cluster state by whichever process holds the cluster lock.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::jobs::JobId;

/// CSV header for result files. The serde field order of [`JobResult`] must
/// match.
pub const RESULT_FIELDS: [&str; 9] = [
    "name",
    "job_id",
    "return_code",
    "status",
    "exec_time_s",
    "completion_time",
    "batch_id",
    "hpc_job_id",
    "output_dir",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobCompletionStatus {
    /// The job process ran to completion; `return_code` holds its exit code.
    Finished,
    /// The job's HPC allocation ended before the job reported a result.
    Missing,
    /// The job was canceled before or during execution.
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub name: String,
    pub job_id: JobId,
    pub return_code: i32,
    pub status: JobCompletionStatus,
    pub exec_time_s: f64,
    /// Unix timestamp in seconds.
    pub completion_time: f64,
    pub batch_id: u64,
    pub hpc_job_id: String,
    pub output_dir: String,
}

impl JobResult {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        job_id: JobId,
        return_code: i32,
        status: JobCompletionStatus,
        exec_time_s: f64,
        batch_id: u64,
        hpc_job_id: &str,
        output_dir: &str,
    ) -> Self {
        JobResult {
            name: name.to_string(),
            job_id,
            return_code,
            status,
            exec_time_s,
            completion_time: Utc::now().timestamp_millis() as f64 / 1000.0,
            batch_id,
            hpc_job_id: hpc_job_id.to_string(),
            output_dir: output_dir.to_string(),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.return_code == 0 && self.status == JobCompletionStatus::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.return_code != 0 && self.status == JobCompletionStatus::Finished
    }

    pub fn is_canceled(&self) -> bool {
        self.status == JobCompletionStatus::Canceled
    }

    pub fn is_missing(&self) -> bool {
        self.status == JobCompletionStatus::Missing
    }
}
