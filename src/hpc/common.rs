//! Common HPC types shared by all queueing-system implementations.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HpcType {
    Slurm,
    /// Runs submission scripts as local child processes. Useful for testing
    /// the full submission path on a workstation.
    Fake,
    /// No queueing system; jobs run in-process on the submitting host.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpcJobStatus {
    /// The scheduler does not know the job (finished long ago, or never
    /// existed).
    None,
    Queued,
    Running,
    Complete,
    Unknown,
}

impl HpcJobStatus {
    /// True when the allocation is no longer running as far as the
    /// scheduler is concerned.
    pub fn is_done(&self) -> bool {
        matches!(self, HpcJobStatus::Complete | HpcJobStatus::None)
    }
}

#[derive(Debug, Clone)]
pub struct HpcJobInfo {
    pub job_id: String,
    pub name: String,
    pub status: HpcJobStatus,
}

impl HpcJobInfo {
    pub fn new(job_id: String, name: String, status: HpcJobStatus) -> Self {
        HpcJobInfo {
            job_id,
            name,
            status,
        }
    }

    pub fn none() -> Self {
        HpcJobInfo {
            job_id: String::new(),
            name: String::new(),
            status: HpcJobStatus::None,
        }
    }
}
