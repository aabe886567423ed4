//! Degenerate interface for runs with no queueing system. Batches are
//! executed in-process by the submitter; nothing is ever submitted through
//! this interface.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Result, anyhow};
use sysinfo::{CpuRefreshKind, RefreshKind, System};

use super::common::{HpcJobInfo, HpcJobStatus};
use super::hpc_interface::HpcInterface;

pub struct LocalInterface;

impl HpcInterface for LocalInterface {
    fn submit(&self, _filename: &Path) -> Result<(i32, String, String)> {
        Err(anyhow!("local runs do not submit to a queue"))
    }

    fn get_status(&self, _job_id: &str) -> Result<HpcJobInfo> {
        Ok(HpcJobInfo::none())
    }

    fn get_statuses(&self) -> Result<HashMap<String, HpcJobStatus>> {
        Ok(HashMap::new())
    }

    fn cancel_job(&self, _job_id: &str) -> Result<i32> {
        Ok(0)
    }

    fn list_active_nodes(&self, _job_id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn create_submission_script(
        &self,
        _name: &str,
        _command: &str,
        _filename: &Path,
        _output: &Path,
    ) -> Result<()> {
        Err(anyhow!("local runs do not render submission scripts"))
    }

    fn get_current_job_id(&self) -> Option<String> {
        None
    }

    fn get_num_cpus(&self) -> usize {
        let sys =
            System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
        sys.cpus().len().max(1)
    }
}
