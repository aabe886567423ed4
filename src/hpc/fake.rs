//! Fake queueing system: "allocations" are local child processes.
//!
//! Submitting a script spawns it immediately with bash. This exercises the
//! whole submission path, including the distributed submitter protocol, on
//! a machine with no scheduler.

use std::collections::HashMap;
use std::env;
use std::fs::{self, File};
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use sysinfo::{CpuRefreshKind, RefreshKind, System};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::common::{HpcJobInfo, HpcJobStatus};
use super::hpc_interface::HpcInterface;

/// Environment variable through which fake allocations learn their job ID.
pub const FAKE_JOB_ID_ENV: &str = "JADE_HPC_JOB_ID";

struct FakeJob {
    child: std::process::Child,
    complete: bool,
}

#[derive(Default)]
pub struct FakeInterface {
    children: Mutex<HashMap<String, FakeJob>>,
    next_id: AtomicU64,
}

impl FakeInterface {
    pub fn new() -> Self {
        FakeInterface {
            children: Mutex::new(HashMap::new()),
            // Offset by the pid so that IDs from successive submitter
            // processes sharing one output directory do not collide.
            next_id: AtomicU64::new(std::process::id() as u64 * 1000 + 1),
        }
    }

    fn poll(&self) -> HashMap<String, HpcJobStatus> {
        let mut children = self.children.lock().expect("fake hpc lock poisoned");
        let mut statuses = HashMap::new();
        for (job_id, job) in children.iter_mut() {
            if !job.complete && job.child.try_wait().ok().flatten().is_some() {
                job.complete = true;
            }
            let status = if job.complete {
                HpcJobStatus::Complete
            } else {
                HpcJobStatus::Running
            };
            statuses.insert(job_id.clone(), status);
        }
        statuses
    }
}

impl HpcInterface for FakeInterface {
    fn submit(&self, filename: &Path) -> Result<(i32, String, String)> {
        let job_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let stdout = File::create(filename.with_extension("o"))?;
        let stderr = File::create(filename.with_extension("e"))?;
        let child = Command::new("bash")
            .arg(filename)
            .env(FAKE_JOB_ID_ENV, &job_id)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .with_context(|| format!("Failed to run submission script {:?}", filename))?;
        info!(
            "Started fake allocation job_id={} pid={} script={:?}",
            job_id,
            child.id(),
            filename
        );
        self.children.lock().expect("fake hpc lock poisoned").insert(
            job_id.clone(),
            FakeJob {
                child,
                complete: false,
            },
        );
        Ok((0, job_id, String::new()))
    }

    fn get_status(&self, job_id: &str) -> Result<HpcJobInfo> {
        match self.poll().get(job_id) {
            Some(status) => Ok(HpcJobInfo::new(
                job_id.to_string(),
                String::new(),
                *status,
            )),
            None => Ok(HpcJobInfo::none()),
        }
    }

    fn get_statuses(&self) -> Result<HashMap<String, HpcJobStatus>> {
        Ok(self.poll())
    }

    fn cancel_job(&self, job_id: &str) -> Result<i32> {
        let mut children = self.children.lock().expect("fake hpc lock poisoned");
        match children.get_mut(job_id) {
            Some(job) => {
                if let Err(e) = job.child.kill() {
                    warn!("Failed to kill fake allocation {}: {}", job_id, e);
                }
                job.complete = true;
                Ok(0)
            }
            None => {
                debug!("Fake allocation {} is not tracked by this process", job_id);
                Ok(0)
            }
        }
    }

    fn list_active_nodes(&self, _job_id: &str) -> Result<Vec<String>> {
        let name = hostname::get()
            .map_err(|e| anyhow!("Failed to get hostname: {e}"))?
            .to_string_lossy()
            .to_string();
        Ok(vec![name])
    }

    fn create_submission_script(
        &self,
        _name: &str,
        command: &str,
        filename: &Path,
        _output: &Path,
    ) -> Result<()> {
        let script = format!("#!/bin/bash\n{command}\n");
        fs::write(filename, script)
            .with_context(|| format!("Failed to write submission script to {:?}", filename))?;
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(filename)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(filename, perms)?;
        }
        Ok(())
    }

    fn get_current_job_id(&self) -> Option<String> {
        env::var(FAKE_JOB_ID_ENV).ok()
    }

    fn get_num_cpus(&self) -> usize {
        let sys =
            System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
        sys.cpus().len().max(1)
    }
}
