//! Supervision of one job's child process.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Instant;

use log::{info, warn};

use crate::common;
use crate::errors::{JadeError, Result};
use crate::jobs::results_aggregator::ResultsAggregator;
use crate::models::jobs::{Job, JobId};
use crate::result::{JobCompletionStatus, JobResult};

/// A CLI command that runs asynchronously as a child process and records
/// its own result row on completion.
///
/// The command is never shell-interpreted; the argv comes from splitting on
/// whitespace. stdout and stderr stream to
/// `<output>/job-stdio/<name>.{o,e}`.
pub struct AsyncCliCommand {
    job: Job,
    output: PathBuf,
    batch_id: u64,
    hpc_job_id: String,
    group_name: String,
    /// Blockers remaining within this batch.
    blocked_by: BTreeSet<JobId>,
    child: Option<Child>,
    start_time: Option<Instant>,
    return_code: Option<i32>,
    is_complete: bool,
    cancel_requested: bool,
}

impl AsyncCliCommand {
    pub fn new(
        job: Job,
        output: &Path,
        batch_id: u64,
        hpc_job_id: &str,
        group_name: &str,
    ) -> Self {
        let blocked_by = job.blocked_by.clone();
        AsyncCliCommand {
            job,
            output: output.to_path_buf(),
            batch_id,
            hpc_job_id: hpc_job_id.to_string(),
            group_name: group_name.to_string(),
            blocked_by,
            child: None,
            start_time: None,
            return_code: None,
            is_complete: false,
            cancel_requested: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn job_id(&self) -> JobId {
        self.job.job_id
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked_by.is_empty()
    }

    pub fn blocked_by(&self) -> &BTreeSet<JobId> {
        &self.blocked_by
    }

    pub fn remove_blocking_job(&mut self, job_id: JobId) {
        self.blocked_by.remove(&job_id);
    }

    pub fn cancel_on_blocking_job_failure(&self) -> bool {
        self.job.cancel_on_blocking_job_failure
    }

    /// Start the child process.
    pub fn run(&mut self, extra_env: &[(String, String)]) -> Result<()> {
        assert!(self.child.is_none(), "job {} already started", self.job.name);
        let mut argv = self.job.command.split_whitespace();
        let program = argv.next().ok_or_else(|| {
            JadeError::InvalidParameter(format!("job {} has an empty command", self.job.name))
        })?;

        let stdout = File::create(common::job_stdout_file(&self.output, &self.job.name))?;
        let stderr = File::create(common::job_stderr_file(&self.output, &self.job.name))?;

        let mut command = Command::new(program);
        command
            .args(argv)
            .env("JADE_RUNTIME_OUTPUT", &self.output)
            .env("JADE_JOB_NAME", &self.job.name)
            .env("JADE_SUBMISSION_GROUP", &self.group_name)
            .stdout(stdout)
            .stderr(stderr);
        for (key, value) in extra_env {
            command.env(key, value);
        }

        self.start_time = Some(Instant::now());
        let child = command.spawn().map_err(|e| {
            JadeError::Execution(format!(
                "failed to start job {} command [{}]: {e}",
                self.job.name, self.job.command
            ))
        })?;
        info!(
            "Started job name={} pid={} hpc_job_id={}",
            self.job.name,
            child.id(),
            self.hpc_job_id
        );
        self.child = Some(child);
        Ok(())
    }

    /// Poll the child without blocking. On exit, record the result row.
    pub fn is_complete(&mut self) -> Result<bool> {
        if self.is_complete {
            return Ok(true);
        }
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return Ok(false),
        };
        match child.try_wait()? {
            Some(status) => {
                let return_code = exit_code(&status);
                let exec_time_s = self
                    .start_time
                    .map(|x| x.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
                let status = if self.cancel_requested {
                    JobCompletionStatus::Canceled
                } else {
                    JobCompletionStatus::Finished
                };
                self.complete(return_code, status, exec_time_s)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record a terminal result without the job ever running.
    pub fn cancel_unstarted(&mut self) -> Result<()> {
        assert!(self.child.is_none());
        self.cancel_requested = true;
        self.complete(1, JobCompletionStatus::Canceled, 0.0)
    }

    /// Ask the child to shut down.
    pub fn terminate(&mut self) {
        self.cancel_requested = true;
        if let Some(child) = &self.child {
            let pid = child.id() as libc::pid_t;
            info!("Job SIGTERM name={} pid={}", self.job.name, pid);
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }

    /// Kill the child immediately.
    pub fn kill(&mut self) {
        self.cancel_requested = true;
        if let Some(child) = self.child.as_mut() {
            info!("Job SIGKILL name={} pid={}", self.job.name, child.id());
            if let Err(e) = child.kill() {
                warn!("Failed to kill job {}: {}", self.job.name, e);
            }
        }
    }

    /// Wait for the child to exit, killing it at the deadline. No result
    /// row is recorded: this is the walltime-termination path, where the
    /// job must later surface as missing rather than canceled.
    pub fn wait_until(&mut self, deadline: Instant) {
        if let Some(child) = self.child.as_mut() {
            let mut killed = false;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Failed to poll job {}: {}", self.job.name, e);
                        break;
                    }
                }
                if !killed && Instant::now() >= deadline {
                    let _ = child.kill();
                    killed = true;
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        }
        self.is_complete = true;
    }

    fn complete(
        &mut self,
        return_code: i32,
        status: JobCompletionStatus,
        exec_time_s: f64,
    ) -> Result<()> {
        self.return_code = Some(return_code);
        self.is_complete = true;
        let result = JobResult::new(
            &self.job.name,
            self.job.job_id,
            return_code,
            status,
            exec_time_s,
            self.batch_id,
            &self.hpc_job_id,
            &self.output.to_string_lossy(),
        );
        ResultsAggregator::append(&self.output, self.batch_id, &result)?;
        info!(
            "Job completed name={} return_code={} status={:?} exec_time_s={:.1}",
            self.job.name, return_code, status, exec_time_s
        );
        Ok(())
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        // Signal-terminated processes report the negated signal number.
        None => status.signal().map(|x| -x).unwrap_or(-1),
    }
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn wait_complete(cmd: &mut AsyncCliCommand) {
        for _ in 0..100 {
            if cmd.is_complete().unwrap() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("job {} never completed", cmd.name());
    }

    fn read_results(output: &Path, batch_id: u64) -> Vec<JobResult> {
        let mut reader =
            csv::Reader::from_path(common::batch_results_file(output, batch_id)).unwrap();
        reader.deserialize().map(|x| x.unwrap()).collect()
    }

    #[test]
    fn test_successful_command() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let mut cmd = AsyncCliCommand::new(Job::new(1, "true"), dir.path(), 1, "42", "default");
        cmd.run(&[]).unwrap();
        wait_complete(&mut cmd);
        assert_eq!(cmd.return_code(), Some(0));

        let results = read_results(dir.path(), 1);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_successful());
        assert_eq!(results[0].hpc_job_id, "42");
    }

    #[test]
    fn test_failing_command() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let mut cmd = AsyncCliCommand::new(Job::new(1, "false"), dir.path(), 1, "42", "default");
        cmd.run(&[]).unwrap();
        wait_complete(&mut cmd);
        assert_eq!(cmd.return_code(), Some(1));
        assert!(read_results(dir.path(), 1)[0].is_failed());
    }

    #[test]
    fn test_stdio_capture_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let mut job = Job::new(1, "printenv JADE_JOB_NAME");
        job.name = "envjob".to_string();
        let mut cmd = AsyncCliCommand::new(job, dir.path(), 1, "", "groupA");
        cmd.run(&[]).unwrap();
        wait_complete(&mut cmd);
        let stdout =
            std::fs::read_to_string(common::job_stdout_file(dir.path(), "envjob")).unwrap();
        assert_eq!(stdout.trim(), "envjob");
    }

    #[test]
    fn test_terminate_records_canceled() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let mut cmd = AsyncCliCommand::new(Job::new(1, "sleep 60"), dir.path(), 1, "", "default");
        cmd.run(&[]).unwrap();
        cmd.terminate();
        wait_complete(&mut cmd);
        let results = read_results(dir.path(), 1);
        assert!(results[0].is_canceled());
        assert_eq!(results[0].return_code, -libc::SIGTERM);
    }

    #[test]
    fn test_cancel_unstarted() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let mut cmd = AsyncCliCommand::new(Job::new(1, "true"), dir.path(), 1, "", "default");
        cmd.cancel_unstarted().unwrap();
        assert!(cmd.is_complete().unwrap());
        let results = read_results(dir.path(), 1);
        assert!(results[0].is_canceled());
        assert_eq!(results[0].exec_time_s, 0.0);
    }
}
