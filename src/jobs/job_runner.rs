//! The per-node worker pool.
//!
//! One `JobRunner` executes one batch on one allocated node: it runs the
//! group's node setup command, keeps up to P job processes in flight, polls
//! the cancellation flag every tick, and always runs the node teardown
//! command on the way out. Results stream to the batch staging file as each
//! job finishes; nothing is held in memory.
//!
//! Termination has two flavors with different observable outcomes:
//!
//! - The cancellation flag (user request): children receive SIGTERM, then
//!   SIGKILL after the grace period, and every job records a `canceled`
//!   result row.
//! - The termination flag (walltime SIGTERM from the scheduler): children
//!   are stopped the same way but no rows are written. The jobs later
//!   surface as `missing` when a submitter notices the allocation is gone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};

use crate::common;
use crate::errors::{JadeError, Result};
use crate::hpc::{HpcInterface, create_hpc_interface};
use crate::jobs::async_cli_command::AsyncCliCommand;
use crate::jobs::cluster;
use crate::jobs::configuration::Configuration;
use crate::jobs::job_queue::JobQueue;
use crate::models::submission_group::SubmissionGroup;
use crate::result::{JobCompletionStatus, JobResult};

/// Seconds between cancellation-flag checks while jobs run.
const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// SIGTERM-to-SIGKILL grace period.
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone)]
pub struct RunnerResult {
    pub had_failures: bool,
    pub canceled: bool,
    /// The allocation was terminated from outside; results were not
    /// recorded for in-flight jobs.
    pub terminated: bool,
}

pub struct JobRunner {
    config: Configuration,
    output: PathBuf,
    batch_id: u64,
    group: SubmissionGroup,
    hpc: Box<dyn HpcInterface>,
    /// Set by a SIGTERM handler when the allocation is about to end.
    termination_flag: Arc<AtomicBool>,
}

impl JobRunner {
    pub fn new(config_file: &Path, output: &Path, batch_id: u64) -> Result<Self> {
        let config = Configuration::load(config_file)?;
        let group_name = config.jobs[0]
            .submission_group
            .clone()
            .expect("normalized configurations always assign a group");
        let group = config
            .get_group(&group_name)
            .ok_or_else(|| {
                JadeError::InvalidConfiguration(format!(
                    "batch config references unknown submission group {group_name}"
                ))
            })?
            .clone();
        let hpc = create_hpc_interface(&group.submitter_params.hpc_config)?;
        Ok(JobRunner {
            config,
            output: output.to_path_buf(),
            batch_id,
            group,
            hpc,
            termination_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns the flag a SIGTERM handler should set to request shutdown.
    pub fn get_termination_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.termination_flag)
    }

    /// Run every job in the batch config. Blocks until all are terminal or
    /// the run is canceled or terminated.
    pub fn run_jobs(&mut self, num_processes: Option<usize>) -> Result<RunnerResult> {
        let params = &self.group.submitter_params;
        let hpc_job_id = self.hpc.get_current_job_id().unwrap_or_default();
        let hostname = hostname::get()
            .map(|x| x.to_string_lossy().to_string())
            .unwrap_or_default();

        if !self.hpc.am_i_manager() {
            // Secondary nodes of a multi-node allocation only exist for the
            // user's own multi-node commands.
            info!(
                "Not the manager node; nothing to run hostname={} batch_id={}",
                hostname, self.batch_id
            );
            return Ok(RunnerResult::default());
        }

        let num_workers = num_processes
            .or(params.num_parallel_processes_per_node)
            .unwrap_or_else(|| self.hpc.get_num_cpus())
            .max(1);
        info!(
            "Run batch_id={} num_jobs={} num_workers={} hostname={} hpc_job_id={}",
            self.batch_id,
            self.config.num_jobs(),
            num_workers,
            hostname,
            hpc_job_id
        );

        let extra_env = self.build_job_environment(&hpc_job_id)?;

        if let Some(setup_command) = params.node_setup_command.clone() {
            let return_code = run_node_command(&setup_command)?;
            if return_code != 0 {
                error!(
                    "node_setup_command failed return_code={}; aborting batch {}",
                    return_code, self.batch_id
                );
                self.record_batch_failure(return_code, &hpc_job_id)?;
                self.run_teardown();
                return Ok(RunnerResult {
                    had_failures: true,
                    canceled: false,
                    terminated: false,
                });
            }
        }

        let mut queue = JobQueue::new(num_workers, WORKER_POLL_INTERVAL, extra_env);
        for job in &self.config.jobs {
            queue.submit(AsyncCliCommand::new(
                job.clone(),
                &self.output,
                self.batch_id,
                &hpc_job_id,
                &self.group.name,
            ));
        }

        let mut result = RunnerResult::default();
        loop {
            queue.process_queue()?;
            if queue.is_complete() {
                break;
            }
            if self.termination_flag.load(Ordering::SeqCst) {
                info!("Termination requested; stopping jobs without recording results");
                queue.terminate_all(CANCEL_GRACE_PERIOD);
                result.terminated = true;
                break;
            }
            if cluster::is_canceled(&self.output) {
                info!("Cancellation flag observed; canceling batch {}", self.batch_id);
                queue.cancel_all(CANCEL_GRACE_PERIOD)?;
                result.canceled = true;
                break;
            }
            std::thread::sleep(WORKER_POLL_INTERVAL);
        }
        result.had_failures = queue.had_failures();

        self.run_teardown();
        info!(
            "Batch complete batch_id={} had_failures={} canceled={} terminated={}",
            self.batch_id, result.had_failures, result.canceled, result.terminated
        );
        Ok(result)
    }

    fn build_job_environment(&self, hpc_job_id: &str) -> Result<Vec<(String, String)>> {
        let mut extra_env = Vec::new();
        if let Some(user_data) = &self.config.user_data {
            extra_env.push(("JADE_USER_DATA".to_string(), user_data.to_string()));
        }
        let num_nodes = self.group.submitter_params.hpc_config.hpc.num_nodes();
        if num_nodes > 1 && !hpc_job_id.is_empty() {
            match self.hpc.list_active_nodes(hpc_job_id) {
                Ok(nodes) => {
                    extra_env.push(("JADE_COMPUTE_NODE_NAMES".to_string(), nodes.join(" ")));
                    extra_env.push((
                        "JADE_OUTPUT_DIR".to_string(),
                        self.output.to_string_lossy().to_string(),
                    ));
                }
                Err(e) => warn!("Failed to list compute nodes for {}: {}", hpc_job_id, e),
            }
        }
        Ok(extra_env)
    }

    /// node_setup_command failed: every job in the batch emits a failure
    /// result so the run can finalize.
    fn record_batch_failure(&self, return_code: i32, hpc_job_id: &str) -> Result<()> {
        for job in &self.config.jobs {
            let result = JobResult::new(
                &job.name,
                job.job_id,
                return_code,
                JobCompletionStatus::Finished,
                0.0,
                self.batch_id,
                hpc_job_id,
                &self.output.to_string_lossy(),
            );
            crate::jobs::results_aggregator::ResultsAggregator::append(
                &self.output,
                self.batch_id,
                &result,
            )?;
        }
        Ok(())
    }

    /// Teardown always runs, even after cancellation; its failure is logged
    /// but never fatal.
    fn run_teardown(&self) {
        if let Some(teardown_command) = &self.group.submitter_params.node_teardown_command {
            match run_node_command(teardown_command) {
                Ok(0) => {}
                Ok(return_code) => {
                    error!("node_teardown_command failed return_code={}", return_code)
                }
                Err(e) => error!("node_teardown_command failed: {}", e),
            }
        }
    }
}

/// Run a setup/teardown command synchronously. The argv comes from
/// whitespace-splitting, same as job commands.
pub fn run_node_command(command: &str) -> Result<i32> {
    let mut argv = command.split_whitespace();
    let program = argv
        .next()
        .ok_or_else(|| JadeError::InvalidParameter("empty node command".to_string()))?;
    info!("Running node command [{}]", command);
    let output = std::process::Command::new(program)
        .args(argv)
        .output()
        .map_err(|e| JadeError::Execution(format!("failed to run [{command}]: {e}")))?;
    if !output.stderr.is_empty() {
        warn!(
            "Node command stderr: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpc::common::HpcType;
    use crate::jobs::results_aggregator::ResultsAggregator;
    use crate::models::hpc::{FakeHpcConfig, HpcConfig, HpcParams};
    use crate::models::jobs::Job;
    use crate::models::submission_group::SubmitterParams;

    fn write_batch_config(dir: &Path, jobs: Vec<Job>) -> PathBuf {
        let mut group = SubmissionGroup {
            name: "default".to_string(),
            submitter_params: SubmitterParams::new(HpcConfig {
                hpc_type: HpcType::Fake,
                job_prefix: "job".to_string(),
                hpc: HpcParams::Fake(FakeHpcConfig {
                    walltime: "04:00:00".to_string(),
                }),
            }),
        };
        group.submitter_params.num_parallel_processes_per_node = Some(2);
        let mut config = Configuration {
            jobs,
            submission_groups: vec![group],
            setup_command: None,
            teardown_command: None,
            user_data: None,
        };
        config.normalize();
        let path = common::batch_config_file(dir, 1);
        config.dump(&path).unwrap();
        path
    }

    #[test]
    fn test_run_batch_with_dependency() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let config_file = write_batch_config(
            dir.path(),
            vec![Job::new(1, "true"), Job::new(2, "true").with_blocked_by([1])],
        );
        let mut runner = JobRunner::new(&config_file, dir.path(), 1).unwrap();
        let result = runner.run_jobs(None).unwrap();
        assert!(!result.had_failures);
        assert!(!result.canceled);

        let results = ResultsAggregator::drain(dir.path()).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|x| x.is_successful()));
    }

    #[test]
    fn test_node_setup_failure_fails_batch() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let config_file = write_batch_config(dir.path(), vec![Job::new(1, "true")]);
        let mut config = Configuration::load(&config_file).unwrap();
        config.submission_groups[0]
            .submitter_params
            .node_setup_command = Some("false".to_string());
        config.dump(&config_file).unwrap();

        let mut runner = JobRunner::new(&config_file, dir.path(), 1).unwrap();
        let result = runner.run_jobs(None).unwrap();
        assert!(result.had_failures);
        let results = ResultsAggregator::drain(dir.path()).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_failed());
    }

    #[test]
    fn test_teardown_runs_after_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let marker = dir.path().join("teardown_ran");
        let config_file =
            write_batch_config(dir.path(), vec![Job::new(1, "sleep 30")]);
        let mut config = Configuration::load(&config_file).unwrap();
        config.submission_groups[0]
            .submitter_params
            .node_teardown_command = Some(format!("touch {}", marker.display()));
        config.dump(&config_file).unwrap();

        // Raise the cancellation flag before starting; the first poll tick
        // cancels the batch.
        cluster::Cluster::new(dir.path()).set_cancel_flag().unwrap();

        let mut runner = JobRunner::new(&config_file, dir.path(), 1).unwrap();
        let result = runner.run_jobs(None).unwrap();
        assert!(result.canceled);
        assert!(marker.exists());

        let results = ResultsAggregator::drain(dir.path()).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_canceled());
    }

    #[test]
    fn test_termination_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let config_file = write_batch_config(dir.path(), vec![Job::new(1, "sleep 30")]);
        let mut runner = JobRunner::new(&config_file, dir.path(), 1).unwrap();
        let flag = runner.get_termination_flag();
        flag.store(true, Ordering::SeqCst);
        let result = runner.run_jobs(None).unwrap();
        assert!(result.terminated);
        // No result rows: the job must later surface as missing.
        assert!(ResultsAggregator::drain(dir.path()).unwrap().is_empty());
    }
}
