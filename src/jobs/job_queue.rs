//! A bounded queue of job child processes for one batch.
//!
//! Keeps up to `queue_depth` children outstanding, polls them without
//! blocking, and starts queued jobs as their in-batch blockers reach
//! terminal states. A blocker that fails still unblocks its dependents
//! unless the dependent opted into `cancel_on_blocking_job_failure`.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::errors::Result;
use crate::jobs::async_cli_command::AsyncCliCommand;
use crate::models::jobs::JobId;

const CANCEL_REAP_INTERVAL: Duration = Duration::from_millis(250);

pub struct JobQueue {
    queue_depth: usize,
    poll_interval: Duration,
    outstanding: Vec<AsyncCliCommand>,
    queued: Vec<AsyncCliCommand>,
    failed_jobs: BTreeSet<JobId>,
    extra_env: Vec<(String, String)>,
    num_jobs: usize,
    num_completed: usize,
    had_failures: bool,
}

impl JobQueue {
    pub fn new(queue_depth: usize, poll_interval: Duration, extra_env: Vec<(String, String)>) -> Self {
        assert!(queue_depth >= 1);
        JobQueue {
            queue_depth,
            poll_interval,
            outstanding: Vec::new(),
            queued: Vec::new(),
            failed_jobs: BTreeSet::new(),
            extra_env,
            num_jobs: 0,
            num_completed: 0,
            had_failures: false,
        }
    }

    pub fn submit(&mut self, command: AsyncCliCommand) {
        self.num_jobs += 1;
        self.queued.push(command);
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty() && self.queued.is_empty()
    }

    pub fn had_failures(&self) -> bool {
        self.had_failures
    }

    /// Process completions and start new jobs if slots are free.
    pub fn process_queue(&mut self) -> Result<()> {
        let mut newly_completed: Vec<(JobId, bool)> = Vec::new();
        let mut index = 0;
        while index < self.outstanding.len() {
            if self.outstanding[index].is_complete()? {
                let command = self.outstanding.swap_remove(index);
                let failed = command.return_code().unwrap_or(1) != 0;
                newly_completed.push((command.job_id(), failed));
                self.num_completed += 1;
            } else {
                index += 1;
            }
        }

        // Unblock dependents; cancel flagged dependents of failures. A
        // cancellation counts as a failure itself, so chains cancel
        // transitively.
        while let Some((job_id, failed)) = newly_completed.pop() {
            if failed {
                self.failed_jobs.insert(job_id);
                self.had_failures = true;
            }
            let mut queued_index = 0;
            while queued_index < self.queued.len() {
                let blocked = self.queued[queued_index].blocked_by().contains(&job_id);
                if blocked && failed && self.queued[queued_index].cancel_on_blocking_job_failure() {
                    let mut canceled = self.queued.remove(queued_index);
                    info!(
                        "Canceling job {} because blocking job {} failed",
                        canceled.name(),
                        job_id
                    );
                    canceled.cancel_unstarted()?;
                    self.num_completed += 1;
                    newly_completed.push((canceled.job_id(), true));
                    continue;
                }
                if blocked {
                    self.queued[queued_index].remove_blocking_job(job_id);
                }
                queued_index += 1;
            }
        }

        // Start ready jobs in submission order.
        let mut queued_index = 0;
        while queued_index < self.queued.len() && self.outstanding.len() < self.queue_depth {
            if self.queued[queued_index].is_blocked() {
                queued_index += 1;
                continue;
            }
            let mut command = self.queued.remove(queued_index);
            command.run(&self.extra_env)?;
            self.outstanding.push(command);
        }
        Ok(())
    }

    /// Block until every job is terminal or `cancel_check` fires. Returns
    /// true when the batch was canceled.
    pub fn run_until_complete(
        &mut self,
        cancel_check: impl Fn() -> bool,
        grace_period: Duration,
    ) -> Result<bool> {
        loop {
            self.process_queue()?;
            if self.is_complete() {
                debug!(
                    "Job queue complete num_jobs={} num_completed={}",
                    self.num_jobs, self.num_completed
                );
                assert_eq!(self.num_jobs, self.num_completed);
                return Ok(false);
            }
            if cancel_check() {
                info!("Cancellation detected; terminating {} running jobs", self.outstanding.len());
                self.cancel_all(grace_period)?;
                return Ok(true);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Stop every child without recording results. Used when the enclosing
    /// allocation is ending (walltime SIGTERM): the jobs must later surface
    /// as missing, not canceled.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        self.queued.clear();
        for command in self.outstanding.iter_mut() {
            command.terminate();
        }
        let deadline = Instant::now() + grace_period;
        for mut command in self.outstanding.drain(..) {
            command.wait_until(deadline);
        }
    }

    /// Cancel everything: unstarted jobs record canceled rows without
    /// running; running jobs get SIGTERM, then SIGKILL after the grace
    /// period.
    pub fn cancel_all(&mut self, grace_period: Duration) -> Result<()> {
        for mut command in self.queued.drain(..) {
            command.cancel_unstarted()?;
            self.num_completed += 1;
        }
        for command in self.outstanding.iter_mut() {
            command.terminate();
        }
        let deadline = Instant::now() + grace_period;
        let mut killed = false;
        while !self.outstanding.is_empty() {
            let mut index = 0;
            while index < self.outstanding.len() {
                if self.outstanding[index].is_complete()? {
                    self.outstanding.swap_remove(index);
                    self.num_completed += 1;
                } else {
                    index += 1;
                }
            }
            if self.outstanding.is_empty() {
                break;
            }
            if !killed && Instant::now() >= deadline {
                for command in self.outstanding.iter_mut() {
                    command.kill();
                }
                killed = true;
            }
            std::thread::sleep(CANCEL_REAP_INTERVAL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common;
    use crate::jobs::results_aggregator::ResultsAggregator;
    use crate::models::jobs::Job;
    use crate::result::JobResult;
    use std::path::Path;

    fn make_queue(depth: usize) -> JobQueue {
        JobQueue::new(depth, Duration::from_millis(50), Vec::new())
    }

    fn command(job: Job, output: &Path) -> AsyncCliCommand {
        AsyncCliCommand::new(job, output, 1, "", "default")
    }

    fn drained(output: &Path) -> Vec<JobResult> {
        ResultsAggregator::drain(output).unwrap()
    }

    #[test]
    fn test_blocked_jobs_wait_for_blockers() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let mut queue = make_queue(4);
        queue.submit(command(Job::new(1, "sleep 0.2"), dir.path()));
        queue.submit(command(Job::new(2, "true").with_blocked_by([1]), dir.path()));
        let canceled = queue
            .run_until_complete(|| false, Duration::from_secs(5))
            .unwrap();
        assert!(!canceled);
        assert!(!queue.had_failures());

        let results = drained(dir.path());
        assert_eq!(results.len(), 2);
        let first = results.iter().find(|x| x.job_id == 1).unwrap();
        let second = results.iter().find(|x| x.job_id == 2).unwrap();
        assert!(first.completion_time <= second.completion_time);
    }

    #[test]
    fn test_failed_blocker_still_unblocks_by_default() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let mut queue = make_queue(2);
        queue.submit(command(Job::new(1, "false"), dir.path()));
        queue.submit(command(Job::new(2, "true").with_blocked_by([1]), dir.path()));
        queue
            .run_until_complete(|| false, Duration::from_secs(5))
            .unwrap();
        assert!(queue.had_failures());

        let results = drained(dir.path());
        let dependent = results.iter().find(|x| x.job_id == 2).unwrap();
        assert!(dependent.is_successful());
    }

    #[test]
    fn test_cancel_on_blocking_job_failure_cascades() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let mut queue = make_queue(2);
        let mut flagged = Job::new(2, "true").with_blocked_by([1]);
        flagged.cancel_on_blocking_job_failure = true;
        let mut downstream = Job::new(3, "true").with_blocked_by([2]);
        downstream.cancel_on_blocking_job_failure = true;
        queue.submit(command(Job::new(1, "false"), dir.path()));
        queue.submit(command(flagged, dir.path()));
        queue.submit(command(downstream, dir.path()));
        queue
            .run_until_complete(|| false, Duration::from_secs(5))
            .unwrap();

        let results = drained(dir.path());
        assert_eq!(results.len(), 3);
        assert!(results.iter().find(|x| x.job_id == 2).unwrap().is_canceled());
        assert!(results.iter().find(|x| x.job_id == 3).unwrap().is_canceled());
    }

    #[test]
    fn test_queue_depth_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let mut queue = make_queue(1);
        for job_id in 1..=3 {
            queue.submit(command(Job::new(job_id, "true"), dir.path()));
        }
        queue.process_queue().unwrap();
        assert_eq!(queue.outstanding.len(), 1);
        queue
            .run_until_complete(|| false, Duration::from_secs(5))
            .unwrap();
        assert_eq!(drained(dir.path()).len(), 3);
    }

    #[test]
    fn test_cancel_all_terminates_and_records() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let mut queue = make_queue(1);
        queue.submit(command(Job::new(1, "sleep 60"), dir.path()));
        queue.submit(command(Job::new(2, "true"), dir.path()));
        queue.process_queue().unwrap();

        let start = Instant::now();
        let canceled = queue
            .run_until_complete(|| true, Duration::from_secs(10))
            .unwrap();
        assert!(canceled);
        // SIGTERM is enough for sleep; well under the grace period.
        assert!(start.elapsed() < Duration::from_secs(10));

        let results = drained(dir.path());
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|x| x.is_canceled()));
    }
}
