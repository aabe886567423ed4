//! Turns the ready portion of the job graph into node-sized batches.
//!
//! Submission groups are processed in name order; within a group, jobs keep
//! their configuration order. A blocker that completed with a non-zero
//! return code still satisfies its dependents unless they set
//! `cancel_on_blocking_job_failure` — that tolerant default is deliberate
//! and load-bearing.

use std::collections::BTreeSet;

use log::{debug, info};

use crate::errors::{JadeError, Result};
use crate::jobs::configuration::Configuration;
use crate::models::cluster_config::ClusterState;
use crate::models::jobs::{Job, JobId};
use crate::models::submission_group::{SubmissionGroup, make_submission_group_lookup};
use crate::result::{JobCompletionStatus, JobResult};

/// Safety margin subtracted from the walltime when packing batches by
/// estimated runtime.
const TIME_BATCH_SAFETY_MARGIN_MINUTES: u64 = 5;

/// One batch ready to hand to the HPC submitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSpec {
    pub batch_id: u64,
    pub job_ids: Vec<JobId>,
    pub submission_group: String,
}

#[derive(Debug, Default)]
pub struct BatcherOutcome {
    pub batches: Vec<BatchSpec>,
    /// Synthetic results for jobs canceled because a blocking job failed.
    /// Already folded into the cluster state by the batcher.
    pub canceled: Vec<JobResult>,
}

pub struct Batcher;

impl Batcher {
    /// Compute the batches that can be submitted against the given state.
    ///
    /// Mutates `state`: allocates batch IDs and records synthetic canceled
    /// results. The caller decides which batches actually get submitted and
    /// persists the state.
    pub fn compute(config: &Configuration, state: &mut ClusterState) -> Result<BatcherOutcome> {
        let mut outcome = BatcherOutcome::default();
        Self::cancel_blocked_chains(config, state, &mut outcome.canceled);

        let groups = make_submission_group_lookup(&config.submission_groups);
        let max_nodes = groups
            .values()
            .next()
            .and_then(|x| x.submitter_params.max_nodes)
            .unwrap_or(usize::MAX);
        let mut capacity = max_nodes.saturating_sub(state.active_batches.len());

        let completed = state.completed_job_ids();
        let mut assigned: BTreeSet<JobId> = BTreeSet::new();

        for group in groups.values() {
            if capacity == 0 {
                break;
            }
            let batches = Self::compute_group_batches(
                config,
                state,
                group,
                &completed,
                &mut assigned,
                &mut capacity,
            )?;
            outcome.batches.extend(batches);
        }

        if !outcome.batches.is_empty() {
            info!(
                "Computed {} batches, {} synthetic cancellations, capacity_left={}",
                outcome.batches.len(),
                outcome.canceled.len(),
                capacity
            );
        }
        Ok(outcome)
    }

    /// Cancel every not-yet-submitted job that opted into
    /// `cancel_on_blocking_job_failure` and has a failed blocker. Canceled
    /// jobs count as failures themselves, so chains cancel transitively.
    fn cancel_blocked_chains(
        config: &Configuration,
        state: &mut ClusterState,
        canceled: &mut Vec<JobResult>,
    ) {
        loop {
            let failed = state.failed_job_ids();
            let mut changed = false;
            for job in &config.jobs {
                if state.submitted_jobs.contains(&job.job_id) {
                    continue;
                }
                if job.cancel_on_blocking_job_failure
                    && !job.blocked_by.is_disjoint(&failed)
                {
                    info!(
                        "Canceling job {} because one of its blocking jobs failed",
                        job.name
                    );
                    let result = JobResult::new(
                        &job.name,
                        job.job_id,
                        1,
                        JobCompletionStatus::Canceled,
                        0.0,
                        0,
                        "",
                        "",
                    );
                    state.submitted_jobs.insert(job.job_id);
                    state.completed_results.push(result.clone());
                    canceled.push(result);
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
    }

    fn compute_group_batches(
        config: &Configuration,
        state: &mut ClusterState,
        group: &SubmissionGroup,
        completed: &BTreeSet<JobId>,
        assigned: &mut BTreeSet<JobId>,
        capacity: &mut usize,
    ) -> Result<Vec<BatchSpec>> {
        let params = &group.submitter_params;
        let mut batches = Vec::new();

        loop {
            if *capacity == 0 {
                break;
            }
            let ready: Vec<&Job> = config
                .jobs
                .iter()
                .filter(|job| {
                    job.submission_group.as_deref() == Some(group.name.as_str())
                        && !state.submitted_jobs.contains(&job.job_id)
                        && !assigned.contains(&job.job_id)
                        && job.blocked_by.iter().all(|x| completed.contains(x))
                })
                .collect();
            if ready.is_empty() {
                break;
            }

            let mut job_ids: Vec<JobId> = if params.time_based_batching {
                Self::next_time_based_batch(group, &ready)?
            } else {
                ready
                    .iter()
                    .take(params.per_node_batch_size)
                    .map(|x| x.job_id)
                    .collect()
            };
            if job_ids.is_empty() {
                break;
            }

            if params.try_add_blocked_jobs {
                Self::add_blocked_jobs(config, state, group, completed, assigned, &mut job_ids);
            }

            for job_id in &job_ids {
                assigned.insert(*job_id);
            }
            let batch_id = state.allocate_batch_id();
            debug!(
                "Formed batch_id={} group={} num_jobs={}",
                batch_id,
                group.name,
                job_ids.len()
            );
            batches.push(BatchSpec {
                batch_id,
                job_ids,
                submission_group: group.name.clone(),
            });
            *capacity -= 1;
        }
        Ok(batches)
    }

    /// Order-preserving greedy packing against the node's time budget:
    /// `(walltime − margin) × num_parallel_processes_per_node`, since the
    /// node works the batch P jobs at a time. A job without an estimate
    /// counts as the full walltime.
    fn next_time_based_batch(group: &SubmissionGroup, ready: &[&Job]) -> Result<Vec<JobId>> {
        let walltime_minutes = group
            .submitter_params
            .hpc_config
            .walltime_minutes()
            .ok_or_else(|| {
                JadeError::InvalidConfiguration(format!(
                    "group {} uses time_based_batching without a walltime",
                    group.name
                ))
            })?;
        let limit = time_batch_limit_minutes(group, walltime_minutes);

        let mut job_ids = Vec::new();
        let mut batch_minutes = 0u64;
        for job in ready {
            let estimate = job.estimated_run_minutes.unwrap_or(walltime_minutes);
            if !job_ids.is_empty() && batch_minutes.saturating_add(estimate) > limit {
                break;
            }
            job_ids.push(job.job_id);
            batch_minutes = batch_minutes.saturating_add(estimate);
        }
        Ok(job_ids)
    }

    /// Pull blocked jobs into an under-full batch when every one of their
    /// blockers is either in the batch or already complete. The node runner
    /// orders them after their blockers within the batch. Repeats until no
    /// more jobs qualify, so chains listed in any order are picked up.
    fn add_blocked_jobs(
        config: &Configuration,
        state: &ClusterState,
        group: &SubmissionGroup,
        completed: &BTreeSet<JobId>,
        assigned: &BTreeSet<JobId>,
        job_ids: &mut Vec<JobId>,
    ) {
        let params = &group.submitter_params;
        let walltime_minutes = params.hpc_config.walltime_minutes().unwrap_or(u64::MAX);
        let time_limit = time_batch_limit_minutes(group, walltime_minutes);
        // Only meaningful for time-based groups; size-based groups may have
        // no walltime at all.
        let mut batch_minutes: u64 = if params.time_based_batching {
            job_ids
                .iter()
                .filter_map(|id| config.get_job(*id))
                .map(|job| job.estimated_run_minutes.unwrap_or(walltime_minutes))
                .fold(0u64, |acc, x| acc.saturating_add(x))
        } else {
            0
        };

        let mut batch_set: BTreeSet<JobId> = job_ids.iter().copied().collect();
        loop {
            if !params.time_based_batching && job_ids.len() >= params.per_node_batch_size {
                return;
            }
            let mut added = false;
            for job in &config.jobs {
                if !params.time_based_batching && job_ids.len() >= params.per_node_batch_size {
                    return;
                }
                if job.submission_group.as_deref() != Some(group.name.as_str())
                    || batch_set.contains(&job.job_id)
                    || assigned.contains(&job.job_id)
                    || state.submitted_jobs.contains(&job.job_id)
                    || job.blocked_by.is_empty()
                {
                    continue;
                }
                let satisfied = job
                    .blocked_by
                    .iter()
                    .all(|x| batch_set.contains(x) || completed.contains(x));
                if !satisfied {
                    continue;
                }
                if params.time_based_batching {
                    let estimate = job.estimated_run_minutes.unwrap_or(walltime_minutes);
                    if batch_minutes.saturating_add(estimate) > time_limit {
                        continue;
                    }
                    batch_minutes = batch_minutes.saturating_add(estimate);
                }
                batch_set.insert(job.job_id);
                job_ids.push(job.job_id);
                added = true;
            }
            if !added {
                return;
            }
        }
    }
}

/// The per-batch time budget: the usable walltime multiplied by the number
/// of workers that will drain the batch.
fn time_batch_limit_minutes(group: &SubmissionGroup, walltime_minutes: u64) -> u64 {
    let num_processes = group
        .submitter_params
        .num_parallel_processes_per_node
        .unwrap_or(1) as u64;
    walltime_minutes
        .saturating_sub(TIME_BATCH_SAFETY_MARGIN_MINUTES)
        .saturating_mul(num_processes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpc::common::HpcType;
    use crate::models::hpc::{FakeHpcConfig, HpcConfig, HpcParams};
    use crate::models::submission_group::SubmitterParams;

    fn fake_group(name: &str) -> SubmissionGroup {
        SubmissionGroup {
            name: name.to_string(),
            submitter_params: SubmitterParams::new(HpcConfig {
                hpc_type: HpcType::Fake,
                job_prefix: "job".to_string(),
                hpc: HpcParams::Fake(FakeHpcConfig {
                    walltime: "04:00:00".to_string(),
                }),
            }),
        }
    }

    fn make_config(jobs: Vec<Job>, groups: Vec<SubmissionGroup>) -> Configuration {
        let mut config = Configuration {
            jobs,
            submission_groups: groups,
            setup_command: None,
            teardown_command: None,
            user_data: None,
        };
        config.normalize();
        config.validate().unwrap();
        config
    }

    fn finished(job_id: JobId, return_code: i32) -> JobResult {
        JobResult::new(
            &job_id.to_string(),
            job_id,
            return_code,
            JobCompletionStatus::Finished,
            0.0,
            1,
            "",
            "",
        )
    }

    #[test]
    fn test_size_based_batching() {
        let mut group = fake_group("default");
        group.submitter_params.per_node_batch_size = 2;
        group.submitter_params.try_add_blocked_jobs = false;
        let config = make_config(
            (1..=5).map(|x| Job::new(x, "true")).collect(),
            vec![group],
        );
        let mut state = ClusterState::new(config.config_id(), 5);
        let outcome = Batcher::compute(&config, &mut state).unwrap();
        assert_eq!(outcome.batches.len(), 3);
        assert_eq!(outcome.batches[0].job_ids, vec![1, 2]);
        assert_eq!(outcome.batches[1].job_ids, vec![3, 4]);
        assert_eq!(outcome.batches[2].job_ids, vec![5]);
        assert_eq!(outcome.batches[2].batch_id, 3);
    }

    #[test]
    fn test_max_nodes_limits_batches() {
        let mut group = fake_group("default");
        group.submitter_params.per_node_batch_size = 1;
        group.submitter_params.max_nodes = Some(2);
        let config = make_config(
            (1..=5).map(|x| Job::new(x, "true")).collect(),
            vec![group],
        );
        let mut state = ClusterState::new(config.config_id(), 5);
        let outcome = Batcher::compute(&config, &mut state).unwrap();
        assert_eq!(outcome.batches.len(), 2);

        // With one batch already active, only one slot remains.
        let mut state = ClusterState::new(config.config_id(), 5);
        state.active_batches.insert(
            1,
            crate::models::cluster_config::BatchState {
                hpc_job_id: "1".to_string(),
                node_names: Vec::new(),
                submission_group: "default".to_string(),
                job_ids: vec![99],
                state: crate::models::cluster_config::BatchRunState::Submitted,
            },
        );
        let outcome = Batcher::compute(&config, &mut state).unwrap();
        assert_eq!(outcome.batches.len(), 1);
    }

    #[test]
    fn test_blocked_jobs_are_not_candidates() {
        let mut group = fake_group("default");
        group.submitter_params.per_node_batch_size = 10;
        group.submitter_params.try_add_blocked_jobs = false;
        let config = make_config(
            vec![Job::new(1, "true"), Job::new(2, "true").with_blocked_by([1])],
            vec![group],
        );
        let mut state = ClusterState::new(config.config_id(), 2);
        let outcome = Batcher::compute(&config, &mut state).unwrap();
        assert_eq!(outcome.batches.len(), 1);
        assert_eq!(outcome.batches[0].job_ids, vec![1]);
    }

    #[test]
    fn test_try_add_blocked_jobs_pulls_in_chain() {
        let mut group = fake_group("default");
        group.submitter_params.per_node_batch_size = 10;
        let config = make_config(
            vec![
                // Blocked jobs listed before their blocker.
                Job::new(1, "true").with_blocked_by([3]),
                Job::new(2, "true").with_blocked_by([1]),
                Job::new(3, "true"),
            ],
            vec![group],
        );
        let mut state = ClusterState::new(config.config_id(), 3);
        let outcome = Batcher::compute(&config, &mut state).unwrap();
        assert_eq!(outcome.batches.len(), 1);
        assert_eq!(outcome.batches[0].job_ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_failed_blocker_satisfies_by_default() {
        let mut group = fake_group("default");
        group.submitter_params.per_node_batch_size = 10;
        let config = make_config(
            vec![Job::new(1, "true"), Job::new(2, "true").with_blocked_by([1])],
            vec![group],
        );
        let mut state = ClusterState::new(config.config_id(), 2);
        state.submitted_jobs.insert(1);
        state.completed_results.push(finished(1, 7));
        let outcome = Batcher::compute(&config, &mut state).unwrap();
        assert_eq!(outcome.batches.len(), 1);
        assert_eq!(outcome.batches[0].job_ids, vec![2]);
        assert!(outcome.canceled.is_empty());
    }

    #[test]
    fn test_cancel_cascade_is_transitive() {
        let mut group = fake_group("default");
        group.submitter_params.per_node_batch_size = 10;
        let mut flagged = Job::new(2, "true").with_blocked_by([1]);
        flagged.cancel_on_blocking_job_failure = true;
        let mut downstream = Job::new(3, "true").with_blocked_by([2]);
        downstream.cancel_on_blocking_job_failure = true;
        let config = make_config(
            vec![Job::new(1, "true"), flagged, downstream],
            vec![group],
        );
        let mut state = ClusterState::new(config.config_id(), 3);
        state.submitted_jobs.insert(1);
        state.completed_results.push(finished(1, 7));

        let outcome = Batcher::compute(&config, &mut state).unwrap();
        assert!(outcome.batches.is_empty());
        assert_eq!(outcome.canceled.len(), 2);
        assert!(outcome.canceled.iter().all(|x| x.is_canceled()));
        assert!(state.all_jobs_complete());
    }

    /// The time budget scales with the worker count: the node works the
    /// batch P jobs at a time, so a batch may carry P× the walltime in
    /// serial estimates (minus the safety margin).
    #[test]
    fn test_time_based_batching() {
        // Walltime 240 min; serial budget 235 with one worker, 470 with two.
        let cases: [(usize, Vec<Vec<JobId>>); 2] = [
            (1, vec![vec![1, 2, 3], vec![4], vec![5]]),
            (2, vec![vec![1, 2, 3, 4], vec![5]]),
        ];
        for (num_processes, expected) in cases {
            let mut group = fake_group("default");
            group.submitter_params.time_based_batching = true;
            group.submitter_params.num_parallel_processes_per_node = Some(num_processes);
            group.submitter_params.try_add_blocked_jobs = false;
            let estimates: [u64; 5] = [10, 10, 30, 200, 240];
            let jobs = estimates
                .iter()
                .enumerate()
                .map(|(index, est)| {
                    let mut job = Job::new(index as JobId + 1, "true");
                    job.estimated_run_minutes = Some(*est);
                    job
                })
                .collect();
            let config = make_config(jobs, vec![group]);
            let mut state = ClusterState::new(config.config_id(), 5);
            let outcome = Batcher::compute(&config, &mut state).unwrap();
            let batches: Vec<Vec<JobId>> =
                outcome.batches.iter().map(|x| x.job_ids.clone()).collect();
            assert_eq!(batches, expected, "num_processes={num_processes}");
        }
    }

    #[test]
    fn test_time_based_unestimated_job_consumes_a_batch() {
        let mut group = fake_group("default");
        group.submitter_params.time_based_batching = true;
        group.submitter_params.try_add_blocked_jobs = false;
        let mut short = Job::new(2, "true");
        short.estimated_run_minutes = Some(10);
        let config = make_config(vec![Job::new(1, "true"), short], vec![group]);
        let mut state = ClusterState::new(config.config_id(), 2);
        let outcome = Batcher::compute(&config, &mut state).unwrap();
        let batches: Vec<Vec<JobId>> =
            outcome.batches.iter().map(|x| x.job_ids.clone()).collect();
        assert_eq!(batches, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_groups_processed_in_name_order() {
        let mut group_b = fake_group("beta");
        group_b.submitter_params.per_node_batch_size = 10;
        let mut group_a = fake_group("alpha");
        group_a.submitter_params.per_node_batch_size = 10;
        let mut job1 = Job::new(1, "true");
        job1.submission_group = Some("beta".to_string());
        let mut job2 = Job::new(2, "true");
        job2.submission_group = Some("alpha".to_string());
        let config = make_config(vec![job1, job2], vec![group_b, group_a]);
        let mut state = ClusterState::new(config.config_id(), 2);
        let outcome = Batcher::compute(&config, &mut state).unwrap();
        assert_eq!(outcome.batches[0].submission_group, "alpha");
        assert_eq!(outcome.batches[1].submission_group, "beta");
    }

    /// Simulate whole runs over pseudo-random DAGs: no job is ever batched
    /// before its blockers are terminal (or co-batched), every job reaches
    /// exactly one terminal state, and the submitted set only grows.
    #[test]
    fn test_random_dags_maintain_invariants() {
        let mut seed: u64 = 0x9e3779b97f4a7c15;
        let mut next_random = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..20 {
            let num_jobs = (next_random() % 30 + 2) as JobId;
            let mut jobs = Vec::new();
            for job_id in 1..=num_jobs {
                let mut job = Job::new(job_id, "true");
                // Edges only point backwards, so the graph is acyclic.
                for blocker in 1..job_id {
                    if next_random() % 4 == 0 {
                        job.blocked_by.insert(blocker);
                    }
                }
                if next_random() % 8 == 0 {
                    job.cancel_on_blocking_job_failure = true;
                }
                jobs.push(job);
            }
            let mut group = fake_group("default");
            group.submitter_params.per_node_batch_size = (next_random() % 5 + 1) as usize;
            group.submitter_params.try_add_blocked_jobs = next_random() % 2 == 0;
            let config = make_config(jobs, vec![group]);

            let mut state = ClusterState::new(config.config_id(), num_jobs as usize);
            let mut previous_submitted = BTreeSet::new();
            loop {
                let outcome = Batcher::compute(&config, &mut state).unwrap();
                if outcome.batches.is_empty() {
                    break;
                }
                let completed = state.completed_job_ids();
                for batch in &outcome.batches {
                    let batch_set: BTreeSet<JobId> = batch.job_ids.iter().copied().collect();
                    for job_id in &batch.job_ids {
                        let job = config.get_job(*job_id).unwrap();
                        for blocker in &job.blocked_by {
                            assert!(
                                completed.contains(blocker) || batch_set.contains(blocker),
                                "job {job_id} batched before blocker {blocker}"
                            );
                        }
                    }
                    // Simulate the node: run every batch job, some failing.
                    for job_id in &batch.job_ids {
                        state.submitted_jobs.insert(*job_id);
                        let return_code = if next_random() % 5 == 0 { 1 } else { 0 };
                        state.completed_results.push(finished(*job_id, return_code));
                    }
                }
                assert!(state.submitted_jobs.is_superset(&previous_submitted));
                previous_submitted = state.submitted_jobs.clone();
            }

            // Every job reached exactly one terminal state.
            assert!(state.all_jobs_complete());
            let mut terminal_ids: Vec<JobId> =
                state.completed_results.iter().map(|x| x.job_id).collect();
            terminal_ids.sort_unstable();
            let expected: Vec<JobId> = (1..=num_jobs).collect();
            assert_eq!(terminal_ids, expected);
        }
    }

    #[test]
    fn test_deterministic_given_state() {
        // Two submitter iterations against the same state must agree; the
        // second caller sees the first one's submissions and computes
        // nothing new.
        let mut group = fake_group("default");
        group.submitter_params.per_node_batch_size = 3;
        let config = make_config(
            (1..=7).map(|x| Job::new(x, "true")).collect(),
            vec![group],
        );
        let mut state = ClusterState::new(config.config_id(), 7);
        let outcome = Batcher::compute(&config, &mut state).unwrap();
        assert_eq!(outcome.batches.len(), 3);
        for batch in &outcome.batches {
            for job_id in &batch.job_ids {
                state.submitted_jobs.insert(*job_id);
            }
        }
        let second = Batcher::compute(&config, &mut state).unwrap();
        assert!(second.batches.is_empty());
    }
}
