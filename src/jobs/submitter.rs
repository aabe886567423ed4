//! The distributed submission workflow.
//!
//! Any process — the login-node `submit-jobs` invocation or a node runner
//! finishing its batch — may advance the run by taking the cluster lock and
//! running one [`try_submit_jobs`] iteration: drain staged results, notice
//! dead allocations, compute new batches, submit them, and finalize the run
//! once every job is terminal. Whoever holds the lock is the submitter;
//! releasing it frees the role.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::common;
use crate::errors::{JadeError, Result};
use crate::hpc::common::{HpcJobStatus, HpcType};
use crate::hpc::{HpcInterface, create_hpc_interface};
use crate::jobs::batcher::{BatchSpec, Batcher};
use crate::jobs::cluster::Cluster;
use crate::jobs::configuration::Configuration;
use crate::jobs::job_runner::{JobRunner, run_node_command};
use crate::jobs::results_aggregator::ResultsAggregator;
use crate::jobs::results_summary::{self, ResultsSummary};
use crate::models::cluster_config::{BatchRunState, BatchState, ClusterState};
use crate::models::submission_group::SubmissionGroup;
use crate::result::{JobCompletionStatus, JobResult};

/// Exit-code mapping for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Good,
    JobsFailed,
    Error,
    Canceled,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Good => 0,
            RunStatus::JobsFailed => 1,
            RunStatus::Error => 2,
            RunStatus::Canceled => 3,
        }
    }
}

#[derive(Debug, Default)]
pub struct SubmitOutcome {
    pub is_complete: bool,
    pub canceled: bool,
    pub num_submitted_batches: usize,
    pub num_new_results: usize,
}

pub(crate) type HpcLookup = BTreeMap<String, Box<dyn HpcInterface>>;

fn make_hpc_lookup(config: &Configuration) -> Result<HpcLookup> {
    let mut lookup = BTreeMap::new();
    for group in &config.submission_groups {
        lookup.insert(
            group.name.clone(),
            create_hpc_interface(&group.submitter_params.hpc_config)?,
        );
    }
    Ok(lookup)
}

/// Renders scripts and submits batches through the HPC interface.
pub struct HpcSubmitter<'a> {
    config: &'a Configuration,
    output: &'a Path,
}

impl<'a> HpcSubmitter<'a> {
    pub fn new(config: &'a Configuration, output: &'a Path) -> Self {
        HpcSubmitter { config, output }
    }

    /// Write the filtered batch config, render the submission script, and
    /// submit it. Retries with exponential backoff before giving up; a
    /// failed batch stays formed-but-unsubmitted and a later submitter
    /// iteration will retry its jobs under a fresh batch ID.
    pub fn submit_batch(
        &self,
        hpc: &dyn HpcInterface,
        group: &SubmissionGroup,
        batch: &BatchSpec,
    ) -> Result<String> {
        let params = &group.submitter_params;
        let batch_config = self.config.filter_for_batch(&batch.job_ids);
        let config_file = common::batch_config_file(self.output, batch.batch_id);
        batch_config.dump(&config_file)?;
        debug!(
            "Created batch config {:?} with {} jobs",
            config_file,
            batch.job_ids.len()
        );

        let mut command = format!(
            "{} {} {} --batch-id {}",
            common::node_runner_exe(),
            config_file.display(),
            self.output.display(),
            batch.batch_id
        );
        if let Some(num_processes) = params.num_parallel_processes_per_node {
            command.push_str(&format!(
                " --num-parallel-processes-per-node {num_processes}"
            ));
        }
        if !params.distributed_submitter {
            command.push_str(" --no-distributed-submitter");
        }

        let script = common::batch_script_file(self.output, batch.batch_id);
        let name = format!("{}_batch_{}", params.hpc_config.job_prefix, batch.batch_id);
        hpc.create_submission_script(&name, &command, &script, self.output)?;

        let mut delay = Duration::from_secs(1);
        let attempts = params.submit_retries.max(1);
        for attempt in 1..=attempts {
            match hpc.submit(&script) {
                Ok((0, hpc_job_id, _)) => {
                    info!(
                        "Submitted batch_id={} name={} hpc_job_id={}",
                        batch.batch_id, name, hpc_job_id
                    );
                    return Ok(hpc_job_id);
                }
                Ok((return_code, _, stderr)) => {
                    warn!(
                        "Submission failed batch_id={} attempt={}/{} return_code={} stderr={}",
                        batch.batch_id,
                        attempt,
                        attempts,
                        return_code,
                        stderr.trim()
                    );
                }
                Err(e) => {
                    warn!(
                        "Submission failed batch_id={} attempt={}/{}: {}",
                        batch.batch_id, attempt, attempts, e
                    );
                }
            }
            if attempt < attempts {
                std::thread::sleep(delay);
                delay *= 2;
            }
        }
        Err(JadeError::Execution(format!(
            "failed to submit batch {} after {} attempts",
            batch.batch_id, attempts
        )))
    }
}

/// Run one submitter iteration. Safe to call from any process at any time;
/// the cluster lock serializes all of them.
pub fn try_submit_jobs(output: &Path) -> Result<SubmitOutcome> {
    let config = Configuration::load(&output.join(common::CONFIG_FILE))?;
    let hpc_lookup = make_hpc_lookup(&config)?;
    try_submit_jobs_with(output, &config, &hpc_lookup)
}

pub(crate) fn try_submit_jobs_with(
    output: &Path,
    config: &Configuration,
    hpc_lookup: &HpcLookup,
) -> Result<SubmitOutcome> {
    let cluster = Cluster::new(output);
    cluster.do_action_under_lock(|cluster| {
        let mut state = cluster.read_state()?;
        if state.is_complete || state.canceled {
            debug!(
                "Nothing to do: is_complete={} canceled={}",
                state.is_complete, state.canceled
            );
            return Ok(SubmitOutcome {
                is_complete: state.is_complete,
                canceled: state.canceled,
                ..Default::default()
            });
        }

        let mut outcome = SubmitOutcome {
            num_new_results: drain_results(output, &mut state)?,
            ..Default::default()
        };
        update_active_batches(output, config, &mut state, hpc_lookup)?;

        let batcher_outcome = Batcher::compute(config, &mut state)?;
        if !batcher_outcome.canceled.is_empty() {
            ResultsAggregator::append_processed(output, &batcher_outcome.canceled)?;
            outcome.num_new_results += batcher_outcome.canceled.len();
        }

        let submitter = HpcSubmitter::new(config, output);
        for batch in &batcher_outcome.batches {
            let group = config
                .get_group(&batch.submission_group)
                .expect("batcher only emits known groups");
            let hpc = hpc_lookup
                .get(&batch.submission_group)
                .expect("one interface per group");
            match submitter.submit_batch(hpc.as_ref(), group, batch) {
                Ok(hpc_job_id) => {
                    record_submitted_batch(&mut state, batch, &hpc_job_id);
                    outcome.num_submitted_batches += 1;
                }
                Err(e) => {
                    // The jobs stay outside submitted_jobs; the next
                    // iteration retries them.
                    error!("Batch {} not submitted: {}", batch.batch_id, e);
                }
            }
        }

        if state.all_jobs_complete() {
            state.is_complete = true;
            finalize_run(output, config, &state)?;
        }

        state.submitter = hostname::get().ok().map(|x| x.to_string_lossy().to_string());
        cluster.write_state(&mut state)?;
        outcome.is_complete = state.is_complete;
        outcome.canceled = state.canceled;
        info!(
            "Submitter iteration done version={} new_results={} submitted_batches={} is_complete={}",
            state.version,
            outcome.num_new_results,
            outcome.num_submitted_batches,
            outcome.is_complete
        );
        Ok(outcome)
    })
}

fn record_submitted_batch(state: &mut ClusterState, batch: &BatchSpec, hpc_job_id: &str) {
    for job_id in &batch.job_ids {
        state.submitted_jobs.insert(*job_id);
    }
    state.active_batches.insert(
        batch.batch_id,
        BatchState {
            hpc_job_id: hpc_job_id.to_string(),
            node_names: Vec::new(),
            submission_group: batch.submission_group.clone(),
            job_ids: batch.job_ids.clone(),
            state: BatchRunState::Submitted,
        },
    );
}

/// Promote freshly staged result rows into the cluster state. Rows for
/// already-terminal jobs are dropped.
fn drain_results(output: &Path, state: &mut ClusterState) -> Result<usize> {
    let drained = ResultsAggregator::drain(output)?;
    let mut num_new = 0;
    for result in drained {
        if state.is_job_completed(result.job_id) {
            warn!(
                "Dropping duplicate result for job {} from batch {}",
                result.name, result.batch_id
            );
            continue;
        }
        state.submitted_jobs.insert(result.job_id);
        state.completed_results.push(result);
        num_new += 1;
    }
    if num_new > 0 {
        debug!("Promoted {} new results", num_new);
    }
    Ok(num_new)
}

/// Reconcile `active_batches` against the scheduler. Batches whose
/// allocation is gone but whose jobs never reported are the "missing"
/// case: the node was killed (walltime, crash) before the results were
/// staged.
fn update_active_batches(
    output: &Path,
    config: &Configuration,
    state: &mut ClusterState,
    hpc_lookup: &HpcLookup,
) -> Result<()> {
    if state.active_batches.is_empty() {
        return Ok(());
    }

    let mut statuses_by_group: HashMap<String, HashMap<String, HpcJobStatus>> = HashMap::new();
    let batch_ids: Vec<u64> = state.active_batches.keys().copied().collect();
    for batch_id in batch_ids {
        let batch = state.active_batches[&batch_id].clone();
        let group = match config.get_group(&batch.submission_group) {
            Some(group) => group,
            None => {
                warn!(
                    "Active batch {} references unknown group {}",
                    batch_id, batch.submission_group
                );
                continue;
            }
        };
        let hpc = match hpc_lookup.get(&batch.submission_group) {
            Some(hpc) => hpc,
            None => continue,
        };
        if !statuses_by_group.contains_key(&batch.submission_group) {
            statuses_by_group.insert(batch.submission_group.clone(), hpc.get_statuses()?);
        }
        let statuses = &statuses_by_group[&batch.submission_group];

        match statuses.get(&batch.hpc_job_id).copied() {
            Some(HpcJobStatus::Running) => {
                let entry = state
                    .active_batches
                    .get_mut(&batch_id)
                    .expect("batch id came from the map");
                if entry.state != BatchRunState::Running {
                    entry.state = BatchRunState::Running;
                    match hpc.list_active_nodes(&batch.hpc_job_id) {
                        Ok(nodes) => entry.node_names = nodes,
                        Err(e) => debug!(
                            "Could not list nodes for hpc_job_id={}: {}",
                            batch.hpc_job_id, e
                        ),
                    }
                }
            }
            Some(HpcJobStatus::Queued) | Some(HpcJobStatus::Unknown) => {}
            Some(HpcJobStatus::Complete) | Some(HpcJobStatus::None) | None => {
                // A fake allocation is a child of whichever process
                // submitted it; other processes cannot see it and must not
                // declare it dead.
                let unseen = !statuses.contains_key(&batch.hpc_job_id);
                if unseen && group.submitter_params.hpc_config.hpc_type == HpcType::Fake {
                    continue;
                }
                finalize_dead_batch(output, config, state, batch_id)?;
            }
        }
    }
    Ok(())
}

/// The allocation ended. Jobs that reported results already left the batch;
/// synthesize `missing` rows for the ones that never did.
fn finalize_dead_batch(
    output: &Path,
    config: &Configuration,
    state: &mut ClusterState,
    batch_id: u64,
) -> Result<()> {
    let batch = state
        .active_batches
        .remove(&batch_id)
        .expect("caller verified the batch is active");
    let mut missing = Vec::new();
    for job_id in &batch.job_ids {
        if state.is_job_completed(*job_id) {
            continue;
        }
        let name = config
            .get_job(*job_id)
            .map(|x| x.name.clone())
            .unwrap_or_else(|| job_id.to_string());
        warn!(
            "Job {} was killed before reporting a result; marking missing (batch_id={} hpc_job_id={})",
            name, batch_id, batch.hpc_job_id
        );
        let result = JobResult::new(
            &name,
            *job_id,
            -1,
            JobCompletionStatus::Missing,
            0.0,
            batch_id,
            &batch.hpc_job_id,
            &output.to_string_lossy(),
        );
        state.completed_results.push(result.clone());
        missing.push(result);
    }
    if !missing.is_empty() {
        ResultsAggregator::append_processed(output, &missing)?;
    }
    info!(
        "Batch finalized batch_id={} hpc_job_id={} num_missing={}",
        batch_id,
        batch.hpc_job_id,
        missing.len()
    );
    Ok(())
}

/// Every job is terminal: generate reports and run the global teardown.
fn finalize_run(output: &Path, config: &Configuration, state: &ClusterState) -> Result<()> {
    info!("All jobs are complete; finalizing the run");
    let generate_reports = config
        .submission_groups
        .first()
        .map(|x| x.submitter_params.generate_reports)
        .unwrap_or(true);
    if generate_reports {
        results_summary::write_reports(output, config, state)?;
    }
    if let Some(teardown_command) = &config.teardown_command {
        match run_node_command(teardown_command) {
            Ok(0) => {}
            Ok(return_code) => error!("teardown_command failed return_code={}", return_code),
            Err(e) => error!("teardown_command failed: {}", e),
        }
    }
    Ok(())
}

/// Options `submit-jobs` applies when the configuration does not define its
/// own submission groups.
#[derive(Debug, Default, Clone)]
pub struct SubmitOptions {
    pub per_node_batch_size: Option<usize>,
    pub max_nodes: Option<usize>,
    pub poll_interval: Option<u64>,
    pub num_parallel_processes_per_node: Option<usize>,
    pub time_based_batching: bool,
    pub no_try_add_blocked_jobs: bool,
    pub no_distributed_submitter: bool,
    pub node_setup_command: Option<String>,
    pub node_teardown_command: Option<String>,
}

impl SubmitOptions {
    fn overrides_groups(&self) -> bool {
        self.per_node_batch_size.is_some()
            || self.max_nodes.is_some()
            || self.poll_interval.is_some()
            || self.num_parallel_processes_per_node.is_some()
            || self.time_based_batching
            || self.no_try_add_blocked_jobs
            || self.no_distributed_submitter
            || self.node_setup_command.is_some()
            || self.node_teardown_command.is_some()
    }
}

/// Create a new run: copy the configuration into the output directory,
/// create the cluster state, and either run everything in-process (local
/// HPC type) or perform the first submitter iteration.
pub fn submit_jobs(
    config_file: &Path,
    hpc_config_file: Option<&Path>,
    output: &Path,
    options: &SubmitOptions,
) -> Result<RunStatus> {
    std::fs::create_dir_all(output)?;
    common::create_output_dirs(output)?;

    let mut config = Configuration::load_unvalidated(config_file)?;
    if config.submission_groups.is_empty() {
        let hpc_config_file = hpc_config_file.ok_or_else(|| {
            JadeError::InvalidConfiguration(
                "configuration defines no submission groups and no HPC config file was given"
                    .to_string(),
            )
        })?;
        let hpc_config = crate::models::hpc::HpcConfig::load(hpc_config_file)?;
        config
            .submission_groups
            .push(build_default_group(hpc_config, options));
    } else if options.overrides_groups() {
        return Err(JadeError::InvalidConfiguration(
            "submitter overrides are not allowed when the configuration defines submission groups"
                .to_string(),
        ));
    }
    config.normalize();
    config.validate()?;

    let master_config_file = output.join(common::CONFIG_FILE);
    config.dump(&master_config_file)?;
    debug!("Copied configuration to {:?}", master_config_file);

    Cluster::create(output, &config)?;

    if let Some(setup_command) = &config.setup_command {
        let return_code = run_node_command(setup_command)?;
        if return_code != 0 {
            return Err(JadeError::Execution(format!(
                "setup_command failed with return code {return_code}"
            )));
        }
    }

    let hpc_type = config.submission_groups[0]
        .submitter_params
        .hpc_config
        .hpc_type;
    if hpc_type == HpcType::Local {
        return run_local(&config, output);
    }

    let outcome = try_submit_jobs(output)?;
    info!(
        "Submitted {} initial batches; distributed submitters will continue the run",
        outcome.num_submitted_batches
    );
    Ok(RunStatus::Good)
}

fn build_default_group(
    hpc_config: crate::models::hpc::HpcConfig,
    options: &SubmitOptions,
) -> SubmissionGroup {
    let mut params = crate::models::submission_group::SubmitterParams::new(hpc_config);
    if let Some(value) = options.per_node_batch_size {
        params.per_node_batch_size = value;
    }
    params.max_nodes = options.max_nodes;
    if let Some(value) = options.poll_interval {
        params.poll_interval = value;
    }
    params.num_parallel_processes_per_node = options.num_parallel_processes_per_node;
    params.time_based_batching = options.time_based_batching;
    params.try_add_blocked_jobs = !options.no_try_add_blocked_jobs;
    params.distributed_submitter = !options.no_distributed_submitter;
    params.node_setup_command = options.node_setup_command.clone();
    params.node_teardown_command = options.node_teardown_command.clone();
    SubmissionGroup {
        name: common::DEFAULT_SUBMISSION_GROUP.to_string(),
        submitter_params: params,
    }
}

/// Run the whole configuration in-process, batch by batch. Used for the
/// local HPC type; exercises the batcher and the worker pool exactly as a
/// compute node would.
fn run_local(config: &Configuration, output: &Path) -> Result<RunStatus> {
    let cluster = Cluster::new(output);
    loop {
        if cluster.is_canceled() {
            let state = cluster.do_action_under_lock(|cluster| {
                let mut state = cluster.read_state()?;
                drain_results(output, &mut state)?;
                state.canceled = true;
                cluster.write_state(&mut state)?;
                Ok(state)
            })?;
            results_summary::write_reports(output, config, &state)?;
            return Ok(RunStatus::Canceled);
        }

        let batches = cluster.do_action_under_lock(|cluster| {
            let mut state = cluster.read_state()?;
            drain_results(output, &mut state)?;
            let batcher_outcome = Batcher::compute(config, &mut state)?;
            if !batcher_outcome.canceled.is_empty() {
                ResultsAggregator::append_processed(output, &batcher_outcome.canceled)?;
            }
            for batch in &batcher_outcome.batches {
                record_submitted_batch(&mut state, batch, "local");
            }
            let done = batcher_outcome.batches.is_empty();
            if done && state.all_jobs_complete() {
                state.is_complete = true;
                finalize_run(output, config, &state)?;
            }
            cluster.write_state(&mut state)?;
            if done { Ok(None) } else { Ok(Some(batcher_outcome.batches)) }
        })?;

        let batches = match batches {
            Some(batches) => batches,
            None => break,
        };

        let mut canceled = false;
        for batch in &batches {
            let group = config
                .get_group(&batch.submission_group)
                .expect("batcher only emits known groups");
            let batch_config = config.filter_for_batch(&batch.job_ids);
            let config_file = common::batch_config_file(output, batch.batch_id);
            batch_config.dump(&config_file)?;
            let mut runner = JobRunner::new(&config_file, output, batch.batch_id)?;
            let result =
                runner.run_jobs(group.submitter_params.num_parallel_processes_per_node)?;
            cluster.do_action_under_lock(|cluster| {
                let mut state = cluster.read_state()?;
                drain_results(output, &mut state)?;
                state.active_batches.remove(&batch.batch_id);
                cluster.write_state(&mut state)
            })?;
            if result.canceled {
                canceled = true;
                break;
            }
        }
        if canceled {
            continue; // the cancellation branch at the loop top finishes up
        }
    }

    let state = cluster.read_state()?;
    if !state.is_complete {
        warn!("Local run ended without completing every job");
        return Ok(RunStatus::Error);
    }
    let summary = ResultsSummary::new(&state.completed_results);
    if summary.all_successful() {
        Ok(RunStatus::Good)
    } else if summary.num_failed == 0 && summary.num_missing == 0 {
        Ok(RunStatus::Canceled)
    } else {
        Ok(RunStatus::JobsFailed)
    }
}

/// Cancel the run: raise the flag for running workers, mark the state, and
/// cancel still-queued HPC allocations.
pub fn cancel_jobs(output: &Path) -> Result<()> {
    let config = Configuration::load(&output.join(common::CONFIG_FILE))?;
    let hpc_lookup = make_hpc_lookup(&config)?;
    let cluster = Cluster::new(output);
    cluster.set_cancel_flag()?;
    cluster.do_action_under_lock(|cluster| {
        let mut state = cluster.read_state()?;
        state.canceled = true;
        for batch in state.active_batches.values() {
            if let Some(hpc) = hpc_lookup.get(&batch.submission_group) {
                match hpc.cancel_job(&batch.hpc_job_id) {
                    Ok(0) => info!("Canceled hpc_job_id={}", batch.hpc_job_id),
                    Ok(return_code) => warn!(
                        "Failed to cancel hpc_job_id={} return_code={}",
                        batch.hpc_job_id, return_code
                    ),
                    Err(e) => warn!("Failed to cancel hpc_job_id={}: {}", batch.hpc_job_id, e),
                }
            }
        }
        cluster.write_state(&mut state)?;
        info!("Marked the run canceled; workers will observe the flag");
        Ok(())
    })
}

/// Reset the terminal run so that failed and/or missing jobs execute again.
/// Successful results are carried over; their dependents treat them as
/// satisfied without re-running.
pub fn resubmit_jobs(output: &Path, failed: bool, missing: bool) -> Result<RunStatus> {
    let config = Configuration::load(&output.join(common::CONFIG_FILE))?;
    let cluster = Cluster::new(output);
    let num_selected = cluster.do_action_under_lock(|cluster| {
        let mut state = cluster.read_state()?;
        if !state.is_complete && !state.canceled {
            return Err(JadeError::InvalidConfiguration(
                "cannot resubmit while the run is still in progress".to_string(),
            ));
        }
        let selected: Vec<_> = state
            .completed_results
            .iter()
            .filter(|x| (failed && x.is_failed()) || (missing && x.is_missing()))
            .map(|x| x.job_id)
            .collect();
        if selected.is_empty() {
            info!("No jobs match the resubmission filters");
            return Ok(0);
        }
        info!("Resubmitting {} jobs", selected.len());
        state
            .completed_results
            .retain(|x| !selected.contains(&x.job_id));
        for job_id in &selected {
            state.submitted_jobs.remove(job_id);
        }
        state.active_batches.clear();
        state.is_complete = false;
        state.canceled = false;
        cluster.write_state(&mut state)?;
        Ok(selected.len())
    })?;
    if num_selected == 0 {
        return Ok(RunStatus::Good);
    }

    let flag = common::cancellation_flag_file(output);
    if flag.exists() {
        std::fs::remove_file(&flag)?;
    }

    let hpc_type = config.submission_groups[0]
        .submitter_params
        .hpc_config
        .hpc_type;
    if hpc_type == HpcType::Local {
        return run_local(&config, output);
    }
    try_submit_jobs(output)?;
    Ok(RunStatus::Good)
}
