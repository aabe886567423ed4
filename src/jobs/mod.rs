//! Job management: configuration, batching, cluster state, execution, and
//! the distributed submission workflow.

pub mod async_cli_command;
pub mod batcher;
pub mod cluster;
pub mod configuration;
pub mod job_queue;
pub mod job_runner;
pub mod results_aggregator;
pub mod results_summary;
pub mod submitter;

pub use batcher::{BatchSpec, Batcher, BatcherOutcome};
pub use cluster::{Cluster, SoftFileLock};
pub use configuration::Configuration;
pub use job_queue::JobQueue;
pub use job_runner::{JobRunner, RunnerResult};
pub use results_aggregator::ResultsAggregator;
pub use submitter::{
    HpcSubmitter, RunStatus, SubmitOptions, SubmitOutcome, cancel_jobs, resubmit_jobs,
    submit_jobs, try_submit_jobs,
};
