//! Data models shared between the submitter, the batcher, and the node
//! runners. Everything here serializes with serde; the JSON documents are
//! the wire format between processes on the shared filesystem.

pub mod cluster_config;
pub mod hpc;
pub mod jobs;
pub mod submission_group;

pub use cluster_config::{BatchState, BatchRunState, ClusterState};
pub use hpc::{FakeHpcConfig, HpcConfig, HpcParams, LocalHpcConfig, SlurmConfig, walltime_minutes};
pub use jobs::{Job, JobId};
pub use submission_group::{SubmissionGroup, SubmitterParams, make_submission_group_lookup};
