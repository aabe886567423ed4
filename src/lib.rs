//! JADE: workload automation over HPC batch systems.
//!
//! Users describe a set of executable jobs with optional dependencies. JADE
//! groups the jobs into node-sized batches, asks the scheduler for one
//! allocation per batch, and runs a worker pool on every allocated node.
//! Between batches any live process may promote itself to submitter —
//! coordination happens entirely through files in the output directory,
//! protected by a single advisory file lock, so no host has to stay alive
//! for the whole run.

pub mod common;
pub mod errors;
pub mod hpc;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod result;

pub use errors::{JadeError, Result};
