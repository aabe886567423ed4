//! Common definitions: the layout of a JADE output directory.
//!
//! Every run owns one output directory on a shared filesystem. All
//! coordination between the login node and compute nodes happens through
//! files in this directory; the constants below are the contract.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::Result;

pub const OUTPUT_DIR: &str = "output";
pub const CONFIG_FILE: &str = "config.json";
pub const HPC_CONFIG_FILE: &str = "hpc_config.toml";
pub const CLUSTER_CONFIG_FILE: &str = "cluster_config.json";
pub const CLUSTER_LOCK_FILE: &str = "cluster_config.json.lock";
pub const CANCELLATION_FLAG_FILE: &str = "cancellation_flag";
pub const CONFIGS_DIR: &str = "configs";
pub const RESULTS_DIR: &str = "results";
pub const JOBS_OUTPUT_DIR: &str = "job-outputs";
pub const JOBS_STDIO_DIR: &str = "job-stdio";
pub const PROCESSED_RESULTS_FILE: &str = "processed_results.csv";
pub const RESULTS_SUMMARY_FILE: &str = "results.txt";
pub const ERRORS_FILE: &str = "errors.txt";
pub const SUBMIT_JOBS_LOG: &str = "submit_jobs.log";
pub const RUN_JOBS_LOG: &str = "run_jobs.log";
pub const DEFAULT_SUBMISSION_GROUP: &str = "default";

/// Environment variable consulted when rendering submission scripts so that
/// tests can point batches at a locally-built runner binary.
pub const NODE_RUNNER_EXE_ENV: &str = "JADE_NODE_RUNNER_EXE";

pub fn cluster_config_file(output: &Path) -> PathBuf {
    output.join(CLUSTER_CONFIG_FILE)
}

pub fn cluster_lock_file(output: &Path) -> PathBuf {
    output.join(CLUSTER_LOCK_FILE)
}

pub fn cancellation_flag_file(output: &Path) -> PathBuf {
    output.join(CANCELLATION_FLAG_FILE)
}

pub fn batch_config_file(output: &Path, batch_id: u64) -> PathBuf {
    output
        .join(CONFIGS_DIR)
        .join(format!("config_batch_{batch_id}.json"))
}

pub fn batch_results_file(output: &Path, batch_id: u64) -> PathBuf {
    output
        .join(RESULTS_DIR)
        .join(format!("results_batch_{batch_id}.csv"))
}

pub fn batch_script_file(output: &Path, batch_id: u64) -> PathBuf {
    output.join(format!("run_batch_{batch_id}.sh"))
}

/// Shared by every node runner; opened in append mode so batches running
/// on different nodes extend it instead of clobbering each other.
pub fn run_jobs_log_file(output: &Path) -> PathBuf {
    output.join(RUN_JOBS_LOG)
}

pub fn processed_results_file(output: &Path) -> PathBuf {
    output.join(PROCESSED_RESULTS_FILE)
}

pub fn job_stdout_file(output: &Path, job_name: &str) -> PathBuf {
    output.join(JOBS_STDIO_DIR).join(format!("{job_name}.o"))
}

pub fn job_stderr_file(output: &Path, job_name: &str) -> PathBuf {
    output.join(JOBS_STDIO_DIR).join(format!("{job_name}.e"))
}

pub fn job_output_dir(output: &Path, job_name: &str) -> PathBuf {
    output.join(JOBS_OUTPUT_DIR).join(job_name)
}

/// Create the standard sub-directories of an output directory.
pub fn create_output_dirs(output: &Path) -> Result<()> {
    for dir in [CONFIGS_DIR, RESULTS_DIR, JOBS_OUTPUT_DIR, JOBS_STDIO_DIR] {
        fs::create_dir_all(output.join(dir))?;
    }
    Ok(())
}

/// The node-runner executable invoked from submission scripts.
pub fn node_runner_exe() -> String {
    std::env::var(NODE_RUNNER_EXE_ENV).unwrap_or_else(|_| "jade-node-runner".to_string())
}
