//! The cluster store: shared run state behind an advisory file lock.
//!
//! The state document lives at `<output>/cluster_config.json` and is only
//! ever rewritten whole (temp file + rename) while holding
//! `<output>/cluster_config.json.lock`. The lock is a soft lock — a file
//! created atomically with `create_new` — because flock-style locks are not
//! reliable across nodes on Lustre/NFS filesystems.
//!
//! Whoever holds the lock is the acting submitter for that iteration; the
//! role frees itself on release.
//!
//! # Orphaned locks
//!
//! If a process dies while holding the lock, the run is stuck. Recovery is
//! manual: verify the holder recorded inside the lock file is really gone,
//! remove `cluster_config.json.lock`, and run `jade try-submit-jobs`. This
//! is not race-safe — if the holder was merely slow, removing the lock
//! permits duplicate submission — so the lock is never reclaimed
//! automatically.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::common;
use crate::errors::{JadeError, Result};
use crate::jobs::configuration::Configuration;
use crate::models::cluster_config::ClusterState;

/// Default time to wait for the cluster lock. Submitter iterations are
/// short; a long wait means many nodes finished at once.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(600);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An acquired soft file lock. Released on drop.
pub struct SoftFileLock {
    path: PathBuf,
}

impl SoftFileLock {
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // Record the holder for manual orphan diagnosis.
                    let host = hostname::get()
                        .map(|x| x.to_string_lossy().to_string())
                        .unwrap_or_default();
                    let _ = writeln!(file, "{} pid={}", host, std::process::id());
                    return Ok(SoftFileLock {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        error!(
                            "Failed to acquire file lock {:?} within {} seconds",
                            path,
                            timeout.as_secs()
                        );
                        return Err(JadeError::LockTimeout {
                            lock_file: path.to_path_buf(),
                            timeout_secs: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for SoftFileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            error!("Failed to release file lock {:?}: {}", self.path, e);
        }
    }
}

/// Handle to the persistent cluster state of one output directory.
pub struct Cluster {
    output: PathBuf,
    lock_timeout: Duration,
}

impl Cluster {
    pub fn new(output: &Path) -> Self {
        Cluster {
            output: output.to_path_buf(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(output: &Path, lock_timeout: Duration) -> Self {
        Cluster {
            output: output.to_path_buf(),
            lock_timeout,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Create the state document for a new run. Fails if one already exists.
    pub fn create(output: &Path, config: &Configuration) -> Result<ClusterState> {
        let cluster = Cluster::new(output);
        let config_file = common::cluster_config_file(output);
        if config_file.exists() {
            return Err(JadeError::InvalidConfiguration(format!(
                "{config_file:?} already exists; choose a new output directory or resubmit"
            )));
        }
        cluster.do_action_under_lock(|cluster| {
            let mut state = ClusterState::new(config.config_id(), config.num_jobs());
            cluster.write_state(&mut state)?;
            info!(
                "Created cluster state config_id={} num_jobs={}",
                state.config_id, state.num_jobs
            );
            Ok(state)
        })
    }

    /// Run `func` while holding the cluster lock.
    pub fn do_action_under_lock<T>(&self, func: impl FnOnce(&Cluster) -> Result<T>) -> Result<T> {
        let lock_file = common::cluster_lock_file(&self.output);
        let lock = SoftFileLock::acquire(&lock_file, self.lock_timeout)?;
        let result = func(self);
        drop(lock);
        result
    }

    /// Read the current state. Callers that intend to write must hold the
    /// lock across the read-modify-write.
    pub fn read_state(&self) -> Result<ClusterState> {
        let config_file = common::cluster_config_file(&self.output);
        if !config_file.is_file() {
            return Err(JadeError::InvalidConfiguration(format!(
                "{config_file:?} does not exist"
            )));
        }
        let text = fs::read_to_string(&config_file)?;
        let state = serde_json::from_str(&text)?;
        Ok(state)
    }

    /// Atomically replace the state document, bumping its version.
    pub fn write_state(&self, state: &mut ClusterState) -> Result<()> {
        state.version += 1;
        let config_file = common::cluster_config_file(&self.output);
        let temp_file = config_file.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(state)?;
        fs::write(&temp_file, text)?;
        fs::rename(&temp_file, &config_file)?;
        debug!("Serialized cluster state version={}", state.version);
        Ok(())
    }

    /// Raise the cancellation flag. Lock-free by design: workers poll for
    /// the file's existence on every tick.
    pub fn set_cancel_flag(&self) -> Result<()> {
        fs::write(common::cancellation_flag_file(&self.output), "")?;
        Ok(())
    }

    pub fn is_canceled(&self) -> bool {
        is_canceled(&self.output)
    }
}

/// True when the cancellation flag file exists.
pub fn is_canceled(output: &Path) -> bool {
    common::cancellation_flag_file(output).exists()
}
