//! The user configuration: jobs, submission groups, and run-level hooks.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::{JadeError, Result};
use crate::models::jobs::{Job, JobId};
use crate::models::submission_group::SubmissionGroup;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    pub jobs: Vec<Job>,
    /// May be empty in the user's file; `submit-jobs` then builds a default
    /// group from the HPC config before the configuration is validated.
    #[serde(default)]
    pub submission_groups: Vec<SubmissionGroup>,
    /// Run once on the submitter host before anything is submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_command: Option<String>,
    /// Run once on the finalizing host after every job is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown_command: Option<String>,
    /// Opaque passthrough, exported to every job environment as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Configuration = serde_json::from_str(&text)?;
        config.normalize();
        config.validate()?;
        debug!(
            "Loaded configuration from {:?}: {} jobs, {} groups",
            path,
            config.jobs.len(),
            config.submission_groups.len()
        );
        Ok(config)
    }

    /// Load without normalization or validation. Used by `submit-jobs`,
    /// which may still need to attach a default submission group.
    pub fn load_unvalidated(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Configuration = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Fill in defaults that depend on other fields: job names default to
    /// the job ID, and the submission group may be omitted when exactly one
    /// group exists.
    pub fn normalize(&mut self) {
        let single_group = if self.submission_groups.len() == 1 {
            Some(self.submission_groups[0].name.clone())
        } else {
            None
        };
        for job in &mut self.jobs {
            if job.name.is_empty() {
                job.name = job.job_id.to_string();
            }
            if job.submission_group.is_none() {
                job.submission_group = single_group.clone();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(JadeError::InvalidConfiguration(
                "configuration contains no jobs".to_string(),
            ));
        }
        if self.submission_groups.is_empty() {
            return Err(JadeError::InvalidConfiguration(
                "configuration contains no submission groups".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for job in &self.jobs {
            if !ids.insert(job.job_id) {
                return Err(JadeError::InvalidConfiguration(format!(
                    "duplicate job_id {}",
                    job.job_id
                )));
            }
            if !names.insert(job.name.as_str()) {
                return Err(JadeError::InvalidConfiguration(format!(
                    "duplicate job name {}",
                    job.name
                )));
            }
        }

        let mut group_names = HashSet::new();
        for group in &self.submission_groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(JadeError::InvalidConfiguration(format!(
                    "duplicate submission group {}",
                    group.name
                )));
            }
            group.validate()?;
        }

        // max_nodes and poll_interval apply to all groups in aggregate and
        // so must agree.
        let first = &self.submission_groups[0].submitter_params;
        for group in &self.submission_groups[1..] {
            let params = &group.submitter_params;
            if params.max_nodes != first.max_nodes || params.poll_interval != first.poll_interval {
                return Err(JadeError::InvalidConfiguration(format!(
                    "max_nodes and poll_interval must be identical across groups; group {} differs",
                    group.name
                )));
            }
        }

        for job in &self.jobs {
            for blocker in &job.blocked_by {
                if !ids.contains(blocker) {
                    return Err(JadeError::InvalidConfiguration(format!(
                        "job {} is blocked by unknown job_id {}",
                        job.name, blocker
                    )));
                }
                if *blocker == job.job_id {
                    return Err(JadeError::InvalidConfiguration(format!(
                        "job {} is blocked by itself",
                        job.name
                    )));
                }
            }
            match &job.submission_group {
                Some(group) if !group_names.contains(group.as_str()) => {
                    return Err(JadeError::InvalidConfiguration(format!(
                        "job {} references unknown submission group {}",
                        job.name, group
                    )));
                }
                None => {
                    return Err(JadeError::InvalidConfiguration(format!(
                        "job {} has no submission group and the configuration defines several",
                        job.name
                    )));
                }
                _ => {}
            }
        }

        self.check_no_cycles()
    }

    /// Kahn's algorithm over the blocked_by graph. Any leftover jobs are
    /// part of a cycle.
    fn check_no_cycles(&self) -> Result<()> {
        let mut remaining: HashMap<JobId, BTreeSet<JobId>> = self
            .jobs
            .iter()
            .map(|job| (job.job_id, job.blocked_by.clone()))
            .collect();
        let mut processed: HashSet<JobId> = HashSet::new();

        while !remaining.is_empty() {
            let ready: Vec<JobId> = remaining
                .iter()
                .filter(|(_, blockers)| blockers.iter().all(|x| processed.contains(x)))
                .map(|(id, _)| *id)
                .collect();
            if ready.is_empty() {
                let mut cycle: Vec<JobId> = remaining.keys().copied().collect();
                cycle.sort_unstable();
                return Err(JadeError::InvalidConfiguration(format!(
                    "cycle detected in blocked_by graph involving job_ids {cycle:?}"
                )));
            }
            for id in ready {
                remaining.remove(&id);
                processed.insert(id);
            }
        }
        Ok(())
    }

    pub fn num_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn get_job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|x| x.job_id == job_id)
    }

    pub fn get_group(&self, name: &str) -> Option<&SubmissionGroup> {
        self.submission_groups.iter().find(|x| x.name == name)
    }

    /// A stable identifier derived from the configuration contents.
    pub fn config_id(&self) -> String {
        let text = serde_json::to_string(self).expect("configuration must serialize");
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Produce the reduced configuration handed to one node's runner.
    ///
    /// Dependency edges pointing outside the batch are dropped: a blocker
    /// that is not in the batch already reached a successful terminal state,
    /// otherwise the batcher would not have picked this job.
    pub fn filter_for_batch(&self, job_ids: &[JobId]) -> Configuration {
        let batch_set: BTreeSet<JobId> = job_ids.iter().copied().collect();
        let jobs = self
            .jobs
            .iter()
            .filter(|job| batch_set.contains(&job.job_id))
            .map(|job| {
                let mut job = job.clone();
                job.blocked_by.retain(|x| batch_set.contains(x));
                job
            })
            .collect();
        Configuration {
            jobs,
            submission_groups: self.submission_groups.clone(),
            setup_command: None,
            teardown_command: None,
            user_data: self.user_data.clone(),
        }
    }
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

    fn make_config(jobs: Vec<Job>) -> Configuration {
        let mut config = Configuration {
            jobs,
            submission_groups: vec![fake_group("default")],
            setup_command: None,
            teardown_command: None,
            user_data: None,
        };
        config.normalize();
        config
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let mut job = Job::new(1, "true");
        job.name = String::new();
        let config = make_config(vec![job]);
        assert_eq!(config.jobs[0].name, "1");
        assert_eq!(config.jobs[0].submission_group.as_deref(), Some("default"));
        config.validate().unwrap();
    }

    #[test]
    fn test_cycle_is_fatal() {
        let config = make_config(vec![
            Job::new(1, "true").with_blocked_by([2]),
            Job::new(2, "true").with_blocked_by([1]),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_group_is_fatal() {
        let mut config = make_config(vec![Job::new(1, "true")]);
        config.jobs[0].submission_group = Some("nope".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_blocker_is_fatal() {
        let config = make_config(vec![Job::new(1, "true").with_blocked_by([99])]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mismatched_max_nodes_is_fatal() {
        let mut config = make_config(vec![Job::new(1, "true")]);
        let mut other = fake_group("other");
        other.submitter_params.max_nodes = Some(4);
        config.submission_groups.push(other);
        config.jobs[0].submission_group = Some("default".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_filter_for_batch_drops_external_edges() {
        let config = make_config(vec![
            Job::new(1, "true"),
            Job::new(2, "true").with_blocked_by([1]),
            Job::new(3, "true").with_blocked_by([1, 2]),
        ]);
        let filtered = config.filter_for_batch(&[2, 3]);
        assert_eq!(filtered.jobs.len(), 2);
        // Job 1 completed in an earlier batch; only the in-batch edge stays.
        assert!(filtered.jobs[0].blocked_by.is_empty());
        assert_eq!(filtered.jobs[1].blocked_by, BTreeSet::from([2]));
    }

    #[test]
    fn test_config_id_is_stable() {
        let config = make_config(vec![Job::new(1, "true")]);
        assert_eq!(config.config_id(), config.config_id());
        let other = make_config(vec![Job::new(1, "false")]);
        assert_ne!(config.config_id(), other.config_id());
    }
}
