//! Models for HPC configurations.

use serde::{Deserialize, Serialize};

use crate::errors::{JadeError, Result};
use crate::hpc::common::HpcType;

/// Config options for the SLURM queueing system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlurmConfig {
    /// Project account to charge.
    pub account: String,
    /// Maximum time allocated to each node, "HH:MM:SS".
    #[serde(default = "default_walltime")]
    pub walltime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmp: Option<String>,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntasks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntasks_per_node: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gres: Option<String>,
}

fn default_walltime() -> String {
    "04:00:00".to_string()
}

fn default_nodes() -> u32 {
    1
}

/// Config options for the fake queueing system, which runs submission
/// scripts as local child processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FakeHpcConfig {
    /// Maximum time allocated to each node, "HH:MM:SS".
    pub walltime: String,
}

/// Config options when there is no queueing system at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocalHpcConfig {}

/// Interface-specific parameters. The variant must agree with
/// [`HpcConfig::hpc_type`]; [`HpcConfig::validate`] enforces that at load
/// time rather than at use time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HpcParams {
    Slurm(SlurmConfig),
    Fake(FakeHpcConfig),
    Local(LocalHpcConfig),
}

impl HpcParams {
    pub fn walltime(&self) -> Option<&str> {
        match self {
            HpcParams::Slurm(config) => Some(&config.walltime),
            HpcParams::Fake(config) => Some(&config.walltime),
            HpcParams::Local(_) => None,
        }
    }

    pub fn num_nodes(&self) -> u32 {
        match self {
            HpcParams::Slurm(config) => config.nodes,
            _ => 1,
        }
    }
}

/// Top-level HPC config, loadable from `hpc_config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HpcConfig {
    pub hpc_type: HpcType,
    #[serde(default = "default_job_prefix")]
    pub job_prefix: String,
    pub hpc: HpcParams,
}

fn default_job_prefix() -> String {
    "job".to_string()
}

impl HpcConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: HpcConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ok = matches!(
            (self.hpc_type, &self.hpc),
            (HpcType::Slurm, HpcParams::Slurm(_))
                | (HpcType::Fake, HpcParams::Fake(_))
                | (HpcType::Local, HpcParams::Local(_))
        );
        if !ok {
            return Err(JadeError::InvalidConfiguration(format!(
                "hpc parameters do not match hpc_type={:?}",
                self.hpc_type
            )));
        }
        Ok(())
    }

    pub fn walltime_minutes(&self) -> Option<u64> {
        self.hpc.walltime().and_then(|x| walltime_minutes(x).ok())
    }
}

/// Parse a SLURM-style walltime string into whole minutes.
///
/// Accepts "HH:MM:SS" and "D-HH:MM:SS". Seconds round up.
pub fn walltime_minutes(walltime: &str) -> Result<u64> {
    let err = || JadeError::InvalidParameter(format!("invalid walltime: {walltime}"));
    let (days, rest) = match walltime.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().map_err(|_| err())?, rest),
        None => (0, walltime),
    };
    let fields: Vec<&str> = rest.split(':').collect();
    if fields.len() != 3 {
        return Err(err());
    }
    let hours: u64 = fields[0].parse().map_err(|_| err())?;
    let minutes: u64 = fields[1].parse().map_err(|_| err())?;
    let seconds: u64 = fields[2].parse().map_err(|_| err())?;
    if minutes > 59 || seconds > 59 {
        return Err(err());
    }
    Ok(days * 24 * 60 + hours * 60 + minutes + seconds.div_ceil(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walltime_minutes() {
        assert_eq!(walltime_minutes("04:00:00").unwrap(), 240);
        assert_eq!(walltime_minutes("00:30:30").unwrap(), 31);
        assert_eq!(walltime_minutes("1-01:00:00").unwrap(), 1500);
        assert!(walltime_minutes("4h").is_err());
        assert!(walltime_minutes("00:99:00").is_err());
    }

    #[test]
    fn test_load_slurm_toml() {
        let text = r#"
            hpc_type = "slurm"
            job_prefix = "myjob"

            [hpc]
            account = "proj123"
            walltime = "08:00:00"
            partition = "short"
            nodes = 2
        "#;
        let config: HpcConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.job_prefix, "myjob");
        match &config.hpc {
            HpcParams::Slurm(slurm) => {
                assert_eq!(slurm.account, "proj123");
                assert_eq!(slurm.nodes, 2);
                assert_eq!(slurm.partition.as_deref(), Some("short"));
            }
            other => panic!("expected slurm params, got {other:?}"),
        }
        assert_eq!(config.walltime_minutes(), Some(480));
    }

    #[test]
    fn test_variant_mismatch_is_fatal() {
        let text = r#"
            hpc_type = "slurm"

            [hpc]
            walltime = "01:00:00"
        "#;
        let config: HpcConfig = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }
}
