//! HPC queueing-system abstractions.
//!
//! The [`HpcInterface`] trait is the seam between the submission workflow
//! and the scheduler. Implementations are selected by `hpc_type` in the HPC
//! config; they compose, never inherit.

pub mod common;
pub mod fake;
pub mod hpc_interface;
pub mod local;
pub mod slurm;

pub use common::{HpcJobInfo, HpcJobStatus, HpcType};
pub use fake::FakeInterface;
pub use hpc_interface::HpcInterface;
pub use local::LocalInterface;
pub use slurm::SlurmInterface;

use anyhow::Result;

use crate::models::hpc::{HpcConfig, HpcParams};

/// Create an HPC interface appropriate for the config.
pub fn create_hpc_interface(config: &HpcConfig) -> Result<Box<dyn HpcInterface>> {
    match (&config.hpc_type, &config.hpc) {
        (HpcType::Slurm, HpcParams::Slurm(slurm)) => {
            Ok(Box::new(SlurmInterface::new(slurm.clone())?))
        }
        (HpcType::Fake, _) => Ok(Box::new(FakeInterface::new())),
        (HpcType::Local, _) => Ok(Box::new(LocalInterface)),
        (hpc_type, _) => Err(anyhow::anyhow!(
            "hpc parameters do not match hpc_type={hpc_type:?}"
        )),
    }
}
