//! SLURM queueing-system implementation.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, trace, warn};
use regex::Regex;
use sysinfo::{CpuRefreshKind, RefreshKind, System};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::common::{HpcJobInfo, HpcJobStatus};
use super::hpc_interface::HpcInterface;
use crate::models::hpc::SlurmConfig;

pub struct SlurmInterface {
    user: String,
    config: SlurmConfig,
    sbatch_regex: Regex,
}

impl SlurmInterface {
    pub fn new(config: SlurmConfig) -> Result<Self> {
        let user = env::var("USER").or_else(|_| env::var("USERNAME"))?;
        let sbatch_regex = Regex::new(r"Submitted batch job (\d+)")?;
        Ok(Self {
            user,
            config,
            sbatch_regex,
        })
    }

    fn map_status(slurm_status: &str) -> HpcJobStatus {
        match slurm_status {
            "PENDING" | "CONFIGURING" => HpcJobStatus::Queued,
            "RUNNING" => HpcJobStatus::Running,
            "COMPLETED" | "COMPLETING" => HpcJobStatus::Complete,
            _ => HpcJobStatus::Unknown,
        }
    }

    /// Get the squeue executable path (allows for testing with fake binary)
    fn get_squeue_exec() -> String {
        env::var("JADE_FAKE_SQUEUE").unwrap_or_else(|_| "squeue".to_string())
    }

    /// Get the sbatch executable path (allows for testing with fake binary)
    fn get_sbatch_exec() -> String {
        env::var("JADE_FAKE_SBATCH").unwrap_or_else(|_| "sbatch".to_string())
    }

    /// Run a command with retries for transient errors.
    fn run_command_with_retries(
        &self,
        cmd: &str,
        args: &[&str],
        num_retries: usize,
        retry_delay_secs: u64,
        ignore_errors: &[&str],
    ) -> Result<(i32, String, String)> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            trace!("Running command: {} {:?} (attempt {})", cmd, args, attempts);

            let output = Command::new(cmd).args(args).output()?;

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let return_code = output.status.code().unwrap_or(-1);

            let should_ignore = ignore_errors
                .iter()
                .any(|err| stderr.contains(err) || stdout.contains(err));

            if return_code == 0 || should_ignore || attempts >= num_retries {
                return Ok((return_code, stdout, stderr));
            }

            warn!(
                "Command failed (attempt {}/{}): {} - {}",
                attempts, num_retries, return_code, stderr
            );

            if attempts < num_retries {
                thread::sleep(Duration::from_secs(retry_delay_secs));
            }
        }
    }
}

impl HpcInterface for SlurmInterface {
    fn submit(&self, filename: &Path) -> Result<(i32, String, String)> {
        let sbatch = Self::get_sbatch_exec();
        let filename_str = filename.to_string_lossy();

        let (return_code, stdout, stderr) =
            self.run_command_with_retries(&sbatch, &[&filename_str], 1, 0, &[])?;

        if return_code != 0 {
            return Ok((return_code, String::new(), stderr));
        }

        if let Some(captures) = self.sbatch_regex.captures(&stdout) {
            let job_id = captures.get(1).unwrap().as_str().to_string();
            Ok((0, job_id, stderr))
        } else {
            error!("Failed to parse sbatch output: {}", stdout);
            Ok((
                1,
                String::new(),
                "Failed to parse job ID from sbatch output".to_string(),
            ))
        }
    }

    fn get_status(&self, job_id: &str) -> Result<HpcJobInfo> {
        let field_names = ["jobid", "name", "state"];
        let format = field_names.join(",");
        let squeue = Self::get_squeue_exec();

        // Transient failures could be costly; retry for up to a minute.
        let (return_code, stdout, stderr) = self.run_command_with_retries(
            &squeue,
            &["-u", &self.user, "--Format", &format, "-h", "-j", job_id],
            6,
            10,
            &["Invalid job id specified"],
        )?;

        if return_code != 0 {
            if stderr.contains("Invalid job id specified") {
                return Ok(HpcJobInfo::none());
            }
            return Err(anyhow!(
                "squeue command failed: {} - {}",
                return_code,
                stderr
            ));
        }

        trace!("squeue output: [{}]", stdout);
        let fields: Vec<&str> = stdout.split_whitespace().collect();

        if fields.is_empty() {
            // No jobs are currently running
            return Ok(HpcJobInfo::none());
        }

        if fields.len() != field_names.len() {
            return Err(anyhow!(
                "Unexpected squeue output format: got {} fields, expected {}",
                fields.len(),
                field_names.len()
            ));
        }

        Ok(HpcJobInfo::new(
            fields[0].to_string(),
            fields[1].to_string(),
            Self::map_status(fields[2]),
        ))
    }

    fn get_statuses(&self) -> Result<HashMap<String, HpcJobStatus>> {
        let field_names = ["jobid", "state"];
        let format = field_names.join(",");
        let squeue = Self::get_squeue_exec();

        let (return_code, stdout, stderr) = self.run_command_with_retries(
            &squeue,
            &["-u", &self.user, "--Format", &format, "-h"],
            6,
            10,
            &[],
        )?;

        if return_code != 0 {
            return Err(anyhow!(
                "squeue command failed: {} - {}",
                return_code,
                stderr
            ));
        }

        trace!("squeue output: [{}]", stdout);

        let mut statuses = HashMap::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != field_names.len() {
                warn!("Skipping malformed squeue line: {}", line);
                continue;
            }

            statuses.insert(fields[0].to_string(), Self::map_status(fields[1]));
        }

        Ok(statuses)
    }

    fn cancel_job(&self, job_id: &str) -> Result<i32> {
        let output = Command::new("scancel").arg(job_id).output()?;

        let return_code = output.status.code().unwrap_or(-1);
        if return_code != 0 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("Failed to cancel Slurm job {}: {}", job_id, stderr);
        } else {
            info!("Canceled Slurm job {}", job_id);
        }

        Ok(return_code)
    }

    fn list_active_nodes(&self, job_id: &str) -> Result<Vec<String>> {
        let squeue = Self::get_squeue_exec();

        // Get compact node list. Compare the node count against the result
        // to make sure 500 characters was enough.
        let output = Command::new(&squeue)
            .args(["-j", job_id, "--format='%5D %500N'", "-h"])
            .output()?;

        if !output.status.success() {
            return Err(anyhow!("Failed to get node list from squeue"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let cleaned = stdout.trim().replace('\'', "");
        let result: Vec<&str> = cleaned.split_whitespace().collect();

        if result.len() != 2 {
            return Err(anyhow!(
                "Unexpected squeue output format: expected 2 fields, got {}",
                result.len()
            ));
        }

        let num_nodes: usize = result[0].parse()?;
        let nodes_compact = result[1];

        let output = Command::new("scontrol")
            .args(["show", "hostnames", nodes_compact])
            .output()?;

        if !output.status.success() {
            return Err(anyhow!("Failed to expand node names"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let nodes: Vec<String> = stdout.trim().split('\n').map(|s| s.to_string()).collect();

        if nodes.len() != num_nodes {
            return Err(anyhow!(
                "Node count mismatch: got {} nodes, expected {}",
                nodes.len(),
                num_nodes
            ));
        }

        Ok(nodes)
    }

    fn create_submission_script(
        &self,
        name: &str,
        command: &str,
        filename: &Path,
        output: &Path,
    ) -> Result<()> {
        let output_str = output.to_string_lossy();
        let mut script = format!(
            "#!/bin/bash\n\
             #SBATCH --account={}\n\
             #SBATCH --job-name={}\n\
             #SBATCH --time={}\n\
             #SBATCH --output={}/job_output_%j.o\n\
             #SBATCH --error={}/job_output_%j.e\n",
            self.config.account, name, self.config.walltime, output_str, output_str
        );

        let optional_params: [(&str, Option<String>); 7] = [
            ("partition", self.config.partition.clone()),
            ("qos", self.config.qos.clone()),
            ("mem", self.config.mem.clone()),
            ("tmp", self.config.tmp.clone()),
            ("ntasks", self.config.ntasks.map(|x| x.to_string())),
            (
                "ntasks-per-node",
                self.config.ntasks_per_node.map(|x| x.to_string()),
            ),
            ("gres", self.config.gres.clone()),
        ];
        for (param, value) in optional_params {
            if let Some(value) = value {
                script.push_str(&format!("#SBATCH --{}={}\n", param, value));
            }
        }
        if self.config.nodes > 1 {
            script.push_str(&format!("#SBATCH --nodes={}\n", self.config.nodes));
        }

        script.push('\n');
        if self.config.nodes > 1 {
            script.push_str("srun ");
        }
        script.push_str(command);
        script.push('\n');

        fs::write(filename, script)
            .with_context(|| format!("Failed to write submission script to {:?}", filename))?;

        #[cfg(unix)]
        {
            let mut perms = fs::metadata(filename)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(filename, perms)?;
        }

        debug!("Created submission script: {:?}", filename);
        Ok(())
    }

    fn get_current_job_id(&self) -> Option<String> {
        env::var("SLURM_JOB_ID").ok()
    }

    fn am_i_manager(&self) -> bool {
        env::var("SLURM_NODEID").map(|x| x == "0").unwrap_or(true)
    }

    fn get_num_cpus(&self) -> usize {
        if let Some(cpus) = env::var("SLURM_CPUS_ON_NODE")
            .ok()
            .and_then(|x| x.parse().ok())
        {
            return cpus;
        }
        let sys =
            System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
        sys.cpus().len().max(1)
    }
}
