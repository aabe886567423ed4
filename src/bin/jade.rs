//! JADE command-line interface.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, builder::styling};
use log::error;

use jade::common;
use jade::jobs::submitter::{self, RunStatus, SubmitOptions};
use jade::jobs::{Cluster, results_summary};
use jade::logging;

const STYLES: styling::Styles = styling::Styles::styled()
    .header(styling::AnsiColor::Green.on_default().bold())
    .usage(styling::AnsiColor::Green.on_default().bold())
    .literal(styling::AnsiColor::Cyan.on_default().bold())
    .placeholder(styling::AnsiColor::Cyan.on_default());

#[derive(Parser)]
#[command(name = "jade")]
#[command(about = "Workload automation over HPC batch systems", long_about = None)]
#[command(styles = STYLES)]
struct Cli {
    /// Enable verbose log output.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a configuration for execution.
    SubmitJobs {
        /// Configuration file (JSON).
        config_file: PathBuf,

        /// HPC config file (TOML); required unless the configuration
        /// defines submission groups.
        #[arg(long, default_value = common::HPC_CONFIG_FILE)]
        hpc_config: PathBuf,

        /// Output directory.
        #[arg(short, long, default_value = common::OUTPUT_DIR)]
        output: PathBuf,

        /// Number of jobs to assign to each node.
        #[arg(short = 'b', long)]
        per_node_batch_size: Option<usize>,

        /// Max number of compute nodes to use simultaneously.
        #[arg(short = 'n', long)]
        max_nodes: Option<usize>,

        /// Interval in seconds on which to poll HPC job status.
        #[arg(short = 'p', long)]
        poll_interval: Option<u64>,

        /// Number of jobs to run in parallel on each node.
        #[arg(short = 'q', long)]
        num_parallel_processes_per_node: Option<usize>,

        /// Pack batches by estimated runtime against the walltime.
        #[arg(long)]
        time_based_batching: bool,

        /// Never pull blocked jobs into an under-full batch.
        #[arg(long)]
        no_try_add_blocked_jobs: bool,

        /// Only explicit try-submit-jobs invocations advance the run.
        #[arg(long)]
        no_distributed_submitter: bool,
    },

    /// Run one submitter iteration against an existing run.
    TrySubmitJobs {
        output: PathBuf,
    },

    /// Cancel a run: stop running jobs and drop pending batches.
    CancelJobs {
        output: PathBuf,
    },

    /// Resubmit failed and/or missing jobs from a completed run.
    ResubmitJobs {
        output: PathBuf,

        /// Resubmit only failed jobs.
        #[arg(long)]
        failed: bool,

        /// Resubmit only missing jobs.
        #[arg(long)]
        missing: bool,
    },

    /// Print the results table for a run.
    ShowResults {
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let status = match run(cli) {
        Ok(status) => status,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            RunStatus::Error
        }
    };
    ExitCode::from(status.exit_code() as u8)
}

fn run(cli: Cli) -> jade::Result<RunStatus> {
    match cli.command {
        Commands::SubmitJobs {
            config_file,
            hpc_config,
            output,
            per_node_batch_size,
            max_nodes,
            poll_interval,
            num_parallel_processes_per_node,
            time_based_batching,
            no_try_add_blocked_jobs,
            no_distributed_submitter,
        } => {
            std::fs::create_dir_all(&output)?;
            logging::setup_logging(&output.join(common::SUBMIT_JOBS_LOG), cli.verbose)?;
            let options = SubmitOptions {
                per_node_batch_size,
                max_nodes,
                poll_interval,
                num_parallel_processes_per_node,
                time_based_batching,
                no_try_add_blocked_jobs,
                no_distributed_submitter,
                node_setup_command: None,
                node_teardown_command: None,
            };
            let hpc_config = hpc_config.is_file().then_some(hpc_config);
            submitter::submit_jobs(&config_file, hpc_config.as_deref(), &output, &options)
        }
        Commands::TrySubmitJobs { output } => {
            logging::setup_logging(&output.join(common::SUBMIT_JOBS_LOG), cli.verbose)?;
            let outcome = submitter::try_submit_jobs(&output)?;
            println!(
                "is_complete={} submitted_batches={} new_results={}",
                outcome.is_complete, outcome.num_submitted_batches, outcome.num_new_results
            );
            Ok(RunStatus::Good)
        }
        Commands::CancelJobs { output } => {
            logging::setup_logging(&output.join(common::SUBMIT_JOBS_LOG), cli.verbose)?;
            submitter::cancel_jobs(&output)?;
            println!("Canceled the run in {}", output.display());
            Ok(RunStatus::Good)
        }
        Commands::ResubmitJobs {
            output,
            failed,
            missing,
        } => {
            logging::setup_logging(&output.join(common::SUBMIT_JOBS_LOG), cli.verbose)?;
            // Default: both categories.
            let (failed, missing) = if !failed && !missing {
                (true, true)
            } else {
                (failed, missing)
            };
            submitter::resubmit_jobs(&output, failed, missing)
        }
        Commands::ShowResults { output } => {
            logging::setup_console_logging(cli.verbose);
            let state = Cluster::new(&output).read_state()?;
            println!(
                "{}",
                results_summary::build_results_table(&state.completed_results)
            );
            let summary = results_summary::ResultsSummary::new(&state.completed_results);
            println!(
                "\nNum successful: {}\nNum failed: {}\nNum canceled: {}\nNum missing: {}\nTotal: {}",
                summary.num_successful,
                summary.num_failed,
                summary.num_canceled,
                summary.num_missing,
                summary.total()
            );
            if summary.all_successful() {
                Ok(RunStatus::Good)
            } else {
                Ok(RunStatus::JobsFailed)
            }
        }
    }
}
