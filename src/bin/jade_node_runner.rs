// This binary is only supported on Unix systems (HPC schedulers are
// Linux-only).
#[cfg(not(unix))]
fn main() {
    eprintln!("jade-node-runner is only supported on Unix systems.");
    std::process::exit(1);
}

#[cfg(unix)]
mod unix_main {
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::thread;

    use clap::{Parser, builder::styling};
    use log::{error, info};
    use signal_hook::consts::SIGTERM;
    use signal_hook::iterator::Signals;

    use jade::common;
    use jade::jobs::JobRunner;
    use jade::jobs::submitter::try_submit_jobs;
    use jade::logging::setup_logging;

    const STYLES: styling::Styles = styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default().bold())
        .usage(styling::AnsiColor::Green.on_default().bold())
        .literal(styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(styling::AnsiColor::Cyan.on_default());

    /// Runs one batch's jobs on an allocated compute node and participates
    /// in the distributed submitter protocol.
    #[derive(Parser, Debug)]
    #[command(name = "jade-node-runner")]
    #[command(about = "Per-node batch executor for JADE runs", long_about = None)]
    #[command(styles = STYLES)]
    struct Args {
        /// Filtered configuration for this batch.
        config_file: PathBuf,

        /// Output directory shared by the whole run.
        output: PathBuf,

        /// Batch ID assigned by the submitter.
        #[arg(long)]
        batch_id: u64,

        /// Maximum number of jobs to run concurrently; defaults to the
        /// group's setting, then the node CPU count.
        #[arg(short = 'q', long)]
        num_parallel_processes_per_node: Option<usize>,

        /// Do not try to submit more batches before and after this one.
        #[arg(long)]
        no_distributed_submitter: bool,

        /// Enable verbose log output.
        #[arg(long)]
        verbose: bool,
    }

    pub fn main() {
        let args = Args::parse();

        if let Err(e) = setup_logging(&common::run_jobs_log_file(&args.output), args.verbose) {
            eprintln!("Error configuring logging: {e}");
            std::process::exit(1);
        }

        let hostname = hostname::get()
            .map(|x| x.to_string_lossy().to_string())
            .unwrap_or_default();
        info!(
            "Starting node runner batch_id={} hostname={} config_file={:?}",
            args.batch_id, hostname, args.config_file
        );

        // Try to promote to submitter before running: completions from
        // other nodes may have unblocked more batches.
        if !args.no_distributed_submitter {
            try_submit(&args.output);
        }

        let mut runner = match JobRunner::new(&args.config_file, &args.output, args.batch_id) {
            Ok(runner) => runner,
            Err(e) => {
                error!("Failed to construct the job runner: {e}");
                std::process::exit(1);
            }
        };

        // When the scheduler is about to reach walltime it sends SIGTERM.
        // The handler sets a flag the runner checks every tick; in-flight
        // jobs are stopped without result rows so a later submitter marks
        // them missing.
        let termination_flag = runner.get_termination_flag();
        let mut signals = match Signals::new([SIGTERM]) {
            Ok(signals) => signals,
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                std::process::exit(1);
            }
        };
        thread::spawn(move || {
            for signal in signals.forever() {
                if signal == SIGTERM {
                    info!("Received SIGTERM; initiating shutdown");
                    termination_flag.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });

        let result = match runner.run_jobs(args.num_parallel_processes_per_node) {
            Ok(result) => result,
            Err(e) => {
                error!("Job runner failed: {e}");
                // Still try to hand the submitter role on so the run can
                // observe this batch's fate.
                if !args.no_distributed_submitter {
                    try_submit(&args.output);
                }
                std::process::exit(1);
            }
        };

        // Promote to submitter again: this node's completions may have
        // unblocked jobs, and if everything is terminal this call
        // finalizes the run.
        if !args.no_distributed_submitter {
            try_submit(&args.output);
        }

        info!(
            "Node runner exiting batch_id={} had_failures={} canceled={} terminated={}",
            args.batch_id, result.had_failures, result.canceled, result.terminated
        );
    }

    fn try_submit(output: &std::path::Path) {
        match try_submit_jobs(output) {
            Ok(outcome) => info!(
                "try-submit: is_complete={} submitted_batches={} new_results={}",
                outcome.is_complete, outcome.num_submitted_batches, outcome.num_new_results
            ),
            Err(e) => error!("try-submit failed: {e}"),
        }
    }
}

#[cfg(unix)]
fn main() {
    unix_main::main();
}
