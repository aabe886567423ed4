//! Logger setup for the CLI entry points.
//!
//! Each entry point logs to a file inside the output directory so that runs
//! on compute nodes leave their history next to the results they produced.

use std::fs::OpenOptions;
use std::path::Path;

use env_logger::Builder;
use log::LevelFilter;

use crate::errors::Result;

/// Initialize the global logger with a file target.
///
/// The file is opened in append mode: a node runner that restarts (or a
/// second try-submit invocation) extends the existing log instead of
/// clobbering it.
pub fn setup_logging(filename: &Path, verbose: bool) -> Result<()> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)?;
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder = Builder::from_default_env();
    builder
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .filter_level(level)
        .try_init()
        .ok();
    Ok(())
}

/// Console-only logging for commands that report directly to the user.
pub fn setup_console_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder = Builder::from_default_env();
    builder.filter_level(level).try_init().ok();
}
