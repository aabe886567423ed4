//! Staging and hand-off of per-job results.
//!
//! Each node runner appends completed-job rows to its own batch file,
//! `<output>/results/results_batch_<N>.csv`, flushing after every row so a
//! result is durable before the worker moves on. Whoever holds the cluster
//! lock drains those files into the cluster state, appends the rows to
//! `processed_results.csv`, and deletes the staging file — that deletion is
//! the hand-off.

use std::fs::OpenOptions;
use std::path::Path;

use log::{debug, warn};

use crate::common;
use crate::errors::{JadeError, Result};
use crate::result::JobResult;

pub struct ResultsAggregator;

impl ResultsAggregator {
    /// Append one result row to the batch staging file. The row is flushed
    /// and synced before returning.
    pub fn append(output: &Path, batch_id: u64, result: &JobResult) -> Result<()> {
        let filename = common::batch_results_file(output, batch_id);
        let write_header = !filename.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        writer.serialize(result)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| JadeError::Execution(format!("failed to flush results file: {e}")))?;
        file.sync_all()?;
        debug!(
            "Appended result job={} batch_id={} status={:?}",
            result.name, batch_id, result.status
        );
        Ok(())
    }

    /// Read the rows of one batch staging file. Partially-written trailing
    /// rows are skipped: the job they belong to has not durably completed.
    fn read_batch_file(filename: &Path) -> Result<Vec<JobResult>> {
        let mut reader = csv::Reader::from_path(filename)?;
        let mut results = Vec::new();
        for row in reader.deserialize() {
            match row {
                Ok(result) => results.push(result),
                Err(e) => warn!("Skipping malformed row in {:?}: {}", filename, e),
            }
        }
        Ok(results)
    }

    /// Drain every batch staging file into `processed_results.csv` and
    /// return the collected rows. Must be called while holding the cluster
    /// lock: this is the single-drainer side of the hand-off.
    pub fn drain(output: &Path) -> Result<Vec<JobResult>> {
        let results_dir = output.join(common::RESULTS_DIR);
        if !results_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut filenames: Vec<_> = std::fs::read_dir(&results_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|x| x.to_str())
                    .map(|x| x.starts_with("results_batch_") && x.ends_with(".csv"))
                    .unwrap_or(false)
            })
            .collect();
        filenames.sort();

        let mut all_results = Vec::new();
        for filename in filenames {
            let results = Self::read_batch_file(&filename)?;
            Self::append_processed(output, &results)?;
            std::fs::remove_file(&filename)?;
            debug!("Drained {} results from {:?}", results.len(), filename);
            all_results.extend(results);
        }
        Ok(all_results)
    }

    /// Append rows to the cumulative `processed_results.csv`. Also used for
    /// rows synthesized by a submitter (cascade cancellations, missing
    /// jobs), which never pass through a batch staging file.
    pub(crate) fn append_processed(output: &Path, results: &[JobResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let filename = common::processed_results_file(output);
        let write_header = !filename.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        for result in results {
            writer.serialize(result)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read the cumulative processed-results file.
    pub fn read_processed(output: &Path) -> Result<Vec<JobResult>> {
        let filename = common::processed_results_file(output);
        if !filename.is_file() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&filename)?;
        let mut results = Vec::new();
        for row in reader.deserialize() {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::JobCompletionStatus;

    fn make_result(name: &str, job_id: i64, return_code: i32) -> JobResult {
        JobResult::new(
            name,
            job_id,
            return_code,
            JobCompletionStatus::Finished,
            1.25,
            1,
            "4242",
            "out",
        )
    }

    #[test]
    fn test_append_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();

        ResultsAggregator::append(dir.path(), 1, &make_result("a", 1, 0)).unwrap();
        ResultsAggregator::append(dir.path(), 1, &make_result("b", 2, 7)).unwrap();
        ResultsAggregator::append(dir.path(), 2, &make_result("c", 3, 0)).unwrap();

        let drained = ResultsAggregator::drain(dir.path()).unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].name, "a");
        assert_eq!(drained[1].return_code, 7);

        // Staging files are deleted by the drain; the rows survive in
        // processed_results.csv.
        assert!(!common::batch_results_file(dir.path(), 1).exists());
        assert!(!common::batch_results_file(dir.path(), 2).exists());
        let processed = ResultsAggregator::read_processed(dir.path()).unwrap();
        assert_eq!(processed, drained);

        // A second drain finds nothing.
        assert!(ResultsAggregator::drain(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_names_with_commas_survive() {
        let dir = tempfile::tempdir().unwrap();
        common::create_output_dirs(dir.path()).unwrap();
        let result = make_result("job,with,commas", 1, 0);
        ResultsAggregator::append(dir.path(), 1, &result).unwrap();
        let drained = ResultsAggregator::drain(dir.path()).unwrap();
        assert_eq!(drained[0].name, "job,with,commas");
    }

    #[test]
    fn test_drain_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ResultsAggregator::drain(dir.path()).unwrap().is_empty());
    }
}
