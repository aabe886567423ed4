//! Human-readable reports written when a run finalizes.

use std::path::Path;

use chrono::{Local, TimeZone};
use log::{info, warn};
use tabled::{Table, Tabled};

use crate::common;
use crate::errors::Result;
use crate::jobs::configuration::Configuration;
use crate::models::cluster_config::ClusterState;
use crate::result::JobResult;

#[derive(Tabled)]
struct ResultRow {
    index: usize,
    name: String,
    return_code: i32,
    status: String,
    exec_time_s: String,
    completion_time: String,
    batch_id: u64,
    hpc_job_id: String,
}

fn format_completion_time(timestamp: f64) -> String {
    Local
        .timestamp_opt(timestamp as i64, 0)
        .single()
        .map(|x| x.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Counts of terminal states across a run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResultsSummary {
    pub num_successful: usize,
    pub num_failed: usize,
    pub num_canceled: usize,
    pub num_missing: usize,
}

impl ResultsSummary {
    pub fn new(results: &[JobResult]) -> Self {
        let mut summary = ResultsSummary::default();
        for result in results {
            if result.is_successful() {
                summary.num_successful += 1;
            } else if result.is_canceled() {
                summary.num_canceled += 1;
            } else if result.is_missing() {
                summary.num_missing += 1;
            } else {
                summary.num_failed += 1;
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.num_successful + self.num_failed + self.num_canceled + self.num_missing
    }

    pub fn all_successful(&self) -> bool {
        self.num_successful == self.total()
    }
}

/// Render the results table, sorted by job ID.
pub fn build_results_table(results: &[JobResult]) -> String {
    let mut sorted: Vec<&JobResult> = results.iter().collect();
    sorted.sort_by_key(|x| x.job_id);
    let rows: Vec<ResultRow> = sorted
        .iter()
        .enumerate()
        .map(|(index, result)| ResultRow {
            index: index + 1,
            name: result.name.clone(),
            return_code: result.return_code,
            status: serde_json::to_string(&result.status)
                .unwrap_or_default()
                .trim_matches('"')
                .to_string(),
            exec_time_s: format!("{:.1}", result.exec_time_s),
            completion_time: format_completion_time(result.completion_time),
            batch_id: result.batch_id,
            hpc_job_id: result.hpc_job_id.clone(),
        })
        .collect();
    Table::new(rows).to_string()
}

/// Write `results.txt` and `errors.txt`.
pub fn write_reports(output: &Path, config: &Configuration, state: &ClusterState) -> Result<()> {
    let results = &state.completed_results;
    let summary = ResultsSummary::new(results);

    let mut text = format!(
        "Results from directory: {}\ntimestamp: {}\n\n",
        output.display(),
        Local::now().format("%Y-%m-%d %H:%M:%S"),
    );
    text.push_str(&build_results_table(results));
    text.push_str(&format!(
        "\n\nNum successful: {}\nNum failed: {}\nNum canceled: {}\nNum missing: {}\nTotal: {}\n",
        summary.num_successful,
        summary.num_failed,
        summary.num_canceled,
        summary.num_missing,
        summary.total(),
    ));
    std::fs::write(output.join(common::RESULTS_SUMMARY_FILE), &text)?;

    let mut errors = String::new();
    for result in results {
        if result.is_failed() || result.is_missing() {
            errors.push_str(&format!(
                "job={} job_id={} status={} return_code={} batch_id={} hpc_job_id={}\n",
                result.name,
                result.job_id,
                serde_json::to_string(&result.status)
                    .unwrap_or_default()
                    .trim_matches('"'),
                result.return_code,
                result.batch_id,
                result.hpc_job_id,
            ));
            let stderr_file = common::job_stderr_file(output, &result.name);
            if stderr_file.is_file() {
                errors.push_str(&format!("  stderr: {}\n", stderr_file.display()));
            }
        }
    }
    std::fs::write(output.join(common::ERRORS_FILE), &errors)?;

    if summary.num_failed == 0 && summary.num_missing == 0 {
        info!(
            "Successful={} Failed=0 Canceled={} Total={}",
            summary.num_successful,
            summary.num_canceled,
            summary.total()
        );
    } else {
        warn!(
            "Successful={} Failed={} Missing={} Canceled={} Total={}",
            summary.num_successful,
            summary.num_failed,
            summary.num_missing,
            summary.num_canceled,
            summary.total()
        );
    }

    if results.len() != config.num_jobs() {
        warn!(
            "Number of results doesn't match number of jobs: results={} jobs={}. \
             Check for process crashes or HPC timeouts.",
            results.len(),
            config.num_jobs()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::JobCompletionStatus;

    fn result(job_id: i64, return_code: i32, status: JobCompletionStatus) -> JobResult {
        JobResult::new(
            &job_id.to_string(),
            job_id,
            return_code,
            status,
            1.0,
            1,
            "",
            "out",
        )
    }

    #[test]
    fn test_summary_counts() {
        let results = vec![
            result(1, 0, JobCompletionStatus::Finished),
            result(2, 7, JobCompletionStatus::Finished),
            result(3, -1, JobCompletionStatus::Missing),
            result(4, 1, JobCompletionStatus::Canceled),
        ];
        let summary = ResultsSummary::new(&results);
        assert_eq!(summary.num_successful, 1);
        assert_eq!(summary.num_failed, 1);
        assert_eq!(summary.num_missing, 1);
        assert_eq!(summary.num_canceled, 1);
        assert_eq!(summary.total(), 4);
        assert!(!summary.all_successful());
    }

    #[test]
    fn test_table_is_sorted_by_job_id() {
        let mut second = result(2, 0, JobCompletionStatus::Finished);
        second.name = "zebra".to_string();
        let mut first = result(1, 0, JobCompletionStatus::Finished);
        first.name = "aardvark".to_string();
        let table = build_results_table(&[second, first]);
        assert!(table.contains("finished"));
        assert!(table.find("aardvark").unwrap() < table.find("zebra").unwrap());
    }
}
