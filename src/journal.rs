//! Execution journal: one record per CLI invocation.
//!
//! Every `plan` and `run` appends a line to `<job_dir>/execution.log` and,
//! when the job already has a `state.json`, an [`Execution`] entry to its
//! `executions` list. Journaling never fails the command that triggered it;
//! problems are logged and swallowed.

use crate::state::{Execution, StateStore};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Name of the append-only text journal inside the job directory.
pub const EXECUTION_LOG: &str = "execution.log";

/// Outcome recorded for an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Error => "ERROR",
        }
    }
}

/// `"{minutes}m {seconds:.3}s"`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs_f64();
    let minutes = (total / 60.0).floor() as u64;
    let seconds = total - (minutes as f64) * 60.0;
    format!("{minutes}m {seconds:.3}s")
}

/// Build the journal record for one invocation.
pub fn execution_record(
    program: &str,
    args: &[String],
    elapsed: Duration,
    outcome: Outcome,
    message: &str,
) -> Execution {
    Execution {
        datetime: chrono::Local::now().format("%Y-%m-%d:%H:%M:%S").to_string(),
        file: program.to_string(),
        args: args.join(" "),
        execution_time: format_elapsed(elapsed),
        status: outcome.as_str().to_string(),
        message: message.to_string(),
    }
}

/// The single-line form written to `execution.log`.
pub fn log_line(record: &Execution) -> String {
    format!(
        "[{}] {} {} | time=\"{}\" status=\"{}:{}\"",
        record.datetime,
        record.file,
        record.args,
        record.execution_time,
        record.status,
        record.message.replace('\n', "\\n"),
    )
}

/// Append `record` to the job's journal files.
///
/// The job directory is created if needed so that a failed `plan` is still
/// journaled.
pub fn record(job_dir: &Path, record: &Execution) {
    if let Err(e) = std::fs::create_dir_all(job_dir) {
        warn!("Cannot create job dir {} for journal: {}", job_dir.display(), e);
        return;
    }

    let log_path = job_dir.join(EXECUTION_LOG);
    let appended = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .and_then(|mut f| writeln!(f, "{}", log_line(record)));
    if let Err(e) = appended {
        warn!("Failed to append to {}: {}", log_path.display(), e);
    }

    let store = StateStore::new(job_dir);
    if store.exists() {
        let entry = record.clone();
        if let Err(e) = store.update(move |state| state.executions.push(entry)) {
            warn!("Failed to journal execution in state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::JobState;
    use std::path::PathBuf;

    #[test]
    fn elapsed_format() {
        assert_eq!(format_elapsed(Duration::from_millis(1_500)), "0m 1.500s");
        assert_eq!(format_elapsed(Duration::from_millis(125_250)), "2m 5.250s");
    }

    #[test]
    fn log_line_escapes_newlines() {
        let rec = Execution {
            datetime: "2026-01-02:03:04:05".into(),
            file: "catalog-extractor".into(),
            args: "run jobs/x".into(),
            execution_time: "0m 1.000s".into(),
            status: "ERROR".into(),
            message: "first\nsecond".into(),
        };
        assert_eq!(
            log_line(&rec),
            "[2026-01-02:03:04:05] catalog-extractor run jobs/x | time=\"0m 1.000s\" status=\"ERROR:first\\nsecond\""
        );
    }

    #[test]
    fn record_without_state_only_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("job");
        let rec = execution_record("catalog-extractor", &["plan".into()], Duration::ZERO, Outcome::Error, "boom");
        record(&job, &rec);

        let log = std::fs::read_to_string(job.join(EXECUTION_LOG)).unwrap();
        assert!(log.contains("status=\"ERROR:boom\""));
        assert!(!job.join("state.json").exists());
    }

    #[test]
    fn record_with_state_appends_execution() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store
            .create(
                &JobState {
                    catalog_source: PathBuf::from("c.pdf"),
                    working_dir: dir.path().to_path_buf(),
                    status: "ready".into(),
                    sections: vec![],
                    executions: vec![],
                },
                false,
            )
            .unwrap();

        let rec = execution_record("catalog-extractor", &["run".into()], Duration::from_secs(2), Outcome::Success, "ok");
        record(dir.path(), &rec);
        record(dir.path(), &rec);

        let state = store.load().unwrap();
        assert_eq!(state.executions.len(), 2);
        assert_eq!(state.executions[0].status, "SUCCESS");
        assert_eq!(state.executions[0].execution_time, "0m 2.000s");
    }
}
