//! Batch reports.

use crate::pipeline::{ExecutionResult, Outcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome counts for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Inputs in the report.
    pub total: usize,
    /// Inputs that reached the target.
    pub succeeded: usize,
    /// Inputs stopped by a stage failure.
    pub failed: usize,
    /// Inputs aborted before or between stages.
    pub aborted: usize,
}

/// Every input's outcome for one batch, in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    /// Unique id of the batch.
    pub batch_id: Uuid,
    /// Stage every input was driven towards.
    pub target_stage: String,
    /// When the batch started.
    pub started_at: DateTime<Utc>,
    /// When the last input finished.
    pub finished_at: DateTime<Utc>,
    /// Whether the batch was cancelled.
    pub cancelled: bool,
    /// Why it was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// One result per distinct input, in completion order.
    pub results: Vec<ExecutionResult>,
}

impl BatchReport {
    pub(crate) fn new(target_stage: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            batch_id: Uuid::new_v4(),
            target_stage: target_stage.into(),
            started_at: now,
            finished_at: now,
            cancelled: false,
            cancel_reason: None,
            results: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, result: ExecutionResult) {
        self.results.push(result);
    }

    pub(crate) fn finish(&mut self, cancel_reason: Option<String>) {
        self.finished_at = Utc::now();
        self.cancelled = cancel_reason.is_some();
        self.cancel_reason = cancel_reason;
    }

    /// Returns the result for `input`, if it was part of the batch.
    #[must_use]
    pub fn get(&self, input: &Path) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.input_file == input)
    }

    /// Returns results keyed by input path.
    #[must_use]
    pub fn by_input(&self) -> BTreeMap<&Path, &ExecutionResult> {
        self.results.iter().map(|r| (r.input_file.as_path(), r)).collect()
    }

    /// Returns the number of results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if the batch had no inputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Counts outcomes.
    #[must_use]
    pub fn summary(&self) -> BatchSummary {
        self.results.iter().fold(
            BatchSummary {
                total: self.results.len(),
                ..BatchSummary::default()
            },
            |mut acc, r| {
                match r.outcome {
                    Outcome::Success => acc.succeeded += 1,
                    Outcome::PartialFailure { .. } => acc.failed += 1,
                    Outcome::Aborted { .. } => acc.aborted += 1,
                }
                acc
            },
        )
    }

    /// Serializes the report as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes the report as JSON to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Logs the summary, and each unsuccessful input at warn level.
    pub fn log_summary(&self) {
        let summary = self.summary();
        let elapsed_ms = (self.finished_at - self.started_at).num_milliseconds();
        info!(
            batch_id = %self.batch_id,
            target = %self.target_stage,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            aborted = summary.aborted,
            cancelled = self.cancelled,
            elapsed_ms,
            "Batch finished"
        );
        for result in self.results.iter().filter(|r| !r.is_success()) {
            warn!(
                batch_id = %self.batch_id,
                input = %result.input_file.display(),
                outcome = %result.outcome,
                "Input did not reach target"
            );
        }
    }
}
