//! Batch coordination.
//!
//! Fans a set of inputs out over the pipeline with a bounded number in
//! flight. Each input runs in its own task; a failing or panicking input
//! never affects its siblings, and the batch call itself always returns a
//! report enumerating every distinct input.

mod report;

pub use crate::pipeline::{ExecutionResult, Outcome};
pub use report::{BatchReport, BatchSummary};

use crate::cancellation::CancellationToken;
use crate::discovery::{discover_inputs, InputFile};
use crate::events::{BATCH_COMPLETED, BATCH_STARTED};
use crate::pipeline::Pipeline;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

/// Reason recorded for inputs that never started.
pub const BATCH_CANCELLED: &str = "batch cancelled";

/// Reason passed to the token when the batch deadline elapses.
pub const DEADLINE_EXCEEDED: &str = "batch deadline exceeded";

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs many inputs through one [`Pipeline`].
#[derive(Debug)]
pub struct BatchCoordinator {
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
    deadline: Option<Duration>,
}

impl BatchCoordinator {
    /// Creates a coordinator with its own cancellation token.
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Uses `token` for cancellation, e.g. one shared with a signal handler.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancels the batch once `deadline` has elapsed since it started.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns the token that cancels this coordinator's batches.
    ///
    /// A cancelled token stays cancelled: later batches report every input
    /// as aborted.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Runs every input in `dir` named like a product with `extension`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn run_dir(
        &self,
        dir: &Path,
        extension: &str,
        target_stage: &str,
        max_concurrency: usize,
    ) -> std::io::Result<BatchReport> {
        let inputs = discover_inputs(dir, extension)?;
        Ok(self.run_batch(inputs, target_stage, max_concurrency).await)
    }

    /// Brings every input up to `target_stage`, at most `max_concurrency` at
    /// a time.
    ///
    /// Results are recorded in completion order. Duplicate input paths are
    /// run once. After cancellation no further input starts; inputs already
    /// running stop after their current stage, and the rest are reported as
    /// aborted with reason `"batch cancelled"`.
    pub async fn run_batch(&self, inputs: Vec<InputFile>, target_stage: &str, max_concurrency: usize) -> BatchReport {
        let max_concurrency = if max_concurrency == 0 {
            warn!("max_concurrency of 0 requested, using 1");
            1
        } else {
            max_concurrency
        };

        let mut seen = HashSet::new();
        let inputs: Vec<InputFile> = inputs.into_iter().filter(|i| seen.insert(i.path.clone())).collect();

        let report = BatchReport::new(target_stage);
        let span = info_span!("batch", batch_id = %report.batch_id, target = target_stage);
        self.run_inputs(report, inputs, max_concurrency)
            .instrument(span)
            .await
    }

    async fn run_inputs(&self, report: BatchReport, inputs: Vec<InputFile>, max_concurrency: usize) -> BatchReport {
        let events = Arc::clone(self.pipeline.events());
        let target_stage = report.target_stage.clone();
        let batch_id = report.batch_id;
        let total = inputs.len();

        events.try_emit(
            BATCH_STARTED,
            Some(json!({
                "batch_id": batch_id.to_string(),
                "target": target_stage,
                "inputs": total,
                "max_concurrency": max_concurrency,
            })),
        );
        info!(inputs = total, max_concurrency, "Batch started");

        let deadline_task = self.deadline.map(|limit| {
            let token = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(limit) => token.cancel(DEADLINE_EXCEEDED),
                    () = token.cancelled() => {}
                }
            })
        });

        let report = Arc::new(Mutex::new(report));
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut handles: Vec<(InputFile, JoinHandle<()>)> = Vec::with_capacity(total);
        let mut unscheduled = Vec::new();

        let mut pending = inputs.into_iter();
        while let Some(input) = pending.next() {
            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                unscheduled.push(input);
                unscheduled.extend(pending.by_ref());
                break;
            };

            let pipeline = Arc::clone(&self.pipeline);
            let cancel = self.cancel.clone();
            let report = Arc::clone(&report);
            let target = target_stage.clone();
            let task_input = input.clone();
            let handle = tokio::spawn(async move {
                let start = Instant::now();
                let run = AssertUnwindSafe(pipeline.run(&task_input, &target, &cancel)).catch_unwind();
                let result = match run.await {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(input = %task_input.path.display(), panic = %message, "Input panicked");
                        ExecutionResult::aborted(
                            &task_input,
                            &target,
                            format!("panicked: {message}"),
                            start.elapsed(),
                        )
                    }
                };
                report.lock().push(result);
                drop(permit);
            });
            handles.push((input, handle));
        }

        for (input, handle) in handles {
            if let Err(e) = handle.await {
                error!(input = %input.path.display(), error = %e, "Input task failed");
                report.lock().push(ExecutionResult::aborted(
                    &input,
                    &target_stage,
                    format!("task failed: {e}"),
                    Duration::ZERO,
                ));
            }
        }

        if !unscheduled.is_empty() {
            warn!(unscheduled = unscheduled.len(), "Batch cancelled before all inputs started");
        }
        for input in &unscheduled {
            report
                .lock()
                .push(ExecutionResult::aborted(input, &target_stage, BATCH_CANCELLED, Duration::ZERO));
        }

        if let Some(task) = deadline_task {
            task.abort();
        }

        let mut report = Arc::try_unwrap(report).map_or_else(|shared| shared.lock().clone(), Mutex::into_inner);
        let cancel_reason = if self.cancel.is_cancelled() {
            self.cancel.reason()
        } else {
            None
        };
        report.finish(cancel_reason);

        let summary = report.summary();
        events.try_emit(
            BATCH_COMPLETED,
            Some(json!({
                "batch_id": batch_id.to_string(),
                "target": target_stage,
                "summary": summary,
                "cancelled": report.cancelled,
            })),
        );
        report.log_summary();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureReason;
    use crate::events::CollectingEventSink;
    use crate::pipeline::ExecutorConfig;
    use crate::registry::{StageDescriptor, StageRegistry};
    use crate::store::ArtifactStore;
    use crate::testing::{write_input, ScriptedRunner, ScriptedStep};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn pipeline(out: &Path, runner: Arc<ScriptedRunner>, events: Arc<CollectingEventSink>) -> Arc<Pipeline> {
        let registry = Arc::new(
            StageRegistry::from_descriptors([
                StageDescriptor::source("raw", "dat"),
                StageDescriptor::tool("filtered", "raw", "/opt/rst/bin/filter", "filtered"),
                StageDescriptor::tool("fitted", "filtered", "/opt/rst/bin/fit", "fitted"),
            ])
            .unwrap(),
        );
        let store = Arc::new(ArtifactStore::new(Arc::clone(&registry), out));
        Arc::new(Pipeline::new(registry, store, runner, ExecutorConfig::new(out)).with_event_sink(events))
    }

    fn inputs(dir: &Path, count: usize) -> Vec<InputFile> {
        (0..count)
            .map(|i| write_input(dir, &format!("20240101.{i:02}00"), "sas", "dat", "raw").unwrap())
            .collect()
    }

    fn outcomes(report: &BatchReport) -> BTreeMap<PathBuf, Outcome> {
        report
            .results
            .iter()
            .map(|r| (r.input_file.clone(), r.outcome.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_outcomes_do_not_depend_on_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = inputs(dir.path(), 5);

        let empty = write_input(dir.path(), "20240102.0000", "sas", "dat", "").unwrap();
        batch.push(empty.clone());
        let wrong_type = dir.path().join("20240103.0000.00.sas.txt");
        std::fs::write(&wrong_type, "text").unwrap();
        batch.push(InputFile::new(&wrong_type, empty.key.clone()));

        let mut reports = Vec::new();
        for (max, out) in [(1, "out-serial"), (4, "out-parallel")] {
            let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(5)));
            let events = Arc::new(CollectingEventSink::new());
            let coordinator = BatchCoordinator::new(pipeline(&dir.path().join(out), Arc::clone(&runner), events));
            let report = coordinator.run_batch(batch.clone(), "fitted", max).await;
            assert!(runner.peak_concurrency() <= max);
            reports.push(report);
        }

        assert_eq!(reports[0].len(), 7);
        assert_eq!(outcomes(&reports[0]), outcomes(&reports[1]));
        assert_eq!(reports[0].summary().succeeded, 5);
        assert_eq!(reports[1].summary().aborted, 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let batch = inputs(dir.path(), 3);
        let runner = Arc::new(ScriptedRunner::new());
        let events = Arc::new(CollectingEventSink::new());
        let coordinator =
            BatchCoordinator::new(pipeline(&dir.path().join("out"), Arc::clone(&runner), events.clone()));

        let token = coordinator.cancellation_token().clone();
        runner.on_call(move |_| token.cancel("operator stop"));

        let report = coordinator.run_batch(batch.clone(), "fitted", 1).await;

        assert_eq!(runner.calls().len(), 1);
        assert!(report.cancelled);
        assert_eq!(report.cancel_reason.as_deref(), Some("operator stop"));
        assert_eq!(report.len(), 3);

        let first = report.get(&batch[0].path).unwrap();
        assert_eq!(first.final_stage_reached.as_deref(), Some("filtered"));
        assert!(matches!(&first.outcome, Outcome::Aborted { reason } if reason.contains("fitted")));
        for input in &batch[1..] {
            assert_eq!(
                report.get(&input.path).unwrap().outcome,
                Outcome::Aborted {
                    reason: BATCH_CANCELLED.to_string()
                }
            );
        }
        assert_eq!(events.events_of_type("batch.").len(), 2);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let batch = inputs(dir.path(), 3);
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("filter", [ScriptedStep::Panic, ScriptedStep::exit(3, "bad header")]);
        let events = Arc::new(CollectingEventSink::new());
        let coordinator = BatchCoordinator::new(pipeline(&dir.path().join("out"), Arc::clone(&runner), events));

        let report = coordinator.run_batch(batch, "fitted", 1).await;

        assert_eq!(report.len(), 3);
        assert!(matches!(&report.results[0].outcome, Outcome::Aborted { reason } if reason.contains("panicked")));
        assert!(matches!(
            &report.results[1].outcome,
            Outcome::PartialFailure {
                reason: FailureReason::NonZeroExit { code: Some(3), .. },
                ..
            }
        ));
        assert!(report.results[2].is_success());
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_duplicates_and_zero_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let mut batch = inputs(dir.path(), 2);
        batch.push(batch[0].clone());
        let runner = Arc::new(ScriptedRunner::new());
        let events = Arc::new(CollectingEventSink::new());
        let coordinator = BatchCoordinator::new(pipeline(&dir.path().join("out"), Arc::clone(&runner), events));

        let report = coordinator.run_batch(batch, "fitted", 0).await;

        assert_eq!(report.len(), 2);
        assert_eq!(report.summary().succeeded, 2);
        assert_eq!(runner.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_deadline_cancels_batch() {
        let dir = tempfile::tempdir().unwrap();
        let batch = inputs(dir.path(), 4);
        let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(40)));
        let events = Arc::new(CollectingEventSink::new());
        let coordinator = BatchCoordinator::new(pipeline(&dir.path().join("out"), Arc::clone(&runner), events))
            .with_deadline(Duration::from_millis(10));

        let report = coordinator.run_batch(batch, "fitted", 1).await;

        assert!(report.cancelled);
        assert_eq!(report.cancel_reason.as_deref(), Some(DEADLINE_EXCEEDED));
        assert_eq!(report.len(), 4);
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(report.summary().aborted, 4);
    }

    #[tokio::test]
    async fn test_run_dir_discovers_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir(&raw).unwrap();
        inputs(&raw, 2);
        std::fs::write(raw.join("notes.txt"), "x").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let events = Arc::new(CollectingEventSink::new());
        let coordinator = BatchCoordinator::new(pipeline(&dir.path().join("out"), runner, events));

        let report = coordinator.run_dir(&raw, "dat", "filtered", 2).await.unwrap();
        assert_eq!(report.summary().succeeded, 2);
    }
}
