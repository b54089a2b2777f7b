//! Planning and execution for single inputs.
//!
//! This module provides:
//! - [`Planner`]: works out which stages an input still needs
//! - [`PipelineExecutor`]: runs those stages and classifies failures
//! - [`Pipeline`]: lease, plan and execute for one input in a single call

mod executor;
mod planner;
mod result;
mod retry;

pub use executor::{ExecutionState, ExecutorConfig, PipelineExecutor};
pub use planner::{PipelinePlan, PlanOrigin, Planner};
pub use result::{ExecutionResult, Outcome};
pub use retry::{decide, BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicy, RetryState};

use crate::cancellation::CancellationToken;
use crate::compression::expand_input;
use crate::config::{PipelineConfig, Toolkit};
use crate::discovery::InputFile;
use crate::errors::{PlanningError, RstflowError};
use crate::events::{EventSink, LoggingEventSink, PIPELINE_ABORTED};
use crate::input::{ExtensionValidator, InputValidator};
use crate::registry::StageRegistry;
use crate::runner::{ProcessRunner, TokioProcessRunner};
use crate::store::ArtifactStore;
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything needed to bring one input up to a target stage.
pub struct Pipeline {
    registry: Arc<StageRegistry>,
    store: Arc<ArtifactStore>,
    runner: Arc<dyn ProcessRunner>,
    validator: Arc<dyn InputValidator>,
    events: Arc<dyn EventSink>,
    config: ExecutorConfig,
    planner: Planner,
    executor: PipelineExecutor,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.registry.stage_names())
            .field("output_dir", &self.store.output_dir())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline with the extension validator and a logging sink.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        store: Arc<ArtifactStore>,
        runner: Arc<dyn ProcessRunner>,
        config: ExecutorConfig,
    ) -> Self {
        Self::assemble(
            registry,
            store,
            runner,
            Arc::new(ExtensionValidator::new()),
            Arc::new(LoggingEventSink::debug()),
            config,
        )
    }

    fn assemble(
        registry: Arc<StageRegistry>,
        store: Arc<ArtifactStore>,
        runner: Arc<dyn ProcessRunner>,
        validator: Arc<dyn InputValidator>,
        events: Arc<dyn EventSink>,
        config: ExecutorConfig,
    ) -> Self {
        let planner = Planner::new(Arc::clone(&registry), Arc::clone(&store), Arc::clone(&validator));
        let executor = PipelineExecutor::new(
            Arc::clone(&store),
            Arc::clone(&runner),
            Arc::clone(&events),
            config.clone(),
        );
        Self {
            registry,
            store,
            runner,
            validator,
            events,
            config,
            planner,
            executor,
        }
    }

    /// Replaces the input validator.
    #[must_use]
    pub fn with_validator(self, validator: Arc<dyn InputValidator>) -> Self {
        Self::assemble(self.registry, self.store, self.runner, validator, self.events, self.config)
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(self, events: Arc<dyn EventSink>) -> Self {
        Self::assemble(self.registry, self.store, self.runner, self.validator, events, self.config)
    }

    /// Builds a pipeline from configuration.
    ///
    /// Locates the toolkit, loads the stage table, creates the output
    /// directory and reconciles the store with what is already on disk.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the toolkit or stage table is
    /// unusable, or a store error if the output directory cannot be
    /// prepared.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, RstflowError> {
        config.validate()?;
        let toolkit = Toolkit::locate(&config.toolkit)?;
        let registry = Arc::new(config.build_registry(&toolkit)?);

        std::fs::create_dir_all(&config.output_dir)?;
        let store = ArtifactStore::new(Arc::clone(&registry), &config.output_dir).with_checksums(config.checksums);
        let summary = store.reconcile()?;
        info!(
            output_dir = %config.output_dir.display(),
            indexed = summary.indexed,
            partials_removed = summary.partials_removed,
            "Artifact store ready"
        );

        let executor_config = ExecutorConfig::new(config.working_dir())
            .with_env(toolkit.env().clone())
            .with_timeout(config.timeout())
            .with_retry(config.retry.clone());

        Ok(Self::new(
            registry,
            Arc::new(store),
            Arc::new(TokioProcessRunner::new()),
            executor_config,
        ))
    }

    /// Plans `input` without running anything.
    ///
    /// # Errors
    ///
    /// Returns the planner's error.
    pub fn plan(&self, input: &InputFile, target_stage: &str) -> Result<PipelinePlan, PlanningError> {
        self.planner.plan(&input.path, &input.key, target_stage)
    }

    /// Brings `input` up to `target_stage`.
    ///
    /// Holds the key's lease for the whole run, so two inputs with the same
    /// radar and time window never interleave. An archived input that has to
    /// be read by a tool is expanded into the radar's output directory first
    /// and the copy is discarded afterwards. Planning and expansion errors
    /// are reported as [`Outcome::Aborted`].
    pub async fn run(&self, input: &InputFile, target_stage: &str, cancel: &CancellationToken) -> ExecutionResult {
        let start = Instant::now();
        let _lease = self.store.lease(&input.key).await;

        let prepared = match self.plan(input, target_stage) {
            Ok(plan) => self.expand_archive(input, plan).await,
            Err(e) => Err(e),
        };
        let (plan, expanded) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.abort(input, target_stage, &e, start),
        };

        let mut result = self.executor.execute(&plan, cancel).await;
        if let Some(path) = expanded {
            discard_expanded(&path).await;
            result.input_file.clone_from(&input.path);
        }
        result
    }

    /// Swaps an archived raw input for a plain copy when a tool will read it.
    async fn expand_archive(
        &self,
        input: &InputFile,
        mut plan: PipelinePlan,
    ) -> Result<(PipelinePlan, Option<PathBuf>), PlanningError> {
        let adopted_raw = matches!(plan.origin, PlanOrigin::RawInput { .. });
        let needs_tool = plan.steps.iter().any(|step| !plan.is_adopted(step));
        if !adopted_raw || !needs_tool || !input.codec().is_compressed() {
            return Ok((plan, None));
        }

        let archive = input.path.clone();
        let dir = self.store.output_dir().join(input.key.radar_id.as_str());
        let expanded = tokio::task::spawn_blocking(move || expand_input(&archive, &dir))
            .await
            .map_err(|e| io::Error::other(e.to_string()))
            .and_then(|res| res)
            .map_err(|e| PlanningError::InvalidInput {
                input: input.path.clone(),
                message: format!("cannot expand {} archive: {e}", input.codec()),
            })?;

        info!(key = %input.key, archive = %input.path.display(), expanded = %expanded.display(), "Archived input expanded");
        plan.input_file.clone_from(&expanded);
        Ok((plan, Some(expanded)))
    }

    fn abort(&self, input: &InputFile, target_stage: &str, e: &PlanningError, start: Instant) -> ExecutionResult {
        warn!(key = %input.key, input = %input.path.display(), error = %e, "Planning failed");
        self.events.try_emit(
            PIPELINE_ABORTED,
            Some(json!({
                "key": input.key.to_string(),
                "input": input.path.display().to_string(),
                "target": target_stage,
                "error": e.to_string(),
            })),
        );
        ExecutionResult::aborted(input, target_stage, e.to_string(), start.elapsed())
    }

    /// Returns the stage registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// Returns the artifact store.
    #[must_use]
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Returns the event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }
}

async fn discard_expanded(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Expanded input discarded"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to discard expanded input"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::registry::StageDescriptor;
    use crate::testing::{write_input, ScriptedRunner};
    use pretty_assertions::assert_eq;

    fn pipeline(dir: &std::path::Path, runner: Arc<ScriptedRunner>) -> Pipeline {
        let registry = Arc::new(
            StageRegistry::from_descriptors([
                StageDescriptor::source("raw", "dat"),
                StageDescriptor::tool("filtered", "raw", "/opt/rst/bin/filter", "filtered"),
                StageDescriptor::tool("fitted", "filtered", "/opt/rst/bin/fit", "fitted"),
            ])
            .unwrap(),
        );
        let store = Arc::new(ArtifactStore::new(Arc::clone(&registry), dir.join("out")));
        Pipeline::new(registry, store, runner, ExecutorConfig::new(dir))
    }

    #[tokio::test]
    async fn test_run_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = pipeline(dir.path(), Arc::clone(&runner)).with_event_sink(events.clone());
        let input = write_input(dir.path(), "20240101.0000", "sas", "dat", "raw").unwrap();

        let first = pipeline.run(&input, "fitted", &CancellationToken::new()).await;
        assert!(first.is_success());
        assert_eq!(first.produced_artifacts.len(), 2);

        pipeline.store().invalidate(&input.key, "fitted").await;
        assert_eq!(pipeline.plan(&input, "fitted").unwrap().stage_names(), vec!["fitted"]);

        let second = pipeline.run(&input, "fitted", &CancellationToken::new()).await;
        assert!(second.is_success());
        assert_eq!(runner.call_count("filter"), 1);
        assert_eq!(runner.call_count("fit"), 2);
        assert_eq!(events.events_of_type("pipeline.completed").len(), 2);
    }

    #[tokio::test]
    async fn test_planning_errors_become_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = pipeline(dir.path(), Arc::clone(&runner)).with_event_sink(events.clone());
        let input = write_input(dir.path(), "20240101.0000", "sas", "dat", "raw").unwrap();

        let result = pipeline.run(&input, "grid", &CancellationToken::new()).await;
        match &result.outcome {
            Outcome::Aborted { reason } => assert!(reason.contains("grid")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(runner.calls().is_empty());
        assert_eq!(events.event_types(), vec!["pipeline.aborted"]);
    }

    #[tokio::test]
    async fn test_archived_input_is_expanded_for_the_first_tool() {
        use crate::compression::{compress_file, Codec};

        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        runner.on_call(move |request| {
            if request.executable.ends_with("filter") {
                let input = PathBuf::from(&request.args[0]);
                let content = std::fs::read_to_string(&input).unwrap_or_default();
                hook_seen.lock().push((input, content));
            }
        });
        let pipeline = pipeline(dir.path(), Arc::clone(&runner));

        let plain = write_input(dir.path(), "20240101.0000", "sas", "dat", "raw records").unwrap();
        let archive = dir.path().join("20240101.0000.00.sas.dat.bz2");
        compress_file(&plain.path, &archive, Codec::Bzip2).unwrap();
        std::fs::remove_file(&plain.path).unwrap();
        let input = InputFile::from_path(&archive, "dat").unwrap();

        let result = pipeline.run(&input, "fitted", &CancellationToken::new()).await;

        assert!(result.is_success());
        assert_eq!(result.input_file, archive);
        let seen = seen.lock().clone();
        let expanded = dir.path().join("out").join("sas").join("20240101.0000.00.sas.dat");
        assert_eq!(seen, vec![(expanded.clone(), "raw records".to_string())]);
        assert!(!expanded.exists());
        assert!(archive.exists());
        assert_eq!(runner.call_count("fit"), 1);
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = pipeline(dir.path(), Arc::clone(&runner)).with_event_sink(events.clone());
        let archive = dir.path().join("20240101.0000.00.sas.dat.gz");
        std::fs::write(&archive, "not gzip at all").unwrap();
        let input = InputFile::from_path(&archive, "dat").unwrap();

        let result = pipeline.run(&input, "fitted", &CancellationToken::new()).await;

        match &result.outcome {
            Outcome::Aborted { reason } => assert!(reason.contains("gz archive")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(runner.calls().is_empty());
        assert_eq!(events.event_types(), vec!["pipeline.aborted"]);
        let leftovers = std::fs::read_dir(dir.path().join("out").join("sas")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_same_key_runs_are_serialised() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().with_delay(std::time::Duration::from_millis(20)));
        let pipeline = pipeline(dir.path(), Arc::clone(&runner));
        let input = write_input(dir.path(), "20240101.0000", "sas", "dat", "raw").unwrap();

        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(
            pipeline.run(&input, "fitted", &cancel),
            pipeline.run(&input, "fitted", &cancel),
        );

        assert!(a.is_success() && b.is_success());
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(runner.peak_concurrency(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_from_config_with_fake_toolkit() {
        use crate::testing::FakeToolkit;

        let dir = tempfile::tempdir().unwrap();
        let fake = FakeToolkit::create(dir.path().join("rst")).unwrap();
        fake.install_rst_tools().unwrap();
        let config = PipelineConfig::new(dir.path().join("out"))
            .with_toolkit(fake.config())
            .with_checksums(true);
        let pipeline = Pipeline::from_config(&config).unwrap();
        let input = write_input(dir.path(), "20240115.0200", "sas", "rawacf", "raw records\n").unwrap();

        let result = pipeline.run(&input, "grid", &CancellationToken::new()).await;

        assert_eq!(result.outcome, Outcome::Success);
        let stages: Vec<_> = result.produced_artifacts.iter().map(|a| a.stage_name.as_str()).collect();
        assert_eq!(stages, vec!["fitacf", "despeck", "grid"]);
        assert_eq!(result.metrics.get("despeck"), Some(&12.5));
        assert!(result.produced_artifacts.iter().all(|a| a.checksum.is_some()));

        let grid = pipeline.store().lookup(&input.key, "grid").unwrap();
        assert_eq!(
            grid.file_path,
            dir.path().join("out").join("sas").join("20240115.0200.grid.grid")
        );
        assert_eq!(
            std::fs::read_to_string(&grid.file_path).unwrap(),
            "grid\nfit -fitacf3\nraw records\n"
        );

        let reopened = Pipeline::from_config(&config).unwrap();
        assert_eq!(reopened.store().len(), 3);
        assert!(reopened.plan(&input, "grid").unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relative_paths_reach_the_tool() {
        use crate::testing::FakeToolkit;

        let dir = tempfile::tempdir_in(".").unwrap();
        let base = dir.path();
        assert!(base.is_relative());
        let fake = FakeToolkit::create(base.join("rst")).unwrap();
        fake.install_rst_tools().unwrap();
        std::fs::create_dir(base.join("raw")).unwrap();

        let config = PipelineConfig::new(base.join("out")).with_toolkit(fake.config());
        let pipeline = Pipeline::from_config(&config).unwrap();
        let input = write_input(&base.join("raw"), "20240115.0200", "sas", "rawacf", "raw records\n").unwrap();
        assert!(input.path.is_relative());

        let result = pipeline.run(&input, "fitacf", &CancellationToken::new()).await;

        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.input_file, input.path);
        let fitacf = pipeline.store().lookup(&input.key, "fitacf").unwrap();
        assert!(fitacf.file_path.is_absolute());
        assert_eq!(
            std::fs::read_to_string(&fitacf.file_path).unwrap(),
            "fit -fitacf3\nraw records\n"
        );
    }
}
