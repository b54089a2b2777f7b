//! Pipeline execution.
//!
//! Runs a [`PipelinePlan`] stage by stage for one input. Each stage writes
//! to a fresh staging path next to its final output; only a successful,
//! non-empty output is renamed into place and recorded, so a failed or
//! interrupted attempt never leaves a file a later run could mistake for a
//! finished product.

use super::planner::{PipelinePlan, PlanOrigin};
use super::result::{ExecutionResult, Outcome};
use super::retry::{decide, RetryDecision, RetryPolicy, RetryState};
use crate::cancellation::CancellationToken;
use crate::core::Artifact;
use crate::errors::{FailureReason, StageFailure};
use crate::events::{
    EventSink, PIPELINE_ABORTED, PIPELINE_COMPLETED, PIPELINE_FAILED, PIPELINE_STARTED, STAGE_COMPLETED,
    STAGE_FAILED, STAGE_RETRYING, STAGE_STARTED,
};
use crate::registry::{OutputMode, StageDescriptor};
use crate::runner::{ProcessOutput, ProcessRequest, ProcessRunner};
use crate::store::{absolute_path, artifact_path, staging_path, ArtifactStore};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Lines of stderr kept in a `NonZeroExit` failure.
const DEFAULT_STDERR_TAIL_LINES: usize = 20;

/// Settings shared by every stage invocation.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Working directory of tool processes.
    pub working_dir: PathBuf,
    /// Complete child environment.
    pub env: BTreeMap<String, String>,
    /// Timeout for stages that do not set their own.
    pub default_timeout: Duration,
    /// Retry policy for timeouts and transient spawn failures.
    pub retry: RetryPolicy,
    /// Lines of stderr kept on failure.
    pub stderr_tail_lines: usize,
}

impl ExecutorConfig {
    /// Creates a config with an empty environment, a 600s timeout and the
    /// default retry policy. A relative `working_dir` is made absolute.
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: absolute_path(&working_dir.into()),
            env: BTreeMap::new(),
            default_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
        }
    }

    /// Sets the child environment.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the default timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Not started.
    Idle,
    /// Running the step at this index.
    Running(usize),
    /// All steps succeeded.
    Succeeded,
    /// A step failed.
    Failed,
    /// Stopped between steps by cancellation.
    Cancelled,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running(i) => write!(f, "running({i})"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

struct StageSuccess {
    artifact: Artifact,
    metric: Option<f64>,
    attempts: usize,
}

struct StageError {
    failure: StageFailure,
    attempts: usize,
}

/// Runs plans against the store and a process runner.
pub struct PipelineExecutor {
    store: Arc<ArtifactStore>,
    runner: Arc<dyn ProcessRunner>,
    events: Arc<dyn EventSink>,
    config: ExecutorConfig,
}

impl fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn discard_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Discarded output file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to discard output file"),
    }
}

fn transition(from: ExecutionState, to: ExecutionState) -> ExecutionState {
    debug!(from = %from, to = %to, "Execution state changed");
    to
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

impl PipelineExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        store: Arc<ArtifactStore>,
        runner: Arc<dyn ProcessRunner>,
        events: Arc<dyn EventSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            runner,
            events,
            config,
        }
    }

    /// Returns the executor settings.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs every step of `plan`.
    ///
    /// Never fails as a call: stage failures and cancellation are reported
    /// in the returned result. The caller must hold the key's lease.
    pub async fn execute(&self, plan: &PipelinePlan, cancel: &CancellationToken) -> ExecutionResult {
        let span = info_span!(
            "pipeline",
            key = %plan.key,
            input = %plan.input_file.display(),
            target = %plan.target_stage,
        );
        self.execute_inner(plan, cancel).instrument(span).await
    }

    async fn execute_inner(&self, plan: &PipelinePlan, cancel: &CancellationToken) -> ExecutionResult {
        let start = Instant::now();
        let mut state = ExecutionState::Idle;
        let mut produced = Vec::new();
        let mut metrics = BTreeMap::new();
        let mut attempts = BTreeMap::new();
        let mut current_input = plan.origin_path().to_path_buf();
        let mut final_stage_reached = match &plan.origin {
            PlanOrigin::Artifact(artifact) => Some(artifact.stage_name.clone()),
            PlanOrigin::RawInput { .. } => None,
        };
        let mut outcome = Outcome::Success;

        self.events.try_emit(
            PIPELINE_STARTED,
            Some(json!({
                "key": plan.key.to_string(),
                "input": plan.input_file.display().to_string(),
                "target": plan.target_stage,
                "steps": plan.stage_names(),
                "skipped": plan.skipped,
            })),
        );

        for (index, stage) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
                state = transition(state, ExecutionState::Cancelled);
                outcome = Outcome::Aborted {
                    reason: format!("batch cancelled before stage '{}': {reason}", stage.name),
                };
                break;
            }
            state = transition(state, ExecutionState::Running(index));

            if plan.is_adopted(stage) {
                debug!(stage = %stage.name, input = %current_input.display(), "Input adopted as stage output");
                final_stage_reached = Some(stage.name.clone());
                continue;
            }

            match self.run_stage(plan, stage, &current_input, cancel).await {
                Ok(success) => {
                    current_input = success.artifact.file_path.clone();
                    final_stage_reached = Some(stage.name.clone());
                    attempts.insert(stage.name.clone(), success.attempts);
                    if let Some(value) = success.metric {
                        metrics.insert(stage.name.clone(), value);
                    }
                    produced.push(success.artifact);
                }
                Err(error) => {
                    attempts.insert(stage.name.clone(), error.attempts);
                    self.store.mark_failed(&plan.key, &stage.name);
                    state = transition(state, ExecutionState::Failed);
                    outcome = Outcome::PartialFailure {
                        stage: error.failure.stage,
                        reason: error.failure.reason,
                    };
                    break;
                }
            }
        }

        if outcome.is_success() {
            transition(state, ExecutionState::Succeeded);
        }

        let duration = start.elapsed();
        let (event, level_is_info) = match &outcome {
            Outcome::Success => (PIPELINE_COMPLETED, true),
            Outcome::PartialFailure { .. } => (PIPELINE_FAILED, false),
            Outcome::Aborted { .. } => (PIPELINE_ABORTED, false),
        };
        self.events.try_emit(
            event,
            Some(json!({
                "key": plan.key.to_string(),
                "outcome": outcome,
                "final_stage_reached": final_stage_reached,
                "duration_ms": duration.as_secs_f64() * 1000.0,
            })),
        );
        if level_is_info {
            info!(produced = produced.len(), duration_ms = duration.as_secs_f64() * 1000.0, "Input processed");
        } else {
            warn!(outcome = %outcome, "Input did not reach its target");
        }

        ExecutionResult {
            input_file: plan.input_file.clone(),
            radar_id: plan.key.radar_id.clone(),
            time_window: plan.key.time_window,
            target_stage: plan.target_stage.clone(),
            final_stage_reached,
            outcome,
            produced_artifacts: produced,
            skipped_stages: plan.skipped.clone(),
            metrics,
            attempts,
            duration,
        }
    }

    fn template_vars(
        &self,
        plan: &PipelinePlan,
        stage: &StageDescriptor,
        input: &Path,
        staging: &Path,
    ) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = stage
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let output_dir = staging.parent().unwrap_or(self.store.output_dir());
        vars.insert("input".to_string(), absolute_path(input).display().to_string());
        vars.insert("output".to_string(), staging.display().to_string());
        vars.insert("output_dir".to_string(), output_dir.display().to_string());
        vars.insert("radar".to_string(), plan.key.radar_id.to_string());
        vars.insert("window".to_string(), plan.key.time_window.slug());
        vars.insert("stage".to_string(), stage.name.clone());
        vars
    }

    async fn run_stage(
        &self,
        plan: &PipelinePlan,
        stage: &StageDescriptor,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<StageSuccess, StageError> {
        let span = info_span!("stage", stage = %stage.name);
        self.run_stage_inner(plan, stage, input, cancel).instrument(span).await
    }

    async fn run_stage_inner(
        &self,
        plan: &PipelinePlan,
        stage: &StageDescriptor,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<StageSuccess, StageError> {
        let stage_start = Instant::now();
        let mut retry_state = RetryState::new();
        let fail = |reason: FailureReason, attempts: usize| {
            self.events.try_emit(
                STAGE_FAILED,
                Some(json!({
                    "stage": stage.name,
                    "key": plan.key.to_string(),
                    "reason": reason,
                    "attempts": attempts,
                    "duration_ms": elapsed_ms(stage_start),
                })),
            );
            warn!(reason = %reason, attempts, "Stage failed");
            Err(StageError {
                failure: StageFailure::new(&stage.name, reason),
                attempts,
            })
        };

        let Some(executable) = stage.executable.as_deref().map(absolute_path) else {
            return fail(FailureReason::ExecutableNotFound, 0);
        };

        let final_path = artifact_path(self.store.output_dir(), &plan.key, &stage.name, &stage.output_extension);
        if let Some(parent) = final_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return fail(
                    FailureReason::SpawnFailure {
                        message: format!("cannot create {}: {e}", parent.display()),
                    },
                    0,
                );
            }
        }

        loop {
            retry_state.begin_attempt();
            let attempt = retry_state.attempts;
            let staging = staging_path(&final_path);

            let args = stage.args.render(&self.template_vars(plan, stage, input, &staging));
            let mut request = ProcessRequest::new(&executable, &self.config.working_dir)
                .with_args(args)
                .with_env(self.config.env.clone())
                .with_timeout(stage.timeout.unwrap_or(self.config.default_timeout));
            if stage.output_mode == OutputMode::Stdout {
                request = request.with_stdout_path(&staging);
            }

            self.events.try_emit(
                STAGE_STARTED,
                Some(json!({
                    "stage": stage.name,
                    "key": plan.key.to_string(),
                    "attempt": attempt,
                    "command": request.command_line(),
                })),
            );

            let (reason, retryable) = match self.runner.run(&request).await {
                Ok(output) => match self.check_output(stage, &output, &staging).await {
                    Ok(()) => match self.promote(plan, stage, &staging, &final_path).await {
                        Ok(artifact) => {
                            let metric = stage.extract_metric(&output.stderr);
                            self.events.try_emit(
                                STAGE_COMPLETED,
                                Some(json!({
                                    "stage": stage.name,
                                    "key": plan.key.to_string(),
                                    "attempts": attempt,
                                    "output": artifact.file_path.display().to_string(),
                                    "size_bytes": artifact.size_bytes,
                                    "metric": metric,
                                    "duration_ms": elapsed_ms(stage_start),
                                })),
                            );
                            info!(
                                output = %artifact.file_path.display(),
                                size_bytes = artifact.size_bytes,
                                metric = ?metric,
                                wall_ms = output.wall_time.as_secs_f64() * 1000.0,
                                "Stage completed"
                            );
                            return Ok(StageSuccess {
                                artifact,
                                metric,
                                attempts: attempt,
                            });
                        }
                        Err(reason) => (reason, false),
                    },
                    Err(reason) => (reason, false),
                },
                Err(err) => (FailureReason::from(&err), err.is_retryable()),
            };

            discard_file(&staging).await;

            match decide(&retry_state, &self.config.retry, retryable) {
                RetryDecision::Retry(delay) if !cancel.is_cancelled() => {
                    warn!(attempt, reason = %reason, delay_ms = delay.as_secs_f64() * 1000.0, "Stage attempt failed, retrying");
                    self.events.try_emit(
                        STAGE_RETRYING,
                        Some(json!({
                            "stage": stage.name,
                            "key": plan.key.to_string(),
                            "attempt": attempt,
                            "reason": reason,
                            "delay_ms": delay.as_secs_f64() * 1000.0,
                        })),
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return fail(reason, attempt),
                    }
                }
                _ => return fail(reason, attempt),
            }
        }
    }

    async fn check_output(
        &self,
        stage: &StageDescriptor,
        output: &ProcessOutput,
        staging: &Path,
    ) -> Result<(), FailureReason> {
        if !stage.is_success(output.exit_code) {
            debug!(stderr = %output.stderr, "Stage stderr");
            return Err(FailureReason::NonZeroExit {
                code: output.exit_code,
                stderr_tail: output.stderr_tail(self.config.stderr_tail_lines),
            });
        }
        match tokio::fs::metadata(staging).await {
            Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Ok(()),
            Ok(metadata) if metadata.is_file() => Err(FailureReason::EmptyOutput),
            _ => Err(FailureReason::MissingOutput),
        }
    }

    async fn promote(
        &self,
        plan: &PipelinePlan,
        stage: &StageDescriptor,
        staging: &Path,
        final_path: &Path,
    ) -> Result<Artifact, FailureReason> {
        if let Err(e) = tokio::fs::rename(staging, final_path).await {
            warn!(error = %e, "Failed to move staging file into place");
            return Err(FailureReason::MissingOutput);
        }

        let artifact = Artifact::new(plan.key.clone(), &stage.name, final_path).temporary(stage.temporary);
        self.record_promoted(artifact).await
    }

    /// Records a file already at its final path. A file the store refuses
    /// is deleted, so the next reconcile cannot index it as Built.
    async fn record_promoted(&self, artifact: Artifact) -> Result<Artifact, FailureReason> {
        let path = artifact.file_path.clone();
        let store = Arc::clone(&self.store);
        let error = match tokio::task::spawn_blocking(move || store.record(artifact)).await {
            Ok(Ok(artifact)) => return Ok(artifact),
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("recording task failed: {e}"),
        };
        warn!(error = %error, path = %path.display(), "Failed to record artifact, discarding output");
        discard_file(&path).await;
        Err(FailureReason::MissingOutput)
    }
}
