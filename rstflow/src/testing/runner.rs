//! A scripted process runner.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ProcessError;
use crate::runner::{ProcessOutput, ProcessRequest, ProcessRunner};
use crate::store::STAGING_MARKER;

type CallHook = Arc<dyn Fn(&ProcessRequest) + Send + Sync>;

/// What one scripted invocation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedStep {
    /// Writes `content` to the output and exits 0.
    Succeed {
        /// Bytes written to the output file.
        content: String,
        /// Text reported on stderr.
        stderr: String,
    },
    /// Exits with `code` without writing output.
    ExitWith {
        /// Exit code.
        code: i32,
        /// Text reported on stderr.
        stderr: String,
    },
    /// Exits 0 without creating the output file.
    NoOutput,
    /// Exits 0 leaving a zero-length output file.
    EmptyOutput,
    /// Reports a timeout.
    Timeout,
    /// Reports a spawn failure.
    SpawnFailure {
        /// Whether the failure is transient.
        transient: bool,
    },
    /// Reports a missing executable.
    NotFound,
    /// Panics inside the runner.
    Panic,
}

impl ScriptedStep {
    /// Succeeds writing `content`.
    #[must_use]
    pub fn succeed(content: impl Into<String>) -> Self {
        Self::Succeed {
            content: content.into(),
            stderr: String::new(),
        }
    }

    /// Succeeds writing `content` and reporting `stderr`.
    #[must_use]
    pub fn succeed_with_stderr(content: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Succeed {
            content: content.into(),
            stderr: stderr.into(),
        }
    }

    /// Exits with `code`.
    #[must_use]
    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self::ExitWith {
            code,
            stderr: stderr.into(),
        }
    }
}

/// A [`ProcessRunner`] that plays back scripted steps instead of launching
/// processes.
///
/// Steps are queued per tool, where the tool is the file name of the
/// request's executable. Once a tool's queue is empty its fallback step is
/// used, and without a fallback the call succeeds writing `"<tool> output"`.
/// Output goes to the request's stdout path, or to the argument carrying
/// the staging marker when the stage writes its own output.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedStep>>>,
    fallbacks: Mutex<HashMap<String, ScriptedStep>>,
    calls: Mutex<Vec<ProcessRequest>>,
    hook: Mutex<Option<CallHook>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl std::fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("calls", &self.calls.lock().len())
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

fn tool_name(executable: &Path) -> String {
    executable
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn output_target(request: &ProcessRequest) -> Option<PathBuf> {
    request.stdout_path.clone().or_else(|| {
        request
            .args
            .iter()
            .find(|arg| arg.contains(STAGING_MARKER))
            .map(PathBuf::from)
    })
}

fn exited(code: i32, stderr: String) -> ProcessOutput {
    ProcessOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr,
        wall_time: Duration::from_millis(1),
    }
}

async fn write_output(path: Option<&Path>, content: &str) -> Result<(), ProcessError> {
    let Some(path) = path else {
        return Ok(());
    };
    tokio::fs::write(path, content)
        .await
        .map_err(|e| ProcessError::SpawnFailure {
            message: format!("scripted output {}: {e}", path.display()),
            transient: false,
        })
}

impl ScriptedRunner {
    /// Creates a runner where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call, keeping calls in flight long enough to overlap.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues steps for `tool`.
    pub fn script(&self, tool: &str, steps: impl IntoIterator<Item = ScriptedStep>) {
        self.scripts
            .lock()
            .entry(tool.to_string())
            .or_default()
            .extend(steps);
    }

    /// Sets the step used for `tool` once its queue is empty.
    pub fn always(&self, tool: &str, step: ScriptedStep) {
        self.fallbacks.lock().insert(tool.to_string(), step);
    }

    /// Runs `hook` at the start of every call.
    pub fn on_call(&self, hook: impl Fn(&ProcessRequest) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    /// Returns every request received, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProcessRequest> {
        self.calls.lock().clone()
    }

    /// Returns how many times `tool` was called.
    #[must_use]
    pub fn call_count(&self, tool: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|r| tool_name(&r.executable) == tool)
            .count()
    }

    /// Returns the largest number of calls that were running at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, tool: &str) -> ScriptedStep {
        if let Some(step) = self.scripts.lock().get_mut(tool).and_then(VecDeque::pop_front) {
            return step;
        }
        self.fallbacks
            .lock()
            .get(tool)
            .cloned()
            .unwrap_or_else(|| ScriptedStep::succeed(format!("{tool} output")))
    }

    async fn play(&self, request: &ProcessRequest, tool: &str) -> Result<ProcessOutput, ProcessError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let target = output_target(request);
        match self.next_step(tool) {
            ScriptedStep::Succeed { content, stderr } => {
                write_output(target.as_deref(), &content).await?;
                Ok(exited(0, stderr))
            }
            ScriptedStep::ExitWith { code, stderr } => Ok(exited(code, stderr)),
            ScriptedStep::NoOutput => Ok(exited(0, String::new())),
            ScriptedStep::EmptyOutput => {
                write_output(target.as_deref(), "").await?;
                Ok(exited(0, String::new()))
            }
            ScriptedStep::Timeout => Err(ProcessError::Timeout {
                after: request.timeout,
            }),
            ScriptedStep::SpawnFailure { transient } => Err(ProcessError::SpawnFailure {
                message: "scripted spawn failure".to_string(),
                transient,
            }),
            ScriptedStep::NotFound => Err(ProcessError::ExecutableNotFound {
                path: request.executable.clone(),
            }),
            ScriptedStep::Panic => panic!("scripted panic in {tool}"),
        }
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput, ProcessError> {
        let tool = tool_name(&request.executable);
        self.calls.lock().push(request.clone());
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(request);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.play(request, &tool).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
