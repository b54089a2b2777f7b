//! Error types for the rstflow orchestration layer.
//!
//! Errors are split by the layer that raises them so callers can tell
//! configuration problems (fatal at startup) apart from per-input planning
//! and processing failures (captured into that input's result).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for rstflow operations.
#[derive(Debug, Error)]
pub enum RstflowError {
    /// The toolkit, registry, or configuration file is unusable.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A plan could not be computed for an input.
    #[error("{0}")]
    Planning(#[from] PlanningError),

    /// The artifact store rejected an operation.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// An external process could not be run to completion.
    #[error("{0}")]
    Process(#[from] ProcessError),

    /// A stage ran but did not produce a usable output.
    #[error("{0}")]
    Stage(#[from] StageFailure),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading configuration or the stage registry.
///
/// These are fatal: no input is processed when one occurs.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The toolkit root is unset, or a required binary is missing under it.
    #[error("RST toolkit not found: {message}")]
    ToolkitNotFound {
        /// What was looked for and where.
        message: String,
    },

    /// Two stages share a name.
    #[error("Duplicate stage definition: '{name}'")]
    DuplicateStage {
        /// The duplicated name.
        name: String,
    },

    /// A stage names a predecessor that is not registered.
    #[error("Stage '{stage}' depends on unknown stage '{predecessor}'")]
    DanglingPredecessor {
        /// The stage with the bad reference.
        stage: String,
        /// The missing predecessor.
        predecessor: String,
    },

    /// The predecessor graph contains a cycle.
    #[error("Cycle detected in stage registry: {}", path.join(" -> "))]
    CyclicRegistry {
        /// Stages forming the cycle, first stage repeated at the end.
        path: Vec<String>,
    },

    /// A stage definition is internally inconsistent.
    #[error("Invalid stage '{stage}': {message}")]
    InvalidStage {
        /// The offending stage.
        stage: String,
        /// Why it was rejected.
        message: String,
    },

    /// The configuration file could not be parsed.
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configuration file could not be read.
    #[error("Cannot read configuration {path}: {source}")]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl ConfigurationError {
    /// Creates a toolkit-not-found error.
    #[must_use]
    pub fn toolkit_not_found(message: impl Into<String>) -> Self {
        Self::ToolkitNotFound {
            message: message.into(),
        }
    }

    /// Creates an invalid-stage error.
    #[must_use]
    pub fn invalid_stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidStage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while resolving stages or computing a plan.
///
/// Reported per input; they never abort a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    /// No stage with this name is registered.
    #[error("Unknown stage: '{name}'")]
    UnknownStage {
        /// The requested name.
        name: String,
    },

    /// Walking predecessors revisited a stage.
    #[error("Cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency {
        /// The traversal path up to and including the revisited stage.
        path: Vec<String>,
    },

    /// Neither an existing artifact nor the input file grounds the chain.
    #[error("Cannot reach stage '{target}' from input {}", input.display())]
    UnsatisfiableTarget {
        /// The requested target stage.
        target: String,
        /// The input file.
        input: PathBuf,
    },

    /// The input file failed validation.
    #[error("Invalid input {}: {message}", input.display())]
    InvalidInput {
        /// The input file.
        input: PathBuf,
        /// Why it was rejected.
        message: String,
    },
}

impl PlanningError {
    /// Creates an unknown-stage error.
    #[must_use]
    pub fn unknown_stage(name: impl Into<String>) -> Self {
        Self::UnknownStage { name: name.into() }
    }
}

/// Errors raised by the artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The artifact's file does not exist.
    #[error("Invalid artifact: {} does not exist", path.display())]
    InvalidArtifact {
        /// The missing file.
        path: PathBuf,
    },

    /// Filesystem failure while scanning or deleting.
    #[error("Artifact store IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the process runner.
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// The executable path does not resolve to a runnable binary.
    #[error("Executable not found: {}", path.display())]
    ExecutableNotFound {
        /// The path that was tried.
        path: PathBuf,
    },

    /// The process exceeded its time limit and was killed.
    #[error("Process timed out after {:.1}s", after.as_secs_f64())]
    Timeout {
        /// The limit that was exceeded.
        after: Duration,
    },

    /// The OS refused to launch the process.
    #[error("Failed to spawn process: {message}")]
    SpawnFailure {
        /// OS error text.
        message: String,
        /// Whether a retry may succeed.
        transient: bool,
    },
}

impl ProcessError {
    /// Returns true if the executor may retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::SpawnFailure { transient, .. } => *transient,
            Self::ExecutableNotFound { .. } => false,
        }
    }
}

/// Why a stage did not produce a usable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The process exited with a code outside the stage's success set.
    NonZeroExit {
        /// The exit code, or `None` if the process was killed by a signal.
        code: Option<i32>,
        /// Last lines of stderr.
        stderr_tail: String,
    },
    /// The process succeeded but the declared output file is absent.
    MissingOutput,
    /// The declared output file exists but is empty.
    EmptyOutput,
    /// Every attempt timed out.
    Timeout,
    /// The stage's executable is missing.
    ExecutableNotFound,
    /// The process could not be launched.
    SpawnFailure {
        /// OS error text.
        message: String,
    },
}

impl FailureReason {
    /// Returns true for failures that are retried automatically.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit { code: Some(code), .. } => write!(f, "non-zero exit ({code})"),
            Self::NonZeroExit { code: None, .. } => write!(f, "terminated by signal"),
            Self::MissingOutput => write!(f, "missing output"),
            Self::EmptyOutput => write!(f, "empty output"),
            Self::Timeout => write!(f, "timeout"),
            Self::ExecutableNotFound => write!(f, "executable not found"),
            Self::SpawnFailure { message } => write!(f, "spawn failure: {message}"),
        }
    }
}

impl From<&ProcessError> for FailureReason {
    fn from(err: &ProcessError) -> Self {
        match err {
            ProcessError::ExecutableNotFound { .. } => Self::ExecutableNotFound,
            ProcessError::Timeout { .. } => Self::Timeout,
            ProcessError::SpawnFailure { message, .. } => Self::SpawnFailure {
                message: message.clone(),
            },
        }
    }
}

/// A classified stage failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Stage '{stage}' failed: {reason}")]
pub struct StageFailure {
    /// The failing stage.
    pub stage: String,
    /// The classified reason.
    pub reason: FailureReason,
}

impl StageFailure {
    /// Creates a new stage failure.
    #[must_use]
    pub fn new(stage: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            stage: stage.into(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_dependency_message() {
        let err = PlanningError::CyclicDependency {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_process_error_retryable() {
        assert!(ProcessError::Timeout {
            after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(ProcessError::SpawnFailure {
            message: "EAGAIN".to_string(),
            transient: true
        }
        .is_retryable());
        assert!(!ProcessError::SpawnFailure {
            message: "EINVAL".to_string(),
            transient: false
        }
        .is_retryable());
        assert!(!ProcessError::ExecutableNotFound {
            path: PathBuf::from("/nope")
        }
        .is_retryable());
    }

    #[test]
    fn test_failure_reason_from_process_error() {
        let reason = FailureReason::from(&ProcessError::Timeout {
            after: Duration::from_millis(5),
        });
        assert_eq!(reason, FailureReason::Timeout);
        assert!(reason.is_retryable());
        assert!(!FailureReason::MissingOutput.is_retryable());
    }

    #[test]
    fn test_failure_reason_serialize() {
        let json = serde_json::to_value(FailureReason::EmptyOutput).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "empty_output"}));

        let json = serde_json::to_value(FailureReason::NonZeroExit {
            code: Some(2),
            stderr_tail: "bad record".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "non_zero_exit");
        assert_eq!(json["code"], 2);
    }

    #[test]
    fn test_stage_failure_display() {
        let err = StageFailure::new("fitacf", FailureReason::NonZeroExit {
            code: Some(1),
            stderr_tail: String::new(),
        });
        assert_eq!(err.to_string(), "Stage 'fitacf' failed: non-zero exit (1)");
    }
}
