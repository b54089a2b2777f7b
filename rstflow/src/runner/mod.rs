//! Process runner.
//!
//! Runs exactly one external command with an explicit working directory,
//! environment and timeout. Nothing is inherited from the parent process
//! implicitly. A non-zero exit code is returned as data; only failures to
//! launch or finish the process are errors.

mod tokio_runner;

pub use tokio_runner::TokioProcessRunner;

use crate::errors::ProcessError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A single command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    /// Path of the binary to run.
    pub executable: PathBuf,
    /// Arguments, already rendered.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub working_dir: PathBuf,
    /// Complete child environment.
    pub env: BTreeMap<String, String>,
    /// Wall-clock limit.
    pub timeout: Duration,
    /// When set, stdout is written to this file instead of being captured.
    pub stdout_path: Option<PathBuf>,
}

impl ProcessRequest {
    /// Creates a request with an empty environment and a 60s timeout.
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(60),
            stdout_path: None,
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the environment.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Redirects stdout into a file.
    #[must_use]
    pub fn with_stdout_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_path = Some(path.into());
        self
    }

    /// Renders the command line for logs.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.executable.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(path) = &self.stdout_path {
            line.push_str(" > ");
            line.push_str(&path.display().to_string());
        }
        line
    }
}

/// What a finished process reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout; empty when stdout was redirected to a file.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Elapsed wall time.
    #[serde(with = "duration_ms")]
    pub wall_time: Duration,
}

impl ProcessOutput {
    /// Returns true if the process exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Returns the last `lines` lines of stderr.
    #[must_use]
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Runs external commands.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs the request to completion.
    ///
    /// # Errors
    ///
    /// `ExecutableNotFound` if the binary cannot be run, `Timeout` if the
    /// limit elapsed (the process is killed), `SpawnFailure` for other
    /// launch errors.
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput, ProcessError>;
}

/// Serializes durations as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let request = ProcessRequest::new("/opt/rst/bin/make_fit", "/tmp")
            .with_args(["-fitacf3", "in.rawacf"])
            .with_stdout_path("/tmp/out.fitacf");
        assert_eq!(
            request.command_line(),
            "/opt/rst/bin/make_fit -fitacf3 in.rawacf > /tmp/out.fitacf"
        );
    }

    #[test]
    fn test_stderr_tail() {
        let output = ProcessOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "a\nb\nc\nd".to_string(),
            wall_time: Duration::from_millis(3),
        };
        assert_eq!(output.stderr_tail(2), "c\nd");
        assert_eq!(output.stderr_tail(10), "a\nb\nc\nd");
        assert!(!output.success());
    }

    #[test]
    fn test_output_serializes_wall_time_ms() {
        let output = ProcessOutput {
            exit_code: Some(0),
            stdout: "ok".to_string(),
            stderr: String::new(),
            wall_time: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["wall_time"], 1500);
    }
}
