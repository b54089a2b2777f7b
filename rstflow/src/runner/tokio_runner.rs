//! `tokio::process` implementation of the runner.

use super::{ProcessOutput, ProcessRequest, ProcessRunner};
use crate::errors::ProcessError;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Runs commands as child processes of the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    /// Creates a new runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn not_found(path: &Path) -> ProcessError {
    ProcessError::ExecutableNotFound {
        path: path.to_path_buf(),
    }
}

fn check_executable(path: &Path) -> Result<(), ProcessError> {
    let metadata = std::fs::metadata(path).map_err(|_| not_found(path))?;
    if !metadata.is_file() {
        return Err(not_found(path));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(not_found(path));
        }
    }
    Ok(())
}

fn classify_spawn_error(path: &Path, err: &io::Error) -> ProcessError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => not_found(path),
        kind => {
            // EMFILE / ENFILE: descriptor exhaustion clears up once siblings finish.
            let descriptors_exhausted = cfg!(unix) && matches!(err.raw_os_error(), Some(23 | 24));
            let transient = descriptors_exhausted
                || matches!(
                    kind,
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::OutOfMemory
                );
            ProcessError::SpawnFailure {
                message: err.to_string(),
                transient,
            }
        }
    }
}

fn drain<R>(reader: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    reader.map(|mut reader| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(e) = reader.read_to_end(&mut buf).await {
                debug!(error = %e, "Stream read ended early");
            }
            buf
        })
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    match handle {
        Some(handle) => match handle.await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(error = %e, "Output reader task failed");
                String::new()
            }
        },
        None => String::new(),
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput, ProcessError> {
        check_executable(&request.executable)?;

        let mut command = Command::new(&request.executable);
        command
            .args(&request.args)
            .current_dir(&request.working_dir)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &request.stdout_path {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(|e| ProcessError::SpawnFailure {
                    message: format!("cannot create {}: {e}", path.display()),
                    transient: false,
                })?;
                command.stdout(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::piped());
            }
        }

        debug!(command = %request.command_line(), cwd = %request.working_dir.display(), "Spawning process");
        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| classify_spawn_error(&request.executable, &e))?;

        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain(child.stderr.take());

        let status = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ProcessError::SpawnFailure {
                    message: format!("wait failed: {e}"),
                    transient: false,
                })
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out process");
                }
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    task.abort();
                }
                warn!(
                    command = %request.command_line(),
                    timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
                    "Process timed out and was killed"
                );
                return Err(ProcessError::Timeout {
                    after: request.timeout,
                });
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        let wall_time = started.elapsed();

        debug!(
            exit_code = ?status.code(),
            wall_ms = u64::try_from(wall_time.as_millis()).unwrap_or(u64::MAX),
            "Process finished"
        );

        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            wall_time,
        })
    }
}
