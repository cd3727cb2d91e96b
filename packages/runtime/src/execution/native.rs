// ABOUTME: Native execution engine spawning `sh -c` processes in the tenant's host workspace
// ABOUTME: Each run gets its own process group so abort and timeout kill the whole tree

use super::{
    ActiveExecution, ActiveSessions, ExecutionEngine, ExecutionRequest, ExecutionResult,
    Outcome, OutputCapture, Result,
};
use crate::error::ExecutionError;
use crate::files::WorkspacePath;
use crate::sink::OutputChunk;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct NativeExecutionEngine {
    workspace: PathBuf,
    default_timeout: Duration,
    sessions: ActiveSessions,
}

impl NativeExecutionEngine {
    pub fn new(workspace: impl Into<PathBuf>, default_timeout: Duration) -> Self {
        Self {
            workspace: workspace.into(),
            default_timeout,
            sessions: ActiveSessions::new(),
        }
    }

    fn working_dir(&self, cwd: Option<&str>) -> Result<PathBuf> {
        let Some(cwd) = cwd else {
            return Ok(self.workspace.clone());
        };
        let path =
            WorkspacePath::parse(cwd).map_err(|_| ExecutionError::InvalidCwd(cwd.to_string()))?;
        let dir = path.on_host(&self.workspace);
        if !dir.is_dir() {
            return Err(ExecutionError::InvalidCwd(path.display()));
        }
        Ok(dir)
    }
}

#[async_trait]
impl ExecutionEngine for NativeExecutionEngine {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let mut guard = self
            .sessions
            .register(&request.session_id, &request.command)?;
        let dir = self.working_dir(request.cwd.as_deref())?;
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&request.command)
            .current_dir(&dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| ExecutionError::ExecFailed(format!("spawn failed: {}", e)))?;
        let pid = child.id();
        let (mut stdout, mut stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => return Err(ExecutionError::ExecFailed("child pipes unavailable".to_string())),
        };
        debug!(
            "Session {} started pid {:?}: {}",
            request.session_id, pid, request.command
        );

        let sink = request.sink.as_ref();
        let mut capture = OutputCapture::default();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        let mut out_open = true;
        let mut err_open = true;

        let outcome = loop {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => match read {
                    Ok(0) | Err(_) => out_open = false,
                    Ok(n) => {
                        let chunk = OutputChunk::stdout(Bytes::copy_from_slice(&out_buf[..n]));
                        if let Some(stopped) =
                            capture.push_until(sink, chunk, &mut guard, deadline, timeout).await
                        {
                            kill_group(pid);
                            break stopped;
                        }
                    }
                },
                read = stderr.read(&mut err_buf), if err_open => match read {
                    Ok(0) | Err(_) => err_open = false,
                    Ok(n) => {
                        let chunk = OutputChunk::stderr(Bytes::copy_from_slice(&err_buf[..n]));
                        if let Some(stopped) =
                            capture.push_until(sink, chunk, &mut guard, deadline, timeout).await
                        {
                            kill_group(pid);
                            break stopped;
                        }
                    }
                },
                status = child.wait(), if !out_open && !err_open => {
                    break match status {
                        Ok(status) => Outcome::Finished(exit_code(status)),
                        Err(e) => Outcome::Failed(format!("wait failed: {}", e)),
                    };
                }
                _ = guard.cancelled() => {
                    kill_group(pid);
                    break Outcome::Aborted;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    kill_group(pid);
                    break Outcome::TimedOut(timeout);
                }
            }
        };

        match &outcome {
            Outcome::Aborted => info!("Session {} aborted", request.session_id),
            Outcome::TimedOut(after) => {
                warn!("Session {} timed out after {:?}", request.session_id, after)
            }
            _ => {}
        }
        if !matches!(outcome, Outcome::Finished(_)) {
            let _ = child.start_kill();
        }

        capture.finish(outcome, &request.session_id)
    }

    async fn abort(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.cancel(session_id))
    }

    fn is_active(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    fn list_active(&self) -> Vec<ActiveExecution> {
        self.sessions.list()
    }
}

fn exit_code(status: std::process::ExitStatus) -> Option<i64> {
    if let Some(code) = status.code() {
        return Some(i64::from(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|signal| 128 + i64::from(signal))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        // Already gone
        debug!("killpg {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
