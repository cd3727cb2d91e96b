// ABOUTME: Sandboxed execution engine running commands through the Sandbox Manager's exec
// ABOUTME: Records the wrapper shell pid in the container so abort can kill the process tree there

use super::{
    ActiveExecution, ActiveSessions, ExecutionEngine, ExecutionRequest, ExecutionResult,
    Outcome, OutputCapture, Result,
};
use crate::error::ExecutionError;
use crate::files::WorkspacePath;
use crate::shell::{shell_quote, SandboxShell};
use crate::sink::OutputChunk;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_sandbox::{Channel, ExecSpec};

/// Budget for the small control commands around a run (cwd check, kill)
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SandboxedExecutionEngine {
    shell: SandboxShell,
    root: String,
    default_timeout: Duration,
    sessions: ActiveSessions,
}

impl SandboxedExecutionEngine {
    pub fn new(shell: SandboxShell, root: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            shell,
            root: root.into(),
            default_timeout,
            sessions: ActiveSessions::new(),
        }
    }

    async fn working_dir(&self, cwd: Option<&str>) -> Result<String> {
        let Some(cwd) = cwd else {
            return Ok(self.root.clone());
        };
        let path =
            WorkspacePath::parse(cwd).map_err(|_| ExecutionError::InvalidCwd(cwd.to_string()))?;
        let dir = path.in_container(&self.root);
        if !path.is_root() {
            let check = format!("[ -d {} ]", shell_quote(&dir));
            let output = self.shell.run(&check, CONTROL_TIMEOUT).await?;
            if !output.success() {
                return Err(ExecutionError::InvalidCwd(path.display()));
            }
        }
        Ok(dir)
    }

    /// Kill the recorded wrapper shell and everything below it
    async fn kill_remote(&self, pid_file: &str) {
        match self.shell.run(&kill_script(pid_file), CONTROL_TIMEOUT).await {
            Ok(_) => debug!("Killed remote process from {}", pid_file),
            Err(e) => warn!(
                "Failed to kill remote process for tenant {}: {}",
                self.shell.tenant_id(),
                e
            ),
        }
    }
}

/// Pid file path for one run of a session, safe to embed unquoted
fn pid_file(session_id: &str, run_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("/tmp/.warden-exec-{}-{}.pid", safe, run_id)
}

/// Records the wrapper pid, then exits if a kill landed before the pid existed
fn wrap_command(command: &str, dir: &str, pid_file: &str) -> String {
    format!(
        "printf '%s' \"$$\" > {pf}\n\
         if [ -e {pf}.cancel ]; then rm -f {pf} {pf}.cancel; exit 137; fi\n\
         cd {dir} || exit 1\n\
         sh -c {cmd}\n\
         rc=$?\n\
         rm -f {pf}\n\
         exit $rc",
        pf = pid_file,
        dir = shell_quote(dir),
        cmd = shell_quote(command),
    )
}

/// Marks the run cancelled before reading the pid file
fn kill_script(pid_file: &str) -> String {
    format!(
        "k() {{ kill -STOP \"$1\" 2>/dev/null; \
         for c in $(cat /proc/\"$1\"/task/*/children 2>/dev/null); do k \"$c\"; done; \
         kill -KILL \"$1\" 2>/dev/null; }}\n\
         : > {pf}.cancel\n\
         pid=$(cat {pf} 2>/dev/null) && [ -n \"$pid\" ] && {{ k \"$pid\"; rm -f {pf}.cancel; }}\n\
         rm -f {pf}",
        pf = pid_file
    )
}

#[async_trait]
impl ExecutionEngine for SandboxedExecutionEngine {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let mut guard = self
            .sessions
            .register(&request.session_id, &request.command)?;
        let dir = self.working_dir(request.cwd.as_deref()).await?;
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let run_id = Uuid::new_v4().simple().to_string();
        let pid_file = pid_file(&request.session_id, &run_id[..12]);

        let mut spec = ExecSpec::shell(wrap_command(&request.command, &dir, &pid_file));
        spec.env = request.env.clone();

        let handle = self
            .shell
            .manager()
            .exec(self.shell.tenant_id(), spec)
            .await?;
        let exec_id = handle.exec_id;
        let mut output = handle.output;
        debug!(
            "Session {} started exec {} for tenant {}",
            request.session_id,
            exec_id,
            self.shell.tenant_id()
        );

        let sink = request.sink.as_ref();
        let mut capture = OutputCapture::default();
        let deadline = tokio::time::Instant::now() + timeout;

        let outcome = loop {
            tokio::select! {
                frame = output.next() => match frame {
                    Some(Ok(frame)) => {
                        let chunk = match frame.channel {
                            Channel::Stdout => OutputChunk::stdout(frame.payload),
                            Channel::Stderr => OutputChunk::stderr(frame.payload),
                        };
                        if let Some(stopped) =
                            capture.push_until(sink, chunk, &mut guard, deadline, timeout).await
                        {
                            break stopped;
                        }
                    }
                    Some(Err(e)) => break Outcome::Failed(format!("output stream failed: {}", e)),
                    None => break Outcome::Finished(None),
                },
                _ = guard.cancelled() => break Outcome::Aborted,
                _ = tokio::time::sleep_until(deadline) => break Outcome::TimedOut(timeout),
            }
        };
        // Release the transport before any follow-up commands
        drop(output);

        let outcome = match outcome {
            Outcome::Finished(_) => {
                match self
                    .shell
                    .manager()
                    .exit_code(self.shell.tenant_id(), &exec_id)
                    .await
                {
                    Ok(code) => Outcome::Finished(code),
                    Err(e) => Outcome::Failed(e.to_string()),
                }
            }
            Outcome::Aborted => {
                info!("Session {} aborted", request.session_id);
                self.kill_remote(&pid_file).await;
                Outcome::Aborted
            }
            Outcome::TimedOut(after) => {
                warn!("Session {} timed out after {:?}", request.session_id, after);
                self.kill_remote(&pid_file).await;
                Outcome::TimedOut(after)
            }
            Outcome::Failed(reason) => {
                self.kill_remote(&pid_file).await;
                Outcome::Failed(reason)
            }
        };

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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pid_file_is_shell_safe() {
        assert_eq!(pid_file("chat-42_a", "r1"), "/tmp/.warden-exec-chat-42_a-r1.pid");
        assert_eq!(
            pid_file("a b;rm -rf /", "r1"),
            "/tmp/.warden-exec-a_b_rm_-rf__-r1.pid"
        );
    }

    #[test]
    fn test_wrapper_quotes_command_and_dir() {
        let script = wrap_command("echo 'hi' && ls", "/workspace/my dir", "/tmp/p.pid");
        assert!(script.contains("cd '/workspace/my dir' || exit 1"));
        assert!(script.contains("sh -c 'echo '\\''hi'\\'' && ls'"));
        assert!(script.ends_with("exit $rc"));
    }

    fn sh(script: &str) -> std::process::ExitStatus {
        std::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .status()
            .unwrap()
    }

    #[test]
    fn test_kill_before_pid_is_written_stops_the_wrapper() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("run.pid").display().to_string();
        let marker = dir.path().join("ran");

        // Nothing to kill yet
        assert!(sh(&kill_script(&pid_file)).success());

        let command = format!("touch {}", marker.display());
        let status = sh(&wrap_command(&command, "/", &pid_file));
        assert_eq!(status.code(), Some(137));
        assert!(!marker.exists());
        assert!(!std::path::Path::new(&pid_file).exists());
        assert!(!std::path::Path::new(&format!("{}.cancel", pid_file)).exists());
    }

    #[test]
    fn test_wrapper_runs_normally_without_cancel_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("run.pid").display().to_string();
        let marker = dir.path().join("ran");

        let command = format!("touch {}; exit 4", marker.display());
        let status = sh(&wrap_command(&command, "/", &pid_file));
        assert_eq!(status.code(), Some(4));
        assert!(marker.exists());
        assert!(!std::path::Path::new(&pid_file).exists());
    }
}
