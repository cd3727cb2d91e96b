// ABOUTME: Execution capability: run a tenant command, stream output to a sink, abort by session
// ABOUTME: Shared active-session tracking and output capture used by the native and sandboxed engines

pub mod native;
pub mod sandboxed;

use crate::error::ExecutionError;
use crate::sink::{OutputChunk, OutputSink, SinkError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

pub use native::NativeExecutionEngine;
pub use sandboxed::SandboxedExecutionEngine;

pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Captured output kept in an `ExecutionResult`. The sink still receives everything.
pub const MAX_CAPTURED_OUTPUT: usize = 1024 * 1024;

pub struct ExecutionRequest {
    pub command: String,
    /// Workspace-relative working directory
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    /// Upper-layer session this run belongs to; the key for `abort`
    pub session_id: String,
    pub sink: Arc<dyn OutputSink>,
    /// Falls back to the configured exec timeout
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(
        session_id: impl Into<String>,
        command: impl Into<String>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: HashMap::new(),
            session_id: session_id.into(),
            sink,
            timeout: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("command", &self.command)
            .field("cwd", &self.cwd)
            .field("session_id", &self.session_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// True when the command exited with status 0
    pub success: bool,
    /// Combined stdout and stderr in arrival order
    pub output: String,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub output_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveExecution {
    pub session_id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Run a command to completion, writing output to the request's sink as it arrives.
    ///
    /// A non-zero exit is a successful call with `success == false`.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult>;

    /// Kill the session's running command. Returns false when nothing was running.
    async fn abort(&self, session_id: &str) -> Result<bool>;

    fn is_active(&self, session_id: &str) -> bool;

    fn list_active(&self) -> Vec<ActiveExecution>;
}

struct ActiveEntry {
    info: ActiveExecution,
    cancel: watch::Sender<bool>,
}

/// Running executions keyed by session id
#[derive(Clone, Default)]
pub struct ActiveSessions {
    inner: Arc<Mutex<HashMap<String, ActiveEntry>>>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveEntry>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a run. The registration is dropped with the returned guard.
    pub fn register(&self, session_id: &str, command: &str) -> Result<ActiveGuard> {
        let mut map = self.lock();
        if map.contains_key(session_id) {
            return Err(ExecutionError::DuplicateSession(session_id.to_string()));
        }
        let (tx, rx) = watch::channel(false);
        map.insert(
            session_id.to_string(),
            ActiveEntry {
                info: ActiveExecution {
                    session_id: session_id.to_string(),
                    command: command.to_string(),
                    started_at: Utc::now(),
                },
                cancel: tx,
            },
        );
        Ok(ActiveGuard {
            sessions: self.clone(),
            session_id: session_id.to_string(),
            cancelled: rx,
        })
    }

    /// Signal cancellation. Returns whether the session was running.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.lock().get(session_id) {
            Some(entry) => {
                let _ = entry.cancel.send(true);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn list(&self) -> Vec<ActiveExecution> {
        let mut list: Vec<_> = self.lock().values().map(|e| e.info.clone()).collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }
}

pub struct ActiveGuard {
    sessions: ActiveSessions,
    session_id: String,
    cancelled: watch::Receiver<bool>,
}

impl ActiveGuard {
    /// Resolves once `abort` has been called for this session
    pub async fn cancelled(&mut self) {
        if *self.cancelled.borrow() {
            return;
        }
        while self.cancelled.changed().await.is_ok() {
            if *self.cancelled.borrow() {
                return;
            }
        }
        // Sender gone: never cancelled
        std::future::pending::<()>().await
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.sessions.lock().remove(&self.session_id);
    }
}

/// How a run ended, before it is turned into a result
#[derive(Debug)]
pub(crate) enum Outcome {
    Finished(Option<i64>),
    Aborted,
    TimedOut(Duration),
    Failed(String),
}

/// Combined output with a size cap
#[derive(Default)]
pub(crate) struct OutputCapture {
    buffer: Vec<u8>,
    truncated: bool,
    sink_closed: bool,
}

impl OutputCapture {
    /// Record a chunk and forward it to the sink.
    ///
    /// A closed sink stops forwarding but the command keeps running.
    #[cfg(test)]
    pub(crate) async fn push(&mut self, sink: &dyn OutputSink, chunk: OutputChunk) {
        self.record(&chunk);
        self.forward(sink, chunk).await;
    }

    /// Record a chunk and forward it, giving up on a stalled sink at abort or the deadline.
    ///
    /// Returns the outcome that interrupted delivery.
    pub(crate) async fn push_until(
        &mut self,
        sink: &dyn OutputSink,
        chunk: OutputChunk,
        guard: &mut ActiveGuard,
        deadline: Instant,
        timeout: Duration,
    ) -> Option<Outcome> {
        self.record(&chunk);
        tokio::select! {
            _ = self.forward(sink, chunk) => None,
            _ = guard.cancelled() => Some(Outcome::Aborted),
            _ = tokio::time::sleep_until(deadline) => Some(Outcome::TimedOut(timeout)),
        }
    }

    fn record(&mut self, chunk: &OutputChunk) {
        let room = MAX_CAPTURED_OUTPUT.saturating_sub(self.buffer.len());
        if chunk.data.len() > room {
            self.truncated = true;
        }
        self.buffer
            .extend_from_slice(&chunk.data[..chunk.data.len().min(room)]);
    }

    async fn forward(&mut self, sink: &dyn OutputSink, chunk: OutputChunk) {
        if self.sink_closed {
            return;
        }
        if let Err(SinkError::Closed) = sink.write(chunk).await {
            debug!("Output sink closed, continuing without it");
            self.sink_closed = true;
        }
    }

    pub(crate) fn finish(self, outcome: Outcome, session_id: &str) -> Result<ExecutionResult> {
        let output = String::from_utf8_lossy(&self.buffer).into_owned();
        match outcome {
            Outcome::Finished(exit_code) => Ok(ExecutionResult {
                success: exit_code == Some(0),
                error: match exit_code {
                    Some(0) => None,
                    Some(code) => Some(format!("Command exited with code {}", code)),
                    None => Some("Exit code unavailable".to_string()),
                },
                output,
                exit_code,
                output_truncated: self.truncated,
            }),
            Outcome::Aborted => Err(ExecutionError::Aborted(session_id.to_string())),
            Outcome::TimedOut(after) => Err(ExecutionError::Timeout { after }),
            Outcome::Failed(reason) => Err(ExecutionError::ExecFailed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{BufferSink, ChannelSink};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_duplicate_session_rejected_until_guard_drops() {
        let sessions = ActiveSessions::new();
        let guard = sessions.register("s1", "sleep 1").unwrap();
        assert!(matches!(
            sessions.register("s1", "echo again"),
            Err(ExecutionError::DuplicateSession(_))
        ));
        assert_eq!(sessions.list().len(), 1);
        assert_eq!(sessions.list()[0].command, "sleep 1");

        drop(guard);
        assert!(!sessions.contains("s1"));
        assert!(sessions.register("s1", "echo again").is_ok());
    }

    #[tokio::test]
    async fn test_cancel_wakes_guard() {
        let sessions = ActiveSessions::new();
        let mut guard = sessions.register("s1", "sleep 10").unwrap();
        assert!(sessions.cancel("s1"));
        tokio::time::timeout(Duration::from_secs(1), guard.cancelled())
            .await
            .expect("cancellation should be observed");
        assert!(!sessions.cancel("other"));
    }

    #[tokio::test]
    async fn test_capture_caps_result_but_not_sink() {
        let sink = BufferSink::new();
        let mut capture = OutputCapture::default();
        let big = vec![b'x'; MAX_CAPTURED_OUTPUT + 10];
        capture.push(&sink, OutputChunk::stdout(big)).await;

        let result = capture.finish(Outcome::Finished(Some(0)), "s1").unwrap();
        assert!(result.output_truncated);
        assert_eq!(result.output.len(), MAX_CAPTURED_OUTPUT);
        assert_eq!(sink.stdout().len(), MAX_CAPTURED_OUTPUT + 10);
    }

    #[tokio::test]
    async fn test_stalled_sink_yields_to_abort_and_deadline() {
        let sessions = ActiveSessions::new();
        let mut guard = sessions.register("s1", "yes").unwrap();
        let (sink, _rx) = ChannelSink::new(1);
        let mut capture = OutputCapture::default();
        let far = Instant::now() + Duration::from_secs(60);

        // Fills the only slot
        let first = capture
            .push_until(&sink, OutputChunk::stdout("a"), &mut guard, far, Duration::from_secs(60))
            .await;
        assert!(first.is_none());

        let deadline = Instant::now() + Duration::from_millis(100);
        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            capture.push_until(
                &sink,
                OutputChunk::stdout("b"),
                &mut guard,
                deadline,
                Duration::from_millis(100),
            ),
        )
        .await
        .expect("deadline should interrupt a stalled sink");
        assert!(matches!(stopped, Some(Outcome::TimedOut(_))));

        assert!(sessions.cancel("s1"));
        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            capture.push_until(&sink, OutputChunk::stdout("c"), &mut guard, far, Duration::from_secs(60)),
        )
        .await
        .expect("abort should interrupt a stalled sink");
        assert!(matches!(stopped, Some(Outcome::Aborted)));

        // Undelivered chunks still land in the result
        let result = capture.finish(Outcome::Finished(Some(0)), "s1").unwrap();
        assert_eq!(result.output, "abc");
    }

    #[tokio::test]
    async fn test_closed_sink_does_not_fail_the_run() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        let mut capture = OutputCapture::default();
        capture.push(&sink, OutputChunk::stdout("a")).await;
        capture.push(&sink, OutputChunk::stderr("b")).await;

        let result = capture.finish(Outcome::Finished(Some(3)), "s1").unwrap();
        assert!(!result.success);
        assert_eq!(result.output, "ab");
        assert_eq!(result.exit_code, Some(3));
    }
}
