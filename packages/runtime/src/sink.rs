// ABOUTME: Output sinks receiving command output chunks as they arrive
// ABOUTME: BufferSink accumulates for request/response callers, ChannelSink pushes to a live consumer

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
pub use warden_sandbox::Channel;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The consumer went away
    #[error("Output sink is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub channel: Channel,
    pub data: Bytes,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self {
            channel: Channel::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self {
            channel: Channel::Stderr,
            data: data.into(),
        }
    }
}

/// Destination for incremental command output. Transport agnostic.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write(&self, chunk: OutputChunk) -> Result<(), SinkError>;

    /// Whether chunks are pushed to a live consumer rather than buffered
    fn is_streaming(&self) -> bool;
}

#[derive(Default)]
struct Buffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
    chunks: usize,
}

/// Accumulates everything written to it
#[derive(Default)]
pub struct BufferSink {
    buffers: Mutex<Buffers>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&Buffers) -> R) -> R {
        let guard = self.buffers.lock().unwrap_or_else(|p| p.into_inner());
        f(&guard)
    }

    pub fn stdout(&self) -> String {
        self.with(|b| String::from_utf8_lossy(&b.stdout).into_owned())
    }

    pub fn stderr(&self) -> String {
        self.with(|b| String::from_utf8_lossy(&b.stderr).into_owned())
    }

    /// Both channels interleaved in arrival order
    pub fn combined(&self) -> String {
        self.with(|b| String::from_utf8_lossy(&b.combined).into_owned())
    }

    pub fn chunk_count(&self) -> usize {
        self.with(|b| b.chunks)
    }
}

#[async_trait]
impl OutputSink for BufferSink {
    async fn write(&self, chunk: OutputChunk) -> Result<(), SinkError> {
        let mut guard = self.buffers.lock().unwrap_or_else(|p| p.into_inner());
        match chunk.channel {
            Channel::Stdout => guard.stdout.extend_from_slice(&chunk.data),
            Channel::Stderr => guard.stderr.extend_from_slice(&chunk.data),
        }
        guard.combined.extend_from_slice(&chunk.data);
        guard.chunks += 1;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        false
    }
}

/// Pushes chunks over a bounded channel. A slow consumer applies backpressure.
pub struct ChannelSink {
    tx: mpsc::Sender<OutputChunk>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutputChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn write(&self, chunk: OutputChunk) -> Result<(), SinkError> {
        self.tx.send(chunk).await.map_err(|_| SinkError::Closed)
    }

    fn is_streaming(&self) -> bool {
        true
    }
}
