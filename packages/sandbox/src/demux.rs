// ABOUTME: Parser for the container engine's multiplexed exec output (8-byte framed stdout/stderr)
// ABOUTME: Two-state incremental demultiplexer whose output is independent of input chunking

use crate::engine::{EngineError, FrameStream};
use async_stream::stream;
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of a frame header: stream tag, three reserved bytes, big-endian u32 length.
pub const HEADER_LEN: usize = 8;

/// Upper bound on a single frame payload. Anything larger means the stream is not framed.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DemuxError {
    #[error("Unknown stream tag {0} in frame header")]
    UnknownStream(u8),
    #[error("Frame length {0} exceeds maximum of {MAX_FRAME_LEN} bytes")]
    FrameTooLarge(usize),
    #[error("Stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    /// Map a header tag to a channel. Tag 0 (stdin echo) goes to stdout, tag 3 (engine system error) to stderr.
    fn from_tag(tag: u8) -> Result<Self, DemuxError> {
        match tag {
            0 | 1 => Ok(Self::Stdout),
            2 | 3 => Ok(Self::Stderr),
            other => Err(DemuxError::UnknownStream(other)),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

/// One complete frame of exec output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub channel: Channel,
    pub payload: Bytes,
}

impl StreamFrame {
    pub fn stdout(payload: impl Into<Bytes>) -> Self {
        Self {
            channel: Channel::Stdout,
            payload: payload.into(),
        }
    }

    pub fn stderr(payload: impl Into<Bytes>) -> Self {
        Self {
            channel: Channel::Stderr,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeader,
    AwaitingPayload { channel: Channel, len: usize },
}

/// Incremental demultiplexer. Feed it chunks in arrival order; it returns every frame
/// completed by that chunk and keeps any partial header or payload for the next call.
#[derive(Debug)]
pub struct StreamDemuxer {
    state: State,
    buffer: BytesMut,
}

impl Default for StreamDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDemuxer {
    pub fn new() -> Self {
        Self {
            state: State::AwaitingHeader,
            buffer: BytesMut::new(),
        }
    }

    /// Consume a chunk and return the frames it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamFrame>, DemuxError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                State::AwaitingHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        break;
                    }
                    let header = self.buffer.split_to(HEADER_LEN);
                    let channel = Channel::from_tag(header[0])?;
                    let len =
                        u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
                    if len > MAX_FRAME_LEN {
                        return Err(DemuxError::FrameTooLarge(len));
                    }
                    self.state = State::AwaitingPayload { channel, len };
                }
                State::AwaitingPayload { channel, len } => {
                    if self.buffer.len() < len {
                        break;
                    }
                    let payload = self.buffer.split_to(len).freeze();
                    self.state = State::AwaitingHeader;
                    if !payload.is_empty() {
                        frames.push(StreamFrame { channel, payload });
                    }
                }
            }
        }

        Ok(frames)
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == State::AwaitingHeader && self.buffer.is_empty()
    }

    /// Signal end of input. Fails if the input stopped in the middle of a frame.
    pub fn finish(&self) -> Result<(), DemuxError> {
        if self.is_idle() {
            Ok(())
        } else {
            let pending_header = match self.state {
                State::AwaitingHeader => 0,
                State::AwaitingPayload { .. } => HEADER_LEN,
            };
            Err(DemuxError::Truncated {
                buffered: pending_header + self.buffer.remaining(),
            })
        }
    }
}

/// Encode a frame with the engine's header layout.
pub fn encode_frame(channel: Channel, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(channel.tag());
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Turn a raw multiplexed byte stream into a stream of frames.
pub fn demux_stream<S>(input: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, EngineError>> + Send + 'static,
{
    Box::pin(stream! {
        let mut demuxer = StreamDemuxer::new();
        let mut input = Box::pin(input);
        while let Some(chunk) = input.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            match demuxer.push(&chunk) {
                Ok(frames) => {
                    for frame in frames {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(EngineError::from(e));
                    return;
                }
            }
        }
        if let Err(e) = demuxer.finish() {
            yield Err(EngineError::from(e));
        }
    })
}
