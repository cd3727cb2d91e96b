// ABOUTME: Dual-mode capability layer: execution, file operations and session discovery
// ABOUTME: Each capability has a native and a sandboxed implementation chosen per tenant

pub mod error;
pub mod execution;
pub mod factory;
pub mod files;
pub mod mode;
pub mod sessions;
pub mod shell;
pub mod sink;

pub use error::{CapabilityError, ExecutionError, FileOperationError, SessionError};
pub use execution::{
    ActiveExecution, ExecutionEngine, ExecutionRequest, ExecutionResult, NativeExecutionEngine,
    SandboxedExecutionEngine,
};
pub use factory::{Capabilities, CapabilityFactory};
pub use files::{
    Encoding, FileContent, FileNode, FileOperations, FileStat, NativeFileOperations, NodeKind,
    SandboxedFileOperations, WorkspacePath,
};
pub use mode::ModeResolver;
pub use sessions::{
    NativeSessionDiscovery, Page, PageRequest, SandboxedSessionDiscovery, SearchHit,
    SessionDiscovery, SessionSummary, TranscriptMessage,
};
pub use shell::SandboxShell;
pub use sink::{BufferSink, Channel, ChannelSink, OutputChunk, OutputSink, SinkError};
pub use warden_config::AdapterMode;
