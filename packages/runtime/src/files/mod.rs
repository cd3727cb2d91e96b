// ABOUTME: File Operations capability: one interface with native and sandboxed implementations
// ABOUTME: Both adapters share path resolution, result types, ordering and the error taxonomy

pub mod listing;
pub mod native;
pub mod paths;
pub mod sandboxed;

use crate::error::FileOperationError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use native::NativeFileOperations;
pub use paths::WorkspacePath;
pub use sandboxed::SandboxedFileOperations;

pub type Result<T> = std::result::Result<T, FileOperationError>;

/// Directories listed in a tree but never descended into
pub const SKIPPED_DIRS: [&str; 2] = [".git", "node_modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Utf8,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
    pub encoding: Encoding,
    /// Size in bytes of the decoded file
    pub size: u64,
}

impl FileContent {
    /// UTF-8 text when the bytes allow it, base64 otherwise
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        match String::from_utf8(bytes) {
            Ok(content) => Self {
                content,
                encoding: Encoding::Utf8,
                size,
            },
            Err(e) => Self {
                content: BASE64.encode(e.as_bytes()),
                encoding: Encoding::Base64,
                size,
            },
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        decode_content(&self.content, self.encoding)
    }
}

/// Bytes a caller asked to write
pub fn decode_content(content: &str, encoding: Encoding) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Utf8 => Ok(content.as_bytes().to_vec()),
        Encoding::Base64 => BASE64
            .decode(content.trim())
            .map_err(|e| FileOperationError::Failed(format!("invalid base64 content: {}", e))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    /// Workspace path, always starting with `/`
    pub path: String,
    pub kind: NodeKind,
    pub size: u64,
    /// `ls -l` style mode string, e.g. `drwxr-xr-x`
    pub permissions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// `None` for files and for directories beyond the requested depth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub path: String,
    pub kind: NodeKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Permission bits, e.g. `0o644`
    pub mode: u32,
}

#[async_trait]
pub trait FileOperations: Send + Sync {
    async fn read(&self, path: &str) -> Result<FileContent>;

    /// Write a file, creating parent directories. Returns the bytes written.
    async fn write(&self, path: &str, content: &str, encoding: Encoding) -> Result<u64>;

    /// Nested listing rooted at `path`. `depth` 1 lists direct children only.
    async fn tree(&self, path: &str, depth: usize) -> Result<FileNode>;

    async fn stat(&self, path: &str) -> Result<FileStat>;

    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create a directory and any missing parents
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Directories first, then everything else, each group by name
pub fn sort_nodes(nodes: &mut [FileNode]) {
    nodes.sort_by(|a, b| {
        let a_dir = a.kind == NodeKind::Directory;
        let b_dir = b.kind == NodeKind::Directory;
        b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
    });
}

pub fn is_skipped_dir(name: &str) -> bool {
    SKIPPED_DIRS.contains(&name)
}

pub(crate) fn check_write_size(path: &WorkspacePath, size: u64, limit: u64) -> Result<()> {
    if size > limit {
        return Err(FileOperationError::TooLarge {
            path: path.display(),
            size,
            limit,
        });
    }
    Ok(())
}

pub(crate) fn reject_root(path: &WorkspacePath) -> Result<()> {
    if path.is_root() {
        return Err(FileOperationError::PathTraversal(path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(name: &str, kind: NodeKind) -> FileNode {
        FileNode {
            name: name.to_string(),
            path: format!("/{}", name),
            kind,
            size: 0,
            permissions: String::new(),
            target: None,
            children: None,
        }
    }

    #[test]
    fn test_sort_puts_directories_first() {
        let mut nodes = vec![
            node("b.txt", NodeKind::File),
            node("src", NodeKind::Directory),
            node("a.txt", NodeKind::File),
            node("link", NodeKind::Symlink),
            node(".git", NodeKind::Directory),
        ];
        sort_nodes(&mut nodes);
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec![".git", "src", "a.txt", "b.txt", "link"]);
    }

    #[test]
    fn test_binary_content_is_base64() {
        let text = FileContent::from_bytes(b"hello".to_vec());
        assert_eq!(text.encoding, Encoding::Utf8);
        assert_eq!(text.content, "hello");

        let binary = FileContent::from_bytes(vec![0xff, 0x00, 0xfe]);
        assert_eq!(binary.encoding, Encoding::Base64);
        assert_eq!(binary.size, 3);
        assert_eq!(binary.into_bytes().unwrap(), vec![0xff, 0x00, 0xfe]);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        assert!(matches!(
            decode_content("not base64!!", Encoding::Base64),
            Err(FileOperationError::Failed(_))
        ));
    }
}
