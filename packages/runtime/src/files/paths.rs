// ABOUTME: Workspace-relative path resolution with traversal rejection
// ABOUTME: Both file adapters resolve every caller path through here before touching anything

use crate::error::FileOperationError;
use std::path::{Path, PathBuf};

/// A normalised path inside a tenant workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePath {
    components: Vec<String>,
}

impl WorkspacePath {
    /// Resolve a caller path. A leading `/` means the workspace root.
    ///
    /// `..` may walk back up but never above the root. Resolution is lexical:
    /// symlinks inside the workspace are not followed here.
    pub fn parse(raw: &str) -> Result<Self, FileOperationError> {
        if raw.contains('\0') {
            return Err(FileOperationError::PathTraversal(raw.replace('\0', "\\0")));
        }

        let mut components: Vec<String> = Vec::new();
        for part in raw.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(FileOperationError::PathTraversal(raw.to_string()));
                    }
                }
                other => components.push(other.to_string()),
            }
        }
        Ok(Self { components })
    }

    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Display form, always starting with `/`
    pub fn display(&self) -> String {
        format!("/{}", self.components.join("/"))
    }

    pub fn name(&self) -> &str {
        self.components.last().map(String::as_str).unwrap_or("")
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, name: &str) -> Self {
        let mut components = self.components.clone();
        components.push(name.to_string());
        Self { components }
    }

    /// Host path under a native workspace root
    pub fn on_host(&self, root: &Path) -> PathBuf {
        self.components
            .iter()
            .fold(root.to_path_buf(), |path, part| path.join(part))
    }

    /// Absolute path under a container workspace root
    pub fn in_container(&self, root: &str) -> String {
        let root = root.trim_end_matches('/');
        if self.is_root() {
            if root.is_empty() {
                "/".to_string()
            } else {
                root.to_string()
            }
        } else {
            format!("{}/{}", root, self.components.join("/"))
        }
    }
}
