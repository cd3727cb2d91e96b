// ABOUTME: Native file operations against a tenant workspace directory on the host
// ABOUTME: Uses tokio::fs for single files and walkdir for trees, each bounded by its operation timeout

use super::{
    check_write_size, decode_content, is_skipped_dir, reject_root, sort_nodes, Encoding,
    FileContent, FileNode, FileOperations, FileStat, NodeKind, Result, WorkspacePath,
};
use crate::error::FileOperationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use walkdir::WalkDir;
use warden_config::{FileLimits, OperationTimeouts};

pub struct NativeFileOperations {
    root: PathBuf,
    timeouts: OperationTimeouts,
    limits: FileLimits,
}

impl NativeFileOperations {
    pub fn new(root: impl Into<PathBuf>, timeouts: OperationTimeouts, limits: FileLimits) -> Self {
        Self {
            root: root.into(),
            timeouts,
            limits,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, raw: &str) -> Result<(WorkspacePath, PathBuf)> {
        let path = WorkspacePath::parse(raw)?;
        let host = path.on_host(&self.root);
        Ok((path, host))
    }
}

async fn bounded<T>(
    operation: &'static str,
    after: Duration,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, work)
        .await
        .map_err(|_| FileOperationError::Timeout { operation, after })?
}

#[async_trait]
impl FileOperations for NativeFileOperations {
    async fn read(&self, raw: &str) -> Result<FileContent> {
        let (path, host) = self.resolve(raw)?;
        let display = path.display();
        let limit = self.limits.max_read_bytes;

        bounded("read", self.timeouts.read, async {
            let meta = tokio::fs::metadata(&host)
                .await
                .map_err(|e| FileOperationError::from_io(e, &display))?;
            if meta.is_dir() {
                return Err(FileOperationError::IsADirectory(display.clone()));
            }
            if meta.len() > limit {
                return Err(FileOperationError::TooLarge {
                    path: display.clone(),
                    size: meta.len(),
                    limit,
                });
            }
            let bytes = tokio::fs::read(&host)
                .await
                .map_err(|e| FileOperationError::from_io(e, &display))?;
            Ok(FileContent::from_bytes(bytes))
        })
        .await
    }

    async fn write(&self, raw: &str, content: &str, encoding: Encoding) -> Result<u64> {
        let (path, host) = self.resolve(raw)?;
        reject_root(&path)?;
        let bytes = decode_content(content, encoding)?;
        let size = bytes.len() as u64;
        check_write_size(&path, size, self.limits.max_write_bytes)?;
        let display = path.display();

        bounded("write", self.timeouts.write, async {
            if let Some(parent) = host.parent() {
                create_dirs(parent, &display).await?;
            }
            if tokio::fs::metadata(&host)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
            {
                return Err(FileOperationError::IsADirectory(display.clone()));
            }
            tokio::fs::write(&host, &bytes)
                .await
                .map_err(|e| FileOperationError::from_io(e, &display))?;
            debug!("Wrote {} bytes to {}", size, host.display());
            Ok(size)
        })
        .await
    }

    async fn tree(&self, raw: &str, depth: usize) -> Result<FileNode> {
        let (path, host) = self.resolve(raw)?;
        let depth = depth.max(1);

        bounded("tree", self.timeouts.tree, async {
            let meta = tokio::fs::symlink_metadata(&host)
                .await
                .map_err(|e| FileOperationError::from_io(e, &path.display()))?;
            if !meta.is_dir() {
                return Err(FileOperationError::NotADirectory(path.display()));
            }

            let root = host.clone();
            let base = path.clone();
            tokio::task::spawn_blocking(move || walk_tree(&root, &base, depth))
                .await
                .map_err(|e| FileOperationError::Failed(format!("tree task failed: {}", e)))?
        })
        .await
    }

    async fn stat(&self, raw: &str) -> Result<FileStat> {
        let (path, host) = self.resolve(raw)?;
        let display = path.display();

        bounded("stat", self.timeouts.stat, async {
            let meta = tokio::fs::symlink_metadata(&host)
                .await
                .map_err(|e| FileOperationError::from_io(e, &display))?;
            let modified: DateTime<Utc> = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .map_err(|e| FileOperationError::from_io(e, &display))?;
            // Whole seconds, matching what `stat -c %Y` reports in a sandbox
            let modified = DateTime::<Utc>::from_timestamp(modified.timestamp(), 0)
                .unwrap_or(modified);
            Ok(FileStat {
                path: display.clone(),
                kind: kind_of(&meta.file_type()),
                size: meta.len(),
                modified,
                mode: mode_bits(&meta),
            })
        })
        .await
    }

    async fn delete(&self, raw: &str, recursive: bool) -> Result<()> {
        let (path, host) = self.resolve(raw)?;
        reject_root(&path)?;
        let display = path.display();

        bounded("delete", self.timeouts.write, async {
            let meta = tokio::fs::symlink_metadata(&host)
                .await
                .map_err(|e| FileOperationError::from_io(e, &display))?;
            let result = if meta.is_dir() {
                if recursive {
                    tokio::fs::remove_dir_all(&host).await
                } else {
                    tokio::fs::remove_dir(&host).await
                }
            } else {
                tokio::fs::remove_file(&host).await
            };
            result.map_err(|e| FileOperationError::from_io(e, &display))?;
            debug!("Deleted {}", host.display());
            Ok(())
        })
        .await
    }

    async fn exists(&self, raw: &str) -> Result<bool> {
        let (_, host) = self.resolve(raw)?;
        bounded("stat", self.timeouts.stat, async {
            Ok(tokio::fs::symlink_metadata(&host).await.is_ok())
        })
        .await
    }

    async fn mkdir(&self, raw: &str) -> Result<()> {
        let (path, host) = self.resolve(raw)?;
        let display = path.display();

        bounded("mkdir", self.timeouts.write, async {
            if let Ok(meta) = tokio::fs::metadata(&host).await {
                if !meta.is_dir() {
                    return Err(FileOperationError::NotADirectory(display.clone()));
                }
                return Ok(());
            }
            create_dirs(&host, &display).await
        })
        .await
    }
}

/// `create_dir_all` reporting a file in the way as `NotADirectory`
async fn create_dirs(host: &Path, display: &str) -> Result<()> {
    tokio::fs::create_dir_all(host).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::NotADirectory => {
            FileOperationError::NotADirectory(display.to_string())
        }
        _ => FileOperationError::from_io(e, display),
    })
}

fn walk_tree(root: &Path, base: &WorkspacePath, depth: usize) -> Result<FileNode> {
    let mut top = FileNode {
        name: base.name().to_string(),
        path: base.display(),
        kind: NodeKind::Directory,
        size: 0,
        permissions: std::fs::symlink_metadata(root)
            .map(|m| permission_string(&m))
            .unwrap_or_default(),
        target: None,
        children: Some(Vec::new()),
    };

    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(depth)
        .sort_by_file_name()
        .into_iter();

    // Nodes waiting for their children, keyed by walk depth
    let mut stack: Vec<FileNode> = vec![];
    let mut stack_depths: Vec<usize> = vec![];

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        let level = entry.depth();
        while stack_depths.last().is_some_and(|d| *d >= level) {
            pop_into(&mut stack, &mut stack_depths, &mut top);
        }

        let meta = match entry.path().symlink_metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let path = rel
            .components()
            .fold(base.clone(), |p, c| p.child(&c.as_os_str().to_string_lossy()));
        let kind = kind_of(&meta.file_type());
        let target = if kind == NodeKind::Symlink {
            std::fs::read_link(entry.path())
                .ok()
                .map(|t| t.to_string_lossy().into_owned())
        } else {
            None
        };

        let skipped = kind == NodeKind::Directory && is_skipped_dir(&name);
        // Only directories below max depth were queued for descent
        if skipped && level < depth {
            walker.skip_current_dir();
        }

        let node = FileNode {
            name,
            path: path.display(),
            kind,
            size: if kind == NodeKind::Directory { 0 } else { meta.len() },
            permissions: permission_string(&meta),
            target,
            children: (kind == NodeKind::Directory && !skipped && level < depth)
                .then(Vec::new),
        };

        if node.children.is_some() {
            stack.push(node);
            stack_depths.push(level);
        } else {
            attach(&mut stack, &mut top, node);
        }
    }
    while !stack.is_empty() {
        pop_into(&mut stack, &mut stack_depths, &mut top);
    }

    sort_recursive(&mut top);
    Ok(top)
}

fn attach(stack: &mut [FileNode], top: &mut FileNode, node: FileNode) {
    let parent = stack.last_mut().unwrap_or(top);
    if let Some(children) = parent.children.as_mut() {
        children.push(node);
    }
}

fn pop_into(stack: &mut Vec<FileNode>, depths: &mut Vec<usize>, top: &mut FileNode) {
    if let Some(node) = stack.pop() {
        depths.pop();
        attach(stack, top, node);
    }
}

fn sort_recursive(node: &mut FileNode) {
    if let Some(children) = node.children.as_mut() {
        sort_nodes(children);
        for child in children.iter_mut() {
            sort_recursive(child);
        }
    }
}

fn kind_of(file_type: &std::fs::FileType) -> NodeKind {
    if file_type.is_symlink() {
        NodeKind::Symlink
    } else if file_type.is_dir() {
        NodeKind::Directory
    } else {
        NodeKind::File
    }
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// `ls -l` style mode string so both modes report the same shape
fn permission_string(meta: &std::fs::Metadata) -> String {
    let kind = match kind_of(&meta.file_type()) {
        NodeKind::Directory => 'd',
        NodeKind::Symlink => 'l',
        NodeKind::File => '-',
    };
    let bits = mode_bits(meta);
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let triple = (bits >> shift) & 0o7;
        out.push(if triple & 0o4 != 0 { 'r' } else { '-' });
        out.push(if triple & 0o2 != 0 { 'w' } else { '-' });
        out.push(if triple & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}
