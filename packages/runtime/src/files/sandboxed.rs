// ABOUTME: File operations proxied through shell commands inside the tenant sandbox
// ABOUTME: Textual output and sentinel lines are parsed back into the native result types and errors

use super::listing::{parse_line, ListingEntry};
use super::{
    check_write_size, decode_content, is_skipped_dir, reject_root, sort_nodes, Encoding,
    FileContent, FileNode, FileOperations, FileStat, NodeKind, Result, WorkspacePath,
};
use crate::error::{FileOperationError, NOT_EMPTY as NOT_EMPTY_MESSAGE};
use crate::shell::{
    fail_with, sentinel, shell_quote, SandboxShell, IS_A_DIRECTORY, NOT_A_DIRECTORY, NOT_EMPTY,
    NOT_FOUND, PERMISSION_DENIED, SENTINEL_EXIT, TOO_LARGE,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use warden_config::{FileLimits, OperationTimeouts};
use warden_sandbox::ExecOutput;

/// Base64 characters per write command, kept well under the kernel's single-argument limit
const WRITE_CHUNK_CHARS: usize = 48 * 1024;

const DIR_MARKER: &str = "__WARDEN_DIR__";
const SELF_MARKER: &str = "__WARDEN_SELF__";

pub struct SandboxedFileOperations {
    shell: SandboxShell,
    root: String,
    timeouts: OperationTimeouts,
    limits: FileLimits,
}

impl SandboxedFileOperations {
    pub fn new(
        shell: SandboxShell,
        root: impl Into<String>,
        timeouts: OperationTimeouts,
        limits: FileLimits,
    ) -> Self {
        Self {
            shell,
            root: root.into(),
            timeouts,
            limits,
        }
    }

    fn container_path(&self, path: &WorkspacePath) -> String {
        shell_quote(&path.in_container(&self.root))
    }

    /// Run a script and turn sentinels and failures into typed errors
    async fn run(
        &self,
        script: &str,
        path: &WorkspacePath,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let output = self
            .shell
            .run(script, timeout)
            .await
            .map_err(|e| FileOperationError::from_sandbox(e, operation))?;
        self.classify(output, path, operation)
    }

    fn classify(
        &self,
        output: ExecOutput,
        path: &WorkspacePath,
        operation: &'static str,
    ) -> Result<ExecOutput> {
        let shown = path.display();
        if let Some(found) = sentinel(&output) {
            debug!("{} on {} reported {}", operation, shown, found.tag);
            return Err(match found.tag {
                NOT_FOUND => FileOperationError::NotFound(shown),
                PERMISSION_DENIED => FileOperationError::PermissionDenied(shown),
                NOT_A_DIRECTORY => FileOperationError::NotADirectory(shown),
                IS_A_DIRECTORY => FileOperationError::IsADirectory(shown),
                NOT_EMPTY => FileOperationError::Failed(format!("{}: {}", shown, NOT_EMPTY_MESSAGE)),
                TOO_LARGE => FileOperationError::TooLarge {
                    path: shown,
                    size: found
                        .arg
                        .as_deref()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                    limit: self.limits.max_read_bytes,
                },
                other => FileOperationError::Failed(format!("{}: {}", shown, other)),
            });
        }

        match output.exit_code {
            Some(0) => Ok(output),
            code => {
                let stderr = output.stderr_lossy();
                let detail = stderr.trim();
                Err(FileOperationError::Failed(if detail.is_empty() {
                    format!("{} {} exited with {:?}", operation, shown, code)
                } else {
                    format!("{} {}: {}", operation, shown, detail)
                }))
            }
        }
    }

    async fn write_chunks(&self, target: &str, temp: &str, bytes: &[u8], path: &WorkspacePath) -> Result<()> {
        let encoded = BASE64.encode(bytes);
        // Base64 is shell safe inside single quotes; chunk on 4-char boundaries
        let chunks = encoded.as_bytes().chunks(WRITE_CHUNK_CHARS);
        for chunk in chunks {
            let chunk = std::str::from_utf8(chunk)
                .map_err(|e| FileOperationError::Failed(format!("encoding chunk: {}", e)))?;
            let script = format!(
                "printf '%s' '{}' | base64 -d >> {} || exit 1",
                chunk, temp
            );
            self.run(&script, path, "write", self.timeouts.write).await?;
        }

        let finish = format!("mv -f {} {}", temp, target);
        self.run(&finish, path, "write", self.timeouts.write).await?;
        Ok(())
    }
}

#[async_trait]
impl FileOperations for SandboxedFileOperations {
    async fn read(&self, raw: &str) -> Result<FileContent> {
        let path = WorkspacePath::parse(raw)?;
        let p = self.container_path(&path);
        let limit = self.limits.max_read_bytes;

        let script = format!(
            "p={p}\n\
             [ -e \"$p\" ] || {nf}\n\
             [ -d \"$p\" ] && {dir}\n\
             [ -r \"$p\" ] || {denied}\n\
             size=$(stat -L -c %s \"$p\") || exit 1\n\
             if [ \"$size\" -gt {limit} ]; then echo \"{too_large} $size\" >&2; exit {code}; fi\n\
             cat \"$p\"",
            p = p,
            nf = fail_with(NOT_FOUND),
            dir = fail_with(IS_A_DIRECTORY),
            denied = fail_with(PERMISSION_DENIED),
            limit = limit,
            too_large = TOO_LARGE,
            code = SENTINEL_EXIT,
        );
        let output = self.run(&script, &path, "read", self.timeouts.read).await?;
        Ok(FileContent::from_bytes(output.stdout))
    }

    async fn write(&self, raw: &str, content: &str, encoding: Encoding) -> Result<u64> {
        let path = WorkspacePath::parse(raw)?;
        reject_root(&path)?;
        let bytes = decode_content(content, encoding)?;
        let size = bytes.len() as u64;
        check_write_size(&path, size, self.limits.max_write_bytes)?;

        let parent = path.parent().unwrap_or_else(WorkspacePath::root);
        let target = self.container_path(&path);
        let dir = self.container_path(&parent);
        let temp = shell_quote(&format!(
            "{}/.warden-write-{}.tmp",
            parent.in_container(&self.root),
            uuid::Uuid::new_v4().simple()
        ));

        let prepare = format!(
            "p={target}\n\
             d={dir}\n\
             [ -d \"$p\" ] && {is_dir}\n\
             {make_dirs}\n\
             : > {temp} || {denied}",
            target = target,
            dir = dir,
            temp = temp,
            is_dir = fail_with(IS_A_DIRECTORY),
            make_dirs = make_dirs("d"),
            denied = fail_with(PERMISSION_DENIED),
        );

        let written = tokio::time::timeout(self.timeouts.write, async {
            self.run(&prepare, &path, "write", self.timeouts.write).await?;
            self.write_chunks(&target, &temp, &bytes, &path).await
        })
        .await
        .map_err(|_| FileOperationError::Timeout {
            operation: "write",
            after: self.timeouts.write,
        })
        .and_then(|inner| inner);

        if let Err(e) = written {
            let cleanup = format!("rm -f {}", temp);
            if let Err(cleanup_err) = self.shell.run(&cleanup, self.timeouts.stat).await {
                warn!("Failed to remove temp file {}: {}", temp, cleanup_err);
            }
            return Err(e);
        }

        debug!(
            "Wrote {} bytes to {} in sandbox for tenant {}",
            size,
            path.display(),
            self.shell.tenant_id()
        );
        Ok(size)
    }

    async fn tree(&self, raw: &str, depth: usize) -> Result<FileNode> {
        let path = WorkspacePath::parse(raw)?;
        let depth = depth.max(1);
        let p = self.container_path(&path);

        let prunes = super::SKIPPED_DIRS
            .iter()
            .map(|name| format!("-name {}", shell_quote(name)))
            .collect::<Vec<_>>()
            .join(" -o ");
        let script = format!(
            "p={p}\n\
             [ -e \"$p\" ] || [ -L \"$p\" ] || {nf}\n\
             [ -d \"$p\" ] && [ ! -L \"$p\" ] || {not_dir}\n\
             cd \"$p\" || {denied}\n\
             printf '{self_marker} %s\\n' \"$(stat -c %A .)\"\n\
             find . -maxdepth {max} \\( -path './*' \\( {prunes} \\) \\) -prune -o -type d -print |\n\
             while IFS= read -r d; do printf '{dir_marker} %s\\n' \"$d\"; ls -la \"$d\" 2>/dev/null; done",
            p = p,
            nf = fail_with(NOT_FOUND),
            not_dir = fail_with(NOT_A_DIRECTORY),
            denied = fail_with(PERMISSION_DENIED),
            self_marker = SELF_MARKER,
            dir_marker = DIR_MARKER,
            max = depth - 1,
            prunes = prunes,
        );

        let output = self.run(&script, &path, "tree", self.timeouts.tree).await?;
        Ok(build_tree(&output.stdout_lossy(), &path, depth))
    }

    async fn stat(&self, raw: &str) -> Result<FileStat> {
        let path = WorkspacePath::parse(raw)?;
        let script = format!(
            "p={}\n[ -e \"$p\" ] || [ -L \"$p\" ] || {}\nstat -c '%s|%Y|%a|%F' \"$p\"",
            self.container_path(&path),
            fail_with(NOT_FOUND),
        );
        let output = self.run(&script, &path, "stat", self.timeouts.stat).await?;
        parse_stat(output.stdout_lossy().trim(), &path)
    }

    async fn delete(&self, raw: &str, recursive: bool) -> Result<()> {
        let path = WorkspacePath::parse(raw)?;
        reject_root(&path)?;
        let remove_dir = if recursive {
            format!("rm -rf \"$p\" || {}", fail_with(PERMISSION_DENIED))
        } else {
            format!("rmdir \"$p\" 2>/dev/null || {}", fail_with(NOT_EMPTY))
        };
        let script = format!(
            "p={p}\n\
             [ -e \"$p\" ] || [ -L \"$p\" ] || {nf}\n\
             if [ -d \"$p\" ] && [ ! -L \"$p\" ]; then\n  {remove_dir}\n\
             else\n  rm -f \"$p\" || {denied}\nfi",
            p = self.container_path(&path),
            nf = fail_with(NOT_FOUND),
            remove_dir = remove_dir,
            denied = fail_with(PERMISSION_DENIED),
        );
        self.run(&script, &path, "delete", self.timeouts.write).await?;
        debug!("Deleted {} in sandbox for tenant {}", path.display(), self.shell.tenant_id());
        Ok(())
    }

    async fn exists(&self, raw: &str) -> Result<bool> {
        let path = WorkspacePath::parse(raw)?;
        let script = format!(
            "p={}\nif [ -e \"$p\" ] || [ -L \"$p\" ]; then echo yes; else echo no; fi",
            self.container_path(&path)
        );
        let output = self.run(&script, &path, "stat", self.timeouts.stat).await?;
        Ok(output.stdout_lossy().trim() == "yes")
    }

    async fn mkdir(&self, raw: &str) -> Result<()> {
        let path = WorkspacePath::parse(raw)?;
        let script = format!(
            "p={p}\n\
             if [ -e \"$p\" ]; then\n  [ -d \"$p\" ] || {not_dir}\n\
             else\n  {make_dirs}\nfi",
            p = self.container_path(&path),
            not_dir = fail_with(NOT_A_DIRECTORY),
            make_dirs = make_dirs("p"),
        );
        self.run(&script, &path, "mkdir", self.timeouts.write).await?;
        Ok(())
    }
}

/// `mkdir -p` on a script variable. A file somewhere in the path is `NotADirectory`,
/// any other refusal is `PermissionDenied`.
fn make_dirs(var: &str) -> String {
    format!(
        "mkdir -p \"${v}\" 2>/dev/null || {{ q=\"${v}\"; \
         while [ -n \"$q\" ] && [ \"$q\" != / ] && [ \"$q\" != . ]; do \
         if [ -e \"$q\" ] && [ ! -d \"$q\" ]; then {not_dir}; fi; q=$(dirname \"$q\"); done; \
         {denied}; }}",
        v = var,
        not_dir = fail_with(NOT_A_DIRECTORY),
        denied = fail_with(PERMISSION_DENIED),
    )
}

fn parse_stat(line: &str, path: &WorkspacePath) -> Result<FileStat> {
    let malformed = || FileOperationError::Failed(format!("unexpected stat output: {:?}", line));
    let mut parts = line.splitn(4, '|');
    let size = parts.next().and_then(|s| s.parse::<u64>().ok()).ok_or_else(malformed)?;
    let mtime = parts.next().and_then(|s| s.parse::<i64>().ok()).ok_or_else(malformed)?;
    let mode = parts
        .next()
        .and_then(|s| u32::from_str_radix(s, 8).ok())
        .ok_or_else(malformed)?;
    let kind = match parts.next().ok_or_else(malformed)? {
        "directory" => NodeKind::Directory,
        "symbolic link" => NodeKind::Symlink,
        _ => NodeKind::File,
    };
    let modified = DateTime::<Utc>::from_timestamp(mtime, 0).ok_or_else(malformed)?;

    Ok(FileStat {
        path: path.display(),
        kind,
        size,
        modified,
        mode,
    })
}

/// Rebuild the nested tree from marker-delimited `ls -la` sections
fn build_tree(output: &str, base: &WorkspacePath, depth: usize) -> FileNode {
    let mut self_permissions = String::new();
    let mut sections: HashMap<String, Vec<ListingEntry>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix(SELF_MARKER) {
            self_permissions = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix(DIR_MARKER) {
            let dir = rest.strip_prefix(' ').unwrap_or(rest);
            let rel = match dir {
                "." => String::new(),
                other => other.strip_prefix("./").unwrap_or(other).to_string(),
            };
            sections.entry(rel.clone()).or_default();
            current = Some(rel);
        } else if let (Some(dir), Some(entry)) = (current.as_ref(), parse_line(line)) {
            if let Some(entries) = sections.get_mut(dir) {
                entries.push(entry);
            }
        }
    }

    FileNode {
        name: base.name().to_string(),
        path: base.display(),
        kind: NodeKind::Directory,
        size: 0,
        permissions: self_permissions,
        target: None,
        children: Some(children_of(&sections, "", base, 1, depth)),
    }
}

fn children_of(
    sections: &HashMap<String, Vec<ListingEntry>>,
    rel: &str,
    parent: &WorkspacePath,
    level: usize,
    depth: usize,
) -> Vec<FileNode> {
    let Some(entries) = sections.get(rel) else {
        return Vec::new();
    };

    let mut nodes: Vec<FileNode> = entries
        .iter()
        .map(|entry| {
            let path = parent.child(&entry.name);
            let is_dir = entry.kind == NodeKind::Directory;
            let descend = is_dir && !is_skipped_dir(&entry.name) && level < depth;
            let child_rel = if rel.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", rel, entry.name)
            };
            FileNode {
                name: entry.name.clone(),
                path: path.display(),
                kind: entry.kind,
                size: if is_dir { 0 } else { entry.size },
                permissions: entry.permissions.clone(),
                target: entry.target.clone(),
                children: descend
                    .then(|| children_of(sections, &child_rel, &path, level + 1, depth)),
            }
        })
        .collect();
    sort_nodes(&mut nodes);
    nodes
}
