// ABOUTME: Session discovery through listing and reading commands run inside the tenant sandbox
// ABOUTME: Listing and search return an empty pending page while the sandbox is still starting

use super::transcript::{
    parse_transcript, search_messages, title_from, validate_project, validate_session_id,
    TITLE_SCAN_LINES,
};
use super::{
    sort_newest_first, split_relative, Page, PageRequest, Result, SearchHit, SessionDiscovery,
    SessionSummary, TranscriptFile, TranscriptMessage,
};
use crate::error::SessionError;
use crate::shell::{fail_with, sentinel, shell_quote, SandboxShell, NOT_FOUND};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;
use warden_config::OperationTimeouts;
use warden_sandbox::SandboxError;

const FILE_MARKER: &str = "__WARDEN_FILE__";

pub struct SandboxedSessionDiscovery {
    shell: SandboxShell,
    root: String,
    timeouts: OperationTimeouts,
}

impl SandboxedSessionDiscovery {
    pub fn new(shell: SandboxShell, root: impl Into<String>, timeouts: OperationTimeouts) -> Self {
        Self {
            shell,
            root: root.into().trim_end_matches('/').to_string(),
            timeouts,
        }
    }

    fn relative<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix(&self.root)?.strip_prefix('/')
    }

    async fn scan(&self) -> std::result::Result<Vec<(TranscriptFile, String)>, SandboxError> {
        let script = format!(
            "r={}\n\
             [ -d \"$r\" ] || exit 0\n\
             find \"$r\" -mindepth 2 -maxdepth 2 -type f -name '*.jsonl' -exec stat -c '%Y %s %n' {{}} +",
            shell_quote(&self.root)
        );
        let output = self.shell.run(&script, self.timeouts.tree).await?;
        if !output.success() && output.stdout.is_empty() {
            debug!("Session scan failed: {}", output.stderr_lossy().trim());
        }

        let files = output
            .stdout_lossy()
            .lines()
            .filter_map(|line| {
                let (mtime, rest) = line.split_once(' ')?;
                let (size, path) = rest.split_once(' ')?;
                let (project, id) = split_relative(self.relative(path)?)?;
                Some((
                    TranscriptFile {
                        project,
                        id,
                        modified: DateTime::<Utc>::from_timestamp(mtime.parse().ok()?, 0)?,
                        size: size.parse().ok()?,
                    },
                    path.to_string(),
                ))
            })
            .collect();
        Ok(files)
    }

    /// Heads of several files in one round trip, keyed by path
    async fn read_heads(&self, paths: &[String]) -> std::result::Result<HashMap<String, String>, SandboxError> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let quoted: Vec<String> = paths.iter().map(|p| shell_quote(p)).collect();
        let script = format!(
            "for f in {}; do printf '{} %s\\n' \"$f\"; head -n {} \"$f\" 2>/dev/null; echo; done",
            quoted.join(" "),
            FILE_MARKER,
            TITLE_SCAN_LINES
        );
        let output = self.shell.run(&script, self.timeouts.read).await?;
        Ok(split_sections(&output.stdout_lossy()))
    }

    /// Path of a session's transcript, choosing the first project by name
    async fn locate(&self, session_id: &str) -> Result<String> {
        validate_session_id(session_id)?;
        let script = format!(
            "r={}\n\
             for f in \"$r\"/*/{}.jsonl; do [ -f \"$f\" ] && printf '%s\\n' \"$f\"; done\n\
             exit 0",
            shell_quote(&self.root),
            session_id
        );
        let output = self
            .shell
            .run(&script, self.timeouts.stat)
            .await
            .map_err(|e| SessionError::from_sandbox(e, "locate session"))?;

        output
            .stdout_lossy()
            .lines()
            .filter_map(|path| {
                let (project, id) = split_relative(self.relative(path)?)?;
                (id == session_id).then(|| (project, path.to_string()))
            })
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, path)| path)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn read_transcript(&self, path: &str, session_id: &str) -> Result<String> {
        let script = format!(
            "p={}\n[ -f \"$p\" ] || {}\ncat \"$p\"",
            shell_quote(path),
            fail_with(NOT_FOUND)
        );
        let output = self
            .shell
            .run(&script, self.timeouts.read)
            .await
            .map_err(|e| SessionError::from_sandbox(e, "read session"))?;
        if sentinel(&output).is_some() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        if !output.success() {
            return Err(SessionError::Failed(output.stderr_lossy().trim().to_string()));
        }
        Ok(output.stdout_lossy())
    }
}

/// Split marker-delimited `cat`/`head` output back into per-file text
fn split_sections(output: &str) -> HashMap<String, String> {
    let mut sections: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    for line in output.lines() {
        if let Some(path) = line
            .strip_prefix(FILE_MARKER)
            .and_then(|rest| rest.strip_prefix(' '))
        {
            current = Some(path.to_string());
            sections.entry(path.to_string()).or_default();
        } else if let Some(text) = current.as_ref().and_then(|p| sections.get_mut(p)) {
            text.push_str(line);
            text.push('\n');
        }
    }
    sections
}

#[async_trait]
impl SessionDiscovery for SandboxedSessionDiscovery {
    async fn list_sessions(
        &self,
        project: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<SessionSummary>> {
        if let Some(project) = project {
            validate_project(project)?;
        }
        let found = match self.scan().await {
            Ok(found) => found,
            Err(e) if e.is_not_ready() || matches!(e, SandboxError::NotFound(_)) => {
                return Ok(Page::pending(page))
            }
            Err(e) => return Err(SessionError::from_sandbox(e, "list sessions")),
        };

        let mut paths = HashMap::new();
        let mut files = Vec::with_capacity(found.len());
        for (file, path) in found {
            if project.is_some_and(|p| p != file.project) {
                continue;
            }
            paths.insert((file.project.clone(), file.id.clone()), path);
            files.push(file);
        }
        sort_newest_first(&mut files);

        let listed = Page::from_all(files, page);
        let page_paths: Vec<String> = listed
            .items
            .iter()
            .filter_map(|f| paths.get(&(f.project.clone(), f.id.clone())).cloned())
            .collect();
        let heads = self
            .read_heads(&page_paths)
            .await
            .map_err(|e| SessionError::from_sandbox(e, "list sessions"))?;

        let items = listed
            .items
            .iter()
            .map(|file| {
                let title = paths
                    .get(&(file.project.clone(), file.id.clone()))
                    .and_then(|path| heads.get(path))
                    .and_then(|head| title_from(head));
                file.summary(title)
            })
            .collect();

        Ok(Page {
            items,
            total: listed.total,
            offset: listed.offset,
            limit: listed.limit,
            has_more: listed.has_more,
            pending: false,
        })
    }

    async fn get_messages(
        &self,
        session_id: &str,
        page: PageRequest,
    ) -> Result<Page<TranscriptMessage>> {
        let path = self.locate(session_id).await?;
        let raw = self.read_transcript(&path, session_id).await?;
        Ok(Page::from_all(parse_transcript(&raw), page))
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.locate(session_id).await?;
        let script = format!("rm -f {}", shell_quote(&path));
        let output = self
            .shell
            .run(&script, self.timeouts.write)
            .await
            .map_err(|e| SessionError::from_sandbox(e, "delete session"))?;
        if !output.success() {
            return Err(SessionError::Failed(format!(
                "{}: {}",
                path,
                output.stderr_lossy().trim()
            )));
        }
        debug!(
            "Deleted session {} in sandbox for tenant {}",
            session_id,
            self.shell.tenant_id()
        );
        Ok(())
    }

    async fn search(&self, query: &str, page: PageRequest) -> Result<Page<SearchHit>> {
        let query_lower = query.trim().to_lowercase();
        if query_lower.is_empty() {
            return Ok(Page::from_all(Vec::new(), page));
        }

        // grep exits 1 when nothing matched; find passes that through
        let prefilter = format!(
            "r={}\n\
             [ -d \"$r\" ] || exit 0\n\
             find \"$r\" -mindepth 2 -maxdepth 2 -type f -name '*.jsonl' -exec grep -ilF -- {} {{}} +",
            shell_quote(&self.root),
            shell_quote(query.trim())
        );
        let output = match self.shell.run(&prefilter, self.timeouts.tree).await {
            Ok(output) => output,
            Err(e) if e.is_not_ready() || matches!(e, SandboxError::NotFound(_)) => {
                return Ok(Page::pending(page))
            }
            Err(e) => return Err(SessionError::from_sandbox(e, "search sessions")),
        };

        let mut candidates: Vec<(String, String, String)> = output
            .stdout_lossy()
            .lines()
            .filter_map(|path| {
                let (project, id) = split_relative(self.relative(path)?)?;
                Some((project, id, path.to_string()))
            })
            .collect();
        candidates.sort();
        if candidates.is_empty() {
            return Ok(Page::from_all(Vec::new(), page));
        }

        let quoted: Vec<String> = candidates.iter().map(|c| shell_quote(&c.2)).collect();
        let script = format!(
            "for f in {}; do printf '{} %s\\n' \"$f\"; cat \"$f\" 2>/dev/null; echo; done",
            quoted.join(" "),
            FILE_MARKER
        );
        let contents = self
            .shell
            .run(&script, self.timeouts.read)
            .await
            .map_err(|e| SessionError::from_sandbox(e, "search sessions"))?;
        let sections = split_sections(&contents.stdout_lossy());

        let mut hits = Vec::new();
        for (project, id, path) in &candidates {
            let Some(raw) = sections.get(path) else {
                continue;
            };
            let messages = parse_transcript(raw);
            hits.extend(search_messages(id, project, &messages, &query_lower));
        }
        Ok(Page::from_all(hits, page))
    }
}
