// ABOUTME: Native session discovery reading transcript files directly from the host
// ABOUTME: Layout is <root>/<project>/<session-id>.jsonl

use super::transcript::{
    parse_transcript, raw_matches, search_messages, title_from, validate_project,
    validate_session_id, TITLE_SCAN_LINES,
};
use super::{
    sort_newest_first, Page, PageRequest, Result, SearchHit, SessionDiscovery, SessionSummary,
    TranscriptFile, TranscriptMessage, TRANSCRIPT_EXTENSION,
};
use crate::error::SessionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use walkdir::WalkDir;

pub struct NativeSessionDiscovery {
    root: PathBuf,
}

impl NativeSessionDiscovery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn scan(&self) -> Result<Vec<(TranscriptFile, PathBuf)>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_blocking(&root))
            .await
            .map_err(|e| SessionError::Failed(format!("scan task failed: {}", e)))
    }

    async fn locate(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        // The same id under several projects resolves to the first project by name
        self.scan()
            .await?
            .into_iter()
            .filter(|(file, _)| file.id == session_id)
            .min_by(|a, b| a.0.project.cmp(&b.0.project))
            .map(|(_, path)| path)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }
}

fn scan_blocking(root: &Path) -> Vec<(TranscriptFile, PathBuf)> {
    if !root.is_dir() {
        return Vec::new();
    }
    WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry.path().extension().and_then(|e| e.to_str()) == Some(TRANSCRIPT_EXTENSION)
        })
        .filter_map(|entry| {
            let id = entry.path().file_stem()?.to_str()?.to_string();
            let project = entry.path().parent()?.file_name()?.to_str()?.to_string();
            if validate_session_id(&id).is_err() {
                return None;
            }
            let meta = entry.metadata().ok()?;
            let secs = meta
                .modified()
                .ok()
                .map(DateTime::<Utc>::from)?
                .timestamp();
            Some((
                TranscriptFile {
                    project,
                    id,
                    modified: DateTime::<Utc>::from_timestamp(secs, 0)?,
                    size: meta.len(),
                },
                entry.into_path(),
            ))
        })
        .collect()
}

async fn read_head(path: &Path) -> Option<String> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut lines = BufReader::new(file).lines();
    let mut head = String::new();
    for _ in 0..TITLE_SCAN_LINES {
        match lines.next_line().await {
            Ok(Some(line)) => {
                head.push_str(&line);
                head.push('\n');
            }
            _ => break,
        }
    }
    Some(head)
}

async fn read_transcript(path: &Path, session_id: &str) -> Result<String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SessionError::NotFound(session_id.to_string()),
        _ => SessionError::Failed(format!("{}: {}", path.display(), e)),
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[async_trait]
impl SessionDiscovery for NativeSessionDiscovery {
    async fn list_sessions(
        &self,
        project: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<SessionSummary>> {
        if let Some(project) = project {
            validate_project(project)?;
        }
        let mut found = self.scan().await?;
        if let Some(project) = project {
            found.retain(|(file, _)| file.project == project);
        }
        let mut files: Vec<TranscriptFile> = Vec::with_capacity(found.len());
        let mut paths = std::collections::HashMap::new();
        for (file, path) in found {
            paths.insert((file.project.clone(), file.id.clone()), path);
            files.push(file);
        }
        sort_newest_first(&mut files);

        let listed = Page::from_all(files, page);
        let mut items = Vec::with_capacity(listed.items.len());
        for file in &listed.items {
            let title = match paths.get(&(file.project.clone(), file.id.clone())) {
                Some(path) => read_head(path).await.and_then(|head| title_from(&head)),
                None => None,
            };
            items.push(file.summary(title));
        }

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
        let raw = read_transcript(&path, session_id).await?;
        Ok(Page::from_all(parse_transcript(&raw), page))
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.locate(session_id).await?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| SessionError::Failed(format!("{}: {}", path.display(), e)))?;
        debug!("Deleted session transcript {}", path.display());
        Ok(())
    }

    async fn search(&self, query: &str, page: PageRequest) -> Result<Page<SearchHit>> {
        let query_lower = query.trim().to_lowercase();
        if query_lower.is_empty() {
            return Ok(Page::from_all(Vec::new(), page));
        }

        let mut candidates = self.scan().await?;
        candidates.sort_by(|a, b| (&a.0.project, &a.0.id).cmp(&(&b.0.project, &b.0.id)));

        let mut hits = Vec::new();
        for (file, path) in candidates {
            let Ok(raw) = read_transcript(&path, &file.id).await else {
                continue;
            };
            if !raw_matches(&raw, &query_lower) {
                continue;
            }
            let messages = parse_transcript(&raw);
            hits.extend(search_messages(&file.id, &file.project, &messages, &query_lower));
        }
        Ok(Page::from_all(hits, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn message(role: &str, text: &str) -> String {
        serde_json::json!({
            "type": role,
            "message": { "role": role, "content": text }
        })
        .to_string()
    }

    fn write_session(root: &Path, project: &str, id: &str, lines: &[String], mtime: i64) {
        let dir = root.join(project);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.jsonl", id));
        std::fs::write(&path, lines.join("\n")).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(
            std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime as u64),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_list_is_newest_first_with_titles() {
        let dir = TempDir::new().unwrap();
        write_session(dir.path(), "app", "old", &[message("user", "first task")], 1_000);
        write_session(dir.path(), "app", "new", &[message("user", "second task")], 2_000);
        write_session(dir.path(), "lib", "other", &[message("user", "lib work")], 1_500);

        let discovery = NativeSessionDiscovery::new(dir.path());
        let page = discovery
            .list_sessions(None, PageRequest::new(0, 2))
            .await
            .unwrap();
        let ids: Vec<_> = page.items.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "other"]);
        assert_eq!(page.items[0].title.as_deref(), Some("second task"));
        assert_eq!(page.total, 3);
        assert!(page.has_more);

        let app_only = discovery
            .list_sessions(Some("app"), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(app_only.total, 2);
    }

    #[tokio::test]
    async fn test_messages_delete_and_search() {
        let dir = TempDir::new().unwrap();
        write_session(
            dir.path(),
            "app",
            "s1",
            &[message("user", "Deploy the API"), message("assistant", "Deploying api now")],
            1_000,
        );
        let discovery = NativeSessionDiscovery::new(dir.path());

        let messages = discovery
            .get_messages("s1", PageRequest::new(1, 10))
            .await
            .unwrap();
        assert_eq!(messages.total, 2);
        assert_eq!(messages.items[0].role, "assistant");

        let hits = discovery.search("API", PageRequest::default()).await.unwrap();
        assert_eq!(hits.total, 2);

        discovery.delete("s1").await.unwrap();
        assert!(matches!(
            discovery.get_messages("s1", PageRequest::default()).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            discovery.delete("../s1").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let discovery = NativeSessionDiscovery::new("/nonexistent/warden/sessions");
        let page = discovery
            .list_sessions(None, PageRequest::default())
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert!(!page.pending);
    }
}
