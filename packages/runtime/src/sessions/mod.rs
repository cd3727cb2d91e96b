// ABOUTME: Session Discovery capability over AI-provider transcript files
// ABOUTME: Native and sandboxed adapters share pagination, ordering and transcript parsing

pub mod native;
pub mod sandboxed;
pub mod transcript;

use crate::error::SessionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use native::NativeSessionDiscovery;
pub use sandboxed::SandboxedSessionDiscovery;
pub use transcript::{validate_project, validate_session_id};

pub type Result<T> = std::result::Result<T, SessionError>;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;
pub const TRANSCRIPT_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    /// Limit is clamped to `1..=MAX_PAGE_SIZE`
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
    /// The sandbox is still starting; retry later
    pub pending: bool,
}

impl<T> Page<T> {
    /// Slice one page out of the full, already ordered result
    pub fn from_all(all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len();
        let items: Vec<T> = all
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .collect();
        Self {
            has_more: request.offset + items.len() < total,
            items,
            total,
            offset: request.offset,
            limit: request.limit,
            pending: false,
        }
    }

    pub fn pending(request: PageRequest) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            offset: request.offset,
            limit: request.limit,
            has_more: false,
            pending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub project: String,
    /// Whole seconds, so both modes report identical values
    pub modified: DateTime<Utc>,
    pub size: u64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub uuid: Option<String>,
    pub role: String,
    pub text: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub session_id: String,
    pub project: String,
    /// Position among the session's parsed messages
    pub message_index: usize,
    pub role: String,
    pub snippet: String,
}

#[async_trait]
pub trait SessionDiscovery: Send + Sync {
    /// Sessions newest first, optionally restricted to one project
    async fn list_sessions(
        &self,
        project: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<SessionSummary>>;

    async fn get_messages(
        &self,
        session_id: &str,
        page: PageRequest,
    ) -> Result<Page<TranscriptMessage>>;

    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Case-insensitive search over message text
    async fn search(&self, query: &str, page: PageRequest) -> Result<Page<SearchHit>>;
}

/// A transcript file found under the sessions root
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TranscriptFile {
    pub project: String,
    pub id: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl TranscriptFile {
    pub(crate) fn summary(&self, title: Option<String>) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            project: self.project.clone(),
            modified: self.modified,
            size: self.size,
            title,
        }
    }
}

/// Split `<project>/<id>.jsonl` into its parts
pub(crate) fn split_relative(rel: &str) -> Option<(String, String)> {
    let (project, file) = rel.split_once('/')?;
    if file.contains('/') {
        return None;
    }
    let id = file.strip_suffix(".jsonl")?;
    if validate_session_id(id).is_err() || project.is_empty() {
        return None;
    }
    Some((project.to_string(), id.to_string()))
}

/// Newest first, ties broken by project then id
pub(crate) fn sort_newest_first(files: &mut [TranscriptFile]) {
    files.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| a.project.cmp(&b.project))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_page_slicing() {
        let page = Page::from_all((0..7).collect::<Vec<_>>(), PageRequest::new(5, 2));
        assert_eq!(page.items, vec![5, 6]);
        assert_eq!(page.total, 7);
        assert!(!page.has_more);

        let page = Page::from_all((0..7).collect::<Vec<_>>(), PageRequest::new(0, 3));
        assert!(page.has_more);

        let page = Page::from_all((0..3).collect::<Vec<_>>(), PageRequest::new(10, 3));
        assert!(page.items.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(PageRequest::new(0, 0).limit, 1);
        assert_eq!(PageRequest::new(0, 10_000).limit, MAX_PAGE_SIZE);
        let pending: Page<u8> = Page::pending(PageRequest::default());
        assert!(pending.pending);
        assert_eq!(pending.limit, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_split_relative() {
        assert_eq!(
            split_relative("-home-me-app/3f2a-11.jsonl"),
            Some(("-home-me-app".to_string(), "3f2a-11".to_string()))
        );
        assert_eq!(split_relative("app/nested/x.jsonl"), None);
        assert_eq!(split_relative("app/notes.txt"), None);
        assert_eq!(split_relative("app/bad id.jsonl"), None);
    }
}
