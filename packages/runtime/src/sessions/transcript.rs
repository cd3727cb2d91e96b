// ABOUTME: Parsing of JSONL conversation transcripts into messages, titles and search hits
// ABOUTME: Tolerant of malformed lines and of content given as a string or a list of blocks

use super::{Result, SearchHit, TranscriptMessage};
use crate::error::SessionError;
use serde_json::Value;

/// Lines scanned when looking for a title
pub const TITLE_SCAN_LINES: usize = 64;
pub const MAX_TITLE_CHARS: usize = 120;
/// Characters of context kept on each side of a search match
const SNIPPET_CONTEXT: usize = 60;

pub fn validate_session_id(id: &str) -> Result<()> {
    if !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(SessionError::NotFound(id.to_string()))
    }
}

/// Project directory names: no separators and no dot-only names
pub fn validate_project(project: &str) -> Result<()> {
    let valid = !project.is_empty()
        && project != "."
        && project != ".."
        && project
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SessionError::NotFound(project.to_string()))
    }
}

/// One transcript line, if it is a user or assistant message with text
pub fn parse_line(line: &str) -> Option<TranscriptMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;

    let kind = value.get("type").and_then(Value::as_str)?;
    if kind != "user" && kind != "assistant" {
        return None;
    }
    let message = value.get("message")?;
    let role = message
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or(kind)
        .to_string();
    let text = content_text(message.get("content")?)?;

    Some(TranscriptMessage {
        uuid: value.get("uuid").and_then(Value::as_str).map(str::to_string),
        role,
        text,
        timestamp: value
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => (!text.trim().is_empty()).then(|| text.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            let joined = parts.join("\n");
            (!joined.trim().is_empty()).then_some(joined)
        }
        _ => None,
    }
}

pub fn parse_transcript(text: &str) -> Vec<TranscriptMessage> {
    text.lines().filter_map(parse_line).collect()
}

/// First user message within the opening lines, on one line and truncated
pub fn title_from(head: &str) -> Option<String> {
    head.lines()
        .take(TITLE_SCAN_LINES)
        .filter_map(parse_line)
        .find(|m| m.role == "user")
        .map(|m| {
            let flat = m.text.split_whitespace().collect::<Vec<_>>().join(" ");
            truncate_chars(&flat, MAX_TITLE_CHARS)
        })
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Cheap raw-text check before parsing a whole transcript
pub fn raw_matches(raw: &str, query_lower: &str) -> bool {
    raw.to_lowercase().contains(query_lower)
}

/// Hits for every message whose text contains the query, case-insensitively
pub fn search_messages(
    session_id: &str,
    project: &str,
    messages: &[TranscriptMessage],
    query_lower: &str,
) -> Vec<SearchHit> {
    messages
        .iter()
        .enumerate()
        .filter_map(|(index, message)| {
            let snippet = snippet_around(&message.text, query_lower)?;
            Some(SearchHit {
                session_id: session_id.to_string(),
                project: project.to_string(),
                message_index: index,
                role: message.role.clone(),
                snippet,
            })
        })
        .collect()
}

fn snippet_around(text: &str, query_lower: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let byte_pos = lower.find(query_lower)?;

    // Work in chars so cuts always land on boundaries
    let chars: Vec<char> = text.chars().collect();
    let match_start = lower[..byte_pos].chars().count().min(chars.len());
    let match_len = query_lower.chars().count();
    let start = match_start.saturating_sub(SNIPPET_CONTEXT);
    let end = (match_start + match_len + SNIPPET_CONTEXT).min(chars.len());

    let mut snippet: String = chars[start..end].iter().collect();
    snippet = snippet.split_whitespace().collect::<Vec<_>>().join(" ");
    if start > 0 {
        snippet.insert_str(0, "...");
    }
    if end < chars.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}
