//! Session file parsing.
//!
//! Reads a `.jsonl` transcript line-by-line, tolerating malformed lines and
//! the handful of duck-typed shapes real session files show up in.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One normalised message, regardless of the shape it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub meta: Option<Value>,
}

/// A fully parsed session file.
#[derive(Debug, Clone)]
pub struct SessionData {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub parse_errors: usize,
}

impl SessionData {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ParserStats {
    pub files_parsed: usize,
    pub total_messages: usize,
    pub parse_errors: usize,
    pub skipped_lines: usize,
}

/// Tolerant JSONL session parser.
pub struct SessionParser {
    strict: bool,
    stats: ParserStats,
}

impl Default for SessionParser {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SessionParser {
    pub fn new(strict: bool) -> Self {
        Self { strict, stats: ParserStats::default() }
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ParserStats::default();
    }

    /// Parse a `.jsonl` session file. The file stem (sans extension)
    /// becomes `session_id`, matching the convention fixed in §6.
    pub fn parse_file(&mut self, path: &Path) -> anyhow::Result<SessionData> {
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("session file not found: {} ({e})", path.display()))?;
        let reader = BufReader::new(file);

        let session_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let mut messages = Vec::new();
        let mut parse_errors = 0usize;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(line) {
                Ok(value) => {
                    if let Some(message) = parse_message(&value) {
                        messages.push(message);
                    }
                }
                Err(err) => {
                    parse_errors += 1;
                    self.stats.parse_errors += 1;
                    self.stats.skipped_lines += 1;
                    tracing::warn!(line = line_no + 1, %err, "malformed JSON line, skipping");
                    if self.strict {
                        anyhow::bail!("malformed JSON at line {}: {err}", line_no + 1);
                    }
                }
            }
        }

        let metadata = std::fs::metadata(path)?;
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|d| Utc.timestamp_opt(d.as_secs() as i64, 0).single());

        let created_at = messages
            .first()
            .and_then(|m| m.timestamp)
            .or(last_modified);

        self.stats.files_parsed += 1;
        self.stats.total_messages += messages.len();

        Ok(SessionData {
            session_id,
            messages,
            created_at,
            last_modified,
            parse_errors,
        })
    }
}

/// Apply the §4.1 field-precedence rules to one JSON line.
fn parse_message(data: &Value) -> Option<Message> {
    let obj = data.as_object()?;

    let mut role = obj
        .get("role")
        .and_then(Value::as_str)
        .or_else(|| obj.get("type").and_then(Value::as_str))
        .map(str::to_string);

    let mut content = extract_content(obj);

    if content.is_none() {
        if let Some(nested) = obj.get("message").and_then(Value::as_object) {
            if let Some(nested_role) = nested.get("role").and_then(Value::as_str) {
                role = Some(nested_role.to_string());
            }
            content = extract_content(nested);
        }
    }

    let role = role?;
    let content = content?;
    if role.is_empty() {
        return None;
    }

    let timestamp = obj.get("timestamp").and_then(parse_timestamp);

    let mut meta = serde_json::Map::new();
    for key in ["model", "id", "stop_reason", "usage"] {
        if let Some(v) = obj.get(key) {
            meta.insert(key.to_string(), v.clone());
        }
    }
    let meta = if meta.is_empty() { None } else { Some(Value::Object(meta)) };

    Some(Message { role, content, timestamp, meta })
}

/// Content from, in order: `content` (string / block-list / other), else `text`.
fn extract_content(obj: &serde_json::Map<String, Value>) -> Option<String> {
    if let Some(value) = obj.get("content") {
        return Some(stringify_content(value));
    }
    if let Some(Value::String(text)) = obj.get("text") {
        return Some(text.clone());
    }
    None
}

fn stringify_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|block| match block {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("text").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let normalised = s.replace('Z', "+00:00");
            DateTime::parse_from_rfc3339(&normalised)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        Value::Number(n) => n.as_f64().and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(lines: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc123.jsonl");
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        (dir, path)
    }

    #[test]
    fn session_id_is_file_stem() {
        let (_dir, path) = write_temp(&[r#"{"role":"user","content":"hi"}"#]);
        let mut parser = SessionParser::default();
        let session = parser.parse_file(&path).unwrap();
        assert_eq!(session.session_id, "abc123");
    }

    #[test]
    fn flat_role_content_parses() {
        let (_dir, path) = write_temp(&[r#"{"role":"user","content":"hello there"}"#]);
        let mut parser = SessionParser::default();
        let session = parser.parse_file(&path).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, "user");
        assert_eq!(session.messages[0].content, "hello there");
    }

    #[test]
    fn content_block_list_joins_with_newline() {
        let line = r#"{"role":"assistant","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}"#;
        let (_dir, path) = write_temp(&[line]);
        let mut parser = SessionParser::default();
        let session = parser.parse_file(&path).unwrap();
        assert_eq!(session.messages[0].content, "a\nb");
    }

    #[test]
    fn nested_message_shape_parses() {
        let line = r#"{"type":"message","message":{"role":"assistant","content":"ok"}}"#;
        let (_dir, path) = write_temp(&[line]);
        let mut parser = SessionParser::default();
        let session = parser.parse_file(&path).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, "assistant");
        assert_eq!(session.messages[0].content, "ok");
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let (_dir, path) = write_temp(&[
            r#"{"role":"user","content":"good"}"#,
            "not json at all {",
            r#"{"role":"assistant","content":"also good"}"#,
        ]);
        let mut parser = SessionParser::default();
        let session = parser.parse_file(&path).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.parse_errors, 1);
    }

    #[test]
    fn missing_role_skips_line() {
        let (_dir, path) = write_temp(&[r#"{"content":"no role here"}"#]);
        let mut parser = SessionParser::default();
        let session = parser.parse_file(&path).unwrap();
        assert_eq!(session.messages.len(), 0);
    }

    #[test]
    fn strict_mode_propagates_parse_errors() {
        let (_dir, path) = write_temp(&["not json"]);
        let mut parser = SessionParser::new(true);
        assert!(parser.parse_file(&path).is_err());
    }

    #[test]
    fn unix_timestamp_parses() {
        let line = r#"{"role":"user","content":"hi","timestamp":1700000000}"#;
        let (_dir, path) = write_temp(&[line]);
        let mut parser = SessionParser::default();
        let session = parser.parse_file(&path).unwrap();
        assert!(session.messages[0].timestamp.is_some());
    }

    #[test]
    fn iso_timestamp_with_trailing_z_parses() {
        let line = r#"{"role":"user","content":"hi","timestamp":"2024-01-01T00:00:00Z"}"#;
        let (_dir, path) = write_temp(&[line]);
        let mut parser = SessionParser::default();
        let session = parser.parse_file(&path).unwrap();
        assert!(session.messages[0].timestamp.is_some());
    }

    #[test]
    fn stats_accumulate_across_files() {
        let (_dir1, path1) = write_temp(&[r#"{"role":"user","content":"a"}"#, "bad"]);
        let (_dir2, path2) = write_temp(&[r#"{"role":"user","content":"b"}"#]);
        let mut parser = SessionParser::default();
        parser.parse_file(&path1).unwrap();
        parser.parse_file(&path2).unwrap();
        let stats = parser.stats();
        assert_eq!(stats.files_parsed, 2);
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.parse_errors, 1);
    }
}
