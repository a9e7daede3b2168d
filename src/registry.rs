//! Session registry: metadata tracking independent of the vector store.
//!
//! A thread-safe, JSON-backed map from session id to [`SessionMetadata`],
//! persisted atomically (write-temp-then-rename) like the teacher's
//! config/cache persistence. Has no equivalent in the teacher repo; grounded
//! directly on `session_registry.py`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
    #[serde(default)]
    pub chunk_count: usize,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

impl SessionMetadata {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            project: None,
            created_at: None,
            last_modified: None,
            last_synced: None,
            chunk_count: 0,
            message_count: 0,
            tags: Vec::new(),
            summary: None,
            archived: false,
        }
    }
}

/// Fields an [`SessionRegistry::update_session`] caller may patch. `None`
/// leaves a field unchanged, mirroring the source's `**kwargs` patch style
/// without Rust's lack of keyword args.
#[derive(Debug, Default, Clone)]
pub struct SessionUpdate {
    pub project: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub last_synced: Option<DateTime<Utc>>,
    pub chunk_count: Option<usize>,
    pub message_count: Option<usize>,
    pub tags: Option<Vec<String>>,
    pub summary: Option<String>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub total_chunks: usize,
    pub total_messages: usize,
    pub total_projects: usize,
    pub projects: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    sessions: HashMap<String, SessionMetadata>,
    last_updated: DateTime<Utc>,
}

/// Thread-safe, JSON-persisted registry of session metadata.
pub struct SessionRegistry {
    path: PathBuf,
    sessions: Mutex<HashMap<String, SessionMetadata>>,
}

impl SessionRegistry {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let sessions = if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(body) => match serde_json::from_str::<RegistryFile>(&body) {
                    Ok(file) => file.sessions,
                    Err(err) => {
                        tracing::error!(%err, "session registry corrupt, starting fresh");
                        HashMap::new()
                    }
                },
                Err(err) => {
                    tracing::error!(%err, "failed to read session registry, starting fresh");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self { path: path.to_path_buf(), sessions: Mutex::new(sessions) })
    }

    fn save(&self, sessions: &HashMap<String, SessionMetadata>) -> anyhow::Result<()> {
        let file = RegistryFile { sessions: sessions.clone(), last_updated: Utc::now() };
        let body = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionMetadata> {
        self.sessions.lock().expect("registry lock poisoned").get(session_id).cloned()
    }

    /// Inserts (or overwrites) `session_id`'s metadata, forcing its
    /// `session_id` field to match the key.
    pub fn add_session(&self, session_id: &str, metadata: Option<SessionMetadata>) -> anyhow::Result<SessionMetadata> {
        let mut metadata = metadata.unwrap_or_else(|| SessionMetadata::new(session_id));
        metadata.session_id = session_id.to_string();

        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        sessions.insert(session_id.to_string(), metadata.clone());
        self.save(&sessions)?;
        Ok(metadata)
    }

    /// Patches only the `Some` fields of `update`. Returns `None` if the
    /// session is not registered.
    pub fn update_session(&self, session_id: &str, update: SessionUpdate) -> anyhow::Result<Option<SessionMetadata>> {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(None);
        };

        if let Some(project) = update.project {
            session.project = Some(project);
        }
        if let Some(created_at) = update.created_at {
            session.created_at = Some(created_at);
        }
        if let Some(last_modified) = update.last_modified {
            session.last_modified = Some(last_modified);
        }
        if let Some(last_synced) = update.last_synced {
            session.last_synced = Some(last_synced);
        }
        if let Some(chunk_count) = update.chunk_count {
            session.chunk_count = chunk_count;
        }
        if let Some(message_count) = update.message_count {
            session.message_count = message_count;
        }
        if let Some(tags) = update.tags {
            session.tags = tags;
        }
        if let Some(summary) = update.summary {
            session.summary = Some(summary);
        }
        if let Some(archived) = update.archived {
            session.archived = archived;
        }

        let result = session.clone();
        self.save(&sessions)?;
        Ok(Some(result))
    }

    pub fn delete_session(&self, session_id: &str) -> anyhow::Result<bool> {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        let removed = sessions.remove(session_id).is_some();
        if removed {
            self.save(&sessions)?;
        }
        Ok(removed)
    }

    /// Sessions matching `project` (if given) and having at least one tag
    /// in `tags` (if given).
    pub fn list_sessions(&self, project: Option<&str>, tags: Option<&[String]>) -> Vec<SessionMetadata> {
        let sessions = self.sessions.lock().expect("registry lock poisoned");
        sessions
            .values()
            .filter(|s| project.map(|p| s.project.as_deref() == Some(p)).unwrap_or(true))
            .filter(|s| tags.map(|wanted| wanted.iter().any(|t| s.tags.contains(t))).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn get_all_sessions(&self) -> HashMap<String, SessionMetadata> {
        self.sessions.lock().expect("registry lock poisoned").clone()
    }

    pub fn set_last_synced(&self, session_id: &str, timestamp: Option<DateTime<Utc>>) -> anyhow::Result<bool> {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        let update = SessionUpdate { last_synced: Some(timestamp), ..Default::default() };
        Ok(self.update_session(session_id, update)?.is_some())
    }

    pub fn get_stats(&self) -> RegistryStats {
        let sessions = self.sessions.lock().expect("registry lock poisoned");
        let mut projects: Vec<String> = sessions
            .values()
            .filter_map(|s| s.project.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        projects.sort();

        RegistryStats {
            total_sessions: sessions.len(),
            total_chunks: sessions.values().map(|s| s.chunk_count).sum(),
            total_messages: sessions.values().map(|s| s.message_count).sum(),
            total_projects: projects.len(),
            projects,
        }
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        sessions.clear();
        self.save(&sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, SessionRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::open(&dir.path().join("registry.json")).unwrap();
        (dir, registry)
    }

    #[test]
    fn add_then_get_round_trips() {
        let (_dir, registry) = registry();
        registry.add_session("s1", None).unwrap();
        let found = registry.get_session("s1").unwrap();
        assert_eq!(found.session_id, "s1");
        assert_eq!(found.chunk_count, 0);
    }

    #[test]
    fn update_patches_only_given_fields() {
        let (_dir, registry) = registry();
        registry.add_session("s1", None).unwrap();
        registry
            .update_session("s1", SessionUpdate { chunk_count: Some(4), ..Default::default() })
            .unwrap();
        let found = registry.get_session("s1").unwrap();
        assert_eq!(found.chunk_count, 4);
        assert_eq!(found.message_count, 0);
    }

    #[test]
    fn update_missing_session_returns_none() {
        let (_dir, registry) = registry();
        let result = registry.update_session("missing", SessionUpdate::default()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn delete_removes_session() {
        let (_dir, registry) = registry();
        registry.add_session("s1", None).unwrap();
        assert!(registry.delete_session("s1").unwrap());
        assert!(registry.get_session("s1").is_none());
        assert!(!registry.delete_session("s1").unwrap());
    }

    #[test]
    fn list_sessions_filters_by_project_and_tags() {
        let (_dir, registry) = registry();
        let mut a = SessionMetadata::new("a");
        a.project = Some("proj1".to_string());
        a.tags = vec!["x".to_string()];
        let mut b = SessionMetadata::new("b");
        b.project = Some("proj2".to_string());
        b.tags = vec!["y".to_string()];
        registry.add_session("a", Some(a)).unwrap();
        registry.add_session("b", Some(b)).unwrap();

        let by_project = registry.list_sessions(Some("proj1"), None);
        assert_eq!(by_project.len(), 1);
        assert_eq!(by_project[0].session_id, "a");

        let by_tag = registry.list_sessions(None, Some(&["y".to_string()]));
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].session_id, "b");
    }

    #[test]
    fn stats_aggregate_across_sessions() {
        let (_dir, registry) = registry();
        let mut a = SessionMetadata::new("a");
        a.project = Some("proj1".to_string());
        a.chunk_count = 3;
        a.message_count = 10;
        let mut b = SessionMetadata::new("b");
        b.project = Some("proj1".to_string());
        b.chunk_count = 2;
        b.message_count = 5;
        registry.add_session("a", Some(a)).unwrap();
        registry.add_session("b", Some(b)).unwrap();

        let stats = registry.get_stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.total_chunks, 5);
        assert_eq!(stats.total_messages, 15);
        assert_eq!(stats.total_projects, 1);
    }

    #[test]
    fn corrupt_file_starts_fresh_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "not json").unwrap();
        let registry = SessionRegistry::open(&path).unwrap();
        assert_eq!(registry.get_all_sessions().len(), 0);
    }

    #[test]
    fn clear_empties_registry_and_persists() {
        let (_dir, registry) = registry();
        registry.add_session("s1", None).unwrap();
        registry.clear().unwrap();
        assert_eq!(registry.get_all_sessions().len(), 0);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        {
            let registry = SessionRegistry::open(&path).unwrap();
            registry.add_session("s1", None).unwrap();
        }
        let reopened = SessionRegistry::open(&path).unwrap();
        assert!(reopened.get_session("s1").is_some());
    }
}
