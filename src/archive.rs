//! Age-based session archiving between the active and archive collections.
//!
//! Grounded directly on `original_source/session_archive_service.py`: the
//! age policy (`last_modified`, falling back to `created_at`), the
//! move-is-read-then-insert-then-delete sequence that keeps `chunk_id`s
//! identical across collections, and `search_archive`/`get_archive_stats`.
//! Re-targeted from ChromaDB's two-collection model onto
//! [`crate::vector_store::VectorStore`]'s two-table model.

use crate::registry::{SessionMetadata, SessionRegistry, SessionUpdate};
use crate::vector_store::{Collection, VectorStore};
use chrono::{DateTime, Duration, Utc};

/// Result of [`ArchiveService::archive_old_sessions`].
#[derive(Debug, Clone, Default)]
pub struct ArchiveRunResult {
    pub sessions_archived: Vec<String>,
    pub chunks_moved: usize,
    pub dry_run: bool,
}

/// Result of [`ArchiveService::restore_session`].
#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub session_id: String,
    pub chunks_restored: usize,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveStats {
    pub total_archived_sessions: usize,
    pub total_archived_chunks: usize,
    pub oldest_session_date: Option<DateTime<Utc>>,
    pub newest_session_date: Option<DateTime<Utc>>,
}

pub struct ArchiveService<'a> {
    store: &'a VectorStore,
    registry: &'a SessionRegistry,
    threshold_days: i64,
}

impl<'a> ArchiveService<'a> {
    pub fn new(store: &'a VectorStore, registry: &'a SessionRegistry, threshold_days: i64) -> Self {
        Self { store, registry, threshold_days }
    }

    /// A session is eligible once `last_modified` (falling back to
    /// `created_at`) is older than the threshold; a session with neither
    /// timestamp is never eligible.
    fn is_eligible(&self, metadata: &SessionMetadata, now: DateTime<Utc>) -> bool {
        let Some(date) = metadata.last_modified.or(metadata.created_at) else {
            return false;
        };
        date < now - Duration::days(self.threshold_days)
    }

    /// List (dry run) or actually move every eligible session's chunks from
    /// `active` to `archive`, marking `archived = true` in the registry.
    pub fn archive_old_sessions(&self, dry_run: bool) -> anyhow::Result<ArchiveRunResult> {
        let now = Utc::now();
        let eligible: Vec<String> = self
            .registry
            .get_all_sessions()
            .into_values()
            .filter(|m| !m.archived && self.is_eligible(m, now))
            .map(|m| m.session_id)
            .collect();

        if dry_run {
            return Ok(ArchiveRunResult { sessions_archived: eligible, chunks_moved: 0, dry_run: true });
        }

        let mut archived = Vec::new();
        let mut total_chunks = 0usize;
        for session_id in eligible {
            match self.archive_session(&session_id) {
                Ok(moved) if moved > 0 => {
                    total_chunks += moved;
                    archived.push(session_id);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(session_id, %err, "failed to archive session");
                }
            }
        }

        Ok(ArchiveRunResult { sessions_archived: archived, chunks_moved: total_chunks, dry_run: false })
    }

    /// Move one session's chunks: read active (with embeddings), insert
    /// into archive under identical `chunk_id`s, delete from active, flip
    /// `archived` in the registry. Returns the number of chunks moved.
    fn archive_session(&self, session_id: &str) -> anyhow::Result<usize> {
        let records = self.store.get_by_session(Collection::Active, session_id)?;
        if records.is_empty() {
            return Ok(0);
        }

        self.store.add(Collection::Archive, &records)?;
        self.store.delete_by_session(Collection::Active, session_id)?;
        self.registry.update_session(
            session_id,
            SessionUpdate { archived: Some(true), ..Default::default() },
        )?;

        Ok(records.len())
    }

    /// Inverse of [`Self::archive_session`]: move chunks archive → active.
    pub fn restore_session(&self, session_id: &str) -> anyhow::Result<RestoreResult> {
        let records = self.store.get_by_session(Collection::Archive, session_id)?;
        if records.is_empty() {
            return Ok(RestoreResult {
                session_id: session_id.to_string(),
                chunks_restored: 0,
                success: false,
                error: Some("session not found in archive".to_string()),
            });
        }

        self.store.add(Collection::Active, &records)?;
        self.store.delete_by_session(Collection::Archive, session_id)?;
        self.registry.update_session(
            session_id,
            SessionUpdate { archived: Some(false), ..Default::default() },
        )?;

        Ok(RestoreResult {
            session_id: session_id.to_string(),
            chunks_restored: records.len(),
            success: true,
            error: None,
        })
    }

    /// Vector search restricted to the archive collection.
    pub fn search_archive(
        &self,
        query_vector: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<crate::vector_store::ChunkSearchResult>> {
        self.store.query(Collection::Archive, query_vector, k, None)
    }

    pub fn get_archive_stats(&self) -> anyhow::Result<ArchiveStats> {
        let total_archived_chunks = self.store.count(Collection::Archive)?;
        let archived_sessions: Vec<SessionMetadata> =
            self.registry.get_all_sessions().into_values().filter(|m| m.archived).collect();

        let mut oldest = None;
        let mut newest = None;
        for metadata in &archived_sessions {
            let Some(date) = metadata.last_modified.or(metadata.created_at) else {
                continue;
            };
            if oldest.map(|o| date < o).unwrap_or(true) {
                oldest = Some(date);
            }
            if newest.map(|n| date > n).unwrap_or(true) {
                newest = Some(date);
            }
        }

        Ok(ArchiveStats {
            total_archived_sessions: archived_sessions.len(),
            total_archived_chunks,
            oldest_session_date: oldest,
            newest_session_date: newest,
        })
    }

    pub fn list_archived_sessions(&self) -> Vec<SessionMetadata> {
        self.registry.get_all_sessions().into_values().filter(|m| m.archived).collect()
    }

    pub fn is_session_archived(&self, session_id: &str) -> bool {
        self.registry.get_session(session_id).map(|m| m.archived).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::{ChunkRecord, MetaValue};
    use std::collections::HashMap;

    fn setup() -> (tempfile::TempDir, VectorStore, SessionRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&dir.path().join("vector.db")).unwrap();
        let registry = SessionRegistry::open(&dir.path().join("registry.json")).unwrap();
        (dir, store, registry)
    }

    fn record(session_id: &str, index: usize) -> ChunkRecord {
        ChunkRecord {
            chunk_id: format!("{session_id}_{index}"),
            session_id: session_id.to_string(),
            chunk_index: index,
            embedding: vec![1.0, 0.0],
            content: "hello".to_string(),
            metadata: HashMap::from([("chunk_index".to_string(), MetaValue::Int(index as i64))]),
        }
    }

    #[test]
    fn old_session_is_eligible_recent_is_not() {
        let (_dir, store, registry) = setup();
        let mut old = SessionMetadata::new("old");
        old.last_modified = Some(Utc::now() - Duration::days(400));
        let mut recent = SessionMetadata::new("recent");
        recent.last_modified = Some(Utc::now() - Duration::days(10));
        registry.add_session("old", Some(old)).unwrap();
        registry.add_session("recent", Some(recent)).unwrap();
        store.add(Collection::Active, &[record("old", 0)]).unwrap();
        store.add(Collection::Active, &[record("recent", 0)]).unwrap();

        let service = ArchiveService::new(&store, &registry, 365);
        let result = service.archive_old_sessions(false).unwrap();
        assert_eq!(result.sessions_archived, vec!["old".to_string()]);
        assert_eq!(result.chunks_moved, 1);
    }

    #[test]
    fn dry_run_does_not_move_chunks() {
        let (_dir, store, registry) = setup();
        let mut old = SessionMetadata::new("old");
        old.last_modified = Some(Utc::now() - Duration::days(400));
        registry.add_session("old", Some(old)).unwrap();
        store.add(Collection::Active, &[record("old", 0)]).unwrap();

        let service = ArchiveService::new(&store, &registry, 365);
        let result = service.archive_old_sessions(true).unwrap();
        assert_eq!(result.sessions_archived, vec!["old".to_string()]);
        assert_eq!(store.count(Collection::Active).unwrap(), 1);
        assert_eq!(store.count(Collection::Archive).unwrap(), 0);
    }

    #[test]
    fn conservation_across_archive_and_restore() {
        let (_dir, store, registry) = setup();
        registry.add_session("s1", None).unwrap();
        store.add(Collection::Active, &[record("s1", 0), record("s1", 1)]).unwrap();

        let service = ArchiveService::new(&store, &registry, 365);
        let before = store.count(Collection::Active).unwrap() + store.count(Collection::Archive).unwrap();

        // force-archive regardless of age via the internal move directly
        service.archive_session("s1").unwrap();
        let mid = store.count(Collection::Active).unwrap() + store.count(Collection::Archive).unwrap();
        assert_eq!(before, mid);
        assert!(service.is_session_archived("s1"));

        let restore = service.restore_session("s1").unwrap();
        assert!(restore.success);
        assert_eq!(restore.chunks_restored, 2);
        let after = store.count(Collection::Active).unwrap() + store.count(Collection::Archive).unwrap();
        assert_eq!(before, after);
        assert!(!service.is_session_archived("s1"));
    }

    #[test]
    fn restore_nonexistent_session_reports_failure() {
        let (_dir, store, registry) = setup();
        let service = ArchiveService::new(&store, &registry, 365);
        let result = service.restore_session("missing").unwrap();
        assert!(!result.success);
        assert_eq!(result.chunks_restored, 0);
    }

    #[test]
    fn stats_report_counts_and_date_range() {
        let (_dir, store, registry) = setup();
        let mut a = SessionMetadata::new("a");
        a.archived = true;
        a.last_modified = Some(Utc::now() - Duration::days(400));
        let mut b = SessionMetadata::new("b");
        b.archived = true;
        b.last_modified = Some(Utc::now() - Duration::days(500));
        registry.add_session("a", Some(a)).unwrap();
        registry.add_session("b", Some(b)).unwrap();
        store.add(Collection::Archive, &[record("a", 0), record("b", 0)]).unwrap();

        let service = ArchiveService::new(&store, &registry, 365);
        let stats = service.get_archive_stats().unwrap();
        assert_eq!(stats.total_archived_sessions, 2);
        assert_eq!(stats.total_archived_chunks, 2);
        assert!(stats.oldest_session_date.unwrap() < stats.newest_session_date.unwrap());
    }

    #[test]
    fn session_with_no_timestamp_is_never_eligible() {
        let (_dir, store, registry) = setup();
        registry.add_session("no-dates", None).unwrap();
        store.add(Collection::Active, &[record("no-dates", 0)]).unwrap();

        let service = ArchiveService::new(&store, &registry, 365);
        let result = service.archive_old_sessions(false).unwrap();
        assert!(result.sessions_archived.is_empty());
    }
}
