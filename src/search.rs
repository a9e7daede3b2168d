//! Orchestrates query-embed → k-NN → group → score → rank → preview.
//!
//! Grounded on `original_source/search_service.py`'s `search`/
//! `get_session_preview` orchestration order (ported without its
//! out-of-scope `ForkGenerator`/`PreferenceService`/`CacheService`
//! collaborators, §1), and on the teacher's `recall.rs` for the
//! embed-then-threshold-then-sort skeleton.

use crate::chunker::MemoryKind;
use crate::config::SearchConfig;
use crate::embedding::EmbeddingService;
use crate::parser::SessionParser;
use crate::registry::{SessionMetadata, SessionRegistry};
use crate::scoring::{self, ScoringInput, SessionScore};
use crate::temporal::{self, TimeRange};
use crate::vector_store::{ChunkSearchResult, Collection, VectorStore};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One ranked session, carrying its score breakdown, registry metadata (if
/// still registered), a short preview, and the chunks that matched.
#[derive(Debug, Clone)]
pub struct SessionSearchResult {
    pub session_id: String,
    pub score: SessionScore,
    pub metadata: Option<SessionMetadata>,
    pub preview: String,
    pub matched_chunks: Vec<ChunkSearchResult>,
}

/// `get_session_preview`'s return shape (§6).
#[derive(Debug, Clone)]
pub struct SessionPreview {
    pub session_id: String,
    pub preview: String,
    pub message_count: usize,
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub metadata: Option<SessionMetadata>,
}

/// Optional query parameters beyond the bare text (§6's `search(...)`).
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub top_n: Option<usize>,
    pub time_range: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub apply_recency_boost: bool,
    pub include_archive: bool,
}

struct CachedEntry {
    results: Vec<SessionSearchResult>,
}

/// Bounded `(query, filter_fingerprint) -> results` cache; entries are
/// evicted on overflow rather than tracked for freshness (§4.8: "staleness
/// is bounded by the cache's own size rather than any TTL").
struct ResultCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, CachedEntry>,
}

impl ResultCache {
    fn new(capacity: usize) -> Self {
        Self { capacity, order: Vec::new(), entries: HashMap::new() }
    }

    fn get(&self, key: &str) -> Option<&Vec<SessionSearchResult>> {
        self.entries.get(key).map(|e| &e.results)
    }

    fn put(&mut self, key: String, results: Vec<SessionSearchResult>) {
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
            if self.order.len() > self.capacity {
                let evicted = self.order.remove(0);
                self.entries.remove(&evicted);
            }
        }
        self.entries.insert(key, CachedEntry { results });
    }
}

fn cache_key(query: &str, time_range: Option<TimeRange>) -> String {
    match time_range {
        Some(range) => format!("{query}\u{0}{}\u{0}{}", range.start.to_rfc3339(), range.end.to_rfc3339()),
        None => query.to_string(),
    }
}

pub struct SearchService {
    config: SearchConfig,
    sessions_root: PathBuf,
    cache: Mutex<ResultCache>,
}

impl SearchService {
    pub fn new(config: SearchConfig, sessions_root: PathBuf) -> Self {
        Self { config, sessions_root, cache: Mutex::new(ResultCache::new(64)) }
    }

    /// Orchestrate a full search per §4.8, steps 1-9.
    pub async fn search(
        &self,
        query: &str,
        params: SearchQuery,
        embeddings: &mut EmbeddingService,
        store: &VectorStore,
        registry: &SessionRegistry,
    ) -> anyhow::Result<Vec<SessionSearchResult>> {
        if query.trim().is_empty() {
            anyhow::bail!("query must not be empty");
        }

        let now = Utc::now();
        let top_n = params.top_n.unwrap_or(self.config.top_n_sessions);

        let time_range = if params.time_range.is_some() || params.start_date.is_some() || params.end_date.is_some() {
            let parsed = temporal::parse_time_range(
                params.time_range.as_deref(),
                params.start_date.as_deref(),
                params.end_date.as_deref(),
                now,
            );
            if parsed.is_none() {
                tracing::warn!(time_range = ?params.time_range, "failed to parse temporal filter");
            }
            parsed
        } else {
            None
        };

        let key = cache_key(query, time_range);
        if let Some(cached) = self.cache.lock().expect("search cache lock poisoned").get(&key) {
            let mut results = cached.clone();
            results.truncate(top_n);
            return Ok(results);
        }

        let query_vector = embeddings.embed_one(query).await?;

        let mut hits = store.query(Collection::Active, &query_vector, self.config.k_chunks, None)?;
        if params.include_archive {
            let archived = store.query(Collection::Archive, &query_vector, self.config.k_chunks, None)?;
            hits.extend(archived);
        }
        hits.retain(|hit| hit.similarity >= self.config.similarity_threshold);

        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut session_chunks: HashMap<String, Vec<ChunkSearchResult>> = HashMap::new();
        for hit in hits {
            session_chunks.entry(hit.session_id.clone()).or_default().push(hit);
        }
        for chunks in session_chunks.values_mut() {
            chunks.sort_by_key(|c| c.chunk_index);
        }

        if let Some(range) = time_range {
            session_chunks.retain(|session_id, _| {
                let Some(metadata) = registry.get_session(session_id) else {
                    return false;
                };
                match metadata.last_modified.or(metadata.created_at) {
                    Some(timestamp) => range.contains(timestamp),
                    None => false,
                }
            });
        }

        let mut scores = Vec::with_capacity(session_chunks.len());
        for (session_id, chunks) in &session_chunks {
            let metadata = registry.get_session(session_id);
            let total_chunks = metadata.as_ref().map(|m| m.chunk_count).unwrap_or(chunks.len());
            let last_modified = metadata.as_ref().and_then(|m| m.last_modified);

            let mut memory_kinds: BTreeSet<MemoryKind> = BTreeSet::new();
            for chunk in chunks {
                memory_kinds.extend(memory_kinds_from_metadata(chunk));
            }

            let mut score = scoring::calculate_session_score(ScoringInput {
                session_id: session_id.clone(),
                chunk_similarities: chunks.iter().map(|c| c.similarity).collect(),
                total_chunks_in_session: total_chunks,
                session_last_modified: last_modified,
                memory_kinds,
                current_time: Some(now),
                chain_quality: None,
            });

            if params.apply_recency_boost && time_range.is_some() {
                let timestamp = last_modified.or_else(|| metadata.as_ref().and_then(|m| m.created_at));
                score.final_score += temporal::recency_boost(timestamp, now, 0.2, 30.0);
            }

            scores.push(score);
        }

        let ranked = scoring::rank(scores, top_n);

        let mut results = Vec::with_capacity(ranked.len());
        for score in ranked {
            let chunks = session_chunks.remove(&score.session_id).unwrap_or_default();
            let metadata = registry.get_session(&score.session_id);
            let preview = build_preview(&chunks, self.config.preview_length);
            results.push(SessionSearchResult {
                session_id: score.session_id.clone(),
                score,
                metadata,
                preview,
                matched_chunks: chunks,
            });
        }

        self.cache.lock().expect("search cache lock poisoned").put(key, results.clone());
        Ok(results)
    }

    /// Locate the session's source file by walking `sessions_root` for a
    /// file whose stem equals `session_id` (§4.8, same convention §6 uses
    /// to derive `session_id`), then build a truncated preview.
    pub fn get_session_preview(
        &self,
        session_id: &str,
        length: usize,
        registry: &SessionRegistry,
    ) -> anyhow::Result<Option<SessionPreview>> {
        let metadata = registry.get_session(session_id);

        let Some(path) = find_session_file(&self.sessions_root, session_id) else {
            return Ok(None);
        };

        let mut parser = SessionParser::new(false);
        let session_data = parser.parse_file(&path)?;
        if session_data.messages.is_empty() {
            return Ok(None);
        }

        let full_text = session_data
            .messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let preview = truncate_on_word_boundary(&full_text, length);

        let timestamps: Vec<DateTime<Utc>> = session_data.messages.iter().filter_map(|m| m.timestamp).collect();
        let date_range = if !timestamps.is_empty() {
            let start = *timestamps.iter().min().unwrap();
            let end = *timestamps.iter().max().unwrap();
            Some((start, end))
        } else {
            match (session_data.created_at, session_data.last_modified) {
                (Some(created), Some(modified)) => Some((created, modified)),
                _ => None,
            }
        };

        Ok(Some(SessionPreview {
            session_id: session_id.to_string(),
            preview,
            message_count: session_data.messages.len(),
            date_range,
            metadata,
        }))
    }
}

fn memory_kinds_from_metadata(chunk: &ChunkSearchResult) -> Vec<MemoryKind> {
    use crate::vector_store::MetaValue;
    match chunk.metadata.get("memory_kinds") {
        Some(MetaValue::Str(joined)) => joined
            .split(',')
            .filter_map(|s| match s.trim() {
                "PATTERN" => Some(MemoryKind::Pattern),
                "WORKING_SOLUTION" => Some(MemoryKind::WorkingSolution),
                "WAITING" => Some(MemoryKind::Waiting),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn truncate_on_word_boundary(text: &str, length: usize) -> String {
    if text.chars().count() <= length {
        return text.to_string();
    }
    let truncated: String = text.chars().take(length).collect();
    match truncated.rsplit_once(' ') {
        Some((head, _)) => format!("{head}…"),
        None => format!("{truncated}…"),
    }
}

/// Build a preview from the single highest-similarity chunk (§4.8 step 8).
fn build_preview(chunks: &[ChunkSearchResult], preview_length: usize) -> String {
    let Some(best) = chunks.iter().max_by(|a, b| a.similarity.partial_cmp(&b.similarity).unwrap()) else {
        return String::new();
    };
    truncate_on_word_boundary(best.content.trim(), preview_length)
}

fn find_session_file(root: &Path, session_id: &str) -> Option<PathBuf> {
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_file() && entry.path().file_stem().and_then(|s| s.to_str()) == Some(session_id) {
            return Some(entry.path().to_path_buf());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text_unchanged() {
        assert_eq!(truncate_on_word_boundary("short", 100), "short");
    }

    #[test]
    fn truncate_breaks_on_word_boundary_and_appends_ellipsis() {
        let text = "one two three four five";
        let truncated = truncate_on_word_boundary(text, 10);
        assert!(truncated.ends_with('…'));
        assert!(!truncated.contains("four"));
    }

    #[test]
    fn preview_empty_for_no_chunks() {
        assert_eq!(build_preview(&[], 200), "");
    }

    #[test]
    fn cache_key_differs_by_time_range() {
        let now = Utc::now();
        let range = TimeRange { start: now, end: now };
        let with_range = cache_key("q", Some(range));
        let without_range = cache_key("q", None);
        assert_ne!(with_range, without_range);
    }

    #[test]
    fn result_cache_evicts_oldest_beyond_capacity() {
        let mut cache = ResultCache::new(2);
        cache.put("a".into(), vec![]);
        cache.put("b".into(), vec![]);
        cache.put("c".into(), vec![]);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }
}
