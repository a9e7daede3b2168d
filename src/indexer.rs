//! Background watcher that keeps the vector store and registry in sync with
//! session files on disk.
//!
//! Grounded on `original_source/background_indexer.py`: a coalescing
//! pending-task map keyed by file path, a debounce window before a changed
//! file is actually re-indexed, and a checkpoint rule that skips re-indexing
//! a file whose message count hasn't grown enough to matter. The filesystem
//! watch itself is `notify` in place of the source's `watchdog`; per §4.9 a
//! watcher that fails to start degrades to manual-only indexing rather than
//! making the whole service unavailable.

use crate::chunker::{chunk_messages, MemoryKind};
use crate::config::{ChunkingConfig, IndexingConfig};
use crate::embedding::EmbeddingService;
use crate::parser::SessionParser;
use crate::registry::{SessionMetadata, SessionRegistry, SessionUpdate};
use crate::vector_store::{ChunkRecord, Collection, MetaValue, VectorStore};
use chrono::{DateTime, Utc};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;

/// One file awaiting (re-)indexing. `last_indexed_count` is the message
/// count as of the last successful index, used for the checkpoint rule.
#[derive(Debug, Clone)]
pub struct IndexingTask {
    pub file_path: PathBuf,
    pub last_modified: DateTime<Utc>,
    pub message_count: usize,
    pub last_indexed_count: usize,
}

impl IndexingTask {
    pub fn needs_indexing(&self) -> bool {
        self.message_count > self.last_indexed_count
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexerStats {
    pub is_running: bool,
    pub pending_count: usize,
    pub watcher_active: bool,
}

fn count_nonempty_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|body| body.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}

fn extract_project(path: &Path) -> Option<String> {
    let mut components = path.components().peekable();
    while let Some(component) = components.next() {
        if component.as_os_str() == "projects" {
            return components.next().map(|c| c.as_os_str().to_string_lossy().to_string());
        }
    }
    None
}

/// Coalescing, debounced background indexer. Shared state lives behind
/// `Arc`s so the notify callback (running on its own thread) and the async
/// scheduler loop can both reach it.
pub struct BackgroundIndexer {
    indexing_config: IndexingConfig,
    chunking_config: ChunkingConfig,
    sessions_root: PathBuf,
    embeddings: Arc<AsyncMutex<EmbeddingService>>,
    store: Arc<VectorStore>,
    registry: Arc<SessionRegistry>,
    pending: Arc<AsyncMutex<HashMap<String, IndexingTask>>>,
    running: Arc<AtomicBool>,
    scheduler_handle: AsyncMutex<Option<JoinHandle<()>>>,
    watcher: AsyncMutex<Option<RecommendedWatcher>>,
}

impl BackgroundIndexer {
    pub fn new(
        indexing_config: IndexingConfig,
        chunking_config: ChunkingConfig,
        sessions_root: PathBuf,
        embeddings: Arc<AsyncMutex<EmbeddingService>>,
        store: Arc<VectorStore>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            indexing_config,
            chunking_config,
            sessions_root,
            embeddings,
            store,
            registry,
            pending: Arc::new(AsyncMutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            scheduler_handle: AsyncMutex::new(None),
            watcher: AsyncMutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn get_pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn get_stats(&self) -> IndexerStats {
        IndexerStats {
            is_running: self.is_running(),
            pending_count: self.get_pending_count().await,
            watcher_active: self.watcher.lock().await.is_some(),
        }
    }

    /// Idempotent: calling `start` while already running is a no-op.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.indexing_config.watcher_enabled {
            match self.spawn_watcher() {
                Ok(watcher) => *self.watcher.lock().await = Some(watcher),
                Err(err) => {
                    tracing::warn!(%err, "filesystem watcher unavailable, falling back to manual indexing only");
                }
            }
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.scheduler_loop().await });
        *self.scheduler_handle.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            handle.abort();
        }
        *self.watcher.lock().await = None;
    }

    fn spawn_watcher(self: &Arc<Self>) -> anyhow::Result<RecommendedWatcher> {
        let this = Arc::clone(self);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            if !matches!(
                event.kind,
                notify::EventKind::Modify(_) | notify::EventKind::Create(_)
            ) {
                return;
            }
            for path in event.paths {
                if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    this.on_file_changed_blocking(path);
                }
            }
        })?;
        watcher.watch(&self.sessions_root, RecursiveMode::Recursive)?;
        Ok(watcher)
    }

    /// Coalescing upsert into the pending map, called from the notify
    /// callback thread. Mirrors `_on_file_changed`: only creates a task if
    /// the file actually needs indexing, only touches an existing task if
    /// this event is newer or shows more messages.
    fn on_file_changed_blocking(&self, path: PathBuf) {
        let message_count = count_nonempty_lines(&path);
        let last_modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let key = path.to_string_lossy().to_string();

        let mut pending = self.pending.blocking_lock();
        match pending.get_mut(&key) {
            Some(existing) => {
                if last_modified > existing.last_modified || message_count > existing.message_count {
                    existing.last_modified = last_modified;
                    existing.message_count = message_count;
                }
            }
            None => {
                let task = IndexingTask { file_path: path, last_modified, message_count, last_indexed_count: 0 };
                if task.needs_indexing() {
                    pending.insert(key, task);
                }
            }
        }
    }

    /// Poll loop: wakes at most once a second, submits any task whose
    /// debounce window has elapsed, bounded by `worker_count` concurrent
    /// indexing jobs.
    async fn scheduler_loop(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.indexing_config.worker_count.max(1)));
        let poll_interval = std::time::Duration::from_millis(1000);

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(poll_interval).await;

            let ready: Vec<IndexingTask> = {
                let mut pending = self.pending.lock().await;
                let now = Utc::now();
                let debounce = chrono::Duration::seconds(self.indexing_config.debounce_secs as i64);
                let ready_keys: Vec<String> = pending
                    .iter()
                    .filter(|(_, task)| now - task.last_modified >= debounce)
                    .map(|(key, _)| key.clone())
                    .collect();
                ready_keys.into_iter().filter_map(|key| pending.remove(&key)).collect()
            };

            for task in ready {
                let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore not closed");
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = this.index_file(&task.file_path, false).await {
                        tracing::error!(path = %task.file_path.display(), %err, "background indexing failed");
                    }
                });
            }
        }
    }

    /// Manually (re-)index one file. `force` bypasses the checkpoint-skip
    /// rule. Returns the number of chunks written.
    pub async fn index_file(&self, path: &Path, force: bool) -> anyhow::Result<usize> {
        let mut parser = SessionParser::new(false);
        let session = parser.parse_file(path)?;
        let session_id = session.session_id.clone();

        let existing = self.registry.get_session(&session_id);
        let last_indexed_count = existing.as_ref().map(|m| m.message_count).unwrap_or(0);
        let new_message_count = session.messages.len();

        if !force
            && last_indexed_count > 0
            && new_message_count.saturating_sub(last_indexed_count) < self.indexing_config.checkpoint_interval
        {
            tracing::debug!(session_id, "skipping re-index, below checkpoint threshold");
            return Ok(0);
        }

        let chunks = chunk_messages(&session.messages, &self.chunking_config);
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embeddings.lock().await.embed(&texts).await?;

        self.store.delete_by_session(Collection::Active, &session_id)?;

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(embeddings.into_iter())
            .enumerate()
            .map(|(i, (chunk, embedding))| ChunkRecord {
                chunk_id: format!("{session_id}_{i}"),
                session_id: session_id.clone(),
                chunk_index: i,
                embedding,
                content: chunk.content.clone(),
                metadata: chunk_metadata(chunk, i),
            })
            .collect();
        self.store.add(Collection::Active, &records)?;

        let project = extract_project(path);
        let update = SessionUpdate {
            project,
            created_at: session.created_at,
            last_modified: session.last_modified,
            chunk_count: Some(records.len()),
            message_count: Some(new_message_count),
            ..Default::default()
        };

        if self.registry.update_session(&session_id, update.clone())?.is_none() {
            let mut metadata = SessionMetadata::new(&session_id);
            metadata.project = update.project;
            metadata.created_at = update.created_at;
            metadata.last_modified = update.last_modified;
            metadata.chunk_count = records.len();
            metadata.message_count = new_message_count;
            self.registry.add_session(&session_id, Some(metadata))?;
        }

        Ok(records.len())
    }

    /// Full manual sweep of `sessions_root`, indexing every `.jsonl` file.
    pub async fn scan_directory(&self, force: bool) -> anyhow::Result<usize> {
        let mut total = 0;
        for entry in walkdir::WalkDir::new(&self.sessions_root).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_file() && entry.path().extension().and_then(|e| e.to_str()) == Some("jsonl") {
                total += self.index_file(entry.path(), force).await?;
            }
        }
        Ok(total)
    }
}

fn chunk_metadata(chunk: &crate::chunker::Chunk, index: usize) -> crate::vector_store::Metadata {
    let mut metadata = HashMap::new();
    metadata.insert("chunk_index".to_string(), MetaValue::Int(index as i64));
    metadata.insert("start_index".to_string(), MetaValue::Int(chunk.first_message_index as i64));
    metadata.insert("end_index".to_string(), MetaValue::Int(chunk.last_message_index as i64));
    metadata.insert("token_count".to_string(), MetaValue::Int(chunk.token_count as i64));
    metadata.insert("is_overlap".to_string(), MetaValue::Bool(chunk.is_overlap));
    if !chunk.memory_kinds.is_empty() {
        let joined = chunk
            .memory_kinds
            .iter()
            .map(MemoryKind::to_string)
            .collect::<Vec<_>>()
            .join(",");
        metadata.insert("memory_kinds".to_string(), MetaValue::Str(joined));
    }
    metadata
}
