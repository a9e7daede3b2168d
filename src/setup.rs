//! One-time bulk indexing of every session file already on disk, resumable
//! across interruption.
//!
//! Grounded on `original_source/initial_setup.py`: a JSON state file
//! tracking which files have already been processed, a `.jsonl`-by-size
//! discovery pass, and a per-file pipeline identical in shape to
//! [`crate::indexer::BackgroundIndexer::index_file`] but always run with
//! `force = true` (first run has no checkpoint to compare against).

use crate::chunker::chunk_messages;
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingService;
use crate::parser::SessionParser;
use crate::registry::{SessionMetadata, SessionRegistry};
use crate::vector_store::{ChunkRecord, Collection, MetaValue, VectorStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

const MIN_FILE_SIZE_BYTES: u64 = 100;

/// Persisted across runs so a crashed or interrupted setup can resume
/// without re-processing files it already finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupState {
    pub total_files: usize,
    pub processed_files: Vec<String>,
    pub started_at: chrono::DateTime<Utc>,
    pub last_updated: chrono::DateTime<Utc>,
}

impl SetupState {
    fn new(total_files: usize) -> Self {
        let now = Utc::now();
        Self { total_files, processed_files: Vec::new(), started_at: now, last_updated: now }
    }
}

/// Snapshot handed to the progress callback after each processed file.
#[derive(Debug, Clone)]
pub struct SetupProgress {
    pub total_files: usize,
    pub processed_files: usize,
    pub current_file: Option<String>,
    pub total_chunks: usize,
    pub elapsed_secs: f64,
    pub estimated_remaining_secs: Option<f64>,
    pub is_complete: bool,
    pub error: Option<String>,
}

/// Outcome of [`InitialSetup::run_setup`].
#[derive(Debug, Clone)]
pub struct SetupSummary {
    pub files_processed: usize,
    pub total_chunks: usize,
    pub errors: usize,
    pub elapsed_secs: f64,
    pub interrupted: bool,
}

pub type ProgressCallback = Box<dyn Fn(&SetupProgress) + Send + Sync>;

/// Logs progress through `tracing` rather than stdout, per §10.3 ("the
/// ambient stack is carried regardless of which outer surface calls in").
fn default_progress_callback(progress: &SetupProgress) {
    tracing::info!(
        processed = progress.processed_files,
        total = progress.total_files,
        chunks = progress.total_chunks,
        current = progress.current_file.as_deref().unwrap_or(""),
        "setup progress"
    );
}

fn find_session_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .filter(|entry| entry.metadata().map(|m| m.len() > MIN_FILE_SIZE_BYTES).unwrap_or(false))
        .map(|entry| entry.path().to_path_buf())
        .collect();
    files.sort();
    Ok(files)
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

/// One-time bulk indexer over every session file under `sessions_root`.
pub struct InitialSetup {
    storage_root: PathBuf,
    sessions_root: PathBuf,
    chunking_config: ChunkingConfig,
    embeddings: Arc<AsyncMutex<EmbeddingService>>,
    store: Arc<VectorStore>,
    registry: Arc<SessionRegistry>,
    interrupted: AtomicBool,
}

impl InitialSetup {
    pub fn new(
        storage_root: PathBuf,
        sessions_root: PathBuf,
        chunking_config: ChunkingConfig,
        embeddings: Arc<AsyncMutex<EmbeddingService>>,
        store: Arc<VectorStore>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            storage_root,
            sessions_root,
            chunking_config,
            embeddings,
            store,
            registry,
            interrupted: AtomicBool::new(false),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.storage_root.join("setup_state.json")
    }

    /// No storage directory yet existing at all.
    pub fn is_first_run(&self) -> bool {
        !self.storage_root.exists()
    }

    pub fn has_incomplete_setup(&self) -> bool {
        self.state_path().exists()
    }

    fn load_state(&self, total_files: usize) -> SetupState {
        match std::fs::read_to_string(self.state_path()) {
            Ok(body) => serde_json::from_str(&body).unwrap_or_else(|_| SetupState::new(total_files)),
            Err(_) => SetupState::new(total_files),
        }
    }

    fn save_state(&self, state: &SetupState) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.storage_root)?;
        let body = serde_json::to_string_pretty(state)?;
        let path = self.state_path();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete_state(&self) -> anyhow::Result<()> {
        let path = self.state_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Set from another thread/task to stop `run_setup` before its next
    /// file boundary; state is saved so `resume = true` picks back up.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    async fn process_session_file(&self, path: &Path) -> anyhow::Result<usize> {
        let mut parser = SessionParser::new(false);
        let session = parser.parse_file(path)?;
        let chunks = chunk_messages(&session.messages, &self.chunking_config);
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embeddings.lock().await.embed(&texts).await?;

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(embeddings.into_iter())
            .enumerate()
            .map(|(i, (chunk, embedding))| {
                let mut metadata = std::collections::HashMap::new();
                metadata.insert("chunk_index".to_string(), MetaValue::Int(i as i64));
                metadata.insert("start_index".to_string(), MetaValue::Int(chunk.first_message_index as i64));
                metadata.insert("end_index".to_string(), MetaValue::Int(chunk.last_message_index as i64));
                ChunkRecord {
                    chunk_id: format!("{}_{i}", session.session_id),
                    session_id: session.session_id.clone(),
                    chunk_index: i,
                    embedding,
                    content: chunk.content.clone(),
                    metadata,
                }
            })
            .collect();

        self.store.add(Collection::Active, &records)?;

        let mut metadata = SessionMetadata::new(&session.session_id);
        metadata.project = extract_project(path);
        metadata.created_at = session.created_at;
        metadata.last_modified = session.last_modified;
        metadata.chunk_count = records.len();
        metadata.message_count = session.messages.len();
        self.registry.add_session(&session.session_id, Some(metadata))?;

        Ok(records.len())
    }

    /// Run the full sweep. `resume = true` skips files already listed in a
    /// prior state file. Returns a summary; `interrupted` is set instead of
    /// an error if [`Self::interrupt`] fired mid-sweep.
    pub async fn run_setup(&self, resume: bool, on_progress: Option<&ProgressCallback>) -> anyhow::Result<SetupSummary> {
        let all_files = find_session_files(&self.sessions_root)?;
        let mut state = if resume { self.load_state(all_files.len()) } else { SetupState::new(all_files.len()) };
        state.total_files = all_files.len();

        let already_processed: HashSet<String> = state.processed_files.iter().cloned().collect();
        let start = std::time::Instant::now();
        let mut total_chunks = 0usize;
        let mut errors = 0usize;

        for path in &all_files {
            let key = path.to_string_lossy().to_string();
            if already_processed.contains(&key) {
                continue;
            }

            if self.interrupted.load(Ordering::SeqCst) {
                self.save_state(&state)?;
                return Ok(SetupSummary {
                    files_processed: state.processed_files.len(),
                    total_chunks,
                    errors,
                    elapsed_secs: start.elapsed().as_secs_f64(),
                    interrupted: true,
                });
            }

            match self.process_session_file(path).await {
                Ok(chunks) => total_chunks += chunks,
                Err(err) => {
                    errors += 1;
                    tracing::error!(path = %path.display(), %err, "failed to index session during setup");
                }
            }

            state.processed_files.push(key);
            state.last_updated = Utc::now();
            self.save_state(&state)?;

            if let Some(callback) = on_progress {
                let processed = state.processed_files.len();
                let elapsed = start.elapsed().as_secs_f64();
                let estimated_remaining = if processed > 0 {
                    Some(elapsed / processed as f64 * (state.total_files.saturating_sub(processed)) as f64)
                } else {
                    None
                };
                callback(&SetupProgress {
                    total_files: state.total_files,
                    processed_files: processed,
                    current_file: Some(path.display().to_string()),
                    total_chunks,
                    elapsed_secs: elapsed,
                    estimated_remaining_secs: estimated_remaining,
                    is_complete: false,
                    error: None,
                });
            } else {
                default_progress_callback(&SetupProgress {
                    total_files: state.total_files,
                    processed_files: state.processed_files.len(),
                    current_file: Some(path.display().to_string()),
                    total_chunks,
                    elapsed_secs: start.elapsed().as_secs_f64(),
                    estimated_remaining_secs: None,
                    is_complete: false,
                    error: None,
                });
            }
        }

        self.delete_state()?;

        Ok(SetupSummary {
            files_processed: state.processed_files.len(),
            total_chunks,
            errors,
            elapsed_secs: start.elapsed().as_secs_f64(),
            interrupted: false,
        })
    }
}
