//! Composition root.
//!
//! Wires every component from one [`Config`] into a single owning
//! [`CoreContext`], replacing the teacher's free-function `Paths` +
//! ad-hoc wiring in `main.rs` with the "construct a root context… pass
//! explicitly, destroy in reverse order" shape called for by the
//! redesign cues.

use crate::archive::ArchiveService;
use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::embedding::{EmbeddingService, OpenAiCompatibleBackend};
use crate::indexer::BackgroundIndexer;
use crate::registry::SessionRegistry;
use crate::search::SearchService;
use crate::setup::InitialSetup;
use crate::vector_store::VectorStore;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Owns every long-lived component, constructed once from a [`Config`] and
/// handed out by reference (or `Arc` for components shared with background
/// tasks) to callers. Dropped in declaration order, which tears down the
/// background indexer before the stores it writes into.
pub struct CoreContext {
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<VectorStore>,
    pub cache: Arc<EmbeddingCache>,
    pub embeddings: Arc<AsyncMutex<EmbeddingService>>,
    pub search: SearchService,
    pub indexer: Arc<BackgroundIndexer>,
}

impl CoreContext {
    /// Build every component from `config`. The embedding backend is an
    /// OpenAI-compatible HTTP client (§4.3); its API key resolution is
    /// delegated to [`OpenAiCompatibleBackend::from_env`].
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let storage_root = config.storage_root();
        let sessions_root = config.sessions_root();

        let registry = Arc::new(SessionRegistry::open(&storage_root.join("session-registry.json"))?);
        let store = Arc::new(VectorStore::open(&storage_root.join("vector_db").join("store.sqlite"))?);
        let cache = Arc::new(EmbeddingCache::open(&storage_root.join("embedding_cache").join("cache.json"))?);

        let backend = Arc::new(OpenAiCompatibleBackend::from_env(config.embedding.model_name.clone())?);
        let embeddings = Arc::new(AsyncMutex::new(EmbeddingService::new(
            backend,
            Arc::clone(&cache),
            config.embedding.clone(),
        )));

        let search = SearchService::new(config.search.clone(), sessions_root.clone());

        let indexer = Arc::new(BackgroundIndexer::new(
            config.indexing.clone(),
            config.chunking.clone(),
            sessions_root,
            Arc::clone(&embeddings),
            Arc::clone(&store),
            Arc::clone(&registry),
        ));

        Ok(Self { config, registry, store, cache, embeddings, search, indexer })
    }

    pub fn initial_setup(&self) -> InitialSetup {
        InitialSetup::new(
            self.config.storage_root(),
            self.config.sessions_root(),
            self.config.chunking.clone(),
            Arc::clone(&self.embeddings),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
        )
    }

    pub fn archive(&self) -> ArchiveService<'_> {
        ArchiveService::new(&self.store, &self.registry, self.config.archive.threshold_days)
    }

    /// Flush write-through caches and stop the background indexer, in the
    /// reverse order components were brought up.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.indexer.stop().await;
        self.cache.flush()?;
        Ok(())
    }
}
