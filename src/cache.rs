//! Content-addressed embedding cache.
//!
//! Maps SHA-256 of the exact chunk text to its embedding vector, persisted
//! as one JSON file written atomically (temp-then-rename). `put` is a no-op
//! when the hash is already cached, matching the source's idempotence.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        if self.total_requests() == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_requests() as f64 * 100.0
        }
    }
}

struct Inner {
    entries: HashMap<String, Vec<f32>>,
    stats: CacheStats,
}

/// Persistent content-addressed embedding cache.
pub struct EmbeddingCache {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl EmbeddingCache {
    pub fn open(cache_file: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = cache_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entries = if cache_file.exists() {
            let body = std::fs::read_to_string(cache_file)?;
            serde_json::from_str::<HashMap<String, Vec<f32>>>(&body).unwrap_or_else(|err| {
                tracing::error!(%err, "embedding cache corrupt, starting fresh");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: cache_file.to_path_buf(),
            inner: Mutex::new(Inner { entries, stats: CacheStats::default() }),
        })
    }

    fn hash(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = Self::hash(text);
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match inner.entries.get(&key).cloned() {
            Some(vector) => {
                inner.stats.hits += 1;
                Some(vector)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Returns `(vector-or-None per input, indices that missed)`.
    pub fn get_batch(&self, texts: &[String]) -> (Vec<Option<Vec<f32>>>, Vec<usize>) {
        let mut vectors = Vec::with_capacity(texts.len());
        let mut misses = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let hit = self.get(text);
            if hit.is_none() {
                misses.push(i);
            }
            vectors.push(hit);
        }
        (vectors, misses)
    }

    /// No-op if the hash is already present, preserving first-writer-wins.
    pub fn put(&self, text: &str, embedding: Vec<f32>) {
        let key = Self::hash(text);
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.entry(key).or_insert(embedding);
    }

    pub fn put_batch(&self, texts: &[String], embeddings: &[Vec<f32>]) -> anyhow::Result<()> {
        if texts.len() != embeddings.len() {
            anyhow::bail!(
                "texts count ({}) must match embeddings count ({})",
                texts.len(),
                embeddings.len()
            );
        }
        for (text, embedding) in texts.iter().zip(embeddings.iter()) {
            self.put(text, embedding.clone());
        }
        Ok(())
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let body = serde_json::to_string(&inner.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            inner.entries.clear();
        }
        self.flush()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().expect("cache lock poisoned").stats
    }
}
