//! Configuration layer.
//!
//! Mirrors the shape of the source's `ConfigManager`: one `Config` document
//! with sub-sections per component, defaults matching every numeric constant
//! fixed by the component specs, loaded from an optional JSON file with a
//! silent fall-back to defaults on a missing or corrupt file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model_name: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub max_batch_size: usize,
    pub min_batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_name: "openai/text-embedding-3-small".to_string(),
            dimension: 768,
            batch_size: 32,
            max_batch_size: 128,
            min_batch_size: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub k_chunks: usize,
    pub top_n_sessions: usize,
    pub preview_length: usize,
    pub similarity_threshold: f32,
    pub recency_weight: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k_chunks: 200,
            top_n_sessions: 5,
            preview_length: 200,
            similarity_threshold: 0.3,
            recency_weight: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 750,
            overlap_tokens: 150,
            max_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexingConfig {
    pub debounce_secs: u64,
    pub checkpoint_interval: usize,
    pub watcher_enabled: bool,
    pub worker_count: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            debounce_secs: 5,
            checkpoint_interval: 15,
            watcher_enabled: true,
            worker_count: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    pub threshold_days: i64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { threshold_days: 365 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub chunking: ChunkingConfig,
    pub indexing: IndexingConfig,
    pub archive: ArchiveConfig,
    pub storage_dir: Option<PathBuf>,
    pub sessions_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            chunking: ChunkingConfig::default(),
            indexing: IndexingConfig::default(),
            archive: ArchiveConfig::default(),
            storage_dir: None,
            sessions_dir: None,
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults (with a warning log) on a
    /// missing or unparseable file. Never fails: configuration errors are
    /// lenient by the same policy as everything else under §7.
    pub fn load(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            return Self::default();
        };

        match serde_json::from_str::<Self>(&content) {
            Ok(mut config) => {
                if let Err(reason) = config.validate() {
                    tracing::warn!(%reason, "config file failed validation, using defaults");
                    config = Self::default();
                }
                config
            }
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "invalid config file, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Boundary checks mirroring `ConfigManager.validate` in the source.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.embedding.batch_size == 0 {
            return Err("embedding.batch_size must be > 0".into());
        }
        if self.embedding.min_batch_size > self.embedding.max_batch_size {
            return Err("embedding.min_batch_size cannot exceed max_batch_size".into());
        }
        if self.search.k_chunks == 0 {
            return Err("search.k_chunks must be > 0".into());
        }
        if self.search.top_n_sessions == 0 {
            return Err("search.top_n_sessions must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.search.similarity_threshold) {
            return Err("search.similarity_threshold must be in [0,1]".into());
        }
        if !(0.0..=1.0).contains(&self.search.recency_weight) {
            return Err("search.recency_weight must be in [0,1]".into());
        }
        if self.chunking.target_tokens == 0 {
            return Err("chunking.target_tokens must be > 0".into());
        }
        if self.chunking.max_tokens == 0 {
            return Err("chunking.max_tokens must be > 0".into());
        }
        if self.chunking.target_tokens > self.chunking.max_tokens {
            return Err("chunking.target_tokens cannot exceed max_tokens".into());
        }
        if self.indexing.checkpoint_interval == 0 {
            return Err("indexing.checkpoint_interval must be > 0".into());
        }
        Ok(())
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(default_storage_dir)
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.sessions_dir.clone().unwrap_or_else(default_sessions_dir)
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

pub fn default_storage_dir() -> PathBuf {
    home_dir().join(".smart-fork")
}

pub fn default_sessions_dir() -> PathBuf {
    home_dir().join(".claude")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = Config::default();
        assert_eq!(config.chunking.target_tokens, 750);
        assert_eq!(config.chunking.max_tokens, 1000);
        assert_eq!(config.chunking.overlap_tokens, 150);
        assert_eq!(config.indexing.debounce_secs, 5);
        assert_eq!(config.indexing.checkpoint_interval, 15);
        assert_eq!(config.archive.threshold_days, 365);
        assert_eq!(config.search.k_chunks, 200);
        assert_eq!(config.search.top_n_sessions, 5);
    }

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_batch_bounds() {
        let mut config = Config::default();
        config.embedding.min_batch_size = 200;
        config.embedding.max_batch_size = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_target_over_max_tokens() {
        let mut config = Config::default();
        config.chunking.target_tokens = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_falls_back_to_defaults_on_missing_file() {
        let config = Config::load(Path::new("/nonexistent/path/for/smart-fork-tests/config.json"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("smart-fork-config-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut config = Config::default();
        config.search.top_n_sessions = 9;
        config.save(&path).unwrap();

        let reloaded = Config::load(&path);
        assert_eq!(reloaded.search.top_n_sessions, 9);

        std::fs::remove_dir_all(&dir).ok();
    }
}
