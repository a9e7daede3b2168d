//! Turns text into unit-norm vectors, adaptively batched and cache-backed.
//!
//! The HTTP call to an embeddings backend is kept behind a small trait so the
//! adaptive-batching and cache-merge logic in [`EmbeddingService`] applies to
//! any backend, not just the OpenAI-compatible one shipped here.

use crate::cache::EmbeddingCache;
use crate::config::EmbeddingConfig;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::System;

/// A source of raw (not necessarily normalised) embeddings for a batch of
/// texts, in order. Implementations own model/connection lifecycle.
#[async_trait::async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// OpenAI-compatible embeddings endpoint (OpenRouter and friends).
pub struct OpenAiCompatibleBackend {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    index: usize,
}

impl OpenAiCompatibleBackend {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model,
            client: reqwest::Client::new(),
        }
    }

    /// Resolution order: `OPENROUTER_API_KEY` env var, else
    /// `~/.clawdbot/clawdbot.json`'s `models.providers.openrouter.apiKey`.
    pub fn from_env(model: String) -> Result<Self> {
        if let Ok(api_key) = std::env::var("OPENROUTER_API_KEY") {
            return Ok(Self::new(api_key, model));
        }

        let home = std::env::var("HOME").context("HOME not set")?;
        let config_path = std::path::Path::new(&home).join(".clawdbot/clawdbot.json");
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: serde_json::Value = serde_json::from_str(&content)?;
        let api_key = config
            .get("models")
            .and_then(|m| m.get("providers"))
            .and_then(|p| p.get("openrouter"))
            .and_then(|o| o.get("apiKey"))
            .and_then(|k| k.as_str())
            .ok_or_else(|| anyhow!("OpenRouter API key not found in clawdbot.json"))?
            .to_string();

        Ok(Self::new(api_key, model))
    }
}

#[async_trait::async_trait]
impl EmbeddingBackend for OpenAiCompatibleBackend {
    async fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest { model: &self.model, input: texts };
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .context("failed to send embedding request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("embedding API error {status}: {body}"));
        }

        let mut parsed: EmbeddingResponse = response.json().await.context("failed to parse embedding response")?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Adaptive batch sizing: linear interpolation between `min_batch` (at or
/// below a low-memory threshold) and `max_batch` (at or above a comfortable
/// threshold), sampled once per `embed` call.
fn calculate_batch_size(config: &EmbeddingConfig, system: &mut System) -> usize {
    const LOW_THRESHOLD_BYTES: u64 = 512 * 1024 * 1024; // 512 MiB
    const HIGH_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024 * 1024; // 4 GiB

    system.refresh_memory();
    let free = system.available_memory();

    if free <= LOW_THRESHOLD_BYTES {
        return config.min_batch_size;
    }
    if free >= HIGH_THRESHOLD_BYTES {
        return config.max_batch_size;
    }

    let span = (HIGH_THRESHOLD_BYTES - LOW_THRESHOLD_BYTES) as f64;
    let position = (free - LOW_THRESHOLD_BYTES) as f64 / span;
    let size = config.min_batch_size as f64
        + position * (config.max_batch_size - config.min_batch_size) as f64;
    (size.round() as usize).clamp(config.min_batch_size, config.max_batch_size)
}

fn l2_normalise(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cache-first, adaptively-batched embedding service.
pub struct EmbeddingService {
    backend: Arc<dyn EmbeddingBackend>,
    cache: Arc<EmbeddingCache>,
    config: EmbeddingConfig,
    system: System,
}

impl EmbeddingService {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, cache: Arc<EmbeddingCache>, config: EmbeddingConfig) -> Self {
        Self { backend, cache, config, system: System::new() }
    }

    /// Embed `texts`, preserving input order. Cache hits never touch the
    /// backend; misses are computed in adaptively-sized sub-batches and
    /// written back to the cache before returning.
    pub async fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let (mut vectors, miss_indices) = self.cache.get_batch(texts);
        if miss_indices.is_empty() {
            return Ok(vectors.into_iter().map(|v| v.expect("all present")).collect());
        }

        let miss_texts: Vec<String> = miss_indices.iter().map(|&i| texts[i].clone()).collect();
        let batch_size = calculate_batch_size(&self.config, &mut self.system).max(1);

        let mut computed = Vec::with_capacity(miss_texts.len());
        let chunks: Vec<&[String]> = miss_texts.chunks(batch_size).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let mut raw = self
                .backend
                .embed_raw(chunk)
                .await
                .map_err(|e| anyhow!("embed error: {e}"))?;
            for vector in raw.iter_mut() {
                l2_normalise(vector);
            }
            self.cache.put_batch(chunk, &raw)?;
            computed.extend(raw);

            if i + 1 < chunks.len() {
                tokio::task::yield_now().await;
            }
        }

        for (miss_idx, vector) in miss_indices.into_iter().zip(computed.into_iter()) {
            vectors[miss_idx] = Some(vector);
        }

        Ok(vectors.into_iter().map(|v| v.expect("filled from cache or compute")).collect())
    }

    pub async fn embed_one(&mut self, text: &str) -> Result<Vec<f32>> {
        let result = self.embed(&[text.to_string()]).await?;
        result.into_iter().next().ok_or_else(|| anyhow!("no embedding returned"))
    }

    pub fn flush_cache(&self) -> Result<()> {
        self.cache.flush()
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubBackend {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EmbeddingBackend for StubBackend {
        async fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let seed = t.bytes().map(|b| b as f32).sum::<f32>();
                    vec![seed, seed + 1.0, seed + 2.0]
                })
                .collect())
        }
    }

    fn cache() -> (tempfile::TempDir, Arc<EmbeddingCache>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::open(&dir.path().join("cache.json")).unwrap();
        (dir, Arc::new(cache))
    }

    #[tokio::test]
    async fn outputs_are_unit_normalised() {
        let (_dir, cache) = cache();
        let backend = Arc::new(StubBackend { calls: AtomicUsize::new(0) });
        let mut service = EmbeddingService::new(backend, cache, EmbeddingConfig::default());

        let vectors = service.embed(&["hello world".to_string()]).await.unwrap();
        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn repeated_call_is_cache_idempotent() {
        let (_dir, cache) = cache();
        let backend = Arc::new(StubBackend { calls: AtomicUsize::new(0) });
        let mut service = EmbeddingService::new(backend.clone(), cache, EmbeddingConfig::default());

        let first = service.embed(&["same text".to_string()]).await.unwrap();
        let second = service.embed(&["same text".to_string()]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1, "second call should be a pure cache hit");
    }

    #[tokio::test]
    async fn preserves_input_order_across_cache_hits_and_misses() {
        let (_dir, cache) = cache();
        // Cache entries are already unit-normalised by the time `embed`
        // would have written them; a cache hit is returned verbatim, with
        // no re-normalisation pass, so the fixture must be pre-normalised.
        let mut cached_vector = vec![9.0, 9.0, 9.0];
        l2_normalise(&mut cached_vector);
        cache.put("already cached", cached_vector.clone());
        let backend = Arc::new(StubBackend { calls: AtomicUsize::new(0) });
        let mut service = EmbeddingService::new(backend, cache, EmbeddingConfig::default());

        let texts = vec!["already cached".to_string(), "fresh text".to_string()];
        let vectors = service.embed(&texts).await.unwrap();
        assert!((vectors[0][0] - cached_vector[0]).abs() < 1e-4);
    }
}
