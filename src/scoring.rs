//! Composite relevance scoring.
//!
//! Pure function over already-computed chunk similarities; no I/O. Grounded
//! directly on `scoring_service.py` — weights, boosts, and the recency decay
//! constant are carried over verbatim.

use crate::chunker::{memory_boost, MemoryKind};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

const WEIGHT_BEST_SIMILARITY: f32 = 0.40;
const WEIGHT_AVG_SIMILARITY: f32 = 0.20;
const WEIGHT_CHUNK_RATIO: f32 = 0.05;
const WEIGHT_RECENCY: f32 = 0.25;
const WEIGHT_CHAIN_QUALITY: f32 = 0.10;

const RECENCY_DECAY_CONSTANT_SECS: f64 = 30.0 * 24.0 * 60.0 * 60.0;

/// Chain-quality signal is not computed by any module in scope (§9 Open
/// Question): carried as a named placeholder rather than silently dropped,
/// so a future chain-quality estimator has a single constant to replace.
pub const DEFAULT_CHAIN_QUALITY: f32 = 0.5;

/// Inputs to [`calculate_session_score`] for one candidate session.
#[derive(Debug, Clone)]
pub struct ScoringInput {
    pub session_id: String,
    pub chunk_similarities: Vec<f32>,
    pub total_chunks_in_session: usize,
    pub session_last_modified: Option<DateTime<Utc>>,
    pub memory_kinds: BTreeSet<MemoryKind>,
    pub current_time: Option<DateTime<Utc>>,
    pub chain_quality: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionScore {
    pub session_id: String,
    pub final_score: f32,
    pub best_similarity: f32,
    pub avg_similarity: f32,
    pub chunk_ratio: f32,
    pub recency_score: f32,
    pub chain_quality: f32,
    pub memory_boost: f32,
    pub num_chunks_matched: usize,
}

fn calculate_recency_score(last_modified: Option<DateTime<Utc>>, current_time: DateTime<Utc>) -> f32 {
    let Some(last_modified) = last_modified else {
        return 0.0;
    };
    let age_seconds = (current_time - last_modified).num_seconds().max(0) as f64;
    (-age_seconds / RECENCY_DECAY_CONSTANT_SECS).exp() as f32
}

/// Calculate the composite score for one session's matched chunks.
pub fn calculate_session_score(input: ScoringInput) -> SessionScore {
    let chain_quality = input.chain_quality.unwrap_or(DEFAULT_CHAIN_QUALITY);

    if input.chunk_similarities.is_empty() {
        return SessionScore {
            session_id: input.session_id,
            final_score: 0.0,
            best_similarity: 0.0,
            avg_similarity: 0.0,
            chunk_ratio: 0.0,
            recency_score: 0.0,
            chain_quality,
            memory_boost: 0.0,
            num_chunks_matched: 0,
        };
    }

    let current_time = input.current_time.unwrap_or_else(Utc::now);
    let best_similarity = input.chunk_similarities.iter().copied().fold(f32::MIN, f32::max);
    let avg_similarity = input.chunk_similarities.iter().sum::<f32>() / input.chunk_similarities.len() as f32;
    let chunk_ratio = if input.total_chunks_in_session > 0 {
        input.chunk_similarities.len() as f32 / input.total_chunks_in_session as f32
    } else {
        0.0
    };
    let recency_score = calculate_recency_score(input.session_last_modified, current_time);
    let boost = memory_boost(&input.memory_kinds);

    let base_score = best_similarity * WEIGHT_BEST_SIMILARITY
        + avg_similarity * WEIGHT_AVG_SIMILARITY
        + chunk_ratio * WEIGHT_CHUNK_RATIO
        + recency_score * WEIGHT_RECENCY
        + chain_quality * WEIGHT_CHAIN_QUALITY;

    let final_score = (base_score + boost).max(0.0);

    SessionScore {
        session_id: input.session_id,
        final_score,
        best_similarity,
        avg_similarity,
        chunk_ratio,
        recency_score,
        chain_quality,
        memory_boost: boost,
        num_chunks_matched: input.chunk_similarities.len(),
    }
}

/// Stable sort by `final_score` descending, truncated to `top_k`.
pub fn rank(mut scores: Vec<SessionScore>, top_k: usize) -> Vec<SessionScore> {
    scores.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal));
    scores.truncate(top_k);
    scores
}
