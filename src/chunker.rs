//! Chunking and memory-marker detection.
//!
//! Groups parsed messages into overlapping token-bounded chunks that respect
//! turn boundaries and never split inside a single message, then tags each
//! chunk with the coarse PATTERN / WORKING_SOLUTION / WAITING markers.

use crate::config::ChunkingConfig;
use crate::parser::Message;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryKind {
    Pattern,
    WorkingSolution,
    Waiting,
}

impl MemoryKind {
    pub fn boost(self) -> f32 {
        match self {
            MemoryKind::Pattern => 0.05,
            MemoryKind::WorkingSolution => 0.08,
            MemoryKind::Waiting => 0.02,
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryKind::Pattern => "PATTERN",
            MemoryKind::WorkingSolution => "WORKING_SOLUTION",
            MemoryKind::Waiting => "WAITING",
        };
        write!(f, "{s}")
    }
}

/// Additive boost for a set of kinds; duplicates and unknown kinds never
/// contribute twice since the caller always passes a `BTreeSet`.
pub fn memory_boost(kinds: &BTreeSet<MemoryKind>) -> f32 {
    kinds.iter().map(|k| k.boost()).sum()
}

struct MarkerPattern {
    kind: MemoryKind,
    regex: Regex,
}

fn word_boundary_pattern(phrases: &[&str]) -> Regex {
    let joined = phrases
        .iter()
        .map(|p| regex::escape(p))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{joined})\b")).expect("static marker pattern")
}

static MARKER_PATTERNS: Lazy<Vec<MarkerPattern>> = Lazy::new(|| {
    vec![
        MarkerPattern {
            kind: MemoryKind::Pattern,
            regex: word_boundary_pattern(&[
                "design pattern",
                "architectural pattern",
                "pattern",
                "approach",
                "strategy",
            ]),
        },
        MarkerPattern {
            kind: MemoryKind::WorkingSolution,
            regex: word_boundary_pattern(&[
                "working solution",
                "proven implementation",
                "all tests pass",
                "successful",
                "tested",
                "verified",
            ]),
        },
        MarkerPattern {
            kind: MemoryKind::Waiting,
            regex: word_boundary_pattern(&[
                "to be completed",
                "in progress",
                "waiting",
                "pending",
                "todo",
                "blocked",
            ]),
        },
    ]
});

pub fn detect_memory_kinds(text: &str) -> BTreeSet<MemoryKind> {
    MARKER_PATTERNS
        .iter()
        .filter(|p| p.regex.is_match(text))
        .map(|p| p.kind)
        .collect()
}

/// A chunk of contiguous messages treated as one retrieval unit.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub content: String,
    pub first_message_index: usize,
    pub last_message_index: usize,
    pub token_count: usize,
    pub is_overlap: bool,
    pub memory_kinds: BTreeSet<MemoryKind>,
    pub timestamp: Option<DateTime<Utc>>,
}

fn count_tokens(text: &str) -> usize {
    ((text.len() + 3) / 4).max(1)
}

fn render(messages: &[&Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Walk messages in order and emit overlapping chunks per §4.2.
pub fn chunk_messages(messages: &[Message], config: &ChunkingConfig) -> Vec<Chunk> {
    if messages.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < messages.len() {
        let mut end = start; // inclusive index of last message in this chunk
        let mut running_tokens = 0usize;

        loop {
            let next_tokens = count_tokens(&messages[end].content);

            // Force-split: a single oversized message becomes its own chunk.
            if end == start && running_tokens == 0 && next_tokens > config.max_tokens {
                running_tokens = next_tokens;
                break;
            }

            if running_tokens + next_tokens > config.max_tokens {
                // Emitting would blow the max; stop before `end` unless `end`
                // is still the first message (handled above).
                if end > start {
                    end -= 1;
                    break;
                }
                running_tokens += next_tokens;
                break;
            }

            running_tokens += next_tokens;

            let reached_target = running_tokens >= config.target_tokens;
            let is_assistant_turn = messages[end].role == "assistant";
            let next_would_overflow = end + 1 < messages.len()
                && running_tokens + count_tokens(&messages[end + 1].content) > config.max_tokens;

            if reached_target && (is_assistant_turn || next_would_overflow) {
                break;
            }

            if end + 1 >= messages.len() {
                break;
            }
            end += 1;
        }

        let slice: Vec<&Message> = messages[start..=end].iter().collect();
        let content = render(&slice);
        let token_count = count_tokens(&content).max(running_tokens);
        let memory_kinds = detect_memory_kinds(&content);
        let timestamp = slice.first().and_then(|m| m.timestamp);
        let is_overlap = start > 0;

        chunks.push(Chunk {
            content,
            first_message_index: start,
            last_message_index: end,
            token_count,
            is_overlap,
            memory_kinds,
            timestamp,
        });

        if end + 1 >= messages.len() {
            break;
        }

        let next_start = find_overlap_start(messages, end, config.overlap_tokens);
        // Forward-progress invariant: never re-emit the same window.
        start = next_start.max(start + 1);
    }

    chunks
}

/// Walk backward from `last_index` accumulating tokens until reaching
/// `overlap_tokens`, then return the index to resume iteration from.
/// Clamped so progress is never lost (forward-progress invariant).
fn find_overlap_start(messages: &[Message], last_index: usize, overlap_tokens: usize) -> usize {
    let mut accumulated = 0usize;
    let mut idx = last_index;

    loop {
        accumulated += count_tokens(&messages[idx].content);
        if accumulated >= overlap_tokens || idx == 0 {
            break;
        }
        idx -= 1;
    }

    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> Message {
        Message {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: None,
            meta: None,
        }
    }

    fn default_config() -> ChunkingConfig {
        ChunkingConfig::default()
    }

    #[test]
    fn s1_each_near_target_message_force_splits_into_its_own_chunk() {
        // 4 messages of roles u/a/u/a, each ~3000 chars (~750 tokens): each
        // message alone already reaches target_tokens, so pairing it with a
        // second message would exceed max_tokens (1000) and force-splits
        // every message into its own chunk.
        let big = "x".repeat(3000);
        let messages = vec![
            msg("user", &big),
            msg("assistant", &big),
            msg("user", &big),
            msg("assistant", &big),
        ];
        let chunks = chunk_messages(&messages, &default_config());
        assert_eq!(chunks.len(), 4, "expected one chunk per message, got {}", chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.first_message_index, i);
            assert_eq!(chunk.last_message_index, i);
        }
    }

    #[test]
    fn progress_invariant_first_message_index_strictly_increases() {
        let big = "y".repeat(2000);
        let messages: Vec<Message> = (0..10)
            .map(|i| msg(if i % 2 == 0 { "user" } else { "assistant" }, &big))
            .collect();
        let chunks = chunk_messages(&messages, &default_config());
        for pair in chunks.windows(2) {
            assert!(pair[1].first_message_index > pair[0].first_message_index);
        }
    }

    #[test]
    fn coverage_spans_full_message_range() {
        let messages: Vec<Message> = (0..6)
            .map(|i| msg(if i % 2 == 0 { "user" } else { "assistant" }, "short message"))
            .collect();
        let chunks = chunk_messages(&messages, &default_config());
        assert_eq!(chunks.last().unwrap().last_message_index, messages.len() - 1);
        assert_eq!(chunks.first().unwrap().first_message_index, 0);
    }

    #[test]
    fn oversized_single_message_becomes_its_own_chunk() {
        let huge = "z".repeat(5000); // ~1250 tokens > max_tokens(1000)
        let messages = vec![msg("user", "short"), msg("assistant", &huge), msg("user", "short2")];
        let chunks = chunk_messages(&messages, &default_config());
        let oversized = chunks.iter().find(|c| c.token_count > default_config().max_tokens);
        assert!(oversized.is_some(), "expected an oversized chunk to exist");
        let oversized = oversized.unwrap();
        assert_eq!(oversized.first_message_index, oversized.last_message_index);
    }

    #[test]
    fn empty_messages_yield_no_chunks() {
        assert!(chunk_messages(&[], &default_config()).is_empty());
    }

    #[test]
    fn pattern_keyword_detected() {
        let kinds = detect_memory_kinds("We should use the factory pattern here.");
        assert!(kinds.contains(&MemoryKind::Pattern));
    }

    #[test]
    fn patterned_does_not_match_pattern_word_boundary() {
        let kinds = detect_memory_kinds("This is patterned fabric.");
        assert!(!kinds.contains(&MemoryKind::Pattern));
    }

    #[test]
    fn working_solution_keywords_detected() {
        assert!(detect_memory_kinds("All tests pass now.").contains(&MemoryKind::WorkingSolution));
        assert!(detect_memory_kinds("This has been verified.").contains(&MemoryKind::WorkingSolution));
    }

    #[test]
    fn waiting_keywords_detected() {
        assert!(detect_memory_kinds("TODO: finish this.").contains(&MemoryKind::Waiting));
        assert!(detect_memory_kinds("Blocked on review.").contains(&MemoryKind::Waiting));
    }

    #[test]
    fn all_three_kinds_detected_together() {
        let text = "We implemented the observer pattern successfully. The solution has been tested and verified. Still waiting for code review.";
        let kinds = detect_memory_kinds(text);
        assert_eq!(kinds.len(), 3);
    }

    #[test]
    fn boost_additivity() {
        let mut a = BTreeSet::new();
        a.insert(MemoryKind::Pattern);
        let mut b = BTreeSet::new();
        b.insert(MemoryKind::WorkingSolution);
        let mut both = BTreeSet::new();
        both.insert(MemoryKind::Pattern);
        both.insert(MemoryKind::WorkingSolution);

        let boost_a = memory_boost(&a);
        let boost_b = memory_boost(&b);
        let boost_both = memory_boost(&both);
        assert!((boost_both - (boost_a + boost_b)).abs() < 1e-6);
    }

    #[test]
    fn duplicate_kind_in_set_has_no_extra_effect() {
        let mut kinds = BTreeSet::new();
        kinds.insert(MemoryKind::Waiting);
        kinds.insert(MemoryKind::Waiting);
        assert_eq!(kinds.len(), 1);
        assert!((memory_boost(&kinds) - 0.02).abs() < 1e-6);
    }
}
