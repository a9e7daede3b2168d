//! smart-fork-core — indexes past conversational session transcripts and
//! ranks them against a natural-language query so a caller can resume
//! ("fork") the most relevant prior session instead of starting over.
//!
//! The crate covers ingestion (parse → chunk → embed → persist), a
//! debounced background watcher that keeps the index current, composite
//! k-NN + metadata ranking, and an active/archive lifecycle for old
//! sessions. Framing it as RPC, REST, a CLI, or anything else is left to
//! the caller; see [`context::CoreContext`] for the composition root this
//! crate expects a caller to build once and hold for the process lifetime.

pub mod archive;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod parser;
pub mod registry;
pub mod scoring;
pub mod search;
pub mod setup;
pub mod temporal;
pub mod vector_store;

pub use config::Config;
pub use context::CoreContext;
pub use error::{CoreError, CoreResult, Interrupted};
