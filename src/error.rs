//! Typed error kinds for the core's public boundaries.
//!
//! Internals use `anyhow::Result` for call chains where only a human-readable
//! chain matters; at each component's public entry point that chain is folded
//! into one of these variants so callers can match on kind instead of
//! parsing strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("model load error: {0}")]
    ModelLoadError(String),

    #[error("embed error: {0}")]
    EmbedError(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Cooperative-cancellation signal. Not an error: callers check this
/// variant to decide whether to resume or report completion, never to
/// print a stack trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

pub type CoreResult<T> = Result<T, CoreError>;
