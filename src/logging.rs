//! Structured logging setup.
//!
//! Replaces the teacher's ad-hoc `println!`/`colored` diagnostics with
//! `tracing`, the way the rest of the pack wires up library-level logging:
//! an `EnvFilter` defaulting to `info`, overridable via `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Initialise the global `tracing` subscriber. Safe to call more than once
/// per process (later calls are a no-op) so both the CLI binary and tests
/// that want log output can call it unconditionally.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
