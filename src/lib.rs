#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Macroflow: replay recorded desktop automation sequences with pause/resume/stop control,
//! spreadsheet-driven loops and live progress, on top of the Enigo library.
//!
//! This crate organizes the codebase into cohesive modules and exposes a convenient prelude
//! for downstream crates/binaries. Most implementation details live under the internal modules:
//! - `config`: Project / action models, run settings, loader, validation and schema helpers.
//! - `executor`: Backends, execution engine, control surface and callbacks.
//! - `sources`: Data sources for data loops (spreadsheets, CSV, TSV, JSON, in-memory).
//! - `utils`: Placeholder interpolation, template matching, schedules, panic key.
//!
//! Use `macroflow::prelude::*` to bring commonly used items into scope quickly.

/// Public module: configuration (models, loader, schema helpers).
pub mod config;
/// Public module: execution engine (backends, engine, control surface).
pub mod executor;
/// Public module: data sources for data loops.
pub mod sources;
/// Public module: utilities (interpolation, template matching, schedules, panic key).
pub mod utils;

/// Crate-level constants for consumers that want to inspect package metadata at runtime.
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version (e.g., "0.1.0").
#[inline]
pub const fn version() -> &'static str {
    PKG_VERSION
}

/// Parse a simple level name (trace|debug|info|warn|error).
pub fn parse_level(name: &str) -> Option<tracing::Level> {
    use tracing::Level;
    match name.trim().to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize tracing (logging) with a reasonable default.
/// - `level` wins when given (e.g. from `--log-level`).
/// - Otherwise honors the `RUST_LOG` environment variable if set.
/// - Falls back to `info` level.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_tracing(level: Option<&str>) {
    use tracing::Level;
    use tracing_subscriber::fmt;

    let level = level
        .and_then(parse_level)
        .or_else(|| std::env::var("RUST_LOG").ok().as_deref().and_then(parse_level))
        .unwrap_or(Level::INFO);

    // Ignore the error if the global subscriber was already set.
    let _ = fmt().with_max_level(level).with_thread_names(true).try_init();
}

/// A convenient set of exports for most consumers.
///
/// Bring this into scope with:
/// `use macroflow::prelude::*;`
pub mod prelude {
    // Common result/error handling
    pub use anyhow::{Context, Error, Result, anyhow, bail, ensure};

    // Serialization
    pub use serde::{Deserialize, Serialize};

    // Tracing macros
    pub use tracing::{debug, error, info, instrument, trace, warn};

    // Timing helpers
    pub use std::time::Duration;

    // External crates (namespaced) if callers want direct access
    pub use crate as macroflow;
    pub use enigo;
    pub use image;

    // Frequently used types
    pub use crate::config::{Action, ActionKind, Project, RunSettings};
    pub use crate::executor::{
        ActionBackend, Callbacks, ControlHandle, DesktopBackend, Engine, ExecError,
        ExecutionStatus, RunObserver, RunReport, RunState, RunStatistics,
    };

    // Frequently used internal modules
    pub use crate::{config, executor, sources, utils};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARNING"), Some(tracing::Level::WARN));
        assert_eq!(parse_level(" debug "), Some(tracing::Level::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(Some("debug"));
        init_tracing(None);
        assert!(!version().is_empty());
    }
}
