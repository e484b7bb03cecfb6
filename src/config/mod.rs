//! Configuration module for Macroflow.
//!
//! This module wires together the data models and loading/validation helpers used
//! throughout the crate. Import from here for a convenient, stable API.
//!
//! Example:
//! use macroflow::config::{Project, load_from_path};
//!
//! let project = load_from_path("projects/login.json")?;

pub mod loader;
pub mod models;

// Re-export core data models
pub use models::{
    Action, ActionKind, AnyImageParams, ClickParams, ClipboardCopyParams, ClipboardPasteParams,
    Condition, ConditionalParams, DataLoopParams, DelayParams, DragParams, ExecutionSpeed,
    FilterOp, HotkeyParams, ImageClickParams, ImageCheck, ImageWaitParams, KeyCombo, KeyParams,
    LoopEndParams, MAX_INTERVAL_SECS, MouseButton, MoveParams, PasteMethod, PixelCheck, Point,
    PointParams, Project, Rect, RowFilter, RunConditions, RunSettings, ScreenshotParams,
    TypeParams, match_data_loops, sort_by_order,
};

// Re-export loader utilities
pub use loader::{
    generate_schema, generate_settings_schema, load_from_path, load_from_path_async,
    load_from_reader, load_from_str, load_settings_from_path, validate_project,
    validate_settings, write_schema_to_writer,
};
