//! Utilities for Macroflow.
//!
//! This module aggregates utility helpers used across the crate.
//!
//! Submodules:
//! - `interpolation`: `{{column}}` placeholder resolution against data-loop rows.
//! - `matching`: template matching for image actions.
//! - `panic_key`: global emergency-stop key (feature `panic-key`).
//! - `schedule`: time-of-day parsing, run windows and next scheduled start.

pub mod interpolation;
pub mod matching;
pub mod panic_key;
pub mod schedule;
