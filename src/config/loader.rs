use anyhow::{Context, Result, bail};
use schemars::{Schema, schema_for};
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, trace};

use super::models::{
    Action, ActionKind, MAX_INTERVAL_SECS, Project, RunSettings, match_data_loops, sort_by_order,
};
use crate::utils::interpolation::has_placeholders;
use crate::utils::schedule::parse_time_of_day;

/// Load a project from a string slice.
pub fn load_from_str(s: &str) -> Result<Project> {
    let project: Project =
        serde_json::from_str(s).context("Failed to parse JSON project string into Project")?;
    validate_project(&project)?;
    Ok(project)
}

/// Load a project from any reader (e.g., a file).
pub fn load_from_reader<R: Read>(reader: R) -> Result<Project> {
    let project: Project =
        serde_json::from_reader(reader).context("Failed to parse JSON project from reader")?;
    validate_project(&project)?;
    Ok(project)
}

/// Load a project from a file path synchronously.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Project> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref)
        .with_context(|| format!("Failed to open project file {}", path_ref.display()))?;
    let project = load_from_reader(file)
        .with_context(|| format!("Invalid project file {}", path_ref.display()))?;
    debug!(target: "macroflow::config", path = %path_ref.display(), actions = project.actions.len(), "Loaded project");
    Ok(project)
}

/// Load a project from a file path asynchronously (Tokio).
pub async fn load_from_path_async<P: AsRef<Path>>(path: P) -> Result<Project> {
    use tokio::fs;
    let path_ref = path.as_ref();
    let bytes = fs::read(path_ref)
        .await
        .with_context(|| format!("Failed to read project file {}", path_ref.display()))?;
    let project: Project = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse JSON project from {}", path_ref.display()))?;
    validate_project(&project)
        .with_context(|| format!("Invalid project file {}", path_ref.display()))?;
    debug!(target: "macroflow::config", path = %path_ref.display(), actions = project.actions.len(), "Loaded project");
    Ok(project)
}

/// Load run settings from a JSON file. Missing keys fall back to defaults.
pub fn load_settings_from_path<P: AsRef<Path>>(path: P) -> Result<RunSettings> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref)
        .with_context(|| format!("Failed to open settings file {}", path_ref.display()))?;
    let settings: RunSettings = serde_json::from_reader(file)
        .with_context(|| format!("Failed to parse settings from {}", path_ref.display()))?;
    validate_settings(&settings)?;
    debug!(target: "macroflow::config", path = %path_ref.display(), "Loaded settings");
    Ok(settings)
}

/// Generate the JSON Schema for the project file.
pub fn generate_schema() -> Schema {
    schema_for!(Project)
}

/// Generate the JSON Schema for the settings file.
pub fn generate_settings_schema() -> Schema {
    schema_for!(RunSettings)
}

/// Write a JSON Schema to any writer (pretty-printed).
pub fn write_schema_to_writer<W: Write>(schema: &Schema, mut writer: W) -> Result<()> {
    let json = serde_json::to_string_pretty(schema).context("Failed to serialize schema")?;
    writer
        .write_all(json.as_bytes())
        .context("Failed to write schema to writer")?;
    Ok(())
}

/// Structural checks that must hold before a project may run:
/// - action ids are unique
/// - `order_index` values are a permutation of 1..=N
/// - data-loop markers are balanced, at top level and inside every conditional branch
/// - parameters without `{{column}}` placeholders satisfy their constraints (placeholder-bearing
///   ones can only be checked once a row is bound)
pub fn validate_project(project: &Project) -> Result<()> {
    let mut ids = HashSet::with_capacity(project.actions.len());
    for action in &project.actions {
        if !ids.insert(action.id) {
            bail!("Action id {} is used more than once", action.id);
        }
    }

    if let Err(reason) = project.check_order() {
        bail!("Project '{}' has an invalid action order: {}", project.name, reason);
    }

    validate_sequence(&project.actions)
        .with_context(|| format!("Invalid action sequence in project '{}'", project.name))?;

    trace!(target: "macroflow::config", project = %project.name, "Project validated");
    Ok(())
}

fn validate_sequence(actions: &[Action]) -> Result<()> {
    let sorted = sort_by_order(actions);
    if let Err(reason) = match_data_loops(&sorted) {
        bail!(reason);
    }

    for action in &sorted {
        check_parameters(action)?;
        if let ActionKind::Conditional(params) = &action.kind {
            validate_sequence(&params.then_actions).with_context(|| {
                format!("Invalid `then_actions` in conditional action {}", action.id)
            })?;
            validate_sequence(&params.else_actions).with_context(|| {
                format!("Invalid `else_actions` in conditional action {}", action.id)
            })?;
        }
    }
    Ok(())
}

fn check_parameters(action: &Action) -> Result<()> {
    // A conditional's own parameters are its condition; branch actions are checked on their own.
    let params = match &action.kind {
        ActionKind::Conditional(p) => serde_json::to_string(&p.condition),
        kind => serde_json::to_string(kind),
    }
    .context("Failed to serialize action parameters")?;
    if has_placeholders(&params) {
        trace!(target: "macroflow::config", action_id = action.id, "Parameter check deferred to run time");
        return Ok(());
    }
    if let Err(reason) = action.kind.validate() {
        bail!(
            "Action {} ({}) has invalid parameters: {}",
            action.id,
            action.kind.name(),
            reason
        );
    }
    Ok(())
}

/// Sanity checks on settings values.
pub fn validate_settings(settings: &RunSettings) -> Result<()> {
    if settings.poll_interval_ms == 0 {
        bail!("poll_interval_ms must be greater than zero");
    }
    if !(0.0..=1.0).contains(&settings.default_confidence) {
        bail!(
            "default_confidence must be within 0.0..=1.0 (got {})",
            settings.default_confidence
        );
    }
    if settings.repeat == 0 {
        bail!("repeat must be at least 1");
    }
    check_interval("repeat_interval", settings.repeat_interval)?;
    check_interval("retry_interval", settings.retry_interval)?;

    let conditions = &settings.conditions;
    for (name, value) in [
        ("conditions.start_time", &conditions.start_time),
        ("conditions.end_time", &conditions.end_time),
    ] {
        if let Some(text) = value {
            parse_time_of_day(text).map_err(|reason| anyhow::anyhow!("{name}: {reason}"))?;
        }
    }
    Ok(())
}

fn check_interval(name: &str, seconds: f64) -> Result<()> {
    if !(0.0..=MAX_INTERVAL_SECS).contains(&seconds) {
        bail!("{name} must be within 0..={MAX_INTERVAL_SECS} seconds (got {seconds})");
    }
    Ok(())
}
