use std::path::PathBuf;

use anyhow::{Context, anyhow, bail};
use chrono::{Local, NaiveTime};
use clap::{Parser, ValueEnum};
use tracing::{debug, error, info, warn};

use macroflow::config::{self as cfg, Action, ExecutionSpeed, RunSettings};
use macroflow::executor::{Callbacks, ControlHandle, DesktopBackend, Engine, ExecError, RunReport, RunState};
use macroflow::utils::panic_key;
use macroflow::utils::schedule::{next_occurrence, parse_time_of_day};

/// Macroflow CLI
#[derive(Debug, Parser)]
#[command(
    name = macroflow::PKG_NAME,
    version = macroflow::PKG_VERSION,
    about = "Replay desktop automation projects with pause/resume/stop control"
)]
struct Args {
    /// Path to the JSON project file
    #[arg(short = 'p', long = "project", required_unless_present_any = ["print_schema", "print_settings_schema"])]
    project: Option<PathBuf>,

    /// Optional JSON settings file (see --print-settings-schema)
    #[arg(short = 's', long = "settings")]
    settings: Option<PathBuf>,

    /// Enable dry-run mode (log actions instead of simulating input)
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Replay the whole project this many times
    #[arg(long = "repeat")]
    repeat: Option<u32>,

    /// Seconds to wait between repetitions
    #[arg(long = "repeat-interval")]
    repeat_interval: Option<f64>,

    /// Extra attempts after a failed run
    #[arg(long = "retries")]
    retries: Option<u32>,

    /// Seconds to wait before each retry
    #[arg(long = "retry-interval")]
    retry_interval: Option<f64>,

    /// Start at this local time of day (HH:MM or HH:MM:SS) instead of immediately
    #[arg(long = "at")]
    at: Option<String>,

    /// Run again every day at the --at time until stopped
    #[arg(long = "daily", requires = "at")]
    daily: bool,

    /// Pause inserted after every action
    #[arg(long = "speed", value_enum)]
    speed: Option<Speed>,

    /// Emergency-stop key (e.g. escape, f12, pause)
    #[arg(long = "panic-key")]
    panic_key: Option<String>,

    /// Set log level (e.g., trace, debug, info, warn, error). Overrides RUST_LOG.
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Print the JSON Schema for project files and exit
    #[arg(long = "print-schema")]
    print_schema: bool,

    /// Print the JSON Schema for settings files and exit
    #[arg(long = "print-settings-schema")]
    print_settings_schema: bool,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum Speed {
    Instant,
    Fast,
    Normal,
    Slow,
}

impl From<Speed> for ExecutionSpeed {
    fn from(s: Speed) -> Self {
        match s {
            Speed::Instant => ExecutionSpeed::Instant,
            Speed::Fast => ExecutionSpeed::Fast,
            Speed::Normal => ExecutionSpeed::Normal,
            Speed::Slow => ExecutionSpeed::Slow,
        }
    }
}

impl Args {
    /// Settings file (or defaults) with command-line overrides applied.
    fn run_settings(&self) -> anyhow::Result<RunSettings> {
        let mut settings = match &self.settings {
            Some(path) => cfg::load_settings_from_path(path)?,
            None => RunSettings::default(),
        };
        if self.dry_run {
            settings.dry_run = true;
        }
        if let Some(repeat) = self.repeat {
            settings.repeat = repeat;
        }
        if let Some(interval) = self.repeat_interval {
            settings.repeat_interval = interval;
        }
        if let Some(retries) = self.retries {
            settings.retries = retries;
        }
        if let Some(interval) = self.retry_interval {
            settings.retry_interval = interval;
        }
        if let Some(speed) = self.speed {
            settings.execution_speed = speed.into();
        }
        if let Some(key) = &self.panic_key {
            settings.panic_key = key.clone();
        }
        cfg::validate_settings(&settings)?;
        Ok(settings)
    }

    fn start_time(&self) -> anyhow::Result<Option<NaiveTime>> {
        self.at
            .as_deref()
            .map(parse_time_of_day)
            .transpose()
            .map_err(|e| anyhow!("--at: {e}"))
    }
}

fn callbacks() -> Callbacks {
    Callbacks::new()
        .with_progress(|index, total, description| {
            info!(target: "macroflow", "[{}/{}] {}", index + 1, total, description);
        })
        .with_error(|message| {
            error!(target: "macroflow", "{message}");
        })
}

/// Sleep until the next `at` on the local clock. Returns `false` if Ctrl+C came first.
async fn wait_for_start(at: NaiveTime) -> bool {
    let now = Local::now().naive_local();
    let next = next_occurrence(now, at);
    let wait = (next - now).to_std().unwrap_or_default();
    info!(start = %next, ?wait, "Waiting for scheduled start");
    tokio::select! {
        _ = tokio::time::sleep(wait) => true,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C before the scheduled start");
            false
        }
    }
}

/// Run once, mapping Ctrl+C to the same stop the panic key uses.
async fn run_once(
    engine: &Engine<DesktopBackend>,
    actions: Vec<Action>,
    control: &ControlHandle,
) -> anyhow::Result<Result<RunReport, ExecError>> {
    let handle = match engine.execute_project(actions, callbacks()) {
        Ok(handle) => handle,
        Err(e) => return Ok(Err(e)),
    };
    let mut join = tokio::task::spawn_blocking(move || handle.join());
    let joined = tokio::select! {
        joined = &mut join => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping");
            control.stop();
            join.await
        }
    };
    let report = joined.context("Execution task failed")??;
    Ok(Ok(report))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    macroflow::init_tracing(args.log_level.as_deref());

    if args.print_schema {
        cfg::write_schema_to_writer(&cfg::generate_schema(), std::io::stdout())?;
        println!();
        return Ok(());
    }
    if args.print_settings_schema {
        cfg::write_schema_to_writer(&cfg::generate_settings_schema(), std::io::stdout())?;
        println!();
        return Ok(());
    }

    let Some(project_path) = args.project.clone() else {
        bail!("--project is required");
    };
    let settings = args.run_settings()?;
    let start_at = args.start_time()?;
    info!(
        version = macroflow::PKG_VERSION,
        project = %project_path.display(),
        dry_run = settings.dry_run,
        "Starting Macroflow"
    );

    // Load the project
    let project = cfg::load_from_path_async(&project_path).await?;
    debug!(target: "macroflow", actions = project.actions.len(), "Project loaded successfully");
    info!(project = %project.name, actions = project.actions.len(), "Running project");

    let backend = DesktopBackend::new(settings.dry_run);
    if backend.is_dry_run() {
        info!("Dry-run mode: actions are logged, not performed");
    }
    let engine = Engine::new(backend, settings.clone());
    let control = engine.control();

    if let Err(e) = panic_key::spawn_listener(&settings.panic_key, control.clone()) {
        warn!(error = %e, "Panic key disabled; use Ctrl+C to stop");
    }

    let report = loop {
        if let Some(at) = start_at {
            if !wait_for_start(at).await {
                return Ok(());
            }
        }
        let report = match run_once(&engine, project.actions.clone(), &control).await? {
            Ok(report) => report,
            Err(ExecError::Precondition(reason)) if args.daily => {
                warn!(%reason, "Skipping today's run");
                continue;
            }
            Err(e) => return Err(e).context("Failed to start execution"),
        };

        let stats = engine.statistics();
        info!(
            state = ?report.state,
            attempts = report.attempts,
            dispatched = report.actions_dispatched,
            failed = report.actions_failed,
            iterations = report.iterations_completed,
            duration = ?report.duration,
            runs = stats.total_runs,
            success_rate = stats.success_rate,
            "Run finished"
        );
        if !args.daily || report.state == RunState::Stopped {
            break report;
        }
        if !report.success {
            warn!(message = %report.message, "Run failed; next run is still scheduled");
        }
    };

    info!(state = ?report.state, "Macroflow finished");
    if !report.success {
        bail!("{}", report.message);
    }
    Ok(())
}
