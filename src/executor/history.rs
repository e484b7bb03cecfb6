//! Finished-run records kept by an [`Engine`](super::Engine) and the statistics over them.

use chrono::{DateTime, Local};
use std::time::Duration;

use super::control::RunState;
use super::engine::RunReport;
use super::timing::average_of;

/// Reports kept per engine; the oldest are dropped first.
pub const HISTORY_LIMIT: usize = 1000;

/// Aggregate view of a set of run reports.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunStatistics {
    pub total_runs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stopped: usize,
    pub total_duration: Duration,
    pub average_duration: Duration,
    /// Percentage of runs that completed successfully, 0 when there are none.
    pub success_rate: f64,
    /// Start time of the most recent run.
    pub latest: Option<DateTime<Local>>,
}

impl RunStatistics {
    pub fn from_reports(reports: &[RunReport]) -> Self {
        if reports.is_empty() {
            return Self::default();
        }
        let total_runs = reports.len();
        let succeeded = reports.iter().filter(|r| r.success).count();
        let failed = reports.iter().filter(|r| r.state == RunState::Failed).count();
        let stopped = reports.iter().filter(|r| r.state == RunState::Stopped).count();
        let total_duration: Duration = reports.iter().map(|r| r.duration).sum();
        Self {
            total_runs,
            succeeded,
            failed,
            stopped,
            total_duration,
            average_duration: average_of(total_duration, total_runs),
            success_rate: succeeded as f64 / total_runs as f64 * 100.0,
            latest: reports.iter().map(|r| r.started_at).max(),
        }
    }
}

/// Append `report`, dropping the oldest entries beyond [`HISTORY_LIMIT`].
pub(crate) fn push_bounded(history: &mut Vec<RunReport>, report: RunReport) {
    history.push(report);
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(..excess);
    }
}
