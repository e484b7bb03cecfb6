use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the execution engine and its backends.
///
/// Every variant except `Busy`, `Precondition` and `Spawn` is produced per action and reported through
/// `on_error`; whether it ends the run is decided by the engine from the action's kind.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Malformed action parameters, detected right before dispatch.
    #[error("invalid parameters: {0}")]
    Validation(String),

    /// An injection, clipboard or capture call failed.
    #[error("backend failure: {0}")]
    Backend(String),

    /// An image did not show up before its deadline.
    #[error("timed out after {:.1}s waiting for {what}", timeout.as_secs_f64())]
    Timeout { what: String, timeout: Duration },

    /// A run is already in progress on this engine.
    #[error("engine is busy: another run is in progress")]
    Busy,

    /// The user stopped the run.
    #[error("execution was cancelled")]
    Cancelled,

    /// Data rows for a loop could not be loaded.
    #[error("data source error: {0}")]
    DataSource(String),

    /// A start condition (time window, file, screen pixel) did not hold, so the run never began.
    #[error("run conditions not met: {0}")]
    Precondition(String),

    /// The execution thread could not be started.
    #[error("failed to start execution thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ExecError {
    pub fn backend(msg: impl std::fmt::Display) -> Self {
        ExecError::Backend(msg.to_string())
    }
}

impl From<enigo::InputError> for ExecError {
    fn from(e: enigo::InputError) -> Self {
        ExecError::Backend(format!("input injection failed: {e}"))
    }
}

impl From<arboard::Error> for ExecError {
    fn from(e: arboard::Error) -> Self {
        ExecError::Backend(format!("clipboard: {e}"))
    }
}

impl From<image::ImageError> for ExecError {
    fn from(e: image::ImageError) -> Self {
        ExecError::Backend(format!("image: {e}"))
    }
}
