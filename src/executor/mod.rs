#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

/*!
Execution engine for Macroflow.

This module wires together:
- `backend`: the `ActionBackend` capability trait the engine drives
- `actions`: `DesktopBackend`, the real backend (enigo input, arboard clipboard, screen capture)
- `dispatch`: per-kind dispatch table, image polling and interruptible delays
- `context`: execution-thread state (index, durations, data-loop stack)
- `control`: the cross-thread control surface (`ControlHandle`, `ExecutionStatus`)
- `engine`: the run loop (`Engine`, `RunHandle`, `RunReport`), retries
- `preconditions`: start conditions (time window, file, screen pixel)
- `history`: finished-run records and `RunStatistics`
- `observer`: progress / error / completion callbacks
- `timing`: running-mean ETA estimator
- `error`: the `ExecError` taxonomy

Typical usage:
- Construct an `Engine` with a backend and `RunSettings`.
- Call `Engine::execute_project` with the sorted actions and an observer.
- Keep the `ControlHandle` to pause, resume or stop; `RunHandle::join` for the report.

Example:
```no_run
use macroflow::config::{self, RunSettings};
use macroflow::executor::{Callbacks, DesktopBackend, Engine};

let project = config::load_from_path("projects/login.json")?;
let engine = Engine::new(DesktopBackend::new(true), RunSettings::default()); // dry-run mode
let callbacks = Callbacks::new().with_progress(|i, n, d| println!("[{}/{}] {d}", i + 1, n));
let handle = engine.execute_project(project.actions, callbacks)?;
let report = handle.join()?;
println!("{}", report.message);
# Ok::<(), anyhow::Error>(())
```
*/

pub mod actions;
pub mod backend;
pub mod context;
pub mod control;
mod dispatch;
pub mod engine;
pub mod error;
pub mod history;
pub mod observer;
mod preconditions;
#[cfg(test)]
pub(crate) mod testing;
pub mod timing;

// Re-exports for convenient access from `macroflow::executor::*`
pub use actions::DesktopBackend;
pub use backend::ActionBackend;
pub use context::{ExecutionContext, LoopFrame};
pub use control::{ControlHandle, ExecutionStatus, RunState, StopSignal};
pub use engine::{Engine, RunHandle, RunReport};
pub use error::ExecError;
pub use history::RunStatistics;
pub use observer::{Callbacks, RunObserver};
pub use timing::EtaEstimator;
