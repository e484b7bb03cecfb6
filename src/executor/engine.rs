use chrono::{DateTime, Local};
use serde_valid::Validate;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::backend::ActionBackend;
use super::context::{Block, ExecutionContext, LoopFrame};
use super::control::{ControlHandle, ExecutionStatus, RunState, SharedState, StopSignal};
use super::dispatch::{Dispatcher, ImageSearch, seconds};
use super::error::ExecError;
use super::history::{RunStatistics, push_bounded};
use super::observer::RunObserver;
use super::preconditions;
use crate::config::{Action, ActionKind, Condition, ConditionalParams, DataLoopParams, RunSettings};
use crate::sources::{DataSource, FileDataSource, load_rows};

const MSG_COMPLETED: &str = "All actions executed successfully";
const MSG_STOPPED: &str = "Execution was stopped by user";

/// Executes action sequences against a backend, one run at a time.
///
/// Runs happen on a dedicated thread; callers talk to them only through the
/// [`ControlHandle`] returned by [`Engine::control`] (or carried by the [`RunHandle`]).
pub struct Engine<B: ActionBackend + 'static> {
    backend: Arc<Mutex<B>>,
    settings: RunSettings,
    data_source: Arc<dyn DataSource>,
    shared: Arc<SharedState>,
    history: Arc<Mutex<Vec<RunReport>>>,
}

impl<B: ActionBackend + 'static> Engine<B> {
    pub fn new(backend: B, settings: RunSettings) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            settings,
            data_source: Arc::new(FileDataSource),
            shared: Arc::new(SharedState::default()),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Replace the file-based row loader used by data loops.
    pub fn with_data_source(mut self, source: impl DataSource + 'static) -> Self {
        self.data_source = Arc::new(source);
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle::new(self.shared.clone())
    }

    pub fn status(&self) -> ExecutionStatus {
        self.control().status()
    }

    /// Reports of finished runs, oldest first.
    pub fn history(&self) -> Vec<RunReport> {
        lock(&self.history).clone()
    }

    pub fn statistics(&self) -> RunStatistics {
        RunStatistics::from_reports(&lock(&self.history))
    }

    /// Start running `actions` (in `order_index` order) on a new thread.
    ///
    /// Fails with [`ExecError::Busy`] while another run is active, leaving that run untouched.
    /// Fails with [`ExecError::Precondition`] (also sent to `on_error`) when a start condition
    /// does not hold. Every other problem is reported through `observer` and the returned report.
    pub fn execute_project<O>(&self, actions: Vec<Action>, mut observer: O) -> Result<RunHandle, ExecError>
    where
        O: RunObserver + 'static,
    {
        if self.shared.is_running() {
            warn!(target: "macroflow::engine", "Rejected run: engine is busy");
            return Err(ExecError::Busy);
        }
        if let Err(e) = self.check_conditions() {
            warn!(target: "macroflow::engine", error = %e, "Run not started");
            let message = e.to_string();
            notify("on_error", || observer.on_error(&message));
            return Err(e);
        }

        let iterations = self.settings.repeat.max(1) as usize;
        if !self.shared.try_begin(actions.len(), iterations) {
            warn!(target: "macroflow::engine", "Rejected run: engine is busy");
            return Err(ExecError::Busy);
        }

        let runner = Runner {
            backend: self.backend.clone(),
            stop: StopSignal::new(self.shared.clone(), self.poll_interval()),
            settings: self.settings.clone(),
            data_source: self.data_source.clone(),
            shared: self.shared.clone(),
            history: self.history.clone(),
            observer: Box::new(observer),
            ctx: ExecutionContext::new(actions.len()),
        };

        info!(
            target: "macroflow::engine",
            actions = actions.len(), iterations, speed = ?self.settings.execution_speed,
            "Starting execution"
        );
        let spawned = thread::Builder::new()
            .name("macroflow-engine".into())
            .spawn(move || runner.run(actions));
        match spawned {
            Ok(thread) => Ok(RunHandle {
                thread,
                control: self.control(),
            }),
            Err(e) => {
                self.shared.abandon();
                error!(target: "macroflow::engine", error = %e, "Failed to spawn execution thread");
                Err(ExecError::Spawn(e))
            }
        }
    }

    /// Dispatch one action synchronously on the calling thread.
    ///
    /// Placeholders are not resolved and control-flow kinds are rejected.
    pub fn execute_single_action(&self, action: &Action) -> Result<(), ExecError> {
        if !self.shared.try_begin(1, 1) {
            return Err(ExecError::Busy);
        }
        let mut guard = RunGuard::new(self.shared.clone());
        let stop = StopSignal::new(self.shared.clone(), self.poll_interval());
        let dispatcher = Dispatcher {
            backend: &self.backend,
            settings: &self.settings,
            stop: &stop,
        };

        debug!(target: "macroflow::engine", action = %action.label(), "Executing single action");
        let result = action
            .kind
            .validate()
            .map_err(ExecError::Validation)
            .and_then(|()| guarded_dispatch(&dispatcher, &action.kind));

        self.shared.set_index(1);
        guard.disarm();
        self.shared.finish(match &result {
            Ok(()) => RunState::Completed,
            Err(ExecError::Cancelled) => RunState::Stopped,
            Err(_) => RunState::Failed,
        });
        result
    }

    fn check_conditions(&self) -> Result<(), ExecError> {
        let conditions = &self.settings.conditions;
        if conditions.is_empty() {
            return Ok(());
        }
        let mut backend = lock(&self.backend);
        guarded(|| preconditions::check(conditions, &mut *backend, Local::now().time()))
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.settings.poll_interval_ms.max(1))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a run in progress.
#[derive(Debug)]
pub struct RunHandle {
    thread: JoinHandle<RunReport>,
    control: ControlHandle,
}

impl RunHandle {
    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Block until the run ends.
    pub fn join(self) -> Result<RunReport, ExecError> {
        self.thread
            .join()
            .map_err(|_| ExecError::backend("execution thread panicked"))
    }
}

/// History record of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    pub success: bool,
    pub message: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    /// Wall-clock time of the whole run, retries and their waits included.
    pub duration: Duration,
    /// How many times the sequence was started (1 plus the retries used).
    /// The counters below describe the last attempt.
    pub attempts: u32,
    /// Actions that reached the backend (or a loop/conditional that was evaluated).
    pub actions_dispatched: usize,
    /// Failed or skipped-as-invalid actions, fatal or not.
    pub actions_failed: usize,
    pub iterations_completed: usize,
    pub average_action_time: Duration,
    /// Duration of every dispatch in the last attempt, in order.
    pub action_durations: Vec<Duration>,
}

/// Why a run ended early.
#[derive(Debug)]
enum Halt {
    Stopped,
    Failed(String),
}

/// Releases the engine if the owning thread unwinds before recording a terminal state.
struct RunGuard(Option<Arc<SharedState>>);

impl RunGuard {
    fn new(shared: Arc<SharedState>) -> Self {
        Self(Some(shared))
    }

    /// Called right before the normal `finish`, so a later run is never touched.
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.0.take() {
            shared.abandon();
        }
    }
}

struct Runner<B: ActionBackend> {
    backend: Arc<Mutex<B>>,
    settings: RunSettings,
    data_source: Arc<dyn DataSource>,
    shared: Arc<SharedState>,
    history: Arc<Mutex<Vec<RunReport>>>,
    stop: StopSignal,
    observer: Box<dyn RunObserver>,
    ctx: ExecutionContext,
}

impl<B: ActionBackend> Runner<B> {
    fn run(mut self, actions: Vec<Action>) -> RunReport {
        let mut guard = RunGuard::new(self.shared.clone());
        let started_at = Local::now();
        let started = Instant::now();
        let max_attempts = self.settings.retries.saturating_add(1);
        let mut attempts = 0;
        let mut completed = 0;

        let outcome = match Block::new(&actions) {
            Ok(block) => loop {
                attempts += 1;
                let (outcome, done) = self.run_attempt(&block);
                completed = done;
                match outcome {
                    Err(Halt::Failed(msg)) if attempts < max_attempts && !self.shared.should_stop() => {
                        if let Err(halt) = self.wait_before_retry(attempts, max_attempts, &msg) {
                            break Err(halt);
                        }
                    }
                    outcome => break outcome,
                }
            },
            Err(msg) => {
                attempts = 1;
                let msg = format!("invalid sequence: {msg}");
                self.report_error(&msg);
                Err(Halt::Failed(msg))
            }
        };

        let (state, success, message) = match outcome {
            Ok(()) => {
                self.shared.set_index(self.ctx.total_actions);
                let message = match self.ctx.failed {
                    0 => MSG_COMPLETED.to_string(),
                    n => format!("Completed with {n} failed action(s)"),
                };
                (RunState::Completed, true, message)
            }
            Err(Halt::Stopped) => (RunState::Stopped, false, MSG_STOPPED.to_string()),
            Err(Halt::Failed(msg)) if attempts > 1 => (
                RunState::Failed,
                false,
                format!("Execution failed after {attempts} attempts: {msg}"),
            ),
            Err(Halt::Failed(msg)) => (RunState::Failed, false, format!("Execution failed: {msg}")),
        };

        let report = RunReport {
            state,
            success,
            message,
            started_at,
            finished_at: Local::now(),
            duration: started.elapsed(),
            attempts,
            actions_dispatched: self.ctx.dispatched,
            actions_failed: self.ctx.failed,
            iterations_completed: completed,
            average_action_time: self.ctx.timing.average(),
            action_durations: self.ctx.timing.samples().to_vec(),
        };
        info!(
            target: "macroflow::engine",
            state = ?report.state, attempts, dispatched = report.actions_dispatched,
            failed = report.actions_failed, duration = ?report.duration,
            "{}", report.message
        );

        push_bounded(&mut lock(&self.history), report.clone());
        guard.disarm();
        self.shared.finish(state);
        self.notify_complete(report.success, &report.message);
        report
    }

    /// One pass over every iteration. Returns the outcome and the iterations completed.
    fn run_attempt(&mut self, block: &Block) -> (Result<(), Halt>, usize) {
        let iterations = self.settings.repeat.max(1) as usize;
        let mut completed = 0;
        for iteration in 0..iterations {
            if let Err(halt) = self.run_iteration(block, iteration) {
                return (Err(halt), completed);
            }
            completed += 1;
        }
        (Ok(()), completed)
    }

    /// Sleep `retry_interval` and start the next attempt from a clean context.
    fn wait_before_retry(&mut self, attempt: u32, max_attempts: u32, reason: &str) -> Result<(), Halt> {
        let pause = seconds(self.settings.retry_interval).unwrap_or(Duration::ZERO);
        warn!(
            target: "macroflow::engine",
            attempt, of = max_attempts, elapsed = ?self.ctx.start_time.elapsed(), ?pause, error = reason,
            "Attempt failed; retrying"
        );
        if !self.stop.sleep(pause) {
            return Err(Halt::Stopped);
        }
        self.ctx = ExecutionContext::new(self.ctx.total_actions);
        self.shared.publish_average(Duration::ZERO, 0);
        Ok(())
    }

    fn run_iteration(&mut self, block: &Block, iteration: usize) -> Result<(), Halt> {
        self.shared.set_iteration(iteration);
        if iteration > 0 {
            let pause = seconds(self.settings.repeat_interval).unwrap_or(Duration::ZERO);
            debug!(target: "macroflow::engine", iteration, ?pause, "Waiting before next iteration");
            if !self.stop.sleep(pause) {
                return Err(Halt::Stopped);
            }
        }
        info!(target: "macroflow::engine", iteration = iteration + 1, "Starting iteration");
        self.ctx.current_index = 0;
        self.ctx.loop_stack.clear();
        self.run_range(block, 0..block.len(), None)
    }

    /// Run `block.actions[range]`. `origin` pins the reported index inside conditional
    /// branches to the conditional's own position.
    fn run_range(
        &mut self,
        block: &Block,
        range: std::ops::Range<usize>,
        origin: Option<usize>,
    ) -> Result<(), Halt> {
        let mut pos = range.start;
        while pos < range.end {
            self.checkpoint()?;
            let index = origin.unwrap_or(pos);
            self.set_index(index);
            let action = &block.actions[pos];
            trace!(target: "macroflow::engine", index, kind = action.kind.name(), "Executing action");

            match &action.kind {
                ActionKind::DataLoopStart(params) => {
                    let Some(&end) = block.loops.get(&pos) else {
                        let msg = format!("data loop at position {pos} has no end");
                        self.report_error(&msg);
                        return Err(Halt::Failed(msg));
                    };
                    self.run_loop(block, pos, end, params, origin)?;
                    let end_index = origin.unwrap_or(end);
                    self.set_index(end_index);
                    self.progress(end_index, &block.actions[end]);
                    pos = end + 1;
                    continue;
                }
                ActionKind::DataLoopEnd(_) => {}
                ActionKind::Conditional(params) => self.run_conditional(action, params, index)?,
                _ => self.run_step(action)?,
            }
            self.progress(index, action);
            pos += 1;
        }
        Ok(())
    }

    fn run_loop(
        &mut self,
        block: &Block,
        start: usize,
        end: usize,
        params: &DataLoopParams,
        origin: Option<usize>,
    ) -> Result<(), Halt> {
        let action = &block.actions[start];
        // A loop that cannot be prepared cannot be skipped past safely.
        let Some(params) = self.resolve_or_fail(action, params, true)? else {
            return Err(Halt::Failed(format!("Action '{}' could not be prepared", action.label())));
        };
        if let Err(e) = params.validate() {
            return self.action_failed(action, ExecError::Validation(e.to_string()), true);
        }

        let started = Instant::now();
        let rows = match load_rows(self.data_source.as_ref(), &params) {
            Ok(rows) => rows,
            Err(e) => {
                self.ctx.failed += 1;
                self.ctx.last_success = false;
                let msg = format!("Action '{}' failed: {}", action.label(), ExecError::DataSource(format!("{e:#}")));
                self.report_error(&msg);
                return Err(Halt::Failed(msg));
            }
        };
        self.record(started.elapsed());
        self.ctx.dispatched += 1;
        self.ctx.last_success = true;
        self.progress(origin.unwrap_or(start), action);

        info!(
            target: "macroflow::engine",
            source = %params.source.display(), rows = rows.len(), body = end - start - 1,
            "Entering data loop"
        );
        let row_count = rows.len();
        self.ctx.loop_stack.push(LoopFrame { rows, cursor: 0 });
        let mut outcome = Ok(());
        for row in 0..row_count {
            if let Some(frame) = self.ctx.loop_stack.last_mut() {
                frame.cursor = row;
            }
            debug!(target: "macroflow::engine", row = row + 1, of = row_count, "Data loop row");
            outcome = self.run_range(block, start + 1..end, origin);
            if outcome.is_err() {
                break;
            }
        }
        self.ctx.loop_stack.pop();
        outcome
    }

    fn run_conditional(&mut self, action: &Action, params: &ConditionalParams, index: usize) -> Result<(), Halt> {
        let Some(condition) = self.resolve_or_fail(action, &params.condition, false)? else {
            return Ok(());
        };

        let started = Instant::now();
        let verdict = match &condition {
            Condition::LastActionSucceeded => Ok(self.ctx.last_success),
            Condition::LastActionFailed => Ok(!self.ctx.last_success),
            Condition::ImagePresent(check) | Condition::ImageAbsent(check) => {
                let wanted = matches!(condition, Condition::ImagePresent(_));
                match check.validate() {
                    Err(e) => Err(ExecError::Validation(e.to_string())),
                    Ok(()) => {
                        let dispatcher = self.dispatcher();
                        let templates = [check.template.clone()];
                        guarded(|| {
                            dispatcher.image_present(&ImageSearch {
                                templates: &templates,
                                confidence: check.confidence,
                                timeout: 0.0,
                                poll_interval: None,
                                region: check.region,
                            })
                        })
                        .map(|found| found == wanted)
                    }
                }
            }
        };
        self.record(started.elapsed());

        let take_then = match verdict {
            Ok(v) => {
                self.ctx.dispatched += 1;
                self.ctx.last_success = true;
                v
            }
            Err(ExecError::Cancelled) => return Err(Halt::Stopped),
            Err(e @ ExecError::Validation(_)) => return self.action_failed(action, e, false),
            Err(e) => return self.action_failed(action, e, params.stop_on_failure),
        };

        let branch = if take_then { &params.then_actions } else { &params.else_actions };
        debug!(
            target: "macroflow::engine",
            condition = ?condition, branch = if take_then { "then" } else { "else" },
            actions = branch.len(), "Conditional evaluated"
        );
        let block = match Block::new(branch) {
            Ok(b) => b,
            Err(msg) => {
                let msg = format!("Action '{}' has an invalid branch: {msg}", action.label());
                self.report_error(&msg);
                return Err(Halt::Failed(msg));
            }
        };
        self.run_range(&block, 0..block.len(), Some(index))
    }

    /// Resolve, validate and dispatch one backend action, then apply the failure policy.
    fn run_step(&mut self, action: &Action) -> Result<(), Halt> {
        let kind = if self.ctx.in_loop() {
            match self.ctx.resolve(&action.kind) {
                Ok(kind) => kind,
                Err(e) => return self.action_failed(action, e, false),
            }
        } else {
            action.kind.clone()
        };
        if let Err(msg) = kind.validate() {
            return self.action_failed(action, ExecError::Validation(msg), false);
        }

        let started = Instant::now();
        let result = {
            let dispatcher = self.dispatcher();
            guarded_dispatch(&dispatcher, &kind)
        };
        self.record(started.elapsed());

        match result {
            Ok(()) => {
                self.ctx.dispatched += 1;
                self.ctx.last_success = true;
            }
            Err(ExecError::Cancelled) => return Err(Halt::Stopped),
            Err(e) => {
                self.ctx.dispatched += 1;
                self.action_failed(action, e, kind.stop_on_failure())?;
            }
        }
        self.settle()
    }

    /// Report a failure and decide whether the run goes on.
    fn action_failed(&mut self, action: &Action, err: ExecError, fatal: bool) -> Result<(), Halt> {
        self.ctx.failed += 1;
        self.ctx.last_success = false;
        let msg = format!("Action '{}' failed: {err}", action.label());
        if fatal {
            error!(target: "macroflow::engine", action_id = action.id, kind = action.kind.name(), "{msg}");
        } else {
            warn!(target: "macroflow::engine", action_id = action.id, kind = action.kind.name(), "{msg}; continuing");
        }
        self.report_error(&msg);
        if fatal { Err(Halt::Failed(msg)) } else { Ok(()) }
    }

    /// Substitute placeholders when inside a loop. `None` means the failure was reported and
    /// the action is skipped.
    fn resolve_or_fail<T>(&mut self, action: &Action, value: &T, fatal: bool) -> Result<Option<T>, Halt>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone,
    {
        if !self.ctx.in_loop() {
            return Ok(Some(value.clone()));
        }
        match self.ctx.resolve(value) {
            Ok(v) => Ok(Some(v)),
            Err(e) => self.action_failed(action, e, fatal).map(|()| None),
        }
    }

    /// Honor stop and pause requests. Polls at `poll_interval_ms` while paused.
    fn checkpoint(&mut self) -> Result<(), Halt> {
        if self.shared.should_stop() {
            return Err(Halt::Stopped);
        }
        if self.shared.is_paused() {
            self.shared.enter_pause();
            info!(target: "macroflow::engine", index = self.ctx.current_index, "Execution paused");
            while self.shared.is_paused() && !self.shared.should_stop() {
                thread::sleep(self.stop.poll_interval());
            }
            self.shared.leave_pause();
            if self.shared.should_stop() {
                return Err(Halt::Stopped);
            }
            info!(target: "macroflow::engine", index = self.ctx.current_index, "Execution resumed");
        }
        Ok(())
    }

    /// Pace delay after each dispatched action. Not counted in action durations.
    fn settle(&self) -> Result<(), Halt> {
        let pause = self.settings.execution_speed.settle_delay();
        if self.stop.sleep(pause) { Ok(()) } else { Err(Halt::Stopped) }
    }

    fn dispatcher(&self) -> Dispatcher<'_, B> {
        Dispatcher {
            backend: &self.backend,
            settings: &self.settings,
            stop: &self.stop,
        }
    }

    fn set_index(&mut self, index: usize) {
        self.ctx.current_index = index;
        self.shared.set_index(index);
    }

    fn record(&mut self, elapsed: Duration) {
        self.ctx.record(elapsed);
        self.shared
            .publish_average(self.ctx.timing.average(), self.ctx.timing.len());
    }

    fn progress(&mut self, index: usize, action: &Action) {
        let total = self.ctx.total_actions;
        let label = action.label();
        notify("on_progress", || self.observer.on_progress(index, total, &label));
    }

    fn report_error(&mut self, message: &str) {
        notify("on_error", || self.observer.on_error(message));
    }

    fn notify_complete(&mut self, success: bool, message: &str) {
        notify("on_complete", || self.observer.on_complete(success, message));
    }
}

/// Run a backend call, turning a panic into a backend failure.
fn guarded<T>(f: impl FnOnce() -> Result<T, ExecError>) -> Result<T, ExecError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(ExecError::backend(format!("backend panicked: {detail}")))
    })
}

fn guarded_dispatch<B: ActionBackend>(dispatcher: &Dispatcher<'_, B>, kind: &ActionKind) -> Result<(), ExecError> {
    guarded(|| dispatcher.dispatch(kind))
}

/// Invoke an observer hook; a panicking hook is logged and ignored.
fn notify(hook: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(target: "macroflow::engine", hook, "Observer callback panicked; ignoring");
    }
}
