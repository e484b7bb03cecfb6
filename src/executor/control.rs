//! Control surface: the only state shared between the execution thread and its callers.
//!
//! The flags and counters are atomics; the clock (start/finish instants and the published
//! running mean) sits behind a mutex that is only ever held for a copy. Everything else the
//! engine keeps on its own thread.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::timing::estimate_remaining;

/// Lifecycle of one run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Completed = 3,
    Stopped = 4,
    Failed = 5,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Running,
            2 => RunState::Paused,
            3 => RunState::Completed,
            4 => RunState::Stopped,
            5 => RunState::Failed,
            _ => RunState::Idle,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Stopped | RunState::Failed)
    }
}

#[derive(Debug, Default)]
struct Clock {
    started: Option<Instant>,
    finished: Option<Instant>,
    average: Duration,
    samples: usize,
}

#[derive(Debug)]
pub(crate) struct SharedState {
    state: AtomicU8,
    is_running: AtomicBool,
    is_paused: AtomicBool,
    should_stop: AtomicBool,
    current_index: AtomicUsize,
    total_actions: AtomicUsize,
    current_iteration: AtomicUsize,
    total_iterations: AtomicUsize,
    clock: Mutex<Clock>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(RunState::Idle as u8),
            is_running: AtomicBool::new(false),
            is_paused: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            current_index: AtomicUsize::new(0),
            total_actions: AtomicUsize::new(0),
            current_iteration: AtomicUsize::new(0),
            total_iterations: AtomicUsize::new(0),
            clock: Mutex::new(Clock::default()),
        }
    }
}

impl SharedState {
    fn clock(&self) -> MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.is_paused.load(Ordering::SeqCst)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Claim the engine for a new run. Fails without touching anything if one is active.
    pub(crate) fn try_begin(&self, total_actions: usize, total_iterations: usize) -> bool {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.should_stop.store(false, Ordering::SeqCst);
        self.is_paused.store(false, Ordering::SeqCst);
        self.current_index.store(0, Ordering::SeqCst);
        self.total_actions.store(total_actions, Ordering::SeqCst);
        self.current_iteration.store(0, Ordering::SeqCst);
        self.total_iterations.store(total_iterations, Ordering::SeqCst);
        *self.clock() = Clock {
            started: Some(Instant::now()),
            ..Clock::default()
        };
        self.state.store(RunState::Running as u8, Ordering::SeqCst);
        true
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.current_index.store(index, Ordering::SeqCst);
    }

    pub(crate) fn set_iteration(&self, iteration: usize) {
        self.current_iteration.store(iteration, Ordering::SeqCst);
    }

    pub(crate) fn publish_average(&self, average: Duration, samples: usize) {
        let mut clock = self.clock();
        clock.average = average;
        clock.samples = samples;
    }

    /// The execution thread observed the pause flag.
    pub(crate) fn enter_pause(&self) {
        self.transition(RunState::Running, RunState::Paused);
    }

    /// The execution thread left its pause wait.
    pub(crate) fn leave_pause(&self) {
        self.transition(RunState::Paused, RunState::Running);
    }

    /// Record the terminal state and release the engine.
    pub(crate) fn finish(&self, state: RunState) {
        self.clock().finished = Some(Instant::now());
        self.state.store(state as u8, Ordering::SeqCst);
        self.is_paused.store(false, Ordering::SeqCst);
        self.is_running.store(false, Ordering::SeqCst);
    }

    /// Release after an unexpected unwind. Leaves a terminal state that was already set.
    pub(crate) fn abandon(&self) {
        if self.is_running.load(Ordering::SeqCst) {
            let state = self.state();
            self.finish(if state.is_terminal() { state } else { RunState::Failed });
        }
    }
}

/// Cross-thread handle for pausing, resuming and stopping a run and reading its status.
///
/// Cheap to clone. All commands are idempotent and return whether they changed anything.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    shared: Arc<SharedState>,
}

impl ControlHandle {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    /// Request a stop. Takes effect at the next check point of the execution thread,
    /// including inside delays and image waits. Also releases a pause.
    pub fn stop(&self) -> bool {
        let s = &self.shared;
        if !s.is_running.load(Ordering::SeqCst) {
            return false;
        }
        if s.should_stop.swap(true, Ordering::SeqCst) {
            return false;
        }
        s.is_paused.store(false, Ordering::SeqCst);
        s.transition(RunState::Paused, RunState::Running);
        info!(target: "macroflow::control", "Stop requested");
        true
    }

    /// Suspend the run at the next action boundary.
    pub fn pause(&self) -> bool {
        let s = &self.shared;
        if !s.is_running.load(Ordering::SeqCst) || s.should_stop() {
            return false;
        }
        if s.is_paused.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(target: "macroflow::control", "Pause requested");
        true
    }

    pub fn resume(&self) -> bool {
        let s = &self.shared;
        if !s.is_paused.swap(false, Ordering::SeqCst) {
            return false;
        }
        s.transition(RunState::Paused, RunState::Running);
        info!(target: "macroflow::control", "Resume requested");
        true
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    /// Immutable snapshot of the run.
    pub fn status(&self) -> ExecutionStatus {
        let s = &self.shared;
        let (started, finished, average) = {
            let clock = s.clock();
            (clock.started, clock.finished, clock.average)
        };
        let current_action_index = s.current_index.load(Ordering::SeqCst);
        let total_actions = s.total_actions.load(Ordering::SeqCst);

        let progress_percent = if total_actions == 0 {
            0.0
        } else {
            100.0 * current_action_index as f64 / total_actions as f64
        };
        let elapsed_time = match (started, finished) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        let remaining = total_actions.saturating_sub(current_action_index);

        let status = ExecutionStatus {
            state: s.state(),
            is_running: s.is_running.load(Ordering::SeqCst),
            is_paused: s.is_paused(),
            should_stop: s.should_stop(),
            current_action_index,
            total_actions,
            current_iteration: s.current_iteration.load(Ordering::SeqCst),
            total_iterations: s.total_iterations.load(Ordering::SeqCst),
            progress_percent,
            elapsed_time,
            average_action_time: average,
            estimated_remaining_time: estimate_remaining(average, remaining),
        };
        debug!(target: "macroflow::control", state = ?status.state, progress = status.progress_percent, "Status snapshot");
        status
    }
}

/// Point-in-time view of a run, as returned by [`ControlHandle::status`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStatus {
    pub state: RunState,
    pub is_running: bool,
    pub is_paused: bool,
    pub should_stop: bool,
    pub current_action_index: usize,
    pub total_actions: usize,
    /// Zero-based repetition of the whole sequence.
    pub current_iteration: usize,
    pub total_iterations: usize,
    /// `100 * current_action_index / total_actions`, zero for an empty run.
    pub progress_percent: f64,
    pub elapsed_time: Duration,
    pub average_action_time: Duration,
    pub estimated_remaining_time: Duration,
}

/// Stop flag view handed to backend calls that may block, so they can bail out early.
#[derive(Debug, Clone)]
pub struct StopSignal {
    shared: Arc<SharedState>,
    poll: Duration,
}

impl StopSignal {
    pub(crate) fn new(shared: Arc<SharedState>, poll: Duration) -> Self {
        Self {
            shared,
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    /// A signal that never fires. For calls made outside a run.
    pub fn never() -> Self {
        Self::new(Arc::new(SharedState::default()), Duration::from_millis(100))
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.should_stop()
    }

    /// Sleep for `duration` in poll-sized slices. Returns `false` if a stop cut it short.
    ///
    /// A duration too large to add to the clock sleeps until stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.is_stopped() {
                return false;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    self.poll.min(deadline - now)
                }
                None => self.poll,
            };
            std::thread::sleep(slice);
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> (Arc<SharedState>, ControlHandle) {
        let shared = Arc::new(SharedState::default());
        assert!(shared.try_begin(4, 1));
        (shared.clone(), ControlHandle::new(shared))
    }

    #[test]
    fn test_commands_are_ignored_when_idle() {
        let control = ControlHandle::new(Arc::new(SharedState::default()));
        assert!(!control.stop());
        assert!(!control.pause());
        assert!(!control.resume());
        let status = control.status();
        assert_eq!(status.state, RunState::Idle);
        assert_eq!(status.progress_percent, 0.0);
        assert_eq!(status.estimated_remaining_time, Duration::ZERO);
    }

    #[test]
    fn test_pause_and_stop_are_idempotent() {
        let (shared, control) = running();
        assert!(control.pause());
        shared.enter_pause();
        let first = control.status();
        assert!(!control.pause());
        let second = control.status();
        assert_eq!(first.state, second.state);
        assert_eq!(first.is_paused, second.is_paused);

        assert!(control.stop());
        assert!(!control.is_paused());
        assert_eq!(control.status().state, RunState::Running);
        assert!(!control.stop());
        assert!(control.status().should_stop);
        assert!(!control.pause());
    }

    #[test]
    fn test_second_begin_is_rejected() {
        let (shared, control) = running();
        shared.set_index(2);
        assert!(!shared.try_begin(9, 1));
        let status = control.status();
        assert_eq!(status.total_actions, 4);
        assert_eq!(status.current_action_index, 2);
    }

    #[test]
    fn test_status_math() {
        let (shared, control) = running();
        shared.set_index(1);
        shared.publish_average(Duration::from_millis(200), 1);
        let status = control.status();
        assert_eq!(status.progress_percent, 25.0);
        assert_eq!(status.average_action_time, Duration::from_millis(200));
        assert_eq!(status.estimated_remaining_time, Duration::from_millis(600));

        shared.set_index(4);
        shared.finish(RunState::Completed);
        let status = control.status();
        assert_eq!(status.progress_percent, 100.0);
        assert!(!status.is_running);
        assert_eq!(status.state, RunState::Completed);
    }

    #[test]
    fn test_stop_signal_sleep_is_cut_short() {
        let (shared, control) = running();
        let signal = StopSignal::new(shared, Duration::from_millis(10));
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            control.stop();
        });
        let started = Instant::now();
        assert!(!signal.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(2));
        stopper.join().unwrap();
        assert!(StopSignal::never().sleep(Duration::from_millis(5)));
    }

    #[test]
    fn test_unbounded_sleep_waits_for_stop() {
        let (shared, control) = running();
        let signal = StopSignal::new(shared, Duration::from_millis(10));
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            control.stop();
        });
        assert!(!signal.sleep(Duration::MAX));
        stopper.join().unwrap();
    }
}
