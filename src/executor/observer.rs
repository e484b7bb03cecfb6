//! Run callbacks.
//!
//! All three hooks are invoked synchronously on the execution thread, at most once per event.
//! Callers that need to update UI state from them must marshal onto their own thread.
//! A panicking hook is caught and logged; it never takes the run down.

/// Receives progress, error and completion events of a run.
pub trait RunObserver: Send {
    /// Called after each top-level action is dispatched or skipped.
    fn on_progress(&mut self, _index: usize, _total: usize, _description: &str) {}

    /// Called once per action failure, fatal or not.
    fn on_error(&mut self, _message: &str) {}

    /// Called exactly once when the run ends.
    fn on_complete(&mut self, _success: bool, _message: &str) {}
}

/// No callbacks.
impl RunObserver for () {}

type ProgressFn = Box<dyn FnMut(usize, usize, &str) + Send>;
type ErrorFn = Box<dyn FnMut(&str) + Send>;
type CompleteFn = Box<dyn FnMut(bool, &str) + Send>;

/// Closure-based observer; any hook may be left unset.
#[derive(Default)]
pub struct Callbacks {
    progress: Option<ProgressFn>,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, f: impl FnMut(usize, usize, &str) + Send + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn with_error(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn with_complete(mut self, f: impl FnMut(bool, &str) + Send + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }
}

impl RunObserver for Callbacks {
    fn on_progress(&mut self, index: usize, total: usize, description: &str) {
        if let Some(f) = self.progress.as_mut() {
            f(index, total, description);
        }
    }

    fn on_error(&mut self, message: &str) {
        if let Some(f) = self.error.as_mut() {
            f(message);
        }
    }

    fn on_complete(&mut self, success: bool, message: &str) {
        if let Some(f) = self.complete.as_mut() {
            f(success, message);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("progress", &self.progress.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_unset_hooks_are_noops() {
        let mut cb = Callbacks::new();
        cb.on_progress(0, 1, "x");
        cb.on_error("boom");
        cb.on_complete(true, "done");
        let mut unit = ();
        RunObserver::on_error(&mut unit, "ignored");
    }

    #[test]
    fn test_hooks_receive_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut cb = Callbacks::new().with_progress(move |i, n, d| {
            sink.lock().unwrap().push(format!("{i}/{n} {d}"));
        });
        cb.on_progress(1, 3, "click");
        assert_eq!(*seen.lock().unwrap(), vec!["1/3 click".to_string()]);
    }
}
