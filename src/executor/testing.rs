//! Scripted backend for engine tests.

use image::RgbaImage;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::backend::ActionBackend;
use super::control::StopSignal;
use super::error::ExecError;
use crate::config::{MouseButton, PasteMethod, Point, Rect};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Move(Point),
    Click(Option<Point>, MouseButton, u32),
    Drag(Point, Point),
    Type(String),
    Key(String),
    Hotkey(Vec<String>),
    Copy(Option<String>),
    Paste(PasteMethod),
    Capture(Option<Rect>),
    Find(PathBuf),
}

/// Records every call; clones share the same log, so a test keeps one and hands the other to
/// the engine. Image lookups succeed only for templates registered with [`MockBackend::with_image`].
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    calls: Arc<Mutex<Vec<Call>>>,
    images: HashMap<PathBuf, Point>,
    failing: HashSet<&'static str>,
    failures_left: Arc<Mutex<HashMap<&'static str, u32>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `template` on the fake screen at `at`.
    pub fn with_image(mut self, template: impl Into<PathBuf>, at: Point) -> Self {
        self.images.insert(template.into(), at);
        self
    }

    /// Make every call of `op` ("click", "type", "key", ...) fail with a backend error.
    pub fn failing(mut self, op: &'static str) -> Self {
        self.failing.insert(op);
        self
    }

    /// Make only the first `times` calls of `op` fail.
    pub fn failing_first(self, op: &'static str, times: u32) -> Self {
        self.failures_left.lock().unwrap().insert(op, times);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, op: &'static str, call: Call) -> Result<(), ExecError> {
        self.calls.lock().unwrap().push(call);
        if self.failing.contains(op) {
            return Err(ExecError::backend(format!("scripted {op} failure")));
        }
        if let Some(left) = self.failures_left.lock().unwrap().get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(ExecError::backend(format!("scripted {op} failure")));
            }
        }
        Ok(())
    }
}

impl ActionBackend for MockBackend {
    fn move_to(&mut self, to: Point, duration: Duration, stop: &StopSignal) -> Result<(), ExecError> {
        if !stop.sleep(duration) {
            return Err(ExecError::Cancelled);
        }
        self.log("move", Call::Move(to))
    }

    fn click(&mut self, at: Option<Point>, button: MouseButton, clicks: u32) -> Result<(), ExecError> {
        self.log("click", Call::Click(at, button, clicks))
    }

    fn drag(
        &mut self,
        from: Point,
        to: Point,
        _button: MouseButton,
        duration: Duration,
        stop: &StopSignal,
    ) -> Result<(), ExecError> {
        if !stop.sleep(duration) {
            return Err(ExecError::Cancelled);
        }
        self.log("drag", Call::Drag(from, to))
    }

    fn type_text(&mut self, text: &str, _interval: Duration, _stop: &StopSignal) -> Result<(), ExecError> {
        self.log("type", Call::Type(text.to_string()))
    }

    fn key_press(&mut self, key: &str) -> Result<(), ExecError> {
        self.log("key", Call::Key(key.to_string()))
    }

    fn hotkey(&mut self, keys: &[String]) -> Result<(), ExecError> {
        self.log("hotkey", Call::Hotkey(keys.to_vec()))
    }

    fn clipboard_copy(&mut self, text: Option<&str>) -> Result<(), ExecError> {
        self.log("copy", Call::Copy(text.map(str::to_string)))
    }

    fn clipboard_paste(&mut self, method: PasteMethod) -> Result<(), ExecError> {
        self.log("paste", Call::Paste(method))
    }

    fn capture_screen(&mut self, region: Option<Rect>) -> Result<RgbaImage, ExecError> {
        self.log("capture", Call::Capture(region))?;
        let (w, h) = region.map_or((4, 4), |r| (r.width.max(1), r.height.max(1)));
        Ok(RgbaImage::new(w, h))
    }

    fn find_image(
        &mut self,
        template: &Path,
        _confidence: f64,
        _region: Option<Rect>,
    ) -> Result<Option<Point>, ExecError> {
        self.log("find", Call::Find(template.to_path_buf()))?;
        Ok(self.images.get(template).copied())
    }
}
