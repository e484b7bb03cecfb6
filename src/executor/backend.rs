//! Capability surface the engine drives.
//!
//! Implementations are called only from the execution thread, one call at a time. Calls that
//! can take a while (animated moves, per-character typing) receive a [`StopSignal`] and must
//! return early once it fires. Image waits are polled by the engine itself, so
//! `find_image` is a single attempt.

use image::RgbaImage;
use std::path::Path;
use std::time::Duration;

use super::control::StopSignal;
use super::error::ExecError;
use crate::config::{MouseButton, PasteMethod, Point, Rect};

pub trait ActionBackend: Send {
    /// Move the pointer to `to`, animated over `duration` (zero = jump).
    fn move_to(&mut self, to: Point, duration: Duration, stop: &StopSignal) -> Result<(), ExecError>;

    /// Click `clicks` times, at `at` if given, otherwise at the current pointer position.
    fn click(&mut self, at: Option<Point>, button: MouseButton, clicks: u32) -> Result<(), ExecError>;

    /// Press at `from`, move to `to` over `duration`, release.
    fn drag(
        &mut self,
        from: Point,
        to: Point,
        button: MouseButton,
        duration: Duration,
        stop: &StopSignal,
    ) -> Result<(), ExecError>;

    /// Type literal text with `interval` between characters.
    fn type_text(&mut self, text: &str, interval: Duration, stop: &StopSignal) -> Result<(), ExecError>;

    /// Press and release one named key.
    fn key_press(&mut self, key: &str) -> Result<(), ExecError>;

    /// Hold every key but the last, tap the last, release in reverse.
    fn hotkey(&mut self, keys: &[String]) -> Result<(), ExecError>;

    /// Put `text` on the clipboard, or send the platform copy shortcut when `None`.
    fn clipboard_copy(&mut self, text: Option<&str>) -> Result<(), ExecError>;

    fn clipboard_paste(&mut self, method: PasteMethod) -> Result<(), ExecError>;

    fn capture_screen(&mut self, region: Option<Rect>) -> Result<RgbaImage, ExecError>;

    /// One search for `template`. Returns the screen coordinates of its center when the match
    /// score reaches `confidence`.
    fn find_image(
        &mut self,
        template: &Path,
        confidence: f64,
        region: Option<Rect>,
    ) -> Result<Option<Point>, ExecError>;
}

impl<B: ActionBackend + ?Sized> ActionBackend for Box<B> {
    fn move_to(&mut self, to: Point, duration: Duration, stop: &StopSignal) -> Result<(), ExecError> {
        (**self).move_to(to, duration, stop)
    }

    fn click(&mut self, at: Option<Point>, button: MouseButton, clicks: u32) -> Result<(), ExecError> {
        (**self).click(at, button, clicks)
    }

    fn drag(
        &mut self,
        from: Point,
        to: Point,
        button: MouseButton,
        duration: Duration,
        stop: &StopSignal,
    ) -> Result<(), ExecError> {
        (**self).drag(from, to, button, duration, stop)
    }

    fn type_text(&mut self, text: &str, interval: Duration, stop: &StopSignal) -> Result<(), ExecError> {
        (**self).type_text(text, interval, stop)
    }

    fn key_press(&mut self, key: &str) -> Result<(), ExecError> {
        (**self).key_press(key)
    }

    fn hotkey(&mut self, keys: &[String]) -> Result<(), ExecError> {
        (**self).hotkey(keys)
    }

    fn clipboard_copy(&mut self, text: Option<&str>) -> Result<(), ExecError> {
        (**self).clipboard_copy(text)
    }

    fn clipboard_paste(&mut self, method: PasteMethod) -> Result<(), ExecError> {
        (**self).clipboard_paste(method)
    }

    fn capture_screen(&mut self, region: Option<Rect>) -> Result<RgbaImage, ExecError> {
        (**self).capture_screen(region)
    }

    fn find_image(
        &mut self,
        template: &Path,
        confidence: f64,
        region: Option<Rect>,
    ) -> Result<Option<Point>, ExecError> {
        (**self).find_image(template, confidence, region)
    }
}
