use enigo::Keyboard as _;
use enigo::Mouse as _;
use enigo::{Button as EButton, Coordinate, Direction, Enigo, Key, Settings};
use image::{GrayImage, RgbaImage, imageops};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::backend::ActionBackend;
use super::control::StopSignal;
use super::error::ExecError;
use crate::config::{MouseButton as CMouseButton, PasteMethod, Point, Rect};
use crate::utils::matching;

/// Pointer animation step.
const MOVE_STEP: Duration = Duration::from_millis(10);

/// Delay between the context-menu right click and the `v` key.
const CONTEXT_MENU_DELAY: Duration = Duration::from_millis(100);

/// Real desktop backend: input through enigo, clipboard through arboard, capture through xcap.
/// In dry-run mode, actions are only logged and no real input is simulated; image searches
/// report a hit so sequences can be walked end to end.
pub struct DesktopBackend {
    dry_run: bool,
    enigo: Option<Enigo>,
    clipboard: Option<arboard::Clipboard>,
    templates: HashMap<PathBuf, GrayImage>,
}

impl DesktopBackend {
    /// Create a new backend.
    /// - dry_run: when true, only logs instead of simulating real input.
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            enigo: None,
            clipboard: None,
            templates: HashMap::new(),
        }
    }

    /// Returns whether the backend is currently in dry-run mode.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn ensure_enigo(&mut self) -> Result<&mut Enigo, ExecError> {
        if self.enigo.is_none() {
            trace!(target: "macroflow::backend", "Initializing Enigo");
            let enigo = Enigo::new(&Settings::default())
                .map_err(|e| ExecError::backend(format!("failed to initialize Enigo: {e}")))?;
            self.enigo = Some(enigo);
        }
        self.enigo
            .as_mut()
            .ok_or_else(|| ExecError::backend("Enigo is not initialized"))
    }

    fn ensure_clipboard(&mut self) -> Result<&mut arboard::Clipboard, ExecError> {
        if self.clipboard.is_none() {
            trace!(target: "macroflow::backend", "Opening clipboard");
            self.clipboard = Some(arboard::Clipboard::new()?);
        }
        self.clipboard
            .as_mut()
            .ok_or_else(|| ExecError::backend("clipboard is not open"))
    }

    fn template(&mut self, path: &Path) -> Result<&GrayImage, ExecError> {
        if !self.templates.contains_key(path) {
            let img = image::open(path).map_err(|e| {
                ExecError::backend(format!("cannot load template {}: {e}", path.display()))
            })?;
            debug!(target: "macroflow::backend", template = %path.display(), width = img.width(), height = img.height(), "Loaded template");
            self.templates.insert(path.to_path_buf(), img.to_luma8());
        }
        self.templates
            .get(path)
            .ok_or_else(|| ExecError::backend(format!("template {} not cached", path.display())))
    }

    /// Animate from the current location to `to` in `MOVE_STEP` increments.
    fn glide(&mut self, to: Point, duration: Duration, stop: &StopSignal) -> Result<(), ExecError> {
        let enigo = self.ensure_enigo()?;
        let steps = (duration.as_millis() / MOVE_STEP.as_millis()).max(1) as i64;
        if steps <= 1 {
            enigo.move_mouse(to.x, to.y, Coordinate::Abs)?;
            return Ok(());
        }
        let (fx, fy) = enigo.location()?;
        for step in 1..=steps {
            let x = fx as i64 + (to.x as i64 - fx as i64) * step / steps;
            let y = fy as i64 + (to.y as i64 - fy as i64) * step / steps;
            self.ensure_enigo()?.move_mouse(x as i32, y as i32, Coordinate::Abs)?;
            if step < steps && !stop.sleep(MOVE_STEP) {
                return Err(ExecError::Cancelled);
            }
        }
        Ok(())
    }
}

impl ActionBackend for DesktopBackend {
    fn move_to(&mut self, to: Point, duration: Duration, stop: &StopSignal) -> Result<(), ExecError> {
        if self.dry_run {
            info!(target: "macroflow::backend", x = to.x, y = to.y, ?duration, "DRY-RUN move_to");
            return Ok(());
        }
        trace!(target: "macroflow::backend", x = to.x, y = to.y, ?duration, "move_to");
        self.glide(to, duration, stop)
    }

    fn click(&mut self, at: Option<Point>, button: CMouseButton, clicks: u32) -> Result<(), ExecError> {
        let clicks = clicks.max(1);
        if self.dry_run {
            info!(target: "macroflow::backend", ?at, ?button, clicks, "DRY-RUN click");
            return Ok(());
        }
        let enigo = self.ensure_enigo()?;
        trace!(target: "macroflow::backend", ?at, ?button, clicks, "click");
        if let Some(p) = at {
            enigo.move_mouse(p.x, p.y, Coordinate::Abs)?;
        }
        let btn = map_mouse_button(button);
        for _ in 0..clicks {
            enigo.button(btn, Direction::Click)?;
        }
        Ok(())
    }

    fn drag(
        &mut self,
        from: Point,
        to: Point,
        button: CMouseButton,
        duration: Duration,
        stop: &StopSignal,
    ) -> Result<(), ExecError> {
        if self.dry_run {
            info!(target: "macroflow::backend", ?from, ?to, ?button, ?duration, "DRY-RUN drag");
            return Ok(());
        }
        trace!(target: "macroflow::backend", ?from, ?to, ?button, ?duration, "drag");
        let btn = map_mouse_button(button);
        let enigo = self.ensure_enigo()?;
        enigo.move_mouse(from.x, from.y, Coordinate::Abs)?;
        enigo.button(btn, Direction::Press)?;
        let moved = self.glide(to, duration, stop);
        // Always let go of the button, even when the glide was cut short.
        self.ensure_enigo()?.button(btn, Direction::Release)?;
        moved
    }

    fn type_text(&mut self, text: &str, interval: Duration, stop: &StopSignal) -> Result<(), ExecError> {
        if self.dry_run {
            info!(target: "macroflow::backend", %text, ?interval, "DRY-RUN type_text");
            return Ok(());
        }
        trace!(target: "macroflow::backend", chars = text.chars().count(), ?interval, "type_text");
        if interval.is_zero() {
            self.ensure_enigo()?.text(text)?;
            return Ok(());
        }
        let mut buf = [0u8; 4];
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            self.ensure_enigo()?.text(c.encode_utf8(&mut buf))?;
            if chars.peek().is_some() && !stop.sleep(interval) {
                return Err(ExecError::Cancelled);
            }
        }
        Ok(())
    }

    fn key_press(&mut self, key: &str) -> Result<(), ExecError> {
        let parsed = parse_key(key)?;
        if self.dry_run {
            info!(target: "macroflow::backend", %key, "DRY-RUN key_press");
            return Ok(());
        }
        trace!(target: "macroflow::backend", %key, "key_press");
        self.ensure_enigo()?.key(parsed, Direction::Click)?;
        Ok(())
    }

    fn hotkey(&mut self, keys: &[String]) -> Result<(), ExecError> {
        let parsed = keys
            .iter()
            .map(|k| parse_key(k))
            .collect::<Result<Vec<_>, _>>()?;
        let Some((last, modifiers)) = parsed.split_last() else {
            return Err(ExecError::Validation("hotkey needs at least one key".into()));
        };
        if self.dry_run {
            info!(target: "macroflow::backend", keys = %keys.join("+"), "DRY-RUN hotkey");
            return Ok(());
        }
        trace!(target: "macroflow::backend", keys = %keys.join("+"), "hotkey");
        let enigo = self.ensure_enigo()?;
        for m in modifiers {
            enigo.key(*m, Direction::Press)?;
        }
        let tapped = enigo.key(*last, Direction::Click);
        // Release modifiers (in reverse order)
        for m in modifiers.iter().rev() {
            enigo.key(*m, Direction::Release)?;
        }
        tapped?;
        Ok(())
    }

    fn clipboard_copy(&mut self, text: Option<&str>) -> Result<(), ExecError> {
        match text {
            Some(text) => {
                if self.dry_run {
                    info!(target: "macroflow::backend", %text, "DRY-RUN clipboard_copy");
                    return Ok(());
                }
                trace!(target: "macroflow::backend", chars = text.chars().count(), "clipboard_copy");
                self.ensure_clipboard()?.set_text(text.to_string())?;
                Ok(())
            }
            None => self.hotkey(&[primary_modifier().to_string(), "c".to_string()]),
        }
    }

    fn clipboard_paste(&mut self, method: PasteMethod) -> Result<(), ExecError> {
        match method {
            PasteMethod::Shortcut => {
                self.hotkey(&[primary_modifier().to_string(), "v".to_string()])
            }
            PasteMethod::ContextMenu => {
                self.click(None, CMouseButton::Right, 1)?;
                if !self.dry_run {
                    thread::sleep(CONTEXT_MENU_DELAY);
                }
                self.key_press("v")
            }
        }
    }

    fn capture_screen(&mut self, region: Option<Rect>) -> Result<RgbaImage, ExecError> {
        if self.dry_run {
            info!(target: "macroflow::backend", ?region, "DRY-RUN capture_screen");
            let (w, h) = region.map_or((1, 1), |r| (r.width.max(1), r.height.max(1)));
            return Ok(RgbaImage::new(w, h));
        }
        trace!(target: "macroflow::backend", ?region, "capture_screen");
        let full = capture_primary_monitor()?;
        match region {
            None => Ok(full),
            Some(r) => crop(&full, r),
        }
    }

    fn find_image(
        &mut self,
        template: &Path,
        confidence: f64,
        region: Option<Rect>,
    ) -> Result<Option<Point>, ExecError> {
        if self.dry_run {
            info!(target: "macroflow::backend", template = %template.display(), confidence, ?region, "DRY-RUN find_image");
            let origin = region.map_or(Point { x: 0, y: 0 }, |r| Point { x: r.x, y: r.y });
            return Ok(Some(origin));
        }
        let screen = imageops::grayscale(&self.capture_screen(region)?);
        let needle = self.template(template)?;
        let found = matching::locate_gray(&screen, needle, confidence).map(|(x, y)| {
            let (ox, oy) = region.map_or((0, 0), |r| (r.x.max(0), r.y.max(0)));
            Point {
                x: ox + x as i32,
                y: oy + y as i32,
            }
        });
        debug!(target: "macroflow::backend", template = %template.display(), ?found, "find_image");
        Ok(found)
    }
}

#[cfg(feature = "screen-capture")]
fn capture_primary_monitor() -> Result<RgbaImage, ExecError> {
    let monitors = xcap::Monitor::all().map_err(|e| ExecError::backend(format!("screen capture: {e}")))?;
    let monitor = monitors
        .first()
        .ok_or_else(|| ExecError::backend("no monitor found"))?;
    monitor
        .capture_image()
        .map_err(|e| ExecError::backend(format!("screen capture: {e}")))
}

#[cfg(not(feature = "screen-capture"))]
fn capture_primary_monitor() -> Result<RgbaImage, ExecError> {
    Err(ExecError::backend(
        "screen capture is unavailable: built without the `screen-capture` feature",
    ))
}

/// Crop `r` out of a full-screen capture, clamped to the capture bounds.
fn crop(full: &RgbaImage, r: Rect) -> Result<RgbaImage, ExecError> {
    let (w, h) = full.dimensions();
    let x = r.x.max(0) as u32;
    let y = r.y.max(0) as u32;
    if x >= w || y >= h || r.width == 0 || r.height == 0 {
        return Err(ExecError::backend(format!(
            "region {r:?} lies outside the {w}x{h} screen"
        )));
    }
    let cw = r.width.min(w - x);
    let ch = r.height.min(h - y);
    Ok(imageops::crop_imm(full, x, y, cw, ch).to_image())
}

fn primary_modifier() -> &'static str {
    if cfg!(target_os = "macos") { "cmd" } else { "ctrl" }
}

fn map_mouse_button(btn: CMouseButton) -> EButton {
    match btn {
        CMouseButton::Left => EButton::Left,
        CMouseButton::Middle => EButton::Middle,
        CMouseButton::Right => EButton::Right,
    }
}

/// Map a key name ("enter", "ctrl", "f5", "a") to an enigo key.
fn parse_key(name: &str) -> Result<Key, ExecError> {
    let lower = name.trim().to_lowercase();
    let key = match lower.as_str() {
        "ctrl" | "control" => Key::Control,
        "shift" => Key::Shift,
        "alt" | "option" => Key::Alt,
        "cmd" | "command" | "meta" | "super" | "win" => Key::Meta,
        "enter" | "return" => Key::Return,
        "tab" => Key::Tab,
        "esc" | "escape" => Key::Escape,
        "space" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" | "page_up" => Key::PageUp,
        "pagedown" | "page_down" => Key::PageDown,
        "capslock" | "caps_lock" => Key::CapsLock,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        _ => {
            let mut chars = name.trim().chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Key::Unicode(c.to_ascii_lowercase()),
                _ => return Err(ExecError::Validation(format!("unknown key '{name}'"))),
            }
        }
    };
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_names() {
        assert!(matches!(parse_key("Ctrl").unwrap(), Key::Control));
        assert!(matches!(parse_key(" enter ").unwrap(), Key::Return));
        assert!(matches!(parse_key("F5").unwrap(), Key::F5));
        assert!(matches!(parse_key("A").unwrap(), Key::Unicode('a')));
        assert!(matches!(parse_key("hyper"), Err(ExecError::Validation(_))));
    }

    #[test]
    fn test_dry_run_never_touches_the_desktop() {
        let mut backend = DesktopBackend::new(true);
        assert!(backend.is_dry_run());
        let stop = StopSignal::never();
        backend
            .move_to(Point { x: 5, y: 5 }, Duration::from_secs(1), &stop)
            .unwrap();
        backend.click(None, CMouseButton::Left, 2).unwrap();
        backend.type_text("hello", Duration::from_millis(100), &stop).unwrap();
        backend.hotkey(&["ctrl".into(), "s".into()]).unwrap();
        backend.clipboard_paste(PasteMethod::ContextMenu).unwrap();
        let region = Rect { x: 10, y: 20, width: 30, height: 40 };
        assert_eq!(backend.capture_screen(Some(region)).unwrap().dimensions(), (30, 40));
        let hit = backend.find_image(Path::new("missing.png"), 0.9, Some(region)).unwrap();
        assert_eq!(hit, Some(Point { x: 10, y: 20 }));
        assert!(backend.enigo.is_none());
    }

    #[test]
    fn test_unknown_key_fails_even_in_dry_run() {
        let mut backend = DesktopBackend::new(true);
        assert!(backend.key_press("nope").is_err());
    }

    #[test]
    fn test_crop_is_clamped() {
        let full = RgbaImage::new(100, 50);
        let part = crop(&full, Rect { x: 90, y: 40, width: 30, height: 30 }).unwrap();
        assert_eq!(part.dimensions(), (10, 10));
        assert!(crop(&full, Rect { x: 200, y: 0, width: 5, height: 5 }).is_err());
    }
}
