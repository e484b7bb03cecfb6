//! Per-kind dispatch onto an [`ActionBackend`].
//!
//! Control-flow kinds never reach this table; the engine handles them itself.

use rand::random_range;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::backend::ActionBackend;
use super::control::StopSignal;
use super::error::ExecError;
use crate::config::{ActionKind, DelayParams, MouseButton, Point, Rect, RunSettings};

pub(crate) struct Dispatcher<'a, B: ActionBackend> {
    pub backend: &'a Mutex<B>,
    pub settings: &'a RunSettings,
    pub stop: &'a StopSignal,
}

/// Everything an image search needs, shared by the three image kinds and conditionals.
pub(crate) struct ImageSearch<'a> {
    pub templates: &'a [PathBuf],
    pub confidence: Option<f64>,
    pub timeout: f64,
    pub poll_interval: Option<f64>,
    pub region: Option<Rect>,
}

impl<B: ActionBackend> Dispatcher<'_, B> {
    pub fn dispatch(&self, kind: &ActionKind) -> Result<(), ExecError> {
        if let ActionKind::Delay(p) = kind {
            return self.delay(p);
        }

        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        let backend = &mut *backend;
        match kind {
            ActionKind::MouseMove(p) => {
                backend.move_to(Point { x: p.x, y: p.y }, seconds(p.duration)?, self.stop)
            }
            ActionKind::MouseClick(p) => backend.click(point(p.x, p.y), p.button, p.clicks),
            ActionKind::MouseDoubleClick(p) => backend.click(point(p.x, p.y), MouseButton::Left, 2),
            ActionKind::MouseRightClick(p) => backend.click(point(p.x, p.y), MouseButton::Right, 1),
            ActionKind::MouseDrag(p) => backend.drag(
                Point { x: p.start_x, y: p.start_y },
                Point { x: p.end_x, y: p.end_y },
                p.button,
                seconds(p.duration)?,
                self.stop,
            ),
            ActionKind::KeyboardType(p) => backend.type_text(&p.text, seconds(p.interval)?, self.stop),
            ActionKind::KeyboardPress(p) => {
                for _ in 0..p.presses {
                    if self.stop.is_stopped() {
                        return Err(ExecError::Cancelled);
                    }
                    backend.key_press(&p.key)?;
                }
                Ok(())
            }
            ActionKind::KeyboardHotkey(p) => backend.hotkey(&p.keys.keys()),
            ActionKind::ClipboardCopy(p) => backend.clipboard_copy(p.text.as_deref()),
            ActionKind::ClipboardPaste(p) => backend.clipboard_paste(p.method),
            ActionKind::Screenshot(p) => {
                let img = backend.capture_screen(p.region)?;
                if let Some(path) = &p.path {
                    img.save(path)?;
                    debug!(target: "macroflow::engine", path = %path.display(), "Screenshot saved");
                }
                Ok(())
            }
            ActionKind::ImageClick(p) => {
                let (_, at) = self.wait_for_image(
                    backend,
                    &ImageSearch {
                        templates: std::slice::from_ref(&p.template),
                        confidence: p.confidence,
                        timeout: p.timeout,
                        poll_interval: p.poll_interval,
                        region: p.region,
                    },
                )?;
                backend.click(Some(at), p.button, p.clicks)
            }
            ActionKind::ImageWait(p) => self
                .wait_for_image(
                    backend,
                    &ImageSearch {
                        templates: std::slice::from_ref(&p.template),
                        confidence: p.confidence,
                        timeout: p.timeout,
                        poll_interval: p.poll_interval,
                        region: p.region,
                    },
                )
                .map(|_| ()),
            ActionKind::WaitForAnyImage(p) => {
                let (which, at) = self.wait_for_image(
                    backend,
                    &ImageSearch {
                        templates: &p.templates,
                        confidence: p.confidence,
                        timeout: p.timeout,
                        poll_interval: p.poll_interval,
                        region: p.region,
                    },
                )?;
                debug!(target: "macroflow::engine", template = %p.templates[which].display(), "First image found");
                if p.click {
                    backend.click(Some(at), MouseButton::Left, 1)?;
                }
                Ok(())
            }
            ActionKind::Delay(_) => Ok(()),
            ActionKind::Conditional(_) | ActionKind::DataLoopStart(_) | ActionKind::DataLoopEnd(_) => {
                Err(ExecError::Validation(format!(
                    "{} can only run as part of a sequence",
                    kind.name()
                )))
            }
        }
    }

    /// Single image check for conditionals.
    pub fn image_present(&self, search: &ImageSearch<'_>) -> Result<bool, ExecError> {
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        let confidence = search.confidence.unwrap_or(self.settings.default_confidence);
        for template in search.templates {
            if backend.find_image(template, confidence, search.region)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Poll for any of `search.templates` until one shows up or the deadline passes.
    /// A zero timeout makes exactly one attempt; a timeout past the clock's range never expires.
    fn wait_for_image(&self, backend: &mut B, search: &ImageSearch<'_>) -> Result<(usize, Point), ExecError> {
        let timeout = seconds(search.timeout)?;
        let poll = match search.poll_interval {
            Some(s) => seconds(s)?,
            None => Duration::from_millis(self.settings.image_poll_interval_ms),
        }
        .max(Duration::from_millis(1));
        let confidence = search.confidence.unwrap_or(self.settings.default_confidence);
        let deadline = Instant::now().checked_add(timeout);

        let mut attempts = 0u32;
        loop {
            if self.stop.is_stopped() {
                return Err(ExecError::Cancelled);
            }
            attempts += 1;
            for (i, template) in search.templates.iter().enumerate() {
                if let Some(at) = backend.find_image(template, confidence, search.region)? {
                    trace!(target: "macroflow::engine", template = %template.display(), x = at.x, y = at.y, attempts, "Image found");
                    return Ok((i, at));
                }
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ExecError::Timeout {
                            what: describe_templates(search.templates),
                            timeout,
                        });
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            if !self.stop.sleep(wait) {
                return Err(ExecError::Cancelled);
            }
        }
    }

    fn delay(&self, p: &DelayParams) -> Result<(), ExecError> {
        let secs = match p.max_seconds {
            Some(max) if max > p.seconds => random_range(p.seconds..=max),
            _ => p.seconds,
        };
        let duration = seconds(secs)?;
        trace!(target: "macroflow::engine", ?duration, "delay");
        if self.stop.sleep(duration) {
            Ok(())
        } else {
            Err(ExecError::Cancelled)
        }
    }
}

fn describe_templates(templates: &[PathBuf]) -> String {
    let names: Vec<String> = templates
        .iter()
        .map(|t| format!("'{}'", t.display()))
        .collect();
    match names.len() {
        1 => format!("image {}", names[0]),
        _ => format!("any of images {}", names.join(", ")),
    }
}

fn point(x: Option<i32>, y: Option<i32>) -> Option<Point> {
    match (x, y) {
        (Some(x), Some(y)) => Some(Point { x, y }),
        _ => None,
    }
}

pub(crate) fn seconds(value: f64) -> Result<Duration, ExecError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ExecError::Validation(format!("invalid duration {value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AnyImageParams, ClipboardCopyParams, ClipboardPasteParams, DragParams, HotkeyParams, ImageClickParams,
        KeyCombo, KeyParams, MoveParams, PasteMethod, PointParams, ScreenshotParams,
    };
    use crate::executor::testing::{Call, MockBackend};

    fn with_dispatcher<T>(backend: MockBackend, f: impl FnOnce(&Dispatcher<'_, MockBackend>) -> T) -> T {
        let backend = Mutex::new(backend);
        let settings = RunSettings::default();
        let stop = StopSignal::never();
        f(&Dispatcher {
            backend: &backend,
            settings: &settings,
            stop: &stop,
        })
    }

    #[test]
    fn test_dispatch_table() {
        let region = Rect { x: 5, y: 6, width: 7, height: 8 };
        let cases = vec![
            (
                ActionKind::MouseMove(MoveParams { x: 3, y: 4, duration: 0.0 }),
                vec![Call::Move(Point { x: 3, y: 4 })],
            ),
            (
                ActionKind::MouseDoubleClick(PointParams { x: Some(10), y: Some(20) }),
                vec![Call::Click(Some(Point { x: 10, y: 20 }), MouseButton::Left, 2)],
            ),
            (
                ActionKind::MouseRightClick(PointParams { x: None, y: None }),
                vec![Call::Click(None, MouseButton::Right, 1)],
            ),
            (
                ActionKind::MouseDrag(DragParams {
                    start_x: 1,
                    start_y: 2,
                    end_x: 30,
                    end_y: 40,
                    button: MouseButton::Left,
                    duration: 0.0,
                }),
                vec![Call::Drag(Point { x: 1, y: 2 }, Point { x: 30, y: 40 })],
            ),
            (
                ActionKind::KeyboardPress(KeyParams { key: "tab".into(), presses: 2 }),
                vec![Call::Key("tab".into()), Call::Key("tab".into())],
            ),
            (
                ActionKind::KeyboardHotkey(HotkeyParams {
                    keys: KeyCombo::List(vec!["ctrl".into(), "shift".into(), "s".into()]),
                }),
                vec![Call::Hotkey(vec!["ctrl".into(), "shift".into(), "s".into()])],
            ),
            (
                ActionKind::KeyboardHotkey(HotkeyParams {
                    keys: KeyCombo::Joined("ctrl + c".into()),
                }),
                vec![Call::Hotkey(vec!["ctrl".into(), "c".into()])],
            ),
            (
                ActionKind::ClipboardCopy(ClipboardCopyParams { text: Some("hello".into()) }),
                vec![Call::Copy(Some("hello".into()))],
            ),
            (
                ActionKind::ClipboardCopy(ClipboardCopyParams { text: None }),
                vec![Call::Copy(None)],
            ),
            (
                ActionKind::ClipboardPaste(ClipboardPasteParams { method: PasteMethod::ContextMenu }),
                vec![Call::Paste(PasteMethod::ContextMenu)],
            ),
            (
                ActionKind::Screenshot(ScreenshotParams { region: Some(region), path: None }),
                vec![Call::Capture(Some(region))],
            ),
        ];

        for (kind, expected) in cases {
            let mock = MockBackend::new();
            with_dispatcher(mock.clone(), |d| d.dispatch(&kind)).unwrap();
            assert_eq!(mock.calls(), expected, "{}", kind.name());
        }
    }

    #[test]
    fn test_control_flow_kinds_are_rejected() {
        let kind = ActionKind::DataLoopEnd(Default::default());
        let err = with_dispatcher(MockBackend::new(), |d| d.dispatch(&kind)).unwrap_err();
        assert!(matches!(err, ExecError::Validation(_)));
    }

    #[test]
    fn test_image_present_checks_once() {
        let mock = MockBackend::new().with_image("here.png", Point { x: 1, y: 1 });
        let templates: [PathBuf; 2] = ["gone.png".into(), "here.png".into()];
        let found = with_dispatcher(mock.clone(), |d| {
            d.image_present(&ImageSearch {
                templates: &templates,
                confidence: None,
                timeout: 0.0,
                poll_interval: None,
                region: None,
            })
        })
        .unwrap();
        assert!(found);
        assert_eq!(
            mock.calls(),
            vec![Call::Find("gone.png".into()), Call::Find("here.png".into())]
        );
    }

    #[test]
    fn test_any_image_clicks_first_found() {
        let mock = MockBackend::new().with_image("b.png", Point { x: 40, y: 50 });
        let kind = ActionKind::WaitForAnyImage(AnyImageParams {
            templates: vec!["a.png".into(), "b.png".into()],
            confidence: Some(0.9),
            timeout: 1.0,
            poll_interval: Some(0.05),
            region: None,
            click: true,
            stop_on_failure: true,
        });
        with_dispatcher(mock.clone(), |d| d.dispatch(&kind)).unwrap();
        assert_eq!(
            mock.calls(),
            vec![
                Call::Find("a.png".into()),
                Call::Find("b.png".into()),
                Call::Click(Some(Point { x: 40, y: 50 }), MouseButton::Left, 1),
            ]
        );
    }

    #[test]
    fn test_image_click_with_zero_timeout_tries_once() {
        let mock = MockBackend::new();
        let kind = ActionKind::ImageClick(ImageClickParams {
            template: "gone.png".into(),
            confidence: None,
            timeout: 0.0,
            poll_interval: None,
            region: None,
            button: MouseButton::Left,
            clicks: 1,
            stop_on_failure: true,
        });
        let err = with_dispatcher(mock.clone(), |d| d.dispatch(&kind)).unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert_eq!(mock.calls(), vec![Call::Find("gone.png".into())]);
    }

    #[test]
    fn test_screenshot_is_saved_as_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        let kind = ActionKind::Screenshot(ScreenshotParams {
            region: Some(Rect { x: 0, y: 0, width: 8, height: 6 }),
            path: Some(path.clone()),
        });
        with_dispatcher(MockBackend::new(), |d| d.dispatch(&kind)).unwrap();
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (8, 6));
    }

    #[test]
    fn test_random_delay_stays_in_range() {
        let kind = ActionKind::Delay(DelayParams {
            seconds: 0.01,
            max_seconds: Some(0.05),
        });
        let started = Instant::now();
        with_dispatcher(MockBackend::new(), |d| d.dispatch(&kind)).unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_seconds_rejects_negative_and_nan() {
        assert_eq!(seconds(0.25).unwrap(), Duration::from_millis(250));
        assert!(seconds(-1.0).is_err());
        assert!(seconds(f64::NAN).is_err());
    }

    #[test]
    fn test_point_requires_both_coordinates() {
        assert_eq!(point(Some(1), Some(2)), Some(Point { x: 1, y: 2 }));
        assert_eq!(point(Some(1), None), None);
    }

    #[test]
    fn test_describe_templates() {
        assert_eq!(describe_templates(&["a.png".into()]), "image 'a.png'");
        assert_eq!(
            describe_templates(&["a.png".into(), "b.png".into()]),
            "any of images 'a.png', 'b.png'"
        );
    }
}
