//! Global emergency-stop key.
//!
//! A background OS thread listens to raw keyboard events and maps a press of the configured
//! key to [`ControlHandle::stop`]. The engine notices the stop at its next poll, so the key
//! works even while an image wait or a long delay is in flight.
//!
//! Requires the `panic-key` feature (rdev). Without it, [`spawn_listener`] returns an error
//! and callers are expected to log it and continue without the key.

use anyhow::Result;

use crate::executor::ControlHandle;

/// Start listening for `key_name` and stop the run on `control` when it is pressed.
#[cfg(feature = "panic-key")]
pub fn spawn_listener(key_name: &str, control: ControlHandle) -> Result<std::thread::JoinHandle<()>> {
    use anyhow::Context;
    use rdev::{EventType, listen};
    use tracing::{error, info, warn};

    let target = parse_key(key_name)?;
    let key_label = key_name.to_string();
    let handle = std::thread::Builder::new()
        .name("macroflow-panic-key".into())
        .spawn(move || {
            info!(target: "macroflow::panic_key", key = %key_label, "Panic key listener started");
            let result = listen(move |event| {
                if let EventType::KeyPress(key) = event.event_type {
                    if key == target && control.is_running() {
                        warn!(target: "macroflow::panic_key", "Panic key pressed; stopping execution");
                        control.stop();
                    }
                }
            });
            if let Err(e) = result {
                error!(target: "macroflow::panic_key", error = ?e, "Keyboard listener failed");
            }
        })
        .context("Failed to spawn panic key listener thread")?;
    Ok(handle)
}

/// Start listening for `key_name` and stop the run on `control` when it is pressed.
#[cfg(not(feature = "panic-key"))]
pub fn spawn_listener(key_name: &str, _control: ControlHandle) -> Result<std::thread::JoinHandle<()>> {
    anyhow::bail!(
        "panic key '{key_name}' is unavailable: built without the `panic-key` feature"
    )
}

/// Map a key name to an rdev key.
#[cfg(feature = "panic-key")]
fn parse_key(name: &str) -> Result<rdev::Key> {
    use rdev::Key;
    let key = match name.trim().to_lowercase().as_str() {
        "esc" | "escape" => Key::Escape,
        "pause" | "break" => Key::Pause,
        "scrolllock" | "scroll_lock" => Key::ScrollLock,
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
        "end" => Key::End,
        "home" => Key::Home,
        other => anyhow::bail!("unsupported panic key: {other:?}"),
    };
    Ok(key)
}

#[cfg(all(test, feature = "panic-key"))]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("ESC").unwrap(), rdev::Key::Escape);
        assert_eq!(parse_key(" f12 ").unwrap(), rdev::Key::F12);
        assert!(parse_key("space bar").is_err());
    }
}

#[cfg(all(test, not(feature = "panic-key")))]
mod tests {
    use super::*;
    use crate::executor::Engine;
    use crate::executor::testing::MockBackend;

    #[test]
    fn test_listener_reports_missing_feature() {
        let engine = Engine::new(MockBackend::default(), Default::default());
        let err = spawn_listener("escape", engine.control()).unwrap_err();
        assert!(err.to_string().contains("panic-key"));
    }
}
