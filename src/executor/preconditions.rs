//! Start conditions checked once before a run claims the engine.

use chrono::NaiveTime;
use tracing::debug;

use super::backend::ActionBackend;
use super::error::ExecError;
use crate::config::{PixelCheck, Rect, RunConditions};
use crate::utils::schedule::{parse_time_of_day, within_window};

/// Check every condition that is set, at local time of day `now`.
///
/// The first one that does not hold is returned as [`ExecError::Precondition`].
pub(crate) fn check<B: ActionBackend + ?Sized>(
    conditions: &RunConditions,
    backend: &mut B,
    now: NaiveTime,
) -> Result<(), ExecError> {
    let start = parse_bound(conditions.start_time.as_deref())?;
    let end = parse_bound(conditions.end_time.as_deref())?;
    if !within_window(now, start, end) {
        return Err(ExecError::Precondition(format!(
            "current time {} is outside the allowed window {}..{}",
            now.format("%H:%M:%S"),
            conditions.start_time.as_deref().unwrap_or("*"),
            conditions.end_time.as_deref().unwrap_or("*"),
        )));
    }

    if let Some(path) = &conditions.file_exists {
        if !path.exists() {
            return Err(ExecError::Precondition(format!(
                "file '{}' does not exist",
                path.display()
            )));
        }
    }

    if let Some(pixel) = &conditions.pixel {
        check_pixel(pixel, backend)?;
    }
    debug!(target: "macroflow::engine", "Run conditions met");
    Ok(())
}

fn parse_bound(text: Option<&str>) -> Result<Option<NaiveTime>, ExecError> {
    text.map(parse_time_of_day)
        .transpose()
        .map_err(ExecError::Precondition)
}

fn check_pixel<B: ActionBackend + ?Sized>(pixel: &PixelCheck, backend: &mut B) -> Result<(), ExecError> {
    let region = Rect {
        x: pixel.x,
        y: pixel.y,
        width: 1,
        height: 1,
    };
    let shot = backend.capture_screen(Some(region)).map_err(|e| {
        ExecError::Precondition(format!("pixel ({}, {}) could not be read: {e}", pixel.x, pixel.y))
    })?;
    let Some(found) = shot.get_pixel_checked(0, 0) else {
        return Err(ExecError::Precondition(format!(
            "pixel ({}, {}) is off screen",
            pixel.x, pixel.y
        )));
    };
    let rgb = [found[0], found[1], found[2]];
    if rgb != pixel.color {
        return Err(ExecError::Precondition(format!(
            "pixel ({}, {}) is {rgb:?}, expected {:?}",
            pixel.x, pixel.y, pixel.color
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{Call, MockBackend};

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_empty_conditions_hold() {
        let mut backend = MockBackend::new();
        check(&RunConditions::default(), &mut backend, t(3, 0)).unwrap();
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_time_window() {
        let conditions = RunConditions {
            start_time: Some("09:00".into()),
            end_time: Some("18:00".into()),
            ..Default::default()
        };
        let mut backend = MockBackend::new();
        check(&conditions, &mut backend, t(12, 0)).unwrap();
        let err = check(&conditions, &mut backend, t(20, 0)).unwrap_err();
        assert!(matches!(err, ExecError::Precondition(_)));
        assert!(err.to_string().contains("outside the allowed window 09:00..18:00"));
    }

    #[test]
    fn test_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("go.flag");
        let conditions = RunConditions {
            file_exists: Some(flag.clone()),
            ..Default::default()
        };
        let mut backend = MockBackend::new();
        let err = check(&conditions, &mut backend, t(12, 0)).unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        std::fs::write(&flag, b"").unwrap();
        check(&conditions, &mut backend, t(12, 0)).unwrap();
    }

    #[test]
    fn test_pixel_colour() {
        // The mock captures fully transparent black images.
        let mut backend = MockBackend::new();
        let black = RunConditions {
            pixel: Some(PixelCheck { x: 4, y: 7, color: [0, 0, 0] }),
            ..Default::default()
        };
        check(&black, &mut backend, t(12, 0)).unwrap();
        assert_eq!(
            backend.calls(),
            vec![Call::Capture(Some(Rect { x: 4, y: 7, width: 1, height: 1 }))]
        );

        let white = RunConditions {
            pixel: Some(PixelCheck { x: 4, y: 7, color: [255, 255, 255] }),
            ..Default::default()
        };
        let err = check(&white, &mut backend, t(12, 0)).unwrap_err();
        assert!(err.to_string().contains("expected [255, 255, 255]"));
    }

    #[test]
    fn test_unreadable_pixel_is_unmet() {
        let mut backend = MockBackend::new().failing("capture");
        let conditions = RunConditions {
            pixel: Some(PixelCheck { x: 0, y: 0, color: [0, 0, 0] }),
            ..Default::default()
        };
        let err = check(&conditions, &mut backend, t(12, 0)).unwrap_err();
        assert!(matches!(err, ExecError::Precondition(_)));
        assert!(err.to_string().contains("could not be read"));
    }
}
