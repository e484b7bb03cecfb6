//! Local time-of-day helpers for run windows and scheduled starts.

use chrono::{Days, NaiveDateTime, NaiveTime};

/// Parse `HH:MM` or `HH:MM:SS` (24-hour clock).
pub fn parse_time_of_day(text: &str) -> Result<NaiveTime, String> {
    let text = text.trim();
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .map_err(|_| format!("'{text}' is not a time of day (expected HH:MM or HH:MM:SS)"))
}

/// First moment at or after `now` whose clock reads `at`: today if still ahead, otherwise tomorrow.
pub fn next_occurrence(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today >= now {
        today
    } else {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    }
}

/// Whether `now` falls inside `[start, end]`. Either bound may be open; a window whose start
/// is after its end spans midnight (`22:00`..`06:00`).
pub fn within_window(now: NaiveTime, start: Option<NaiveTime>, end: Option<NaiveTime>) -> bool {
    match (start, end) {
        (None, None) => true,
        (Some(s), None) => now >= s,
        (None, Some(e)) => now <= e,
        (Some(s), Some(e)) if s <= e => now >= s && now <= e,
        (Some(s), Some(e)) => now >= s || now <= e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap().and_time(t(h, m))
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("09:30").unwrap(), t(9, 30));
        assert_eq!(
            parse_time_of_day(" 23:59:10 ").unwrap(),
            NaiveTime::from_hms_opt(23, 59, 10).unwrap()
        );
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("noon").is_err());
    }

    #[test]
    fn test_next_occurrence_rolls_over_to_tomorrow() {
        assert_eq!(next_occurrence(at(4, 8, 0), t(9, 0)), at(4, 9, 0));
        assert_eq!(next_occurrence(at(4, 9, 0), t(9, 0)), at(4, 9, 0));
        assert_eq!(next_occurrence(at(4, 10, 0), t(9, 0)), at(5, 9, 0));
    }

    #[test]
    fn test_windows() {
        assert!(within_window(t(12, 0), Some(t(9, 0)), Some(t(18, 0))));
        assert!(!within_window(t(19, 0), Some(t(9, 0)), Some(t(18, 0))));
        assert!(within_window(t(23, 0), Some(t(22, 0)), Some(t(6, 0))));
        assert!(within_window(t(5, 0), Some(t(22, 0)), Some(t(6, 0))));
        assert!(!within_window(t(12, 0), Some(t(22, 0)), Some(t(6, 0))));
        assert!(within_window(t(8, 0), None, Some(t(9, 0))));
        assert!(!within_window(t(8, 0), Some(t(9, 0)), None));
        assert!(within_window(t(0, 0), None, None));
    }
}
