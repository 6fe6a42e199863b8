//! Wall-clock access and human-readable time labels.

use chrono::{DateTime, Local, TimeZone};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Source of "now" in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to. Used by tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

fn local(ts_millis: i64) -> Option<DateTime<Local>> {
    Local.timestamp_millis_opt(ts_millis).single()
}

/// `HH:MM` in local time.
pub fn format_clock_time(ts_millis: i64) -> String {
    local(ts_millis)
        .map(|dt| dt.format("%H:%M").to_string())
        .unwrap_or_default()
}

/// Short relative label for chat messages: `just now`, `5m ago`, `3h ago`,
/// or the calendar date once the message is a day old.
pub fn relative_time(ts_millis: i64, now_millis: i64) -> String {
    let age = now_millis.saturating_sub(ts_millis);
    if age < MINUTE_MS {
        "just now".to_string()
    } else if age < HOUR_MS {
        format!("{}m ago", age / MINUTE_MS)
    } else if age < DAY_MS {
        format!("{}h ago", age / HOUR_MS)
    } else {
        local(ts_millis)
            .map(|dt| dt.format("%b %-d").to_string())
            .unwrap_or_default()
    }
}

/// Label for a version history entry: `Today at 14:05`,
/// `Yesterday at 09:30`, or `Mar 4, 17:20`.
pub fn format_version_time(ts_millis: i64, now_millis: i64) -> String {
    let (Some(at), Some(now)) = (local(ts_millis), local(now_millis)) else {
        return String::new();
    };
    let day = at.date_naive();
    let today = now.date_naive();
    let time = at.format("%H:%M");

    if day == today {
        format!("Today at {time}")
    } else if today.pred_opt() == Some(day) {
        format!("Yesterday at {time}")
    } else {
        at.format("%b %-d, %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 3_000);
        clock.set(42);
        assert_eq!(clock.now_millis(), 42);
    }

    #[test]
    fn test_relative_time_buckets() {
        let now = 1_700_000_000_000;
        assert_eq!(relative_time(now - 5_000, now), "just now");
        assert_eq!(relative_time(now - 5 * MINUTE_MS, now), "5m ago");
        assert_eq!(relative_time(now - 3 * HOUR_MS, now), "3h ago");
        assert!(!relative_time(now - 3 * DAY_MS, now).contains("ago"));
    }

    #[test]
    fn test_future_timestamp_is_just_now() {
        let now = 1_700_000_000_000;
        assert_eq!(relative_time(now + 10_000, now), "just now");
    }

    #[test]
    fn test_version_time_today_and_yesterday() {
        let now = Local::now();
        let now_ms = now.timestamp_millis();
        assert!(format_version_time(now_ms, now_ms).starts_with("Today at "));

        let yesterday = now - chrono::Duration::days(1);
        assert!(format_version_time(yesterday.timestamp_millis(), now_ms)
            .starts_with("Yesterday at "));

        let older = now - chrono::Duration::days(10);
        let label = format_version_time(older.timestamp_millis(), now_ms);
        assert!(!label.starts_with("Today") && !label.starts_with("Yesterday"));
    }

    #[test]
    fn test_clock_time_shape() {
        let label = format_clock_time(SystemClock.now_millis());
        assert_eq!(label.len(), 5);
        assert_eq!(&label[2..3], ":");
    }
}
