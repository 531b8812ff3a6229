//! Quiet-hours oracle.
//!
//! A quiet period is a weekly window (in the configured IANA timezone)
//! during which the gateway observes messages but processes nothing: no
//! containers are spawned, no tasks fire, per-group cursors stand still.
//! Windows may cross midnight (`start >= end` wraps to the next day).

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One weekly quiet window as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietWindowSpec {
    /// Day of week the window starts on ("mon" .. "sun").
    pub day: String,
    /// Local start time, "HH:MM".
    pub start: String,
    /// Local end time, "HH:MM". An end at or before the start wraps past
    /// midnight into the following day.
    pub end: String,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    day: Weekday,
    start: NaiveTime,
    duration: Duration,
}

/// Compiled weekly schedule. Cheap to query; all math happens in the
/// schedule's timezone.
#[derive(Debug, Clone)]
pub struct QuietSchedule {
    tz: Tz,
    windows: Vec<Window>,
}

impl QuietSchedule {
    /// Compile window specs. Invalid entries are skipped with a warning so
    /// one bad config line does not silence the whole schedule.
    pub fn new(timezone: &str, specs: &[QuietWindowSpec]) -> Self {
        let tz: Tz = timezone.parse().unwrap_or_else(|_| {
            warn!(tz = timezone, "invalid timezone for quiet hours, using UTC");
            Tz::UTC
        });

        let mut windows = Vec::with_capacity(specs.len());
        for spec in specs {
            let Some(day) = parse_weekday(&spec.day) else {
                warn!(day = spec.day.as_str(), "invalid quiet window day, skipping");
                continue;
            };
            let (Some(start), Some(end)) = (parse_hhmm(&spec.start), parse_hhmm(&spec.end)) else {
                warn!(
                    start = spec.start.as_str(),
                    end = spec.end.as_str(),
                    "invalid quiet window time, skipping"
                );
                continue;
            };
            let mut duration = end - start;
            if duration <= Duration::zero() {
                duration = duration + Duration::hours(24);
            }
            windows.push(Window {
                day,
                start,
                duration,
            });
        }

        Self { tz, windows }
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Whether `now` falls inside any quiet window.
    pub fn is_quiet(&self, now: DateTime<Utc>) -> bool {
        self.intervals_around(now)
            .iter()
            .any(|(start, end)| *start <= now && now < *end)
    }

    /// The next quiet↔active boundary after `now`: the end of the current
    /// window when quiet, otherwise the next window start. `None` when the
    /// schedule has no windows.
    pub fn next_transition(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let intervals = self.intervals_around(now);
        let containing_end = intervals
            .iter()
            .filter(|(start, end)| *start <= now && now < *end)
            .map(|(_, end)| *end)
            .max();
        if containing_end.is_some() {
            return containing_end;
        }
        intervals
            .iter()
            .map(|(start, _)| *start)
            .filter(|start| *start > now)
            .min()
    }

    /// The start of the next quiet window strictly after `now`.
    pub fn next_window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.intervals_around(now)
            .iter()
            .map(|(start, _)| *start)
            .filter(|start| *start > now)
            .min()
    }

    /// Concrete window instances within roughly a week either side of `now`.
    fn intervals_around(&self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let local_today = now.with_timezone(&self.tz).date_naive();
        let mut out = Vec::new();
        for window in &self.windows {
            for offset in -7i64..=7 {
                let date = local_today + Duration::days(offset);
                if date.weekday() != window.day {
                    continue;
                }
                let naive_start = date.and_time(window.start);
                // DST gaps: take the earliest valid interpretation.
                let Some(start) = self
                    .tz
                    .from_local_datetime(&naive_start)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
                else {
                    continue;
                };
                out.push((start, start + window.duration));
            }
        }
        out
    }
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.to_ascii_lowercase().as_str() {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn friday_evening_schedule() -> QuietSchedule {
        QuietSchedule::new(
            "UTC",
            &[QuietWindowSpec {
                day: "fri".into(),
                start: "18:00".into(),
                end: "21:00".into(),
            }],
        )
    }

    #[test]
    fn inside_and_outside_window() {
        let s = friday_evening_schedule();
        // 2024-01-19 is a Friday
        assert!(s.is_quiet(at("2024-01-19T19:00:00Z")));
        assert!(!s.is_quiet(at("2024-01-19T17:59:00Z")));
        assert!(!s.is_quiet(at("2024-01-19T21:00:00Z")));
        assert!(!s.is_quiet(at("2024-01-18T19:00:00Z")));
    }

    #[test]
    fn transition_points() {
        let s = friday_evening_schedule();
        // During the window: next transition is the window end.
        assert_eq!(
            s.next_transition(at("2024-01-19T19:00:00Z")),
            Some(at("2024-01-19T21:00:00Z"))
        );
        // Before the window: next transition is the window start.
        assert_eq!(
            s.next_transition(at("2024-01-19T12:00:00Z")),
            Some(at("2024-01-19T18:00:00Z"))
        );
    }

    #[test]
    fn window_crossing_midnight() {
        let s = QuietSchedule::new(
            "UTC",
            &[QuietWindowSpec {
                day: "sat".into(),
                start: "22:00".into(),
                end: "06:00".into(),
            }],
        );
        // 2024-01-20 is a Saturday; Sunday 03:00 is still inside.
        assert!(s.is_quiet(at("2024-01-20T23:00:00Z")));
        assert!(s.is_quiet(at("2024-01-21T03:00:00Z")));
        assert!(!s.is_quiet(at("2024-01-21T06:00:00Z")));
    }

    #[test]
    fn timezone_respected() {
        let s = QuietSchedule::new(
            "America/New_York",
            &[QuietWindowSpec {
                day: "fri".into(),
                start: "18:00".into(),
                end: "20:00".into(),
            }],
        );
        // 18:30 New York == 23:30 UTC in January (EST, UTC-5).
        assert!(s.is_quiet(at("2024-01-19T23:30:00Z")));
        assert!(!s.is_quiet(at("2024-01-19T18:30:00Z")));
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let s = QuietSchedule::new(
            "UTC",
            &[
                QuietWindowSpec {
                    day: "someday".into(),
                    start: "18:00".into(),
                    end: "20:00".into(),
                },
                QuietWindowSpec {
                    day: "fri".into(),
                    start: "25:99".into(),
                    end: "20:00".into(),
                },
            ],
        );
        assert!(s.is_empty());
        assert_eq!(s.next_transition(at("2024-01-19T12:00:00Z")), None);
    }
}
