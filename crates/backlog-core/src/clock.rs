use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::error::{BacklogError, Result};

/// Naive layouts accepted for schedule strings; interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Source of "now" and the parser for human-written schedule strings.
///
/// The queue never calls `Utc::now()` directly so due-checks can be driven
/// deterministically in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Turn `text` into an absolute instant, resolving relative forms
    /// against [`Clock::now`].
    fn parse(&self, text: &str) -> Result<DateTime<Utc>> {
        parse_datetime(text, self.now())
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Parse an absolute or relative date/time expression.
///
/// Accepted forms, tried in order:
///   - `now`, `today`, `tomorrow`, `yesterday` (the latter three at 00:00 UTC)
///   - RFC 3339 (`2026-05-01T08:30:00+02:00`)
///   - naive `YYYY-MM-DD HH:MM[:SS]` (with space or `T`), read as UTC
///   - bare `YYYY-MM-DD`
///   - integer epoch seconds, optionally prefixed with `@`
///   - relative offsets: `+10 minutes`, `in 2 hours`, `3 days ago`, `-1 week`
pub fn parse_datetime(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = text.trim();
    let lower = input.to_ascii_lowercase();

    match lower.as_str() {
        "now" => return Ok(now),
        "today" => return Ok(midnight(now, 0)),
        "tomorrow" => return Ok(midnight(now, 1)),
        "yesterday" => return Ok(midnight(now, -1)),
        _ => {}
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
    }

    let digits = input.strip_prefix('@').unwrap_or(input);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        return digits
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| BacklogError::InvalidSchedule(format!("epoch out of range: {input}")));
    }

    parse_relative(&lower)
        .and_then(|offset| now.checked_add_signed(offset))
        .ok_or_else(|| BacklogError::InvalidSchedule(format!("unrecognised date/time: {input}")))
}

fn midnight(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    let date = now.date_naive() + Duration::days(days);
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn parse_relative(s: &str) -> Option<Duration> {
    let (mut sign, rest) = match s.strip_suffix(" ago") {
        Some(r) => (-1, r),
        None => (1, s),
    };
    let rest = rest.trim();
    let rest = rest.strip_prefix("in ").unwrap_or(rest).trim_start();
    let rest = match rest.strip_prefix('-') {
        Some(r) => {
            sign = -sign;
            r
        }
        None => rest.strip_prefix('+').unwrap_or(rest),
    };

    let split = rest.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = rest.split_at(split);
    let n: i64 = num.parse().ok()?;

    // "s" alone trims to "" and means seconds
    let unit_secs = match unit.trim().trim_end_matches('s') {
        "" | "sec" | "second" => 1,
        "m" | "min" | "minute" => 60,
        "h" | "hr" | "hour" => 3_600,
        "d" | "day" => 86_400,
        "w" | "week" => 604_800,
        _ => return None,
    };

    let total = n.checked_mul(unit_secs)?.checked_mul(sign)?;
    Duration::try_seconds(total)
}
