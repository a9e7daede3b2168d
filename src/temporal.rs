//! Natural-language time-range parsing for search-time temporal filters.
//!
//! Grounded directly on `original_source/temporal_filter.py`: the closed set
//! of named ranges, relative-time shorthand, `last <weekday>`, and ISO dates
//! are all carried over verbatim (§4.8.1), along with the linear recency
//! boost used when temporal filtering is active.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;

/// An inclusive `[start, end]` window. A missing bound is represented by
/// `DateTime::<Utc>::MIN_UTC` / the caller's `now`, per §4.8.1's
/// "missing start = -inf, missing end = now".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

fn weekday_from_name(name: &str) -> Option<Weekday> {
    match name {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" | "tues" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" | "thur" | "thurs" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

static RELATIVE_AGO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d+)\s*(hours?|days?|weeks?|months?)\s*ago$").unwrap());
static RELATIVE_SHORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(\d+)(h|d|w|m)$").unwrap());
static LAST_WEEKDAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^last\s+(\w+)$").unwrap());

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn parse_relative_delta(text: &str) -> Option<Duration> {
    if let Some(caps) = RELATIVE_AGO.captures(text) {
        let amount: i64 = caps[1].parse().ok()?;
        let unit = caps[2].to_lowercase();
        return Some(match unit.trim_end_matches('s') {
            "hour" => Duration::hours(amount),
            "day" => Duration::days(amount),
            "week" => Duration::weeks(amount),
            "month" => Duration::days(amount * 30),
            _ => return None,
        });
    }
    if let Some(caps) = RELATIVE_SHORT.captures(text) {
        let amount: i64 = caps[1].parse().ok()?;
        return Some(match &caps[2] {
            "h" => Duration::hours(amount),
            "d" => Duration::days(amount),
            "w" => Duration::weeks(amount),
            "m" => Duration::days(amount * 30),
            _ => return None,
        });
    }
    None
}

/// Parse an ISO date or datetime (`YYYY-MM-DD[THH:MM:SS[.f]]`).
fn parse_iso(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Utc.from_local_datetime(&start_of_day(date)).single();
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Utc.from_local_datetime(&dt).single();
        }
    }
    None
}

fn parse_date_or_relative(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_iso(text).or_else(|| parse_relative_delta(&text.to_lowercase()).map(|delta| now - delta))
}

/// Parse `time_range` / `start_date` / `end_date` into a concrete window,
/// evaluated relative to `now`. `start_date`/`end_date` override any named
/// `time_range` per §4.8.1.
pub fn parse_time_range(
    time_range: Option<&str>,
    start_date: Option<&str>,
    end_date: Option<&str>,
    now: DateTime<Utc>,
) -> Option<TimeRange> {
    if start_date.is_some() || end_date.is_some() {
        let start = match start_date {
            Some(s) => parse_date_or_relative(s, now)?,
            None => DateTime::<Utc>::MIN_UTC,
        };
        let end = match end_date {
            Some(e) => parse_date_or_relative(e, now)?,
            None => now,
        };
        return Some(TimeRange { start, end });
    }

    let raw = time_range?;
    let normalised = raw.trim().to_lowercase().replace('_', " ");

    match normalised.as_str() {
        "today" => {
            let today = now.date_naive();
            let start = Utc.from_local_datetime(&start_of_day(today)).single()?;
            return Some(TimeRange { start, end: now });
        }
        "yesterday" => {
            let yesterday = now.date_naive() - Duration::days(1);
            let start = Utc.from_local_datetime(&start_of_day(yesterday)).single()?;
            let end = start + Duration::days(1) - Duration::microseconds(1);
            return Some(TimeRange { start, end });
        }
        "this week" => {
            let today = now.date_naive();
            let monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
            let start = Utc.from_local_datetime(&start_of_day(monday)).single()?;
            return Some(TimeRange { start, end: now });
        }
        "last week" => {
            let today = now.date_naive();
            let this_monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
            let last_monday = this_monday - Duration::weeks(1);
            let start = Utc.from_local_datetime(&start_of_day(last_monday)).single()?;
            let end = start + Duration::days(6) + Duration::hours(23) + Duration::minutes(59) + Duration::seconds(59);
            return Some(TimeRange { start, end });
        }
        "this month" => {
            let today = now.date_naive();
            let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
            let start = Utc.from_local_datetime(&start_of_day(first)).single()?;
            return Some(TimeRange { start, end: now });
        }
        "last month" => {
            let today = now.date_naive();
            let first_this_month = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
            let last_day_prev_month = first_this_month - Duration::days(1);
            let first_prev_month =
                NaiveDate::from_ymd_opt(last_day_prev_month.year(), last_day_prev_month.month(), 1)?;
            let start = Utc.from_local_datetime(&start_of_day(first_prev_month)).single()?;
            let end =
                Utc.from_local_datetime(&start_of_day(first_this_month)).single()? - Duration::microseconds(1);
            return Some(TimeRange { start, end });
        }
        "this year" => {
            let today = now.date_naive();
            let first = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;
            let start = Utc.from_local_datetime(&start_of_day(first)).single()?;
            return Some(TimeRange { start, end: now });
        }
        _ => {}
    }

    if let Some(delta) = parse_relative_delta(&normalised) {
        return Some(TimeRange { start: now - delta, end: now });
    }

    if let Some(caps) = LAST_WEEKDAY.captures(&normalised) {
        if let Some(target) = weekday_from_name(&caps[1]) {
            let today_weekday = now.weekday();
            let mut days_back =
                (today_weekday.num_days_from_monday() as i64 - target.num_days_from_monday() as i64).rem_euclid(7);
            if days_back == 0 {
                days_back = 7;
            }
            let target_date = now.date_naive() - Duration::days(days_back);
            let start = Utc.from_local_datetime(&start_of_day(target_date)).single()?;
            let end = start + Duration::days(1) - Duration::microseconds(1);
            return Some(TimeRange { start, end });
        }
    }

    if let Some(date) = parse_iso(raw) {
        let start = Utc.from_local_datetime(&start_of_day(date.date_naive())).single()?;
        let end = start + Duration::days(1) - Duration::microseconds(1);
        return Some(TimeRange { start, end });
    }

    None
}

/// Linear-decay recency boost for search results under active temporal
/// filtering (§4.8 step 7): `max_boost * (1 - age_days/decay_days)` clamped
/// to `[0, max_boost]`. Future timestamps get no boost.
pub fn recency_boost(timestamp: Option<DateTime<Utc>>, now: DateTime<Utc>, max_boost: f32, decay_days: f32) -> f32 {
    let Some(timestamp) = timestamp else {
        return 0.0;
    };
    let age_days = (now - timestamp).num_seconds() as f32 / 86400.0;
    if age_days < 0.0 || age_days >= decay_days {
        return 0.0;
    }
    (max_boost * (1.0 - age_days / decay_days)).max(0.0)
}
