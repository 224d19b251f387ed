//! Time window filter and the flexible time-spec parser behind
//! `since` / `until` / `between`.
//!
//! Accepted spec formats:
//! - duration ago: `30s`, `5m`, `2h`, `1d`
//! - time of day (today, UTC): `14:30`, `14:30:05`
//! - ISO 8601: `2024-01-15T14:30:00`, optional trailing `Z`, `T` or space
//!
//! Parsing takes the reference instant as an argument so results are
//! deterministic under test.

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Utc};

/// Error for unparseable time specs.
#[derive(Debug, Clone)]
pub struct TimeSpecError {
    pub input: String,
}

impl std::fmt::Display for TimeSpecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cannot parse time '{}'; use a duration (5m, 30s, 2h, 1d), \
             a time of day (14:30, 14:30:05), or ISO 8601 \
             (2024-01-15T14:30:00Z)",
            self.input
        )
    }
}

impl std::error::Error for TimeSpecError {}

/// Inclusive time window with open-ended bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeFilter {
    pub fn is_empty(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }

    /// `since ≤ ts ≤ until`, either bound optional.
    pub fn matches(&self, ts: DateTime<Utc>) -> bool {
        if let Some(since) = self.since
            && ts < since
        {
            return false;
        }
        if let Some(until) = self.until
            && ts > until
        {
            return false;
        }
        true
    }

    pub fn describe(&self) -> String {
        match (self.since, self.until) {
            (None, None) => "none".to_string(),
            (Some(s), None) => format!("since {}", s.format("%Y-%m-%d %H:%M:%S")),
            (None, Some(u)) => format!("until {}", u.format("%Y-%m-%d %H:%M:%S")),
            (Some(s), Some(u)) => format!(
                "{} .. {}",
                s.format("%Y-%m-%d %H:%M:%S"),
                u.format("%Y-%m-%d %H:%M:%S")
            ),
        }
    }
}

/// Parse a time spec against the reference instant `now`.
pub fn parse_time_spec(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeSpecError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(TimeSpecError {
            input: input.to_string(),
        });
    }

    if let Some(ts) = try_parse_duration_ago(input, now) {
        return Ok(ts);
    }
    if let Some(ts) = try_parse_time_of_day(input, now) {
        return Ok(ts);
    }
    if let Some(ts) = try_parse_iso8601(input) {
        return Ok(ts);
    }

    Err(TimeSpecError {
        input: input.to_string(),
    })
}

/// Format an instant back to `HH:MM`, the shortest accepted spec form.
pub fn format_time_of_day(ts: DateTime<Utc>) -> String {
    ts.format("%H:%M").to_string()
}

/// `<number><unit>` meaning "that long before `now`".
fn try_parse_duration_ago(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let unit = input.chars().last()?;
    let number_str = &input[..input.len() - unit.len_utf8()];
    if number_str.is_empty() || !number_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number: i64 = number_str.parse().ok()?;
    let delta = match unit {
        's' => Duration::seconds(number),
        'm' => Duration::minutes(number),
        'h' => Duration::hours(number),
        'd' => Duration::days(number),
        _ => return None,
    };
    now.checked_sub_signed(delta)
}

/// `HH:MM` or `HH:MM:SS` on the day of `now`, UTC.
fn try_parse_time_of_day(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let time = match input.len() {
        5 => NaiveTime::parse_from_str(input, "%H:%M").ok()?,
        8 => NaiveTime::parse_from_str(input, "%H:%M:%S").ok()?,
        _ => return None,
    };
    Some(NaiveDateTime::new(now.date_naive(), time).and_utc())
}

/// ISO 8601 with `T` or space separator, optional seconds, optional `Z`.
fn try_parse_iso8601(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    let trimmed = input.strip_suffix('Z').unwrap_or(input);
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(ndt.and_utc());
        }
    }
    None
}
