//! Session-scoped error statistics.
//!
//! Counts entries at WARNING and above by level and SQLSTATE, keeps a
//! bounded buffer of recent events, and maintains a per-minute ring over
//! the last hour for rate and trend queries. Nothing here persists across
//! sessions.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::parse::LogLevel;

/// Recent-event buffer bound.
const MAX_RECENT: usize = 1000;

/// Stored message excerpt length.
const MAX_EXCERPT: usize = 160;

/// Minutes covered by the rate ring.
const RING_MINUTES: usize = 60;

/// Condition names for SQLSTATE codes that show up in practice.
const SQLSTATE_NAMES: &[(&str, &str)] = &[
    ("08006", "connection_failure"),
    ("22012", "division_by_zero"),
    ("23502", "not_null_violation"),
    ("23503", "foreign_key_violation"),
    ("23505", "unique_violation"),
    ("25P02", "in_failed_sql_transaction"),
    ("28P01", "invalid_password"),
    ("40001", "serialization_failure"),
    ("40P01", "deadlock_detected"),
    ("42601", "syntax_error"),
    ("42703", "undefined_column"),
    ("42P01", "undefined_table"),
    ("53100", "disk_full"),
    ("53200", "out_of_memory"),
    ("53300", "too_many_connections"),
    ("57014", "query_canceled"),
    ("58P01", "undefined_file"),
];

/// Condition name for a SQLSTATE code, when known.
pub fn sqlstate_name(code: &str) -> Option<&'static str> {
    SQLSTATE_NAMES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// One recorded error occurrence.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub sqlstate: Option<String>,
    pub error_name: Option<&'static str>,
    pub excerpt: String,
}

/// Per-SQLSTATE aggregate.
#[derive(Debug, Clone, Default)]
pub struct CodeCount {
    pub count: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct ErrorStats {
    sqlstate_re: Regex,
    by_level: BTreeMap<LogLevel, u64>,
    by_code: BTreeMap<String, CodeCount>,
    recent: VecDeque<ErrorEvent>,
    /// `(minute epoch, count)` slots; a slot is live only while its minute
    /// is inside the ring window.
    ring: [(i64, u32); RING_MINUTES],
    total: u64,
}

impl Default for ErrorStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorStats {
    pub fn new() -> Self {
        Self {
            sqlstate_re: Regex::new(r"SQLSTATE\s*[:=]\s*([A-Z0-9]{5})")
                .expect("static sqlstate regex"),
            by_level: BTreeMap::new(),
            by_code: BTreeMap::new(),
            recent: VecDeque::new(),
            ring: [(0, 0); RING_MINUTES],
            total: 0,
        }
    }

    /// Record an entry. Returns `false` for levels below WARNING, which
    /// are not counted.
    pub fn record(&mut self, timestamp: DateTime<Utc>, level: LogLevel, message: &str) -> bool {
        if !matches!(
            level,
            LogLevel::Warning | LogLevel::Error | LogLevel::Fatal | LogLevel::Panic
        ) {
            return false;
        }

        self.total += 1;
        *self.by_level.entry(level).or_default() += 1;

        let sqlstate = self
            .sqlstate_re
            .captures(message)
            .map(|caps| caps[1].to_string());
        let error_name = sqlstate.as_deref().and_then(sqlstate_name);
        if let Some(code) = &sqlstate {
            let slot = self.by_code.entry(code.clone()).or_default();
            slot.count += 1;
            slot.last_seen = Some(timestamp);
        }

        let minute = timestamp.timestamp().div_euclid(60);
        let slot = &mut self.ring[minute.rem_euclid(RING_MINUTES as i64) as usize];
        if slot.0 != minute {
            *slot = (minute, 0);
        }
        slot.1 += 1;

        if self.recent.len() == MAX_RECENT {
            self.recent.pop_front();
        }
        self.recent.push_back(ErrorEvent {
            timestamp,
            level,
            sqlstate,
            error_name,
            excerpt: excerpt(message),
        });
        true
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn by_level(&self) -> &BTreeMap<LogLevel, u64> {
        &self.by_level
    }

    pub fn by_code(&self) -> &BTreeMap<String, CodeCount> {
        &self.by_code
    }

    /// Recent events, oldest first. Bounded at [`MAX_RECENT`].
    pub fn recent(&self) -> impl DoubleEndedIterator<Item = &ErrorEvent> {
        self.recent.iter()
    }

    /// Recent events stamped at or after `since`. Subject to the recent
    /// buffer bound; counters in `by_level` are exact.
    pub fn events_since(&self, since: DateTime<Utc>) -> impl Iterator<Item = &ErrorEvent> {
        self.recent.iter().filter(move |e| e.timestamp >= since)
    }

    /// Errors per minute over the trailing `minutes` window ending at `now`.
    pub fn rate_per_minute(&self, now: DateTime<Utc>, minutes: u32) -> f64 {
        let minutes = minutes.clamp(1, RING_MINUTES as u32);
        let count = self.count_in_window(now, minutes);
        count as f64 / minutes as f64
    }

    /// Raw event count over the trailing `minutes` window ending at `now`.
    pub fn count_in_window(&self, now: DateTime<Utc>, minutes: u32) -> u64 {
        let now_minute = now.timestamp().div_euclid(60);
        let oldest = now_minute - i64::from(minutes.clamp(1, RING_MINUTES as u32)) + 1;
        self.ring
            .iter()
            .filter(|(minute, _)| *minute >= oldest && *minute <= now_minute)
            .map(|&(_, count)| u64::from(count))
            .sum()
    }

    /// Per-minute counts for the last hour, oldest first. Minutes with no
    /// errors are included as zeros.
    pub fn trend(&self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, u32)> {
        let now_minute = now.timestamp().div_euclid(60);
        (0..RING_MINUTES as i64)
            .rev()
            .map(|back| {
                let minute = now_minute - back;
                let slot = self.ring[minute.rem_euclid(RING_MINUTES as i64) as usize];
                let count = if slot.0 == minute { slot.1 } else { 0 };
                let ts = DateTime::from_timestamp(minute * 60, 0).unwrap_or(DateTime::UNIX_EPOCH);
                (ts, count)
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.by_level.clear();
        self.by_code.clear();
        self.recent.clear();
        self.ring = [(0, 0); RING_MINUTES];
        self.total = 0;
    }
}

fn excerpt(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("");
    if first_line.len() <= MAX_EXCERPT {
        return first_line.to_string();
    }
    let mut cut = MAX_EXCERPT;
    while !first_line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &first_line[..cut])
}
