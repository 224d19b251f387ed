//! PostgreSQL log line parser.
//!
//! Turns raw stderr-format log lines into structured [`LogEntry`] values.
//! The prefix is assumed to be close to the stock `%t [%p] ` / `%m [%p] `
//! shapes; `log_line_prefix` itself is not consulted. Continuation lines
//! (DETAIL, HINT, multi-line statements) are folded into the preceding
//! entry.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

/// Longest accepted input line. Anything longer is truncated with a marker.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Marker appended to lines cut at [`MAX_LINE_LEN`].
const TRUNCATION_MARKER: &str = " [truncated]";

/// Severity levels emitted by PostgreSQL, ordered from most verbose to
/// most severe. The ordering matches `log_min_messages` semantics, with
/// `LOG` sitting between `ERROR` and `FATAL` as the server ranks it for
/// server-log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogLevel {
    Debug5,
    Debug4,
    Debug3,
    Debug2,
    Debug1,
    Info,
    Notice,
    Warning,
    Error,
    Log,
    Fatal,
    Panic,
}

/// Coarse severity class used for styling and quiet-hour overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityClass {
    Critical,
    High,
    Medium,
    Low,
    Info,
    Verbose,
}

impl LogLevel {
    /// All levels, ordered from most verbose to most severe.
    pub const ALL: [LogLevel; 12] = [
        LogLevel::Debug5,
        LogLevel::Debug4,
        LogLevel::Debug3,
        LogLevel::Debug2,
        LogLevel::Debug1,
        LogLevel::Info,
        LogLevel::Notice,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Log,
        LogLevel::Fatal,
        LogLevel::Panic,
    ];

    /// Canonical uppercase name as it appears in log output.
    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Debug5 => "DEBUG5",
            LogLevel::Debug4 => "DEBUG4",
            LogLevel::Debug3 => "DEBUG3",
            LogLevel::Debug2 => "DEBUG2",
            LogLevel::Debug1 => "DEBUG1",
            LogLevel::Info => "INFO",
            LogLevel::Notice => "NOTICE",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Log => "LOG",
            LogLevel::Fatal => "FATAL",
            LogLevel::Panic => "PANIC",
        }
    }

    /// Parse a level name, case-insensitively.
    pub fn parse(name: &str) -> Option<LogLevel> {
        let upper = name.trim().to_ascii_uppercase();
        LogLevel::ALL.into_iter().find(|l| l.name() == upper)
    }

    /// Severity class for rendering and notification overrides.
    pub fn severity_class(self) -> SeverityClass {
        match self {
            LogLevel::Panic | LogLevel::Fatal => SeverityClass::Critical,
            LogLevel::Error => SeverityClass::High,
            LogLevel::Warning => SeverityClass::Medium,
            LogLevel::Log | LogLevel::Notice => SeverityClass::Low,
            LogLevel::Info => SeverityClass::Info,
            _ => SeverityClass::Verbose,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A structured log entry.
///
/// `raw` always holds the original text, including any folded continuation
/// lines joined with `\n`. For a line that matched no known shape and had
/// no preceding entry, only `raw` carries content.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Entry timestamp; the Unix epoch when the prefix carried none or it
    /// failed to parse.
    pub timestamp: DateTime<Utc>,
    /// Backend PID from the bracketed prefix field; 0 when absent.
    pub pid: u32,
    pub level: LogLevel,
    /// Message text after the severity token, continuation lines appended.
    pub message: String,
    pub raw: String,
}

impl LogEntry {
    /// Text the filter pipeline matches against: the parsed message when
    /// one exists, the raw line otherwise.
    pub fn filter_text(&self) -> &str {
        if self.message.is_empty() {
            &self.raw
        } else {
            &self.message
        }
    }
}

/// Streaming parser that folds continuation lines into the entry that
/// precedes them.
///
/// An entry is released when the next entry begins, or on [`flush`]
/// (the tail worker flushes on idle polls so the last entry is not held
/// back indefinitely).
///
/// [`flush`]: EntryParser::flush
pub struct EntryParser {
    prefix_re: Regex,
    pending: Option<LogEntry>,
}

impl Default for EntryParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryParser {
    pub fn new() -> Self {
        // Timestamp, bracketed PID, optional `user=…,db=…`-style label,
        // severity token, message. Tolerates fractional seconds, numeric
        // offsets, and named timezone abbreviations in the timestamp.
        let prefix_re = Regex::new(
            r"(?x)
            ^(?P<ts>\d{4}-\d{2}-\d{2}[\ T]\d{2}:\d{2}:\d{2}
              (?:\.\d{1,6})?
              (?:Z|\ ?[+-]\d{2}(?::?\d{2})?|\ [A-Z][A-Za-z0-9+\-/_]{1,31})?)
            \s+\[(?P<pid>\d+)\]:?
            \s+(?:(?P<label>[^\s=]+=\S*)\s+)?
            (?P<level>DEBUG[1-5]|INFO|NOTICE|WARNING|ERROR|LOG|FATAL|PANIC):
            \s{0,2}(?P<msg>.*)$",
        )
        .expect("static parser regex");
        Self {
            prefix_re,
            pending: None,
        }
    }

    /// Feed one newline-stripped line.
    ///
    /// Returns the previously accumulated entry when `line` starts a new
    /// one; `None` while the line extends the pending entry.
    pub fn push_line(&mut self, line: &str) -> Option<LogEntry> {
        let line = truncate_line(line);

        if let Some(caps) = self.prefix_re.captures(&line) {
            let timestamp = parse_timestamp(&caps["ts"]).unwrap_or(DateTime::UNIX_EPOCH);
            let pid = caps["pid"].parse().unwrap_or(0);
            let level = LogLevel::parse(&caps["level"]).unwrap_or(LogLevel::Log);
            let message = caps["msg"].to_string();
            let entry = LogEntry {
                timestamp,
                pid,
                level,
                message,
                raw: line.into_owned(),
            };
            return self.pending.replace(entry);
        }

        match &mut self.pending {
            // Continuation: inherit the level, extend message and raw.
            Some(entry) => {
                entry.message.push('\n');
                entry.message.push_str(line.trim_start());
                entry.raw.push('\n');
                entry.raw.push_str(&line);
                None
            }
            // No prior entry to attach to.
            None => {
                self.pending = Some(LogEntry {
                    timestamp: DateTime::UNIX_EPOCH,
                    pid: 0,
                    level: LogLevel::Log,
                    message: String::new(),
                    raw: line.into_owned(),
                });
                None
            }
        }
    }

    /// Release the pending entry, if any.
    pub fn flush(&mut self) -> Option<LogEntry> {
        self.pending.take()
    }

    /// Parse a complete text into entries. Used by tests and the seek scan.
    pub fn parse_all(&mut self, text: &str) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for line in text.lines() {
            if let Some(entry) = self.push_line(line) {
                entries.push(entry);
            }
        }
        entries.extend(self.flush());
        entries
    }
}

/// Whether a line begins with a plausible `YYYY-MM-DD HH:MM` timestamp.
///
/// Cheap byte-level check used by the tailer's `--since` scan to avoid
/// regex work on continuation lines.
pub fn starts_with_timestamp(line: &str) -> bool {
    let b = line.as_bytes();
    if b.len() < 16 {
        return false;
    }
    b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[5].is_ascii_digit()
        && b[6].is_ascii_digit()
        && b[7] == b'-'
        && b[8].is_ascii_digit()
        && b[9].is_ascii_digit()
        && (b[10] == b' ' || b[10] == b'T')
        && b[11].is_ascii_digit()
        && b[12].is_ascii_digit()
        && b[13] == b':'
        && b[14].is_ascii_digit()
        && b[15].is_ascii_digit()
}

/// Parse the timestamp prefix of a log line, up to the bracketed PID.
pub fn leading_timestamp(line: &str) -> Option<DateTime<Utc>> {
    if !starts_with_timestamp(line) {
        return None;
    }
    let end = line.find(" [").unwrap_or(line.len());
    parse_timestamp(&line[..end])
}

/// Parse a log timestamp.
///
/// Accepts ISO-8601 (optional `Z` or numeric offset) and
/// `YYYY-MM-DD HH:MM:SS[.f][ TZ]`. Named timezone abbreviations are
/// accepted but taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f %#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    // Strip a trailing named zone abbreviation (UTC, PST, CEST, ...).
    let naive_part = match s.rfind(' ') {
        Some(pos)
            if s[pos + 1..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '/')
                && s[pos + 1..].starts_with(|c: char| c.is_ascii_alphabetic()) =>
        {
            &s[..pos]
        }
        _ => s,
    };
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(naive_part, fmt) {
            return Some(ndt.and_utc());
        }
    }

    None
}

/// Cap a line at [`MAX_LINE_LEN`], appending the truncation marker.
fn truncate_line(line: &str) -> std::borrow::Cow<'_, str> {
    if line.len() <= MAX_LINE_LEN {
        return std::borrow::Cow::Borrowed(line);
    }
    let mut cut = MAX_LINE_LEN;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&line[..cut]);
    out.push_str(TRUNCATION_MARKER);
    std::borrow::Cow::Owned(out)
}
