//! Notification rules, suppression, and dispatch.
//!
//! Rules are evaluated in order against every entry that survives the
//! filter pipeline; the first match produces a payload for the injected
//! [`Notifier`]. Two suppressions apply on top: quiet hours (overridden by
//! FATAL/PANIC entries) and a sliding-minute rate limit whose overflow is
//! coalesced into a single summary notification.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, NaiveTime, Utc};
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::parse::LogLevel;

/// Sliding rate-limit window.
const RATE_WINDOW_SECS: i64 = 60;

/// Payload handed to the notifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub subtitle: Option<String>,
}

/// Dispatch capability, injected at construction. Desktop integration
/// lives outside the engine.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> std::io::Result<()>;
}

/// A pattern rule's compiled regex. Config syntax is `/pattern/[i]`,
/// `i` marking case-insensitive.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub raw: String,
    pub case_insensitive: bool,
    compiled: Regex,
}

impl PatternRule {
    pub fn parse_token(token: &str) -> Result<Self, String> {
        let bad = || format!("expected /pattern/[i], got: {}", token);
        let rest = token.strip_prefix('/').ok_or_else(bad)?;
        let (pattern, case_insensitive) = if let Some(p) = rest.strip_suffix("/i") {
            (p, true)
        } else if let Some(p) = rest.strip_suffix('/') {
            (p, false)
        } else {
            return Err(bad());
        };
        if pattern.is_empty() {
            return Err(bad());
        }
        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| format!("invalid regex: {}", e))?;
        Ok(Self {
            raw: pattern.to_string(),
            case_insensitive,
            compiled,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.compiled.is_match(text)
    }

    pub fn describe(&self) -> String {
        format!(
            "/{}/{}",
            self.raw,
            if self.case_insensitive { "i" } else { "" }
        )
    }
}

/// One notification rule.
#[derive(Debug, Clone)]
pub enum NotificationRule {
    /// Entry level is in the set.
    Level(BTreeSet<LogLevel>),
    /// Entry text matches the pattern.
    Pattern(PatternRule),
    /// Error rate reached the per-minute threshold.
    Rate(u32),
    /// Extracted duration reached the threshold.
    Slow(u64),
}

impl NotificationRule {
    pub fn describe(&self) -> String {
        match self {
            NotificationRule::Level(levels) => {
                let names: Vec<_> = levels.iter().map(|l| l.name()).collect();
                format!("level {}", names.join(" "))
            }
            NotificationRule::Pattern(p) => format!("pattern {}", p.describe()),
            NotificationRule::Rate(n) => format!("rate {}/min", n),
            NotificationRule::Slow(ms) => format!("slow {}ms", ms),
        }
    }
}

/// Daily quiet window, `HH:MM-HH:MM`; spans midnight when start > end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let bad = || format!("expected HH:MM-HH:MM, got: {}", spec);
        let (start, end) = spec.split_once('-').ok_or_else(bad)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| bad())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| bad())?;
        Ok(Self { start, end })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// Notification configuration. Immutable value; commands replace it.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub rules: Vec<NotificationRule>,
    pub quiet_hours: Option<QuietHours>,
    pub rate_limit_per_minute: u32,
}

impl NotifyConfig {
    /// Default rate limit applied when none is configured.
    pub const DEFAULT_RATE_LIMIT: u32 = 10;

    pub fn effective_rate_limit(&self) -> u32 {
        if self.rate_limit_per_minute == 0 {
            Self::DEFAULT_RATE_LIMIT
        } else {
            self.rate_limit_per_minute
        }
    }
}

/// Everything known about an entry at notification time.
#[derive(Debug, Clone)]
pub struct NotifyContext<'a> {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub text: &'a str,
    /// Duration extracted from the message, ms.
    pub duration_ms: Option<f64>,
    /// Current error rate per minute.
    pub error_rate_per_min: f64,
    /// Shown as the notification subtitle, typically the tail target.
    pub subtitle: Option<&'a str>,
}

/// Stateful evaluator: owns the sliding-window limiter and suppressed
/// counter. One per tail session.
#[derive(Debug, Default)]
pub struct NotifyEngine {
    sent_at: VecDeque<DateTime<Utc>>,
    suppressed: u32,
    suppressed_level: Option<LogLevel>,
}

impl NotifyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one entry. Returns the number of notifications actually
    /// dispatched (0, 1, or 2 when a pending summary flushes first).
    pub fn evaluate(
        &mut self,
        config: &NotifyConfig,
        ctx: &NotifyContext<'_>,
        notifier: &dyn Notifier,
    ) -> u32 {
        if !config.enabled {
            return 0;
        }

        let mut dispatched = self.flush_summary(config, ctx.timestamp, notifier);

        let Some(payload) = first_match(config, ctx) else {
            return dispatched;
        };

        // Quiet hours swallow everything below FATAL.
        if let Some(quiet) = &config.quiet_hours
            && quiet.contains(ctx.timestamp.time())
            && ctx.level < LogLevel::Fatal
        {
            debug!("notification suppressed by quiet hours");
            return dispatched;
        }

        self.prune(ctx.timestamp);
        if self.sent_at.len() >= config.effective_rate_limit() as usize {
            self.suppressed += 1;
            self.suppressed_level = Some(ctx.level);
            return dispatched;
        }

        self.sent_at.push_back(ctx.timestamp);
        dispatch(notifier, &payload);
        dispatched += 1;
        dispatched
    }

    /// Emit the coalesced "N additional events" summary once the window
    /// has drained enough to admit it.
    fn flush_summary(
        &mut self,
        config: &NotifyConfig,
        now: DateTime<Utc>,
        notifier: &dyn Notifier,
    ) -> u32 {
        if self.suppressed == 0 {
            return 0;
        }
        self.prune(now);
        if self.sent_at.len() >= config.effective_rate_limit() as usize {
            return 0;
        }
        let body = match self.suppressed_level {
            Some(level) => format!("{} additional {} events", self.suppressed, level.name()),
            None => format!("{} additional events", self.suppressed),
        };
        let payload = Notification {
            title: "pgtail: rate limit".to_string(),
            body,
            subtitle: None,
        };
        self.suppressed = 0;
        self.suppressed_level = None;
        self.sent_at.push_back(now);
        dispatch(notifier, &payload);
        1
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(first) = self.sent_at.front() {
            if (now - *first).num_seconds() >= RATE_WINDOW_SECS {
                self.sent_at.pop_front();
            } else {
                break;
            }
        }
    }
}

/// First rule matching the entry, rendered into a payload.
fn first_match(config: &NotifyConfig, ctx: &NotifyContext<'_>) -> Option<Notification> {
    for rule in &config.rules {
        let payload = match rule {
            NotificationRule::Level(levels) if levels.contains(&ctx.level) => Notification {
                title: format!("PostgreSQL {}", ctx.level.name()),
                body: first_line(ctx.text),
                subtitle: ctx.subtitle.map(str::to_string),
            },
            NotificationRule::Pattern(pattern) if pattern.is_match(ctx.text) => Notification {
                title: format!("Pattern match: {}", pattern.describe()),
                body: first_line(ctx.text),
                subtitle: ctx.subtitle.map(str::to_string),
            },
            NotificationRule::Rate(threshold)
                if ctx.error_rate_per_min >= f64::from(*threshold) =>
            {
                Notification {
                    title: "High error rate".to_string(),
                    body: format!(
                        "{:.0} errors/min (threshold {})",
                        ctx.error_rate_per_min, threshold
                    ),
                    subtitle: ctx.subtitle.map(str::to_string),
                }
            }
            NotificationRule::Slow(threshold_ms) => match ctx.duration_ms {
                Some(ms) if ms >= *threshold_ms as f64 => Notification {
                    title: "Slow query".to_string(),
                    body: format!("duration {:.1} ms (threshold {} ms)", ms, threshold_ms),
                    subtitle: ctx.subtitle.map(str::to_string),
                },
                _ => continue,
            },
            _ => continue,
        };
        return Some(payload);
    }
    None
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").to_string()
}

/// Send, swallowing errors. `notify test` goes around this path.
fn dispatch(notifier: &dyn Notifier, payload: &Notification) {
    if let Err(e) = notifier.notify(payload) {
        warn!("notifier failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notification: &Notification) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn at(min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, min, sec).unwrap()
    }

    fn fatal_ctx(ts: DateTime<Utc>, text: &'static str) -> NotifyContext<'static> {
        NotifyContext {
            timestamp: ts,
            level: LogLevel::Fatal,
            text,
            duration_ms: None,
            error_rate_per_min: 0.0,
            subtitle: None,
        }
    }

    fn level_config(levels: &[LogLevel], rate_limit: u32) -> NotifyConfig {
        NotifyConfig {
            enabled: true,
            rules: vec![NotificationRule::Level(levels.iter().copied().collect())],
            quiet_hours: None,
            rate_limit_per_minute: rate_limit,
        }
    }

    #[test]
    fn test_level_rule_matches() {
        let config = level_config(&[LogLevel::Fatal], 10);
        let notifier = RecordingNotifier::default();
        let mut engine = NotifyEngine::new();

        engine.evaluate(&config, &fatal_ctx(at(0, 0), "the db went away"), &notifier);
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "PostgreSQL FATAL");
        assert_eq!(sent[0].body, "the db went away");
    }

    #[test]
    fn test_disabled_config_sends_nothing() {
        let mut config = level_config(&[LogLevel::Fatal], 10);
        config.enabled = false;
        let notifier = RecordingNotifier::default();
        let mut engine = NotifyEngine::new();
        engine.evaluate(&config, &fatal_ctx(at(0, 0), "x"), &notifier);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let config = NotifyConfig {
            enabled: true,
            rules: vec![
                NotificationRule::Pattern(PatternRule::parse_token("/deadlock/i").unwrap()),
                NotificationRule::Level([LogLevel::Fatal].into_iter().collect()),
            ],
            quiet_hours: None,
            rate_limit_per_minute: 10,
        };
        let notifier = RecordingNotifier::default();
        let mut engine = NotifyEngine::new();
        engine.evaluate(&config, &fatal_ctx(at(0, 0), "Deadlock detected"), &notifier);
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].title.starts_with("Pattern match"));
    }

    #[test]
    fn test_rate_limit_with_summary() {
        // 30 FATAL entries in one minute, limit 10: 10 notifications,
        // then one summary for the remaining 20 after the window drains.
        let config = level_config(&[LogLevel::Fatal], 10);
        let notifier = RecordingNotifier::default();
        let mut engine = NotifyEngine::new();

        for i in 0..30 {
            engine.evaluate(&config, &fatal_ctx(at(0, i), "boom"), &notifier);
        }
        assert_eq!(notifier.sent.lock().unwrap().len(), 10);

        // Sixty-plus seconds later the window has drained.
        engine.evaluate(
            &config,
            &NotifyContext {
                timestamp: at(1, 30),
                level: LogLevel::Log,
                text: "quiet entry",
                duration_ms: None,
                error_rate_per_min: 0.0,
                subtitle: None,
            },
            &notifier,
        );
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 11);
        assert_eq!(sent[10].body, "20 additional FATAL events");
    }

    #[test]
    fn test_dispatch_count_bounded_per_window() {
        let config = level_config(&[LogLevel::Fatal], 5);
        let notifier = RecordingNotifier::default();
        let mut engine = NotifyEngine::new();
        for i in 0..50 {
            engine.evaluate(&config, &fatal_ctx(at(0, i % 60), "x"), &notifier);
        }
        // Within one sliding minute: at most limit + 1 (the summary).
        assert!(notifier.sent.lock().unwrap().len() <= 6);
    }

    #[test]
    fn test_quiet_hours_suppress_below_fatal() {
        let mut config = level_config(&[LogLevel::Error, LogLevel::Fatal], 10);
        config.quiet_hours = Some(QuietHours::parse("11:00-13:00").unwrap());
        let notifier = RecordingNotifier::default();
        let mut engine = NotifyEngine::new();

        // ERROR inside quiet hours: suppressed.
        engine.evaluate(
            &config,
            &NotifyContext {
                timestamp: at(0, 0),
                level: LogLevel::Error,
                text: "suppressed",
                duration_ms: None,
                error_rate_per_min: 0.0,
                subtitle: None,
            },
            &notifier,
        );
        assert!(notifier.sent.lock().unwrap().is_empty());

        // FATAL overrides quiet hours.
        engine.evaluate(&config, &fatal_ctx(at(0, 1), "override"), &notifier);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_quiet_hours_span_midnight() {
        let quiet = QuietHours::parse("22:00-07:00").unwrap();
        assert!(quiet.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(quiet.contains(NaiveTime::from_hms_opt(3, 0, 0).unwrap()));
        assert!(!quiet.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        assert!(QuietHours::parse("22:00").is_err());
        assert!(QuietHours::parse("25:00-07:00").is_err());
    }

    #[test]
    fn test_slow_rule() {
        let config = NotifyConfig {
            enabled: true,
            rules: vec![NotificationRule::Slow(500)],
            quiet_hours: None,
            rate_limit_per_minute: 10,
        };
        let notifier = RecordingNotifier::default();
        let mut engine = NotifyEngine::new();

        let mut ctx = fatal_ctx(at(0, 0), "duration: 600 ms statement: SELECT 1");
        ctx.duration_ms = Some(600.0);
        engine.evaluate(&config, &ctx, &notifier);

        let mut fast = fatal_ctx(at(0, 1), "duration: 100 ms");
        fast.duration_ms = Some(100.0);
        engine.evaluate(&config, &fast, &notifier);

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Slow query");
    }

    #[test]
    fn test_rate_rule() {
        let config = NotifyConfig {
            enabled: true,
            rules: vec![NotificationRule::Rate(20)],
            quiet_hours: None,
            rate_limit_per_minute: 10,
        };
        let notifier = RecordingNotifier::default();
        let mut engine = NotifyEngine::new();

        let mut ctx = fatal_ctx(at(0, 0), "x");
        ctx.error_rate_per_min = 25.0;
        engine.evaluate(&config, &ctx, &notifier);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
        assert_eq!(notifier.sent.lock().unwrap()[0].title, "High error rate");
    }

    #[test]
    fn test_pattern_token_case_flag() {
        let sensitive = PatternRule::parse_token("/Deadlock/").unwrap();
        assert!(sensitive.is_match("Deadlock here"));
        assert!(!sensitive.is_match("deadlock here"));

        let insensitive = PatternRule::parse_token("/Deadlock/i").unwrap();
        assert!(insensitive.is_match("DEADLOCK here"));

        assert!(PatternRule::parse_token("deadlock").is_err());
        assert!(PatternRule::parse_token("/(bad/").is_err());
    }
}
