//! Slow-query detection and session duration statistics.
//!
//! PostgreSQL reports statement timing as `duration: 123.456 ms` (with
//! `log_min_duration_statement` or `log_duration`). Durations are
//! extracted, classified against the configured thresholds, and collected
//! for percentile reporting.

use regex::Regex;

/// Threshold configuration, milliseconds. Invariant:
/// `0 < warning < slow < critical`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlowQueryConfig {
    pub warning_ms: u64,
    pub slow_ms: u64,
    pub critical_ms: u64,
    pub enabled: bool,
}

impl Default for SlowQueryConfig {
    fn default() -> Self {
        Self {
            warning_ms: 100,
            slow_ms: 500,
            critical_ms: 1000,
            enabled: true,
        }
    }
}

impl SlowQueryConfig {
    /// Build a validated config.
    pub fn new(warning_ms: u64, slow_ms: u64, critical_ms: u64) -> Result<Self, String> {
        if warning_ms == 0 {
            return Err("thresholds must be positive".to_string());
        }
        if !(warning_ms < slow_ms && slow_ms < critical_ms) {
            return Err(format!(
                "thresholds must ascend: warning ({warning_ms}) < slow ({slow_ms}) < critical ({critical_ms})"
            ));
        }
        Ok(Self {
            warning_ms,
            slow_ms,
            critical_ms,
            enabled: true,
        })
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Classify a duration. Total over `(duration, thresholds)`.
    pub fn classify(&self, duration_ms: f64) -> Option<SlowClass> {
        if !self.enabled {
            return None;
        }
        if duration_ms >= self.critical_ms as f64 {
            Some(SlowClass::Critical)
        } else if duration_ms >= self.slow_ms as f64 {
            Some(SlowClass::Slow)
        } else if duration_ms >= self.warning_ms as f64 {
            Some(SlowClass::Warning)
        } else {
            None
        }
    }

    pub fn describe(&self) -> String {
        if self.enabled {
            format!(
                "warning {}ms / slow {}ms / critical {}ms",
                self.warning_ms, self.slow_ms, self.critical_ms
            )
        } else {
            "off".to_string()
        }
    }
}

/// Severity bucket for a classified duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlowClass {
    Warning,
    Slow,
    Critical,
}

impl SlowClass {
    pub fn name(self) -> &'static str {
        match self {
            SlowClass::Warning => "warning",
            SlowClass::Slow => "slow",
            SlowClass::Critical => "critical",
        }
    }
}

/// Extracts `duration: N ms|s` from message text, normalized to ms.
pub struct DurationMatcher {
    re: Regex,
}

impl Default for DurationMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DurationMatcher {
    pub fn new() -> Self {
        Self {
            re: Regex::new(r"(?i)duration:\s*(\d+(?:\.\d+)?)\s*(ms|s)\b")
                .expect("static duration regex"),
        }
    }

    pub fn extract_ms(&self, text: &str) -> Option<f64> {
        let caps = self.re.captures(text)?;
        let value: f64 = caps[1].parse().ok()?;
        Some(match &caps[2].to_ascii_lowercase()[..] {
            "s" => value * 1000.0,
            _ => value,
        })
    }
}

/// Aggregate view over the collected durations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationSummary {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Append-only session-scoped duration samples.
///
/// Percentiles sort a copy on demand; at the session scale (well under
/// a million samples) that comfortably meets the reporting budget.
#[derive(Debug, Clone, Default)]
pub struct DurationStats {
    samples: Vec<f64>,
}

impl DurationStats {
    pub fn record(&mut self, duration_ms: f64) {
        self.samples.push(duration_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn summary(&self) -> Option<DurationSummary> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        Some(DurationSummary {
            count,
            avg_ms: sum / count as f64,
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            max_ms: sorted[count - 1],
        })
    }
}

/// Nearest-rank percentile over an already sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
