//! Plain-ANSI rendering of log entries.
//!
//! Colors follow the entry's severity class; `NO_COLOR` or `--no-color`
//! turns them off. Display toggles come from the `[display]` settings
//! section.

use chrono::DateTime;
use pgtail_core::analyze::SlowClass;
use pgtail_core::parse::{LogEntry, SeverityClass};

const RESET: &str = "\x1b[0m";
const BOLD_RED: &str = "\x1b[1;31m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const DIM: &str = "\x1b[2m";
const MAGENTA: &str = "\x1b[35m";
const INVERT: &str = "\x1b[7m";

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub color: bool,
    pub timestamp_format: String,
    pub show_pid: bool,
    pub show_level: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            color: true,
            timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            show_pid: true,
            show_level: true,
        }
    }
}

impl RenderConfig {
    fn level_color(&self, class: SeverityClass) -> &'static str {
        if !self.color {
            return "";
        }
        match class {
            SeverityClass::Critical => BOLD_RED,
            SeverityClass::High => RED,
            SeverityClass::Medium => YELLOW,
            SeverityClass::Low => "",
            SeverityClass::Info => CYAN,
            SeverityClass::Verbose => DIM,
        }
    }

    fn paint(&self, code: &'static str, text: &str) -> String {
        if self.color && !code.is_empty() {
            format!("{}{}{}", code, text, RESET)
        } else {
            text.to_string()
        }
    }
}

/// Format one entry for the terminal.
pub fn render_entry(
    config: &RenderConfig,
    entry: &LogEntry,
    slow: Option<SlowClass>,
    highlighted: bool,
) -> String {
    // Nothing was parsed out of the line; show it as-is.
    if entry.message.is_empty() {
        return entry.raw.clone();
    }

    let mut parts: Vec<String> = Vec::new();
    if entry.timestamp != DateTime::UNIX_EPOCH {
        parts.push(
            config.paint(DIM, &entry.timestamp.format(&config.timestamp_format).to_string()),
        );
    }
    if config.show_pid && entry.pid > 0 {
        parts.push(config.paint(DIM, &format!("[{}]", entry.pid)));
    }

    let color = config.level_color(entry.level.severity_class());
    if config.show_level {
        parts.push(config.paint(color, &format!("{}:", entry.level.name())));
    }

    let mut message = config.paint(color, &entry.message);
    if highlighted {
        message = config.paint(INVERT, &entry.message);
    }
    parts.push(message);

    if let Some(class) = slow {
        parts.push(config.paint(MAGENTA, &format!("[{}]", class.name())));
    }

    parts.join(" ")
}
