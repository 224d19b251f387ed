//! Typed settings source for the persisted TOML configuration.
//!
//! File I/O stays in the binary; this module only deserializes the
//! document and carries defaults. Semantically invalid values (unknown
//! level names, bad patterns) degrade per key when applied to the
//! session, with a warning.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub default: DefaultSettings,
    pub slow: SlowSettings,
    pub display: DisplaySettings,
    pub theme: ThemeSettings,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DefaultSettings {
    /// Initial level filter; empty shows everything.
    pub levels: Vec<String>,
    /// When false, `tail` starts from the beginning of the file instead
    /// of the end.
    pub follow: bool,
}

impl Default for DefaultSettings {
    fn default() -> Self {
        Self {
            levels: Vec::new(),
            follow: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SlowSettings {
    pub warn: u64,
    pub slow: u64,
    pub critical: u64,
}

impl Default for SlowSettings {
    fn default() -> Self {
        Self {
            warn: 100,
            slow: 500,
            critical: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplaySettings {
    pub timestamp_format: String,
    pub show_pid: bool,
    pub show_level: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            show_pid: true,
            show_level: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThemeSettings {
    pub name: String,
}

impl Default for ThemeSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    /// Level names feeding one level rule.
    pub levels: Vec<String>,
    /// `/pattern/[i]` tokens, one pattern rule each.
    pub patterns: Vec<String>,
    /// Per-minute error-rate threshold; 0 disables the rule.
    pub error_rate: u32,
    /// Slow-query threshold in ms; 0 disables the rule.
    pub slow_query_ms: u64,
    /// `HH:MM-HH:MM`; empty means no quiet window.
    pub quiet_hours: String,
}

impl Settings {
    /// Parse a TOML document. Unknown keys are ignored.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
