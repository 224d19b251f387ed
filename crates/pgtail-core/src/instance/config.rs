//! Readers for the files a data directory carries: `PG_VERSION`,
//! `postgresql.conf`, and `postmaster.pid`.
//!
//! Parsing is deliberately forgiving. An unreadable or malformed
//! `postgresql.conf` yields an empty config rather than an error; callers
//! fall back to defaults.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Default PostgreSQL listen port.
pub const DEFAULT_PORT: u16 = 5432;

/// Subset of `postgresql.conf` settings pgtail cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostgresConfig {
    pub log_directory: Option<String>,
    pub log_filename: Option<String>,
    pub port: Option<u16>,
    pub log_destination: Option<String>,
    pub logging_collector: bool,
}

impl PostgresConfig {
    /// Effective port, defaulting to 5432.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

/// Contents of `postmaster.pid`. Lines beyond the PID are best-effort.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostmasterInfo {
    pub pid: u32,
    pub data_dir: String,
    /// Postmaster start time; `None` when the epoch line was absent.
    pub start_time: Option<DateTime<Utc>>,
    pub port: u16,
    pub socket_dir: String,
    pub host: String,
}

/// Read the `PG_VERSION` file: a single trimmed line.
pub fn read_pg_version(data_dir: &Path) -> Option<String> {
    let text = fs::read_to_string(data_dir.join("PG_VERSION")).ok()?;
    let version = text.trim();
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

/// Parse `postgresql.conf` under `data_dir`.
///
/// Never fails: missing file or malformed content yields the default
/// (empty) config.
pub fn read_postgresql_conf(data_dir: &Path) -> PostgresConfig {
    match fs::read_to_string(data_dir.join("postgresql.conf")) {
        Ok(text) => parse_conf(&text),
        Err(e) => {
            debug!("postgresql.conf unreadable in {}: {}", data_dir.display(), e);
            PostgresConfig::default()
        }
    }
}

/// Parse the `key = value` body of a `postgresql.conf`.
pub fn parse_conf(text: &str) -> PostgresConfig {
    let mut config = PostgresConfig::default();
    for line in text.lines() {
        let Some((key, value)) = parse_conf_line(line) else {
            continue;
        };
        match key.as_str() {
            "log_directory" => config.log_directory = Some(value),
            "log_filename" => config.log_filename = Some(value),
            "port" => config.port = value.parse().ok(),
            "log_destination" => config.log_destination = Some(value),
            "logging_collector" => config.logging_collector = is_truthy(&value),
            _ => {}
        }
    }
    config
}

/// Split one config line into `(key, value)`. Strips `#` comments (leading
/// and inline) and surrounding quotes from the value.
fn parse_conf_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, rest) = line.split_once('=')?;
    let key = key.trim().to_ascii_lowercase();
    if key.is_empty() {
        return None;
    }

    // Inline comment starts at the first `#` outside quotes.
    let mut value_end = rest.len();
    let mut in_quote: Option<char> = None;
    for (i, c) in rest.char_indices() {
        match in_quote {
            Some(q) if c == q => in_quote = None,
            None if c == '\'' || c == '"' => in_quote = Some(c),
            None if c == '#' => {
                value_end = i;
                break;
            }
            _ => {}
        }
    }
    let value = rest[..value_end].trim();
    let value = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .unwrap_or(value);
    Some((key, value.to_string()))
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "on" | "true" | "1")
}

/// Parse `postmaster.pid`. Fixed line order: 1=PID, 2=dataDir,
/// 3=startEpoch, 4=port, 5=socketDir, 6=host, 7=cluster. Returns `None`
/// when the PID line is missing or non-numeric.
pub fn read_postmaster_pid(data_dir: &Path) -> Option<PostmasterInfo> {
    let text = fs::read_to_string(data_dir.join("postmaster.pid")).ok()?;
    parse_postmaster_pid(&text)
}

pub fn parse_postmaster_pid(text: &str) -> Option<PostmasterInfo> {
    let mut lines = text.lines();
    let pid: u32 = lines.next()?.trim().parse().ok()?;
    let data_dir = lines.next().unwrap_or("").trim().to_string();
    let start_time = lines
        .next()
        .and_then(|l| l.trim().parse::<i64>().ok())
        .and_then(|epoch| DateTime::from_timestamp(epoch, 0));
    let port = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .unwrap_or(0);
    let socket_dir = lines.next().unwrap_or("").trim().to_string();
    let host = lines.next().unwrap_or("").trim().to_string();
    Some(PostmasterInfo {
        pid,
        data_dir,
        start_time,
        port,
        socket_dir,
        host,
    })
}

/// Resolve the log directory for a data dir given its config.
///
/// Absolute `log_directory` wins; a relative one is joined onto the data
/// dir; when unset, `data_dir/log` and `data_dir/pg_log` are probed.
pub fn resolve_log_dir(data_dir: &Path, config: &PostgresConfig) -> Option<PathBuf> {
    if let Some(dir) = &config.log_directory {
        if dir.is_empty() {
            return probe_default_log_dirs(data_dir);
        }
        let path = PathBuf::from(dir);
        return Some(if path.is_absolute() {
            path
        } else {
            data_dir.join(path)
        });
    }
    probe_default_log_dirs(data_dir)
}

fn probe_default_log_dirs(data_dir: &Path) -> Option<PathBuf> {
    for name in ["log", "pg_log"] {
        let candidate = data_dir.join(name);
        if candidate.is_dir() {
            return Some(candidate);
        }
    }
    None
}

/// Error from the enable-logging helper.
#[derive(Debug)]
pub enum EnableLoggingError {
    AlreadyEnabled,
    Io(std::io::Error),
}

impl std::fmt::Display for EnableLoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnableLoggingError::AlreadyEnabled => write!(f, "logging_collector is already on"),
            EnableLoggingError::Io(e) => write!(f, "could not update postgresql.conf: {}", e),
        }
    }
}

impl std::error::Error for EnableLoggingError {}

impl From<std::io::Error> for EnableLoggingError {
    fn from(e: std::io::Error) -> Self {
        EnableLoggingError::Io(e)
    }
}

/// One-shot helper: append the settings that turn on the logging
/// collector. The server must be restarted for them to take effect.
pub fn enable_logging_collector(data_dir: &Path) -> Result<(), EnableLoggingError> {
    let config = read_postgresql_conf(data_dir);
    if config.logging_collector {
        return Err(EnableLoggingError::AlreadyEnabled);
    }

    let path = data_dir.join("postgresql.conf");
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file)?;
    writeln!(file, "# added by pgtail on {}", Utc::now().format("%Y-%m-%d"))?;
    writeln!(file, "logging_collector = on")?;
    if config.log_directory.is_none() {
        writeln!(file, "log_directory = 'log'")?;
    }
    if config.log_filename.is_none() {
        writeln!(file, "log_filename = 'postgresql-%Y-%m-%d_%H%M%S.log'")?;
    }
    Ok(())
}
