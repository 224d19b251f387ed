//! Discovered PostgreSQL instance model.

pub mod config;

use std::path::{Path, PathBuf};

/// Strategy that first discovered an instance. Lower priority value wins
/// when two strategies report the same data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DetectionSource {
    /// Running `postgres`/`postmaster` process.
    Process,
    /// `~/.pgrx/data-*` development cluster.
    Pgrx,
    /// `PGDATA` environment variable.
    EnvVar,
    /// Platform-specific well-known directory.
    KnownPath,
    /// OS service registry.
    Service,
}

impl DetectionSource {
    pub fn name(self) -> &'static str {
        match self {
            DetectionSource::Process => "process",
            DetectionSource::Pgrx => "pgrx",
            DetectionSource::EnvVar => "env",
            DetectionSource::KnownPath => "path",
            DetectionSource::Service => "service",
        }
    }
}

impl std::fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A discovered PostgreSQL instance, keyed by its canonical data directory.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Absolute, normalized data directory. Always contains `PG_VERSION`.
    pub data_dir: PathBuf,
    /// Contents of `PG_VERSION`, e.g. `16` or `12.4`.
    pub version: String,
    /// Listen port; 0 when unknown.
    pub port: u16,
    pub running: bool,
    /// Resolved log directory, when one could be determined.
    pub log_dir: Option<PathBuf>,
    /// `log_filename` strftime pattern; empty when unset.
    pub log_pattern: String,
    pub source: DetectionSource,
}

impl Instance {
    /// Dedup key: the canonicalized data directory, case-folded on
    /// filesystems that are case-insensitive by default.
    pub fn key(&self) -> String {
        canonical_key(&self.data_dir)
    }

    /// One-line human description used by `list`.
    pub fn describe(&self) -> String {
        let state = if self.running { "running" } else { "stopped" };
        let port = if self.port > 0 {
            format!(":{}", self.port)
        } else {
            String::new()
        };
        format!(
            "PostgreSQL {}{} [{}] {} ({})",
            self.version,
            port,
            state,
            self.data_dir.display(),
            self.source
        )
    }
}

/// Whether `dir` looks like a PostgreSQL data directory.
pub fn is_valid_data_dir(dir: &Path) -> bool {
    dir.join("PG_VERSION").is_file()
}

/// Resolve a path to its canonical absolute form, falling back to lexical
/// cleanup when the directory cannot be resolved (e.g. went away between
/// discovery and completion).
pub fn canonical_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| normalize_lexically(path))
}

/// Canonicalize a path into a dedup key, case-folded on filesystems that
/// are case-insensitive by default.
pub fn canonical_key(path: &Path) -> String {
    let key = canonical_path(path).to_string_lossy().into_owned();
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        key.to_lowercase()
    } else {
        key
    }
}

/// Lexical cleanup: make absolute against the current directory and drop
/// `.` / resolve `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for comp in absolute.components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
