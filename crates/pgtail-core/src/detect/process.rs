//! Data-directory discovery from running `postgres` processes.
//!
//! Scans `/proc/[pid]/` directly, the same way the system collector reads
//! process state: `comm` for the executable name, `cmdline` for `-D`,
//! `environ` for `PGDATA`, and the `cwd` link as a last resort (the
//! postmaster chdirs into its data directory on startup).

use std::path::{Path, PathBuf};

use crate::instance::is_valid_data_dir;

/// Executable basenames that identify a PostgreSQL server process.
const POSTGRES_NAMES: &[&str] = &["postgres", "postmaster"];

/// Scan a procfs root for postgres data directories.
///
/// Unreadable per-pid files are skipped silently: `environ` is only
/// readable for same-user processes, and pids vanish mid-scan.
pub fn scan(proc_root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let pid_dir = entry.path();
        if !is_postgres_process(&pid_dir) {
            continue;
        }
        if let Some(data_dir) = data_dir_for(&pid_dir) {
            found.push(data_dir);
        }
    }
    Ok(found)
}

fn is_postgres_process(pid_dir: &Path) -> bool {
    let Ok(comm) = std::fs::read_to_string(pid_dir.join("comm")) else {
        return false;
    };
    let comm = comm.trim();
    POSTGRES_NAMES.contains(&comm)
}

/// Derive the data directory for one process: `-D` argument, then the
/// process `PGDATA` environment, then the working directory.
fn data_dir_for(pid_dir: &Path) -> Option<PathBuf> {
    if let Ok(cmdline) = std::fs::read(pid_dir.join("cmdline"))
        && let Some(dir) = datadir_from_cmdline(&cmdline)
        && is_valid_data_dir(&dir)
    {
        return Some(dir);
    }

    if let Ok(environ) = std::fs::read(pid_dir.join("environ"))
        && let Some(dir) = pgdata_from_environ(&environ)
        && is_valid_data_dir(&dir)
    {
        return Some(dir);
    }

    let cwd = std::fs::read_link(pid_dir.join("cwd")).ok()?;
    if is_valid_data_dir(&cwd) { Some(cwd) } else { None }
}

/// Extract the `-D <dir>` (or `-D<dir>` / `--pgdata=<dir>`) argument from
/// a NUL-separated cmdline buffer.
pub(crate) fn datadir_from_cmdline(cmdline: &[u8]) -> Option<PathBuf> {
    let args: Vec<&str> = cmdline
        .split(|&b| b == 0)
        .filter(|a| !a.is_empty())
        .filter_map(|a| std::str::from_utf8(a).ok())
        .collect();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if *arg == "-D" {
            return iter.peek().map(PathBuf::from);
        }
        if let Some(rest) = arg.strip_prefix("-D").filter(|r| !r.is_empty()) {
            return Some(PathBuf::from(rest));
        }
        if let Some(rest) = arg.strip_prefix("--pgdata=") {
            return Some(PathBuf::from(rest));
        }
    }
    None
}

/// Extract `PGDATA` from a NUL-separated environ buffer.
pub(crate) fn pgdata_from_environ(environ: &[u8]) -> Option<PathBuf> {
    environ
        .split(|&b| b == 0)
        .filter_map(|kv| std::str::from_utf8(kv).ok())
        .find_map(|kv| kv.strip_prefix("PGDATA="))
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
