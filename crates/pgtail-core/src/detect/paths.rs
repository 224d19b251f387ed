//! Filesystem and service-registry discovery strategies: pgrx data dirs,
//! the `PGDATA` environment variable, platform well-known directories,
//! and systemd units.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::instance::is_valid_data_dir;

/// Soft deadline for querying the service manager.
pub const SERVICE_DEADLINE: Duration = Duration::from_secs(2);

/// Enumerate `~/.pgrx/data-*` development clusters under `pgrx_root`.
pub fn pgrx_data_dirs(pgrx_root: &Path) -> Vec<PathBuf> {
    scan_children(pgrx_root, "data-", None)
}

/// Platform-specific well-known data directory locations.
pub fn known_data_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    #[cfg(target_os = "linux")]
    {
        // Debian/Ubuntu: /var/lib/postgresql/<version>/main
        dirs.extend(scan_children(Path::new("/var/lib/postgresql"), "", Some("main")));
        // RHEL/Fedora: /var/lib/pgsql/<version>/data, plus the unversioned layout
        dirs.extend(scan_children(Path::new("/var/lib/pgsql"), "", Some("data")));
        dirs.push(PathBuf::from("/var/lib/pgsql/data"));
    }

    #[cfg(target_os = "macos")]
    {
        dirs.extend(scan_children(Path::new("/opt/homebrew/var"), "postgres", None));
        dirs.extend(scan_children(Path::new("/usr/local/var"), "postgres", None));
        if let Some(home) = home::home_dir() {
            // Postgres.app keeps one var-<version> dir per cluster.
            dirs.extend(scan_children(
                &home.join("Library/Application Support/Postgres"),
                "var-",
                None,
            ));
        }
    }

    #[cfg(target_os = "windows")]
    {
        dirs.extend(scan_children(
            Path::new("C:\\Program Files\\PostgreSQL"),
            "",
            Some("data"),
        ));
    }

    dirs.retain(|d| is_valid_data_dir(d));
    dirs
}

/// List children of `base` whose name starts with `prefix`, optionally
/// descending into a fixed `suffix` subdirectory. Missing bases yield an
/// empty list.
fn scan_children(base: &Path, prefix: &str, suffix: Option<&str>) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(base) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
        .map(|e| match suffix {
            Some(s) => e.path().join(s),
            None => e.path(),
        })
        .filter(|p| p.is_dir())
        .collect();
    out.sort();
    out
}

/// Data directories implied by running PostgreSQL services.
///
/// On Linux this asks systemd for running `postgresql*` units and maps
/// Debian-style `postgresql@<version>-<cluster>` instance names onto
/// their conventional data directories. Other platforms report nothing.
pub fn service_data_dirs() -> Result<Vec<PathBuf>, String> {
    #[cfg(target_os = "linux")]
    {
        let output = run_with_deadline(
            std::process::Command::new("systemctl").args([
                "list-units",
                "--type=service",
                "--state=running",
                "--no-legend",
                "--plain",
                "postgresql*",
            ]),
            SERVICE_DEADLINE,
        )?;
        let mut dirs = parse_systemd_units(&output);
        dirs.retain(|d| is_valid_data_dir(d));
        Ok(dirs)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(Vec::new())
    }
}

/// Map systemd unit listing lines to conventional data directories.
#[cfg(any(target_os = "linux", test))]
pub(crate) fn parse_systemd_units(output: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for line in output.lines() {
        let Some(unit) = line.split_whitespace().next() else {
            continue;
        };
        let Some(name) = unit.strip_suffix(".service") else {
            continue;
        };
        if let Some(instance) = name.strip_prefix("postgresql@") {
            // Debian: postgresql@16-main -> /var/lib/postgresql/16/main
            if let Some((version, cluster)) = instance.split_once('-') {
                dirs.push(
                    PathBuf::from("/var/lib/postgresql")
                        .join(version)
                        .join(cluster),
                );
            }
        } else if name == "postgresql" {
            dirs.push(PathBuf::from("/var/lib/pgsql/data"));
        }
    }
    dirs
}

/// Run a command, killing it when the soft deadline passes.
#[cfg(target_os = "linux")]
fn run_with_deadline(
    command: &mut std::process::Command,
    deadline: Duration,
) -> Result<String, String> {
    use std::process::Stdio;
    use std::time::Instant;
    use tracing::debug;

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| format!("spawn failed: {}", e))?;

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut output = String::new();
                if let Some(mut stdout) = child.stdout.take() {
                    use std::io::Read;
                    let _ = stdout.read_to_string(&mut output);
                }
                if !status.success() {
                    debug!("service query exited with {}", status);
                }
                return Ok(output);
            }
            Ok(None) => {
                if started.elapsed() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!(
                        "service manager did not answer within {:?}",
                        deadline
                    ));
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(format!("wait failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pgrx_data_dirs() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("data-16")).unwrap();
        std::fs::create_dir(root.path().join("data-17")).unwrap();
        std::fs::create_dir(root.path().join("16.3")).unwrap();
        std::fs::write(root.path().join("config.toml"), "").unwrap();

        let dirs = pgrx_data_dirs(root.path());
        assert_eq!(
            dirs,
            vec![root.path().join("data-16"), root.path().join("data-17")]
        );
    }

    #[test]
    fn test_pgrx_missing_root_is_empty() {
        assert!(pgrx_data_dirs(Path::new("/definitely/not/here")).is_empty());
    }

    #[test]
    fn test_parse_systemd_units() {
        let output = "\
postgresql@16-main.service   loaded active running PostgreSQL Cluster 16-main
postgresql@14-replica.service loaded active running PostgreSQL Cluster 14-replica
postgresql.service           loaded active running PostgreSQL RDBMS
nginx.service                loaded active running nginx\n";
        let dirs = parse_systemd_units(output);
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/var/lib/postgresql/16/main"),
                PathBuf::from("/var/lib/postgresql/14/replica"),
                PathBuf::from("/var/lib/pgsql/data"),
            ]
        );
    }

    #[test]
    fn test_parse_systemd_units_empty() {
        assert!(parse_systemd_units("").is_empty());
        assert!(parse_systemd_units("\n\n").is_empty());
    }
}
