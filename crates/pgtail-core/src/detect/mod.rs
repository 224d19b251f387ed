//! PostgreSQL instance detection.
//!
//! Runs the discovery strategies in priority order, completes each hit via
//! the config reader, and deduplicates by canonical data directory. A
//! failing strategy never aborts the scan; its error is collected into the
//! report.

pub mod paths;
pub mod process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::instance::config::{
    read_pg_version, read_postgresql_conf, read_postmaster_pid, resolve_log_dir,
};
use crate::instance::{DetectionSource, Instance, canonical_key, canonical_path, is_valid_data_dir};

/// Soft deadline per strategy; slower strategies are reported, not killed.
const STRATEGY_DEADLINE: Duration = Duration::from_secs(2);

/// A strategy failure collected during detection.
#[derive(Debug, Clone)]
pub struct StrategyError {
    pub source: DetectionSource,
    pub message: String,
}

impl std::fmt::Display for StrategyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} strategy: {}", self.source, self.message)
    }
}

/// Result of a detection run: instances plus non-fatal strategy errors.
#[derive(Debug, Default)]
pub struct DetectionReport {
    pub instances: Vec<Instance>,
    pub errors: Vec<StrategyError>,
}

/// Instance detector. The filesystem roots it consults are injectable so
/// tests can point it at fixtures.
pub struct Detector {
    proc_root: PathBuf,
    pgrx_root: Option<PathBuf>,
    pgdata: Option<PathBuf>,
    scan_processes: bool,
    scan_known_paths: bool,
    scan_services: bool,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            pgrx_root: home::home_dir().map(|h| h.join(".pgrx")),
            pgdata: std::env::var_os("PGDATA").map(PathBuf::from),
            scan_processes: cfg!(target_os = "linux"),
            scan_known_paths: true,
            scan_services: true,
        }
    }

    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self.scan_processes = true;
        self
    }

    pub fn with_pgrx_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.pgrx_root = Some(root.into());
        self
    }

    pub fn with_pgdata(mut self, pgdata: Option<PathBuf>) -> Self {
        self.pgdata = pgdata;
        self
    }

    /// Restrict the scan to injected roots only. Used by tests to keep
    /// host state out of fixtures.
    pub fn isolated(mut self) -> Self {
        self.scan_processes = false;
        self.scan_known_paths = false;
        self.scan_services = false;
        self.pgdata = None;
        self
    }

    /// Run all strategies and return the deduplicated report.
    pub fn detect(&self) -> DetectionReport {
        let mut report = DetectionReport::default();
        // Key -> index into report.instances; first strategy wins.
        let mut seen: HashMap<String, usize> = HashMap::new();

        if self.scan_processes {
            let hits = self.timed(DetectionSource::Process, &mut report, |_| {
                process::scan(&self.proc_root).map_err(|e| e.to_string())
            });
            for dir in hits {
                self.admit(&dir, DetectionSource::Process, true, &mut report, &mut seen);
            }
        }

        if let Some(pgrx_root) = &self.pgrx_root {
            let hits = self.timed(DetectionSource::Pgrx, &mut report, |_| {
                Ok(paths::pgrx_data_dirs(pgrx_root))
            });
            for dir in hits {
                self.admit(&dir, DetectionSource::Pgrx, false, &mut report, &mut seen);
            }
        }

        if let Some(pgdata) = self.pgdata.clone() {
            self.admit(&pgdata, DetectionSource::EnvVar, false, &mut report, &mut seen);
        }

        if self.scan_known_paths {
            let hits = self.timed(DetectionSource::KnownPath, &mut report, |_| {
                Ok(paths::known_data_dirs())
            });
            for dir in hits {
                self.admit(&dir, DetectionSource::KnownPath, false, &mut report, &mut seen);
            }
        }

        if self.scan_services {
            let hits = self.timed(DetectionSource::Service, &mut report, |_| {
                paths::service_data_dirs()
            });
            for dir in hits {
                // A service-registered unit is alive by definition of the query.
                self.admit(&dir, DetectionSource::Service, true, &mut report, &mut seen);
            }
        }

        // Running instances first; discovery order preserved otherwise.
        report.instances.sort_by_key(|i| !i.running);
        report
    }

    /// Run one strategy, collecting its error and noting deadline misses.
    fn timed<F>(
        &self,
        source: DetectionSource,
        report: &mut DetectionReport,
        run: F,
    ) -> Vec<PathBuf>
    where
        F: FnOnce(&Self) -> Result<Vec<PathBuf>, String>,
    {
        let started = Instant::now();
        let result = run(self);
        let elapsed = started.elapsed();
        if elapsed > STRATEGY_DEADLINE {
            warn!("{} strategy took {:?}", source, elapsed);
        }
        match result {
            Ok(hits) => {
                debug!("{} strategy found {} candidate(s)", source, hits.len());
                hits
            }
            Err(message) => {
                report.errors.push(StrategyError { source, message });
                Vec::new()
            }
        }
    }

    /// Validate, complete, and deduplicate one candidate directory.
    fn admit(
        &self,
        dir: &Path,
        source: DetectionSource,
        running: bool,
        report: &mut DetectionReport,
        seen: &mut HashMap<String, usize>,
    ) {
        if !is_valid_data_dir(dir) {
            return;
        }
        let key = canonical_key(dir);
        if let Some(&idx) = seen.get(&key) {
            // Earlier strategy keeps the record; liveness is merged so a
            // service-registered running cluster is never shown stopped.
            report.instances[idx].running |= running;
            return;
        }
        match complete(dir, source, running) {
            Some(instance) => {
                seen.insert(key, report.instances.len());
                report.instances.push(instance);
            }
            None => debug!("{} candidate {} failed completion", source, dir.display()),
        }
    }
}

/// Fill in an [`Instance`] from the files inside its data directory.
fn complete(dir: &Path, source: DetectionSource, running: bool) -> Option<Instance> {
    let data_dir = canonical_path(dir);
    let version = read_pg_version(&data_dir)?;
    let config = read_postgresql_conf(&data_dir);
    let postmaster = read_postmaster_pid(&data_dir);

    let port = postmaster
        .as_ref()
        .map(|p| p.port)
        .filter(|&p| p > 0)
        .unwrap_or_else(|| config.port_or_default());

    Some(Instance {
        log_dir: resolve_log_dir(&data_dir, &config),
        log_pattern: config.log_filename.clone().unwrap_or_default(),
        data_dir,
        version,
        port,
        running,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_data_dir(root: &Path, name: &str, version: &str, conf: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("PG_VERSION"), format!("{version}\n")).unwrap();
        std::fs::write(dir.join("postgresql.conf"), conf).unwrap();
        dir
    }

    #[test]
    fn test_pgrx_only_detection() {
        let root = tempfile::tempdir().unwrap();
        let pgrx = root.path().join(".pgrx");
        std::fs::create_dir(&pgrx).unwrap();
        let data = pgrx.join("data-16");
        std::fs::create_dir(&data).unwrap();
        std::fs::write(data.join("PG_VERSION"), "16\n").unwrap();

        let report = Detector::new().isolated().with_pgrx_root(&pgrx).detect();
        assert!(report.errors.is_empty());
        assert_eq!(report.instances.len(), 1);
        let inst = &report.instances[0];
        assert_eq!(inst.source, DetectionSource::Pgrx);
        assert_eq!(inst.version, "16");
        assert!(!inst.running);
        assert_eq!(inst.data_dir, canonical_path(&data));
    }

    #[test]
    fn test_detection_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let pgrx = root.path().join(".pgrx");
        std::fs::create_dir(&pgrx).unwrap();
        for name in ["data-15", "data-16"] {
            let data = pgrx.join(name);
            std::fs::create_dir(&data).unwrap();
            std::fs::write(data.join("PG_VERSION"), "16\n").unwrap();
        }

        let detector = Detector::new().isolated().with_pgrx_root(&pgrx);
        let first: Vec<String> = detector.detect().instances.iter().map(|i| i.key()).collect();
        let second: Vec<String> = detector.detect().instances.iter().map(|i| i.key()).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_dedup_keeps_first_source() {
        let root = tempfile::tempdir().unwrap();
        let data = make_data_dir(root.path(), "cluster", "16", "port = 5433\n");

        // Same dir via pgrx (priority 2) and PGDATA (priority 3): the pgrx
        // record wins, so the pgrx root must contain it under data-*.
        let pgrx = root.path().join(".pgrx");
        std::fs::create_dir(&pgrx).unwrap();
        let pgrx_data = pgrx.join("data-16");
        std::fs::create_dir(&pgrx_data).unwrap();
        std::fs::write(pgrx_data.join("PG_VERSION"), "16\n").unwrap();

        let report = Detector::new()
            .isolated()
            .with_pgrx_root(&pgrx)
            .with_pgdata(Some(pgrx_data.clone()))
            .detect();
        assert_eq!(report.instances.len(), 1);
        assert_eq!(report.instances[0].source, DetectionSource::Pgrx);

        // An unrelated PGDATA still shows up on its own.
        let report = Detector::new()
            .isolated()
            .with_pgrx_root(&pgrx)
            .with_pgdata(Some(data.clone()))
            .detect();
        assert_eq!(report.instances.len(), 2);
        assert!(
            report
                .instances
                .iter()
                .any(|i| i.source == DetectionSource::EnvVar && i.port == 5433)
        );
    }

    #[test]
    fn test_completion_reads_config() {
        let root = tempfile::tempdir().unwrap();
        let data = make_data_dir(
            root.path(),
            "main",
            "15.4",
            "port = 6000\nlog_directory = 'log'\nlog_filename = 'postgresql-%a.log'\n",
        );
        std::fs::create_dir(data.join("log")).unwrap();

        let inst = complete(&data, DetectionSource::EnvVar, false).unwrap();
        assert_eq!(inst.version, "15.4");
        assert_eq!(inst.port, 6000);
        assert_eq!(inst.log_pattern, "postgresql-%a.log");
        assert_eq!(inst.log_dir, Some(canonical_path(&data).join("log")));
    }

    #[test]
    fn test_invalid_candidate_rejected() {
        let root = tempfile::tempdir().unwrap();
        let report = Detector::new()
            .isolated()
            .with_pgdata(Some(root.path().join("nope")))
            .detect();
        assert!(report.instances.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_strategy_marks_running() {
        let root = tempfile::tempdir().unwrap();
        let data = make_data_dir(root.path(), "live", "16", "port = 5432\n");

        let proc_root = root.path().join("proc");
        let pid_dir = proc_root.join("77");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("comm"), "postgres\n").unwrap();
        let mut cmdline = b"postgres\0-D\0".to_vec();
        cmdline.extend_from_slice(data.as_os_str().as_encoded_bytes());
        cmdline.push(0);
        std::fs::write(pid_dir.join("cmdline"), cmdline).unwrap();

        let report = Detector::new()
            .isolated()
            .with_proc_root(&proc_root)
            .with_pgdata(Some(data))
            .detect();
        // Process and EnvVar collapse into one running instance.
        assert_eq!(report.instances.len(), 1);
        let inst = &report.instances[0];
        assert_eq!(inst.source, DetectionSource::Process);
        assert!(inst.running);
    }
}
