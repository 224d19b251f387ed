//! Rotation-aware log file tailer.
//!
//! Polls a log directory, follows the current file by strftime pattern and
//! modification time, and emits raw newline-stripped lines over a bounded
//! channel. Rotation, truncation, and files vanishing mid-poll are all
//! recoverable; the poll loop itself never fails once started.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::parse::leading_timestamp;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded channel capacity between the tailer and its consumer. A slow
/// consumer blocks the tailer, which paces file reads; lines are never
/// dropped.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Read buffer size per poll iteration.
const READ_CHUNK: usize = 64 * 1024;

/// Minimum spacing between repeated notices with the same signature.
const NOTICE_INTERVAL: Duration = Duration::from_secs(60);

/// Events emitted by the tailer.
#[derive(Debug)]
pub enum TailEvent {
    /// A complete, newline-stripped log line.
    Line(String),
    /// A poll pass produced nothing new; consumers flush pending state.
    Idle,
    /// Human-visible condition (file gone, unreadable directory).
    Notice(String),
}

/// How a tail starts and polls.
#[derive(Debug, Clone)]
pub struct TailOptions {
    pub poll_interval: Duration,
    /// Read the initial file from the beginning instead of seeking to EOF.
    pub from_start: bool,
    /// Skip ahead to the first line stamped at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            from_start: false,
            since: None,
        }
    }
}

/// Error constructing a tailer.
#[derive(Debug)]
pub enum TailError {
    LogDirNotFound(PathBuf),
    FileNotFound(PathBuf),
    BadPattern(String),
    Io(io::Error),
}

impl std::fmt::Display for TailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TailError::LogDirNotFound(p) => write!(f, "log directory not found: {}", p.display()),
            TailError::FileNotFound(p) => write!(f, "log file not found: {}", p.display()),
            TailError::BadPattern(p) => write!(f, "unusable log_filename pattern: {}", p),
            TailError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TailError {}

impl From<io::Error> for TailError {
    fn from(e: io::Error) -> Self {
        TailError::Io(e)
    }
}

/// Outcome of a single poll pass.
#[derive(Debug, PartialEq)]
enum Poll {
    /// At least one line was emitted.
    Lines,
    /// Nothing new.
    Quiet,
    /// The consumer went away; stop tailing.
    Disconnected,
}

/// Polled follower of a rotating log file.
pub struct LogTailer {
    log_dir: PathBuf,
    /// Filename matcher derived from the strftime pattern; `None` means
    /// "lexically newest `*.log`".
    file_re: Option<Regex>,
    /// Fixed single-file mode (`tail <path>`): rotation never switches away.
    pinned: bool,
    opts: TailOptions,
    current: Option<PathBuf>,
    offset: u64,
    /// Partial trailing line carried to the next poll.
    partial: Vec<u8>,
    last_notice: HashMap<String, Instant>,
}

impl LogTailer {
    /// Tail the pattern-matched current file of a log directory.
    pub fn for_directory(
        log_dir: impl Into<PathBuf>,
        log_pattern: &str,
        opts: TailOptions,
    ) -> Result<Self, TailError> {
        let log_dir = log_dir.into();
        if !log_dir.is_dir() {
            return Err(TailError::LogDirNotFound(log_dir));
        }
        let file_re = if log_pattern.is_empty() {
            None
        } else {
            Some(
                pattern_to_regex(log_pattern)
                    .map_err(|_| TailError::BadPattern(log_pattern.to_string()))?,
            )
        };
        Ok(Self {
            log_dir,
            file_re,
            pinned: false,
            opts,
            current: None,
            offset: 0,
            partial: Vec::new(),
            last_notice: HashMap::new(),
        })
    }

    /// Tail one specific file.
    pub fn for_file(path: impl Into<PathBuf>, opts: TailOptions) -> Result<Self, TailError> {
        let path = path.into();
        if !path.is_file() {
            return Err(TailError::FileNotFound(path));
        }
        let log_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            log_dir,
            file_re: None,
            pinned: true,
            opts,
            current: Some(path),
            offset: 0,
            partial: Vec::new(),
            last_notice: HashMap::new(),
        })
    }

    /// Spawn the polling loop on a worker thread. The returned receiver
    /// yields events until cancellation or consumer drop closes the
    /// channel.
    pub fn spawn(mut self, cancel: Arc<AtomicBool>) -> (Receiver<TailEvent>, JoinHandle<()>) {
        let (tx, rx) = sync_channel(CHANNEL_CAPACITY);
        let handle = std::thread::Builder::new()
            .name("pgtail-tailer".to_string())
            .spawn(move || self.run(tx, cancel))
            .expect("spawn tailer thread");
        (rx, handle)
    }

    fn run(&mut self, tx: SyncSender<TailEvent>, cancel: Arc<AtomicBool>) {
        self.position_initial(&tx);
        loop {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            match self.poll(&tx) {
                Poll::Disconnected => break,
                Poll::Lines => {}
                Poll::Quiet => {
                    // Idle marker lets the consumer flush a pending
                    // multi-line entry. Best-effort; never blocks.
                    if matches!(tx.try_send(TailEvent::Idle), Err(TrySendError::Disconnected(_))) {
                        break;
                    }
                }
            }
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(self.opts.poll_interval);
        }
        debug!("tailer for {} stopped", self.log_dir.display());
    }

    /// Establish the starting file and offset.
    fn position_initial(&mut self, tx: &SyncSender<TailEvent>) {
        if self.current.is_none() {
            self.current = self.select_file();
        }
        let Some(path) = self.current.clone() else {
            self.notice(tx, "no-file", format!("no log files in {} yet", self.log_dir.display()));
            return;
        };
        if let Some(since) = self.opts.since {
            self.offset = seek_to_since(&path, since).unwrap_or(0);
        } else if !self.opts.from_start {
            self.offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        }
    }

    /// One poll pass: drain the current file, then check for rotation and
    /// drain the replacement. The old file is always read to EOF before
    /// the switch, so cross-rotation ordering holds.
    fn poll(&mut self, tx: &SyncSender<TailEvent>) -> Poll {
        let mut emitted = false;

        if self.current.is_some() {
            match self.read_new(tx) {
                Ok(any) => emitted |= any,
                Err(ReadStop::Disconnected) => return Poll::Disconnected,
            }
        }

        if !self.pinned
            && let Some(newest) = self.select_file()
            && self.current.as_ref() != Some(&newest)
        {
            debug!("rotated to {}", newest.display());
            self.current = Some(newest);
            self.offset = 0;
            self.partial.clear();
            match self.read_new(tx) {
                Ok(any) => emitted |= any,
                Err(ReadStop::Disconnected) => return Poll::Disconnected,
            }
        }

        if self.current.is_none() {
            self.current = self.select_file();
        }

        if emitted { Poll::Lines } else { Poll::Quiet }
    }

    /// Read from the remembered offset to EOF, emitting complete lines.
    fn read_new(&mut self, tx: &SyncSender<TailEvent>) -> Result<bool, ReadStop> {
        let Some(path) = self.current.clone() else {
            return Ok(false);
        };

        let len = match std::fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Expected mid-rotation; the next pass re-selects.
                self.notice(tx, "gone", format!("{} disappeared", path.display()));
                return Ok(false);
            }
            Err(e) => {
                self.notice(tx, "stat", format!("cannot stat {}: {}", path.display(), e));
                return Ok(false);
            }
        };

        if len < self.offset {
            debug!("{} truncated, rereading", path.display());
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(false);
        }

        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                self.notice(tx, "open", format!("cannot open {}: {}", path.display(), e));
                return Ok(false);
            }
        };
        if let Err(e) = file.seek(SeekFrom::Start(self.offset)) {
            self.notice(tx, "seek", format!("cannot seek {}: {}", path.display(), e));
            return Ok(false);
        }

        let mut emitted = false;
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let read = match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.notice(tx, "read", format!("read error on {}: {}", path.display(), e));
                    break;
                }
            };
            self.offset += read as u64;
            self.partial.extend_from_slice(&chunk[..read]);

            // Emit every complete line; keep the unterminated tail.
            while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
                line.pop(); // '\n'
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                if tx.send(TailEvent::Line(text)).is_err() {
                    return Err(ReadStop::Disconnected);
                }
                emitted = true;
            }
        }
        Ok(emitted)
    }

    /// Pick the file to follow: pattern matches by latest mtime (name
    /// breaks ties), or the lexically newest `*.log` without a pattern.
    fn select_file(&self) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.log_dir).ok()?;
        let mut best: Option<(std::time::SystemTime, String, PathBuf)> = None;
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let matched = match &self.file_re {
                Some(re) => re.is_match(&name),
                None => name.ends_with(".log"),
            };
            if !matched {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let key = match &self.file_re {
                Some(_) => {
                    let mtime = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    (mtime, name, path)
                }
                // Lexical ordering only; mtime neutralized.
                None => (std::time::SystemTime::UNIX_EPOCH, name, path),
            };
            if best.as_ref().is_none_or(|b| (&key.0, &key.1) > (&b.0, &b.1)) {
                best = Some(key);
            }
        }
        best.map(|(_, _, path)| path)
    }

    /// Emit a notice, at most once per signature per minute.
    fn notice(&mut self, tx: &SyncSender<TailEvent>, signature: &str, message: String) {
        let now = Instant::now();
        let due = self
            .last_notice
            .get(signature)
            .is_none_or(|last| now.duration_since(*last) >= NOTICE_INTERVAL);
        if !due {
            return;
        }
        self.last_notice.insert(signature.to_string(), now);
        warn!("{}", message);
        let _ = tx.try_send(TailEvent::Notice(message));
    }
}

enum ReadStop {
    Disconnected,
}

/// Byte offset of the first line whose leading timestamp is at or after
/// `since`. Lines without a timestamp do not qualify on their own.
fn seek_to_since(path: &Path, since: DateTime<Utc>) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut offset: u64 = 0;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return Ok(offset);
        }
        if let Some(ts) = leading_timestamp(&line)
            && ts >= since
        {
            return Ok(offset);
        }
        offset += read as u64;
    }
}

/// Translate a strftime `log_filename` pattern into a filename regex.
///
/// Conversion specifiers map to digit/letter classes; unknown ones match
/// anything, which keeps the matcher tolerant of exotic patterns.
pub fn pattern_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 16);
    out.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push_str(&regex::escape(&c.to_string()));
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(r"\d{4}"),
            Some('y' | 'm' | 'd' | 'H' | 'M' | 'S' | 'U' | 'W') => out.push_str(r"\d{2}"),
            Some('j') => out.push_str(r"\d{3}"),
            Some('s') => out.push_str(r"\d+"),
            Some('e') => out.push_str(r"[ \d]?\d"),
            Some('a' | 'b') => out.push_str(r"[A-Za-z]{3}"),
            Some('A' | 'B') => out.push_str(r"[A-Za-z]+"),
            Some('p') => out.push_str(r"[AP]M"),
            Some('%') => out.push('%'),
            Some(_) => out.push_str(r".*"),
            None => break,
        }
    }
    out.push('$');
    Regex::new(&out)
}
