//! REPL session state and command executor.
//!
//! The session owns every piece of pipeline state. Filter values live in
//! an immutable [`PipelineSnapshot`] behind a mutex-guarded `Arc`:
//! commands build a new snapshot and swap the `Arc`, the tail worker
//! clones the current one per entry. Statistics are written by the tail
//! worker and read here on `stats`/`errors`.

pub mod command;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::analyze::{DurationMatcher, DurationStats, ErrorStats, SlowClass, SlowQueryConfig};
use crate::detect::{DetectionReport, Detector};
use crate::filter::{LevelFilter, RegexFilter, RegexState, TimeFilter, parse_time_spec};
use crate::instance::Instance;
use crate::instance::config::enable_logging_collector;
use crate::notify::{
    NotificationRule, Notifier, NotifyConfig, NotifyContext, NotifyEngine, PatternRule, QuietHours,
};
use crate::parse::{EntryParser, LogEntry, LogLevel};
use crate::tail::{LogTailer, TailEvent, TailOptions};

use command::{Command, ErrorsCommand, NotifyCommand};

/// Bounded wait for tail threads to finish after cancellation.
const JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Immutable pipeline configuration captured by the tail worker.
#[derive(Debug, Clone, Default)]
pub struct PipelineSnapshot {
    pub levels: LevelFilter,
    pub regex: RegexState,
    pub time: TimeFilter,
    pub slow: SlowQueryConfig,
    pub notify: NotifyConfig,
}

/// Session statistics, written by the tail worker.
#[derive(Debug, Default)]
pub struct TailStats {
    pub durations: DurationStats,
    pub errors: ErrorStats,
}

/// Where surviving entries go. The binary renders them to the terminal.
pub trait TailSink: Send {
    fn entry(&mut self, entry: &LogEntry, slow: Option<SlowClass>, highlighted: bool);
    fn notice(&mut self, message: &str);
}

/// Factory producing a sink per tail session.
pub type SinkFactory = Box<dyn FnMut() -> Box<dyn TailSink> + Send>;

/// Result of executing one input line.
#[derive(Debug, Default)]
pub struct CommandResult {
    pub messages: Vec<String>,
    pub quit: bool,
}

impl CommandResult {
    fn message(text: impl Into<String>) -> Self {
        Self {
            messages: vec![text.into()],
            quit: false,
        }
    }
}

struct TailHandle {
    cancel: Arc<AtomicBool>,
    tailer_thread: JoinHandle<()>,
    worker_thread: JoinHandle<()>,
    target: String,
}

/// The interactive session: instances, pipeline state, and the active
/// tail worker.
pub struct Session {
    instances: Vec<Instance>,
    current: Option<usize>,
    pipeline: Arc<Mutex<Arc<PipelineSnapshot>>>,
    stats: Arc<Mutex<TailStats>>,
    notifier: Arc<dyn Notifier>,
    sink_factory: SinkFactory,
    detect: Box<dyn Fn() -> DetectionReport + Send>,
    tail: Option<TailHandle>,
    poll_interval: Duration,
    /// When false, `tail` starts from the beginning of the file.
    follow_default: bool,
}

impl Session {
    pub fn new(notifier: Arc<dyn Notifier>, sink_factory: SinkFactory) -> Self {
        Self {
            instances: Vec::new(),
            current: None,
            pipeline: Arc::new(Mutex::new(Arc::new(PipelineSnapshot::default()))),
            stats: Arc::new(Mutex::new(TailStats::default())),
            notifier,
            sink_factory,
            detect: Box::new(|| Detector::new().detect()),
            tail: None,
            poll_interval: crate::tail::DEFAULT_POLL_INTERVAL,
            follow_default: true,
        }
    }

    /// Replace the detection routine (tests inject fixtures here).
    pub fn with_detector(mut self, detect: Box<dyn Fn() -> DetectionReport + Send>) -> Self {
        self.detect = detect;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn set_follow_default(&mut self, follow: bool) {
        self.follow_default = follow;
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn set_instances(&mut self, instances: Vec<Instance>) {
        self.instances = instances;
        self.current = None;
    }

    pub fn is_tailing(&self) -> bool {
        self.tail.is_some()
    }

    /// Description of the active tail target, for the prompt.
    pub fn tail_target(&self) -> Option<&str> {
        self.tail.as_ref().map(|t| t.target.as_str())
    }

    /// Current pipeline snapshot (as the tail worker would see it).
    pub fn snapshot(&self) -> Arc<PipelineSnapshot> {
        self.pipeline.lock().unwrap().clone()
    }

    /// Execute one line of input.
    pub fn execute(&mut self, line: &str) -> CommandResult {
        let command = match command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return CommandResult::default(),
            Err(e) => return CommandResult::message(e.to_string()),
        };

        match self.dispatch(command) {
            Ok(result) => result,
            Err(message) => CommandResult::message(message),
        }
    }

    /// Stop the active tail, if any. Idempotent.
    pub fn stop_tail(&mut self) -> bool {
        let Some(handle) = self.tail.take() else {
            return false;
        };
        handle.cancel.store(true, Ordering::SeqCst);
        join_with_timeout(handle.tailer_thread, JOIN_TIMEOUT, "tailer");
        join_with_timeout(handle.worker_thread, JOIN_TIMEOUT, "pipeline worker");
        true
    }

    fn dispatch(&mut self, command: Command) -> Result<CommandResult, String> {
        let result = match command {
            Command::List => self.cmd_list(),
            Command::Tail {
                target,
                since,
                from_start,
            } => self.cmd_tail(&target, since.as_deref(), from_start)?,
            Command::Stop => {
                if self.stop_tail() {
                    CommandResult::message("stopped")
                } else {
                    CommandResult::message("no tail active")
                }
            }
            Command::Refresh => self.cmd_refresh()?,
            Command::Levels(names) => self.cmd_levels(&names)?,
            Command::FilterAdd(token) => self.cmd_filter_add(&token)?,
            Command::FilterShow => self.cmd_filter_show(),
            Command::FilterClear => {
                self.update_pipeline(|p| PipelineSnapshot {
                    regex: p.regex.cleared(),
                    ..p.clone()
                });
                CommandResult::message("regex filters cleared")
            }
            Command::Highlight(token) => {
                let filter = RegexFilter::parse_token(&token).map_err(|e| e.to_string())?;
                self.update_pipeline(|p| PipelineSnapshot {
                    regex: p.regex.with_highlight(filter.clone()),
                    ..p.clone()
                });
                CommandResult::message(format!("highlighting /{}/", filter.raw))
            }
            Command::HighlightClear => {
                self.update_pipeline(|p| {
                    let mut regex = p.regex.clone();
                    regex.highlights.clear();
                    PipelineSnapshot {
                        regex,
                        ..p.clone()
                    }
                });
                CommandResult::message("highlights cleared")
            }
            Command::Since(spec) => self.cmd_time_bound(Some(&spec), None)?,
            Command::Until(spec) => self.cmd_time_bound(None, Some(&spec))?,
            Command::Between(from, to) => self.cmd_time_bound(Some(&from), Some(&to))?,
            Command::TimeShow => {
                CommandResult::message(format!("time filter: {}", self.snapshot().time.describe()))
            }
            Command::TimeClear => {
                self.update_pipeline(|p| PipelineSnapshot {
                    time: TimeFilter::default(),
                    ..p.clone()
                });
                CommandResult::message("time filter cleared")
            }
            Command::SlowSet {
                warning,
                slow,
                critical,
            } => {
                let config = SlowQueryConfig::new(warning, slow, critical)?;
                self.update_pipeline(|p| PipelineSnapshot {
                    slow: config,
                    ..p.clone()
                });
                CommandResult::message(format!("slow-query thresholds: {}", config.describe()))
            }
            Command::SlowOff => {
                self.update_pipeline(|p| PipelineSnapshot {
                    slow: p.slow.disabled(),
                    ..p.clone()
                });
                CommandResult::message("slow-query detection off")
            }
            Command::SlowShow => CommandResult::message(format!(
                "slow-query thresholds: {}",
                self.snapshot().slow.describe()
            )),
            Command::Stats => self.cmd_stats(),
            Command::Errors(sub) => self.cmd_errors(sub)?,
            Command::Notify(sub) => self.cmd_notify(sub)?,
            Command::Enable(id) => self.cmd_enable(&id)?,
            Command::Help => CommandResult {
                messages: help_text(),
                quit: false,
            },
            Command::Quit => {
                self.stop_tail();
                CommandResult {
                    messages: Vec::new(),
                    quit: true,
                }
            }
        };
        Ok(result)
    }

    fn cmd_list(&self) -> CommandResult {
        if self.instances.is_empty() {
            return CommandResult::message("no PostgreSQL instances detected (try 'refresh')");
        }
        let messages = self
            .instances
            .iter()
            .enumerate()
            .map(|(i, inst)| {
                let marker = if self.current == Some(i) { "*" } else { " " };
                format!("{}{:>2}  {}", marker, i, inst.describe())
            })
            .collect();
        CommandResult {
            messages,
            quit: false,
        }
    }

    fn cmd_tail(
        &mut self,
        target: &str,
        since: Option<&str>,
        from_start: bool,
    ) -> Result<CommandResult, String> {
        let since = since
            .map(|spec| parse_time_spec(spec, Utc::now()))
            .transpose()
            .map_err(|e| e.to_string())?;
        let opts = TailOptions {
            poll_interval: self.poll_interval,
            from_start: from_start || !self.follow_default,
            since,
        };

        let (tailer, description) = self.resolve_target(target, opts)?;

        let mut messages = Vec::new();
        if self.stop_tail() {
            messages.push("stopped previous tail".to_string());
        }
        self.spawn_tail(tailer, description.clone());
        messages.push(format!("tailing {} ('stop' to stop)", description));
        Ok(CommandResult {
            messages,
            quit: false,
        })
    }

    /// Resolve a tail target: an instance index or a filesystem path.
    fn resolve_target(
        &mut self,
        target: &str,
        opts: TailOptions,
    ) -> Result<(LogTailer, String), String> {
        if let Ok(index) = target.parse::<usize>() {
            let instance = self
                .instances
                .get(index)
                .ok_or_else(|| format!("unknown instance id: {} (have {})", index, self.instances.len()))?;
            let log_dir = instance.log_dir.clone().ok_or_else(|| {
                format!(
                    "no log directory for instance {}; is logging_collector on? (see 'enable {}')",
                    index, index
                )
            })?;
            let tailer = LogTailer::for_directory(&log_dir, &instance.log_pattern, opts)
                .map_err(|e| e.to_string())?;
            let description = format!("instance {} ({})", index, log_dir.display());
            self.current = Some(index);
            return Ok((tailer, description));
        }

        let path = PathBuf::from(target);
        if path.is_file() {
            let tailer = LogTailer::for_file(&path, opts).map_err(|e| e.to_string())?;
            Ok((tailer, path.display().to_string()))
        } else if path.is_dir() {
            let tailer = LogTailer::for_directory(&path, "", opts).map_err(|e| e.to_string())?;
            Ok((tailer, path.display().to_string()))
        } else {
            Err(format!("no such instance or path: {}", target))
        }
    }

    fn spawn_tail(&mut self, tailer: LogTailer, target: String) {
        let cancel = Arc::new(AtomicBool::new(false));
        let (rx, tailer_thread) = tailer.spawn(cancel.clone());

        let pipeline = self.pipeline.clone();
        let stats = self.stats.clone();
        let notifier = self.notifier.clone();
        let sink = (self.sink_factory)();
        let worker_cancel = cancel.clone();
        let subtitle = target.clone();

        let worker_thread = std::thread::Builder::new()
            .name("pgtail-pipeline".to_string())
            .spawn(move || pipeline_worker(rx, worker_cancel, pipeline, stats, notifier, sink, subtitle))
            .expect("spawn pipeline worker");

        self.tail = Some(TailHandle {
            cancel,
            tailer_thread,
            worker_thread,
            target,
        });
    }

    fn cmd_refresh(&mut self) -> Result<CommandResult, String> {
        if self.is_tailing() {
            return Err("cannot refresh while tailing; 'stop' first".to_string());
        }
        let report = (self.detect)();
        let mut messages = vec![format!(
            "detected {} instance(s)",
            report.instances.len()
        )];
        for error in &report.errors {
            messages.push(format!("warning: {}", error));
        }
        self.set_instances(report.instances);
        Ok(CommandResult {
            messages,
            quit: false,
        })
    }

    fn cmd_levels(&mut self, names: &[String]) -> Result<CommandResult, String> {
        if names.is_empty() {
            self.update_pipeline(|p| PipelineSnapshot {
                levels: LevelFilter::default(),
                ..p.clone()
            });
            return Ok(CommandResult::message("level filter cleared (showing all)"));
        }
        let filter = LevelFilter::from_names(names.iter().map(String::as_str))?;
        let description = filter.describe();
        self.update_pipeline(|p| PipelineSnapshot {
            levels: filter.clone(),
            ..p.clone()
        });
        Ok(CommandResult::message(format!("showing levels: {}", description)))
    }

    fn cmd_filter_add(&mut self, token: &str) -> Result<CommandResult, String> {
        let filter = RegexFilter::parse_token(token).map_err(|e| e.to_string())?;
        let description = filter.describe();
        self.update_pipeline(|p| PipelineSnapshot {
            regex: p.regex.with(filter.clone()),
            ..p.clone()
        });
        Ok(CommandResult::message(format!("filter added: {}", description)))
    }

    fn cmd_filter_show(&self) -> CommandResult {
        let snapshot = self.snapshot();
        if snapshot.regex.is_empty() {
            return CommandResult::message("no regex filters active");
        }
        CommandResult {
            messages: snapshot.regex.describe(),
            quit: false,
        }
    }

    fn cmd_time_bound(
        &mut self,
        since: Option<&str>,
        until: Option<&str>,
    ) -> Result<CommandResult, String> {
        let now = Utc::now();
        let since = since
            .map(|spec| parse_time_spec(spec, now))
            .transpose()
            .map_err(|e| e.to_string())?;
        let until = until
            .map(|spec| parse_time_spec(spec, now))
            .transpose()
            .map_err(|e| e.to_string())?;
        if let (Some(s), Some(u)) = (since, until)
            && s > u
        {
            return Err("'between' bounds are reversed".to_string());
        }

        self.update_pipeline(|p| {
            let mut time = p.time;
            if since.is_some() {
                time.since = since;
            }
            if until.is_some() {
                time.until = until;
            }
            PipelineSnapshot {
                time,
                ..p.clone()
            }
        });
        Ok(CommandResult::message(format!(
            "time filter: {}",
            self.snapshot().time.describe()
        )))
    }

    fn cmd_stats(&self) -> CommandResult {
        let stats = self.stats.lock().unwrap();
        match stats.durations.summary() {
            None => CommandResult::message("no duration samples yet"),
            Some(s) => CommandResult {
                messages: vec![
                    format!("duration samples: {}", s.count),
                    format!(
                        "avg {:.1} ms   p50 {:.1} ms   p95 {:.1} ms   p99 {:.1} ms   max {:.1} ms",
                        s.avg_ms, s.p50_ms, s.p95_ms, s.p99_ms, s.max_ms
                    ),
                ],
                quit: false,
            },
        }
    }

    fn cmd_errors(&mut self, sub: ErrorsCommand) -> Result<CommandResult, String> {
        let now = Utc::now();
        let mut stats = self.stats.lock().unwrap();
        let result = match sub {
            ErrorsCommand::Summary => {
                let errors = &stats.errors;
                if errors.total() == 0 {
                    CommandResult::message("no errors recorded")
                } else {
                    let mut messages = vec![format!("errors recorded: {}", errors.total())];
                    for (level, count) in errors.by_level() {
                        messages.push(format!("  {:<8} {}", level.name(), count));
                    }
                    if !errors.by_code().is_empty() {
                        messages.push("by SQLSTATE:".to_string());
                        let mut codes: Vec<_> = errors.by_code().iter().collect();
                        codes.sort_by(|a, b| b.1.count.cmp(&a.1.count));
                        for (code, stat) in codes.into_iter().take(10) {
                            let name = crate::analyze::errors::sqlstate_name(code)
                                .unwrap_or("");
                            messages.push(format!("  {} {:<28} {}", code, name, stat.count));
                        }
                    }
                    CommandResult {
                        messages,
                        quit: false,
                    }
                }
            }
            ErrorsCommand::Trend => {
                let trend = stats.errors.trend(now);
                let nonzero: Vec<_> = trend.iter().filter(|&&(_, c)| c > 0).collect();
                if nonzero.is_empty() {
                    CommandResult::message("no errors in the last hour")
                } else {
                    let messages = nonzero
                        .into_iter()
                        .map(|&(minute, count)| {
                            format!("{}  {:<40} {}", minute.format("%H:%M"), bar(count), count)
                        })
                        .collect();
                    CommandResult {
                        messages,
                        quit: false,
                    }
                }
            }
            ErrorsCommand::Live => {
                if self.tail.is_none() {
                    return Err("not tailing; 'errors --live' needs an active tail".to_string());
                }
                let errors = &stats.errors;
                CommandResult {
                    messages: vec![format!(
                        "error rate: {:.1}/min (1m)   {:.1}/min (5m)   {:.1}/min (15m)",
                        errors.rate_per_minute(now, 1),
                        errors.rate_per_minute(now, 5),
                        errors.rate_per_minute(now, 15)
                    )],
                    quit: false,
                }
            }
            ErrorsCommand::Code(code) => {
                let errors = &stats.errors;
                match errors.by_code().get(&code) {
                    None => CommandResult::message(format!("no errors with SQLSTATE {}", code)),
                    Some(stat) => {
                        let mut messages = vec![format!(
                            "SQLSTATE {} {}: {} occurrence(s)",
                            code,
                            crate::analyze::errors::sqlstate_name(&code).unwrap_or(""),
                            stat.count
                        )];
                        messages.extend(
                            errors
                                .recent()
                                .filter(|e| e.sqlstate.as_deref() == Some(&code))
                                .rev()
                                .take(5)
                                .map(|e| {
                                    format!(
                                        "  {} {}",
                                        e.timestamp.format("%H:%M:%S"),
                                        e.excerpt
                                    )
                                }),
                        );
                        CommandResult {
                            messages,
                            quit: false,
                        }
                    }
                }
            }
            ErrorsCommand::Since(spec) => {
                let since = parse_time_spec(&spec, now).map_err(|e| e.to_string())?;
                let count = stats.errors.events_since(since).count();
                CommandResult::message(format!(
                    "{} error(s) since {}",
                    count,
                    since.format("%Y-%m-%d %H:%M:%S")
                ))
            }
            ErrorsCommand::Clear => {
                stats.errors.clear();
                stats.durations.clear();
                CommandResult::message("error statistics cleared")
            }
        };
        Ok(result)
    }

    fn cmd_notify(&mut self, sub: NotifyCommand) -> Result<CommandResult, String> {
        let result = match sub {
            NotifyCommand::Status => {
                let config = self.snapshot().notify.clone();
                let mut messages = vec![
                    format!("notifications: {}", if config.enabled { "on" } else { "off" }),
                    format!("rate limit: {}/min", config.effective_rate_limit()),
                    format!(
                        "quiet hours: {}",
                        config
                            .quiet_hours
                            .map(|q| q.describe())
                            .unwrap_or_else(|| "none".to_string())
                    ),
                ];
                if config.rules.is_empty() {
                    messages.push("rules: none".to_string());
                } else {
                    messages.push("rules:".to_string());
                    for (i, rule) in config.rules.iter().enumerate() {
                        messages.push(format!("  {}. {}", i + 1, rule.describe()));
                    }
                }
                CommandResult {
                    messages,
                    quit: false,
                }
            }
            NotifyCommand::On => {
                self.update_notify(|n| n.enabled = true);
                CommandResult::message("notifications on")
            }
            NotifyCommand::Off => {
                self.update_notify(|n| n.enabled = false);
                CommandResult::message("notifications off")
            }
            NotifyCommand::Levels(names) => {
                let filter = LevelFilter::from_names(names.iter().map(String::as_str))?;
                let levels: std::collections::BTreeSet<LogLevel> = LogLevel::ALL
                    .into_iter()
                    .filter(|&l| filter.allows(l) && !filter.is_empty())
                    .collect();
                self.update_notify(move |n| n.rules.push(NotificationRule::Level(levels.clone())));
                CommandResult::message("level rule added")
            }
            NotifyCommand::Pattern(token) => {
                let rule = PatternRule::parse_token(&token)?;
                let description = rule.describe();
                self.update_notify(move |n| n.rules.push(NotificationRule::Pattern(rule.clone())));
                CommandResult::message(format!("pattern rule added: {}", description))
            }
            NotifyCommand::Rate(per_minute) => {
                if per_minute == 0 {
                    return Err("rate threshold must be positive".to_string());
                }
                self.update_notify(move |n| n.rules.push(NotificationRule::Rate(per_minute)));
                CommandResult::message(format!("rate rule added: {}/min", per_minute))
            }
            NotifyCommand::Slow(threshold_ms) => {
                if threshold_ms == 0 {
                    return Err("slow threshold must be positive".to_string());
                }
                self.update_notify(move |n| n.rules.push(NotificationRule::Slow(threshold_ms)));
                CommandResult::message(format!("slow rule added: {} ms", threshold_ms))
            }
            NotifyCommand::Quiet(window) => {
                let quiet = QuietHours::parse(&window)?;
                self.update_notify(move |n| n.quiet_hours = Some(quiet));
                CommandResult::message(format!("quiet hours: {}", quiet.describe()))
            }
            NotifyCommand::Clear => {
                self.update_notify(|n| {
                    n.rules.clear();
                    n.quiet_hours = None;
                });
                CommandResult::message("notification rules cleared")
            }
            NotifyCommand::Test => {
                let payload = crate::notify::Notification {
                    title: "pgtail".to_string(),
                    body: "test notification".to_string(),
                    subtitle: None,
                };
                match self.notifier.notify(&payload) {
                    Ok(()) => CommandResult::message("test notification sent"),
                    Err(e) => return Err(format!("notifier failed: {}", e)),
                }
            }
        };
        Ok(result)
    }

    fn cmd_enable(&mut self, id: &str) -> Result<CommandResult, String> {
        let index: usize = id
            .parse()
            .map_err(|_| format!("not an instance id: {}", id))?;
        let instance = self
            .instances
            .get(index)
            .ok_or_else(|| format!("unknown instance id: {}", index))?;
        enable_logging_collector(&instance.data_dir).map_err(|e| e.to_string())?;
        Ok(CommandResult {
            messages: vec![
                format!(
                    "logging collector enabled in {}",
                    instance.data_dir.join("postgresql.conf").display()
                ),
                "restart PostgreSQL, then 'refresh' to pick up the log directory".to_string(),
            ],
            quit: false,
        })
    }

    /// Apply persisted settings onto the session. Each invalid value is
    /// skipped with a returned warning; valid keys still take effect.
    pub fn apply_settings(&mut self, settings: &crate::settings::Settings) -> Vec<String> {
        let mut warnings = Vec::new();
        self.follow_default = settings.default.follow;

        if !settings.default.levels.is_empty() {
            match LevelFilter::from_names(settings.default.levels.iter().map(String::as_str)) {
                Ok(filter) => self.update_pipeline(|p| PipelineSnapshot {
                    levels: filter.clone(),
                    ..p.clone()
                }),
                Err(e) => warnings.push(format!("config default.levels: {}", e)),
            }
        }

        match SlowQueryConfig::new(settings.slow.warn, settings.slow.slow, settings.slow.critical)
        {
            Ok(config) => self.update_pipeline(|p| PipelineSnapshot {
                slow: config,
                ..p.clone()
            }),
            Err(e) => warnings.push(format!("config slow thresholds: {}", e)),
        }

        let mut notify = NotifyConfig {
            enabled: settings.notifications.enabled,
            ..NotifyConfig::default()
        };
        if !settings.notifications.levels.is_empty() {
            match LevelFilter::from_names(settings.notifications.levels.iter().map(String::as_str))
            {
                Ok(filter) => {
                    let levels = LogLevel::ALL
                        .into_iter()
                        .filter(|&l| filter.allows(l) && !filter.is_empty())
                        .collect();
                    notify.rules.push(NotificationRule::Level(levels));
                }
                Err(e) => warnings.push(format!("config notifications.levels: {}", e)),
            }
        }
        for token in &settings.notifications.patterns {
            match PatternRule::parse_token(token) {
                Ok(rule) => notify.rules.push(NotificationRule::Pattern(rule)),
                Err(e) => warnings.push(format!("config notifications.patterns: {}", e)),
            }
        }
        if settings.notifications.error_rate > 0 {
            notify
                .rules
                .push(NotificationRule::Rate(settings.notifications.error_rate));
        }
        if settings.notifications.slow_query_ms > 0 {
            notify
                .rules
                .push(NotificationRule::Slow(settings.notifications.slow_query_ms));
        }
        if !settings.notifications.quiet_hours.is_empty() {
            match QuietHours::parse(&settings.notifications.quiet_hours) {
                Ok(quiet) => notify.quiet_hours = Some(quiet),
                Err(e) => warnings.push(format!("config notifications.quiet_hours: {}", e)),
            }
        }
        self.update_pipeline(|p| PipelineSnapshot {
            notify: notify.clone(),
            ..p.clone()
        });

        warnings
    }

    /// Swap in a new pipeline snapshot built from the current one.
    fn update_pipeline<F>(&self, build: F)
    where
        F: FnOnce(&PipelineSnapshot) -> PipelineSnapshot,
    {
        let mut guard = self.pipeline.lock().unwrap();
        let next = build(&guard);
        *guard = Arc::new(next);
    }

    fn update_notify<F>(&self, mutate: F)
    where
        F: Fn(&mut NotifyConfig),
    {
        self.update_pipeline(|p| {
            let mut notify = p.notify.clone();
            mutate(&mut notify);
            PipelineSnapshot {
                notify,
                ..p.clone()
            }
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_tail();
    }
}

/// The consumer side of a tail: parse, filter, record, notify, render.
fn pipeline_worker(
    rx: Receiver<TailEvent>,
    cancel: Arc<AtomicBool>,
    pipeline: Arc<Mutex<Arc<PipelineSnapshot>>>,
    stats: Arc<Mutex<TailStats>>,
    notifier: Arc<dyn Notifier>,
    mut sink: Box<dyn TailSink>,
    subtitle: String,
) {
    let mut parser = EntryParser::new();
    let matcher = DurationMatcher::new();
    let mut engine = NotifyEngine::new();

    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        let event = match rx.recv() {
            Ok(event) => event,
            Err(_) => break,
        };
        match event {
            TailEvent::Line(line) => {
                if let Some(entry) = parser.push_line(&line) {
                    process_entry(
                        &entry, &matcher, &mut engine, &pipeline, &stats, &notifier, &mut sink,
                        &subtitle,
                    );
                }
            }
            TailEvent::Idle => {
                if let Some(entry) = parser.flush() {
                    process_entry(
                        &entry, &matcher, &mut engine, &pipeline, &stats, &notifier, &mut sink,
                        &subtitle,
                    );
                }
            }
            TailEvent::Notice(message) => sink.notice(&message),
        }
    }
    debug!("pipeline worker for {} stopped", subtitle);
}

/// Run one entry through the pipeline: time -> level -> regex, then
/// slow-query classification, statistics, notification, render.
#[allow(clippy::too_many_arguments)]
fn process_entry(
    entry: &LogEntry,
    matcher: &DurationMatcher,
    engine: &mut NotifyEngine,
    pipeline: &Arc<Mutex<Arc<PipelineSnapshot>>>,
    stats: &Arc<Mutex<TailStats>>,
    notifier: &Arc<dyn Notifier>,
    sink: &mut Box<dyn TailSink>,
    subtitle: &str,
) {
    let snapshot = pipeline.lock().unwrap().clone();

    if !snapshot.time.matches(entry.timestamp) {
        return;
    }
    if !snapshot.levels.allows(entry.level) {
        return;
    }
    let text = entry.filter_text();
    if !snapshot.regex.should_show(text) {
        return;
    }

    let duration_ms = matcher.extract_ms(text);
    let slow = duration_ms.and_then(|ms| snapshot.slow.classify(ms));

    // Entries with an unparseable timestamp are stamped at receipt time
    // for statistics and rate purposes.
    let ts = if entry.timestamp == chrono::DateTime::UNIX_EPOCH {
        Utc::now()
    } else {
        entry.timestamp
    };

    let rate = {
        let mut stats = stats.lock().unwrap();
        if let Some(ms) = duration_ms {
            stats.durations.record(ms);
        }
        stats.errors.record(ts, entry.level, text);
        stats.errors.rate_per_minute(ts, 1)
    };

    engine.evaluate(
        &snapshot.notify,
        &NotifyContext {
            timestamp: ts,
            level: entry.level,
            text,
            duration_ms,
            error_rate_per_min: rate,
            subtitle: Some(subtitle),
        },
        notifier.as_ref(),
    );

    sink.entry(entry, slow, snapshot.regex.is_highlighted(text));
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        warn!("{} did not stop within {:?}; abandoning", what, timeout);
    }
}

fn bar(count: u32) -> String {
    "#".repeat((count as usize).min(40))
}

fn help_text() -> Vec<String> {
    [
        "list                           detected PostgreSQL instances",
        "tail <id|path> [--since T] [--from-start]",
        "                               follow an instance's log (or a file/dir)",
        "stop                           stop the active tail",
        "refresh                        re-run instance detection",
        "levels [L…]                    show only these levels (empty = all)",
        "filter [+|-|&]/re/[c]          add include/exclude/AND regex ('c' = case-sensitive)",
        "filter clear                   drop all regex filters",
        "highlight /re/[c]              mark matching lines without hiding others",
        "since T | until T | between T T",
        "                               time window (5m, 14:30, 2024-01-15T14:30:00)",
        "time [clear]                   show or clear the time window",
        "slow <warn> <slow> <crit>      slow-query thresholds in ms ('slow off' disables)",
        "stats                          duration percentiles for this session",
        "errors [--trend|--live|--code C|--since T|clear]",
        "                               error statistics",
        "notify on|off|level L…|pattern /re/[i]|rate N|slow MS|quiet HH:MM-HH:MM|clear|test",
        "enable <id>                    turn on logging_collector for an instance",
        "quit                           exit",
    ]
    .map(str::to_string)
    .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::DetectionSource;
    use crate::notify::Notification;
    use std::io::Write;

    struct NullNotifier;
    impl Notifier for NullNotifier {
        fn notify(&self, _n: &Notification) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl TailSink for SharedSink {
        fn entry(&mut self, entry: &LogEntry, slow: Option<SlowClass>, _highlighted: bool) {
            let tag = slow.map(|s| format!(" [{}]", s.name())).unwrap_or_default();
            self.lines.lock().unwrap().push(format!("{}{}", entry.raw, tag));
        }
        fn notice(&mut self, message: &str) {
            self.lines.lock().unwrap().push(format!("! {}", message));
        }
    }

    fn session_with_sink() -> (Session, Arc<Mutex<Vec<String>>>) {
        let sink = SharedSink::default();
        let lines = sink.lines.clone();
        let session = Session::new(
            Arc::new(NullNotifier),
            Box::new(move || Box::new(sink.clone())),
        )
        .with_poll_interval(Duration::from_millis(20));
        (session, lines)
    }

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn test_empty_and_unknown_input() {
        let (mut session, _) = session_with_sink();
        assert!(session.execute("").messages.is_empty());
        let result = session.execute("lst");
        assert!(result.messages[0].contains("did you mean 'list'"));
    }

    #[test]
    fn test_list_without_instances() {
        let (mut session, _) = session_with_sink();
        let result = session.execute("list");
        assert!(result.messages[0].contains("no PostgreSQL instances"));
    }

    #[test]
    fn test_levels_command_updates_snapshot() {
        let (mut session, _) = session_with_sink();
        session.execute("levels error fatal");
        let snapshot = session.snapshot();
        assert!(snapshot.levels.allows(LogLevel::Error));
        assert!(!snapshot.levels.allows(LogLevel::Log));

        // Unknown level leaves state unchanged.
        let before = session.snapshot();
        let result = session.execute("levels bogus");
        assert!(result.messages[0].contains("unknown level"));
        assert_eq!(session.snapshot().levels, before.levels);

        session.execute("levels");
        assert!(session.snapshot().levels.is_empty());
    }

    #[test]
    fn test_filter_commands() {
        let (mut session, _) = session_with_sink();
        session.execute("filter +/dup/");
        session.execute("filter -/noise/");
        let snapshot = session.snapshot();
        assert_eq!(snapshot.regex.includes.len(), 1);
        assert_eq!(snapshot.regex.excludes.len(), 1);

        let result = session.execute("filter /(bad/");
        assert!(result.messages[0].contains("invalid regex"));

        session.execute("filter clear");
        assert!(session.snapshot().regex.is_empty());
    }

    #[test]
    fn test_time_commands() {
        let (mut session, _) = session_with_sink();
        session.execute("since 5m");
        assert!(session.snapshot().time.since.is_some());
        session.execute("until 14:30");
        assert!(session.snapshot().time.until.is_some());

        let result = session.execute("since tomorrow-ish");
        assert!(result.messages[0].contains("cannot parse time"));

        session.execute("time clear");
        assert!(session.snapshot().time.is_empty());
    }

    #[test]
    fn test_slow_command_validation() {
        let (mut session, _) = session_with_sink();
        let result = session.execute("slow 500 100 1000");
        assert!(result.messages[0].contains("ascend"));

        session.execute("slow 10 20 30");
        let slow = session.snapshot().slow;
        assert_eq!((slow.warning_ms, slow.slow_ms, slow.critical_ms), (10, 20, 30));

        session.execute("slow off");
        assert!(!session.snapshot().slow.enabled);
    }

    #[test]
    fn test_notify_commands() {
        let (mut session, _) = session_with_sink();
        session.execute("notify on");
        session.execute("notify level FATAL");
        session.execute("notify pattern /deadlock/i");
        session.execute("notify rate 20");
        session.execute("notify quiet 22:00-07:00");

        let config = session.snapshot().notify.clone();
        assert!(config.enabled);
        assert_eq!(config.rules.len(), 3);
        assert!(config.quiet_hours.is_some());

        session.execute("notify clear");
        let config = session.snapshot().notify.clone();
        assert!(config.rules.is_empty());
        assert!(config.quiet_hours.is_none());

        let result = session.execute("notify test");
        assert!(result.messages[0].contains("test notification sent"));
    }

    #[test]
    fn test_quit_stops_and_quits() {
        let (mut session, _) = session_with_sink();
        let result = session.execute("quit");
        assert!(result.quit);
    }

    #[test]
    fn test_stop_without_tail() {
        let (mut session, _) = session_with_sink();
        let result = session.execute("stop");
        assert_eq!(result.messages[0], "no tail active");
    }

    #[test]
    fn test_refresh_replaces_instances() {
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("PG_VERSION"), "16\n").unwrap();
        let data_dir = data.path().to_path_buf();

        let (session, _) = session_with_sink();
        let mut session = session.with_detector(Box::new(move || DetectionReport {
            instances: vec![Instance {
                data_dir: data_dir.clone(),
                version: "16".to_string(),
                port: 5432,
                running: false,
                log_dir: None,
                log_pattern: String::new(),
                source: DetectionSource::EnvVar,
            }],
            errors: Vec::new(),
        }));

        let result = session.execute("refresh");
        assert!(result.messages[0].contains("1 instance"));
        assert_eq!(session.instances().len(), 1);

        let listing = session.execute("list");
        assert!(listing.messages[0].contains("PostgreSQL 16"));
    }

    #[test]
    fn test_tail_pipeline_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        std::fs::write(&log, "").unwrap();

        let (mut session, lines) = session_with_sink();
        session.execute("levels error");
        session.execute("filter +/duplicate/");

        let result = session.execute(&format!("tail {}", log.display()));
        assert!(result.messages.last().unwrap().contains("tailing"));
        assert!(session.is_tailing());

        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(f, "2024-01-15 10:00:00 UTC [42] ERROR:  duplicate key").unwrap();
        writeln!(f, "2024-01-15 10:00:01 UTC [42] ERROR:  unrelated failure").unwrap();
        writeln!(f, "2024-01-15 10:00:02 UTC [42] LOG:  duplicate but wrong level").unwrap();
        drop(f);

        wait_for("filtered entry", || {
            lines.lock().unwrap().iter().any(|l| l.contains("duplicate key"))
        });
        let seen = lines.lock().unwrap().clone();
        assert!(seen.iter().all(|l| !l.contains("unrelated")));
        assert!(seen.iter().all(|l| !l.contains("wrong level")));

        // The surviving ERROR was recorded in the error stats.
        wait_for("error stats", || {
            session.stats.lock().unwrap().errors.total() >= 1
        });

        // Removing the include hides new duplicates; excluding hides them too.
        session.execute("filter clear");
        session.execute("filter -/duplicate/");
        let before = lines.lock().unwrap().len();
        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(f, "2024-01-15 10:00:03 UTC [42] ERROR:  duplicate again").unwrap();
        writeln!(f, "2024-01-15 10:00:04 UTC [42] ERROR:  shown now").unwrap();
        drop(f);
        wait_for("post-change entry", || {
            lines.lock().unwrap().iter().any(|l| l.contains("shown now"))
        });
        assert!(
            !lines.lock().unwrap()[before..]
                .iter()
                .any(|l| l.contains("duplicate again"))
        );

        let stopped = session.execute("stop");
        assert_eq!(stopped.messages[0], "stopped");
        assert!(!session.is_tailing());
    }

    #[test]
    fn test_slow_classification_flows_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        std::fs::write(&log, "").unwrap();

        let (mut session, lines) = session_with_sink();
        session.execute("slow 100 500 1000");
        session.execute(&format!("tail {}", log.display()));

        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(
            f,
            "2024-01-15 10:00:00 UTC [42] LOG:  duration: 600.0 ms  statement: SELECT 1"
        )
        .unwrap();
        drop(f);

        wait_for("slow entry", || {
            lines.lock().unwrap().iter().any(|l| l.contains("[slow]"))
        });

        let stats = session.execute("stats");
        assert!(stats.messages[0].contains("duration samples: 1"));
        session.execute("stop");
    }

    #[test]
    fn test_refresh_rejected_while_tailing() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        std::fs::write(&log, "").unwrap();

        let (mut session, _) = session_with_sink();
        session.execute(&format!("tail {}", log.display()));
        let result = session.execute("refresh");
        assert!(result.messages[0].contains("cannot refresh while tailing"));
        session.execute("stop");
    }

    #[test]
    fn test_stop_within_two_poll_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        std::fs::write(&log, "").unwrap();

        let (mut session, _) = session_with_sink();
        session.execute(&format!("tail {}", log.display()));
        assert!(session.is_tailing());

        let started = Instant::now();
        session.execute("stop");
        assert!(!session.is_tailing());
        // Poll interval is 20 ms in tests; the contract is 2x the interval
        // with scheduling slack.
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_errors_live_requires_tail() {
        let (mut session, _) = session_with_sink();
        let result = session.execute("errors --live");
        assert!(result.messages[0].contains("not tailing"));
    }

    #[test]
    fn test_tail_unknown_id() {
        let (mut session, _) = session_with_sink();
        let result = session.execute("tail 7");
        assert!(result.messages[0].contains("unknown instance id"));
    }

    #[test]
    fn test_apply_settings() {
        let (mut session, _) = session_with_sink();
        let settings = crate::settings::Settings::from_toml_str(
            r#"
            [default]
            levels = ["ERROR"]
            follow = false

            [slow]
            warn = 10
            slow = 20
            critical = 30

            [notifications]
            enabled = true
            levels = ["FATAL"]
            patterns = ["/deadlock/i", "not-a-token"]
            error_rate = 5
            quiet_hours = "22:00-07:00"
            "#,
        )
        .unwrap();

        let warnings = session.apply_settings(&settings);
        // Only the malformed pattern warns; everything else applies.
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("patterns"));

        let snapshot = session.snapshot();
        assert!(snapshot.levels.allows(LogLevel::Error));
        assert!(!snapshot.levels.allows(LogLevel::Log));
        assert_eq!(snapshot.slow.warning_ms, 10);
        assert!(snapshot.notify.enabled);
        assert_eq!(snapshot.notify.rules.len(), 3);
        assert!(snapshot.notify.quiet_hours.is_some());
    }

    #[test]
    fn test_errors_clear() {
        let (mut session, _) = session_with_sink();
        session
            .stats
            .lock()
            .unwrap()
            .errors
            .record(Utc::now(), LogLevel::Error, "boom");
        session.execute("errors clear");
        assert_eq!(session.stats.lock().unwrap().errors.total(), 0);
    }
}
