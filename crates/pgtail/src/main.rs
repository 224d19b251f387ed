//! pgtail - interactive PostgreSQL log tailer.
//!
//! Detects PostgreSQL instances on the host, then drops into a REPL that
//! can follow their log files with filtering, slow-query detection, error
//! statistics, and notifications.

mod render;
mod repl;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rustyline::Editor;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use tracing::{Level, debug, warn};
use tracing_subscriber::EnvFilter;

use pgtail_core::detect::Detector;
use pgtail_core::session::Session;
use pgtail_core::settings::Settings;

use render::RenderConfig;
use repl::{ConsoleNotifier, PrinterSink, ReplHelper, SharedPrinter};

/// Interactive PostgreSQL log tailer.
#[derive(Parser)]
#[command(name = "pgtail", about = "Interactive PostgreSQL log tailer", version)]
struct Args {
    /// Instance id or log path to tail immediately.
    #[arg(value_name = "ID|PATH")]
    target: Option<String>,

    /// Start reading from the beginning of the log file.
    #[arg(long)]
    from_start: bool,

    /// Only show entries at or after this time (5m, 14:30, ISO 8601).
    #[arg(long, value_name = "TIME")]
    since: Option<String>,

    /// Configuration file path (default: <config dir>/pgtail/config.toml).
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log file poll interval in milliseconds.
    #[arg(long, default_value = "100", value_name = "MS")]
    poll_interval: u64,

    /// Disable colored output (NO_COLOR is also honored).
    #[arg(long)]
    no_color: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only log errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber on stderr so diagnostics never
/// interleave with tailed log lines.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("pgtail={}", level).parse().unwrap())
        .add_directive(format!("pgtail_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Configuration directory: `$XDG_CONFIG_HOME/pgtail`, `%APPDATA%\pgtail`
/// on Windows, `~/.config/pgtail` otherwise.
fn config_dir() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("pgtail"));
    }
    #[cfg(windows)]
    if let Some(appdata) = std::env::var_os("APPDATA").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(appdata).join("pgtail"));
    }
    home::home_dir().map(|h| h.join(".config").join("pgtail"))
}

fn load_settings(explicit: Option<&PathBuf>) -> Settings {
    let path = explicit
        .cloned()
        .or_else(|| config_dir().map(|d| d.join("config.toml")));
    let Some(path) = path else {
        return Settings::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => match Settings::from_toml_str(&text) {
            Ok(settings) => {
                debug!("loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                warn!("ignoring {}: {}", path.display(), e);
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

fn color_enabled(no_color_flag: bool) -> bool {
    if no_color_flag {
        return false;
    }
    // NO_COLOR convention: any non-empty value disables color.
    std::env::var_os("NO_COLOR").is_none_or(|v| v.is_empty())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let settings = load_settings(args.config.as_ref());

    let mut editor: Editor<ReplHelper, DefaultHistory> = match Editor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("pgtail: cannot initialize terminal: {}", e);
            std::process::exit(1);
        }
    };
    editor.set_helper(Some(ReplHelper));

    let history_path = config_dir().map(|d| d.join("history"));
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    let printer = SharedPrinter::new(
        editor
            .create_external_printer()
            .ok()
            .map(|p| Box::new(p) as _),
    );

    let render_config = RenderConfig {
        color: color_enabled(args.no_color),
        timestamp_format: settings.display.timestamp_format.clone(),
        show_pid: settings.display.show_pid,
        show_level: settings.display.show_level,
    };

    let notifier = Arc::new(ConsoleNotifier::new(printer.clone()));
    let sink_printer = printer.clone();
    let sink_config = render_config.clone();
    let mut session = Session::new(
        notifier,
        Box::new(move || Box::new(PrinterSink::new(sink_printer.clone(), sink_config.clone()))),
    )
    .with_poll_interval(Duration::from_millis(args.poll_interval.max(10)));

    for warning in session.apply_settings(&settings) {
        warn!("{}", warning);
    }

    println!("pgtail {} - scanning for PostgreSQL instances...", env!("CARGO_PKG_VERSION"));
    let report = Detector::new().detect();
    for error in &report.errors {
        warn!("{}", error);
    }
    session.set_instances(report.instances);
    for message in session.execute("list").messages {
        println!("{}", message);
    }
    println!("type 'help' for commands");

    // A target on the command line starts tailing straight away.
    if let Some(target) = &args.target {
        let mut line = format!("tail \"{}\"", target);
        if let Some(since) = &args.since {
            line.push_str(&format!(" --since {}", since));
        }
        if args.from_start {
            line.push_str(" --from-start");
        }
        for message in session.execute(&line).messages {
            println!("{}", message);
        }
    }

    loop {
        let prompt = match session.tail_target() {
            Some(target) => format!("pgtail [{}]> ", target),
            None => "pgtail> ".to_string(),
        };
        match editor.readline(&prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = editor.add_history_entry(line.as_str());
                }
                let result = session.execute(&line);
                for message in result.messages {
                    println!("{}", message);
                }
                if result.quit {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                if session.stop_tail() {
                    println!("stopped");
                } else {
                    println!("interrupt - 'quit' or Ctrl-D to exit");
                }
            }
            Err(ReadlineError::Eof) => {
                session.stop_tail();
                break;
            }
            Err(e) => {
                eprintln!("pgtail: {}", e);
                session.stop_tail();
                std::process::exit(1);
            }
        }
    }

    if let Some(path) = &history_path {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Err(e) = editor.save_history(path) {
            debug!("could not save history: {}", e);
        }
    }
}
