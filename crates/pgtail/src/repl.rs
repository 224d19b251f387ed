//! rustyline glue: tab completion and the shared external printer that
//! lets the tail worker write above the active prompt.

use std::sync::{Arc, Mutex};

use rustyline::completion::Completer;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, ExternalPrinter, Helper};

use pgtail_core::analyze::SlowClass;
use pgtail_core::notify::{Notification, Notifier};
use pgtail_core::parse::LogEntry;
use pgtail_core::session::TailSink;
use pgtail_core::session::command;

use crate::render::{RenderConfig, render_entry};

/// Completion over command verbs and per-command keywords.
pub struct ReplHelper;

impl Completer for ReplHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let (start, candidates) = command::completions(&line[..pos]);
        Ok((start, candidates))
    }
}

impl Hinter for ReplHelper {
    type Hint = String;
}

impl Highlighter for ReplHelper {}
impl Validator for ReplHelper {}
impl Helper for ReplHelper {}

/// Clonable handle over the editor's external printer. Falls back to
/// stdout when no printer is available (plain pipes, tests).
#[derive(Clone)]
pub struct SharedPrinter {
    inner: Arc<Mutex<Option<Box<dyn ExternalPrinter + Send>>>>,
}

impl SharedPrinter {
    pub fn new(printer: Option<Box<dyn ExternalPrinter + Send>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(printer)),
        }
    }

    pub fn print(&self, message: String) {
        let mut guard = self.inner.lock().unwrap();
        match guard.as_mut() {
            Some(printer) => {
                if printer.print(message.clone()).is_err() {
                    println!("{}", message);
                }
            }
            None => println!("{}", message),
        }
    }
}

/// Tail sink rendering entries through the shared printer.
pub struct PrinterSink {
    printer: SharedPrinter,
    config: RenderConfig,
}

impl PrinterSink {
    pub fn new(printer: SharedPrinter, config: RenderConfig) -> Self {
        Self { printer, config }
    }
}

impl TailSink for PrinterSink {
    fn entry(&mut self, entry: &LogEntry, slow: Option<SlowClass>, highlighted: bool) {
        self.printer
            .print(render_entry(&self.config, entry, slow, highlighted));
    }

    fn notice(&mut self, message: &str) {
        self.printer.print(format!("[pgtail] {}", message));
    }
}

/// Console notifier: prints the payload above the prompt with a terminal
/// bell. Desktop integration would implement the same trait.
pub struct ConsoleNotifier {
    printer: SharedPrinter,
}

impl ConsoleNotifier {
    pub fn new(printer: SharedPrinter) -> Self {
        Self { printer }
    }
}

impl Notifier for ConsoleNotifier {
    fn notify(&self, notification: &Notification) -> std::io::Result<()> {
        let subtitle = notification
            .subtitle
            .as_deref()
            .map(|s| format!(" ({})", s))
            .unwrap_or_default();
        self.printer.print(format!(
            "\x07[notify] {}{}: {}",
            notification.title, subtitle, notification.body
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completer_completes_verbs() {
        let helper = ReplHelper;
        let history = rustyline::history::DefaultHistory::new();
        let ctx = Context::new(&history);
        let (start, words) = helper.complete("ta", 2, &ctx).unwrap();
        assert_eq!(start, 0);
        assert_eq!(words, vec!["tail"]);
    }

    #[test]
    fn test_completer_respects_cursor_position() {
        let helper = ReplHelper;
        let history = rustyline::history::DefaultHistory::new();
        let ctx = Context::new(&history);
        // Cursor after "err" even though the line continues.
        let (_, words) = helper.complete("errors --live", 3, &ctx).unwrap();
        assert_eq!(words, vec!["errors"]);
    }

    #[test]
    fn test_shared_printer_without_backend() {
        let printer = SharedPrinter::new(None);
        // Must not panic; output goes to stdout.
        printer.print("hello".to_string());
    }
}
