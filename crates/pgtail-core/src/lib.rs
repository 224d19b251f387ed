//! pgtail-core — engine for the pgtail interactive PostgreSQL log tailer.
//!
//! Provides:
//! - `instance` / `detect` — PostgreSQL instance discovery and config reading
//! - `tail` — rotation-aware polled log following
//! - `parse` — structured log entries from stderr-format lines
//! - `filter` — level, regex, and time-window filters
//! - `analyze` — slow-query classification and error statistics
//! - `notify` — notification rules, suppression, and dispatch
//! - `session` — REPL state, command grammar, and the tail pipeline
//! - `settings` — typed view of the persisted TOML configuration
//!
//! Terminal concerns (prompt, rendering, desktop notifications) live in
//! the `pgtail` binary behind the `TailSink` and `Notifier` traits.

pub mod analyze;
pub mod detect;
pub mod filter;
pub mod instance;
pub mod notify;
pub mod parse;
pub mod session;
pub mod settings;
pub mod tail;
