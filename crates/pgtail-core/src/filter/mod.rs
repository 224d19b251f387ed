//! Entry filters: severity level set, regex include/exclude/AND
//! composition, and time window.
//!
//! Filter values are immutable snapshots; commands build a new value and
//! swap it in, so the tail worker can read them without coordination.

pub mod level;
pub mod regex;
pub mod time;

pub use level::LevelFilter;
pub use regex::{FilterKind, RegexFilter, RegexState};
pub use time::{TimeFilter, TimeSpecError, format_time_of_day, parse_time_spec};
