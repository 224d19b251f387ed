//! Severity level filter: a set of allowed levels, empty meaning "all".

use std::collections::BTreeSet;

use crate::parse::LogLevel;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelFilter {
    allowed: BTreeSet<LogLevel>,
}

impl LevelFilter {
    /// Build from level names. Fails on the first unknown name.
    pub fn from_names<'a, I>(names: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut allowed = BTreeSet::new();
        for name in names {
            match LogLevel::parse(name) {
                Some(level) => {
                    allowed.insert(level);
                }
                None => return Err(format!("unknown level: {}", name)),
            }
        }
        Ok(Self { allowed })
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Constant-time-ish membership; an empty set allows everything.
    pub fn allows(&self, level: LogLevel) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&level)
    }

    /// Space-separated level names, or "all" for the empty filter.
    pub fn describe(&self) -> String {
        if self.allowed.is_empty() {
            return "all".to_string();
        }
        self.allowed
            .iter()
            .map(|l| l.name())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_allows_all() {
        let filter = LevelFilter::default();
        for level in LogLevel::ALL {
            assert!(filter.allows(level));
        }
    }

    #[test]
    fn test_set_restricts() {
        let filter = LevelFilter::from_names(["error", "FATAL"]).unwrap();
        assert!(filter.allows(LogLevel::Error));
        assert!(filter.allows(LogLevel::Fatal));
        assert!(!filter.allows(LogLevel::Log));
        assert!(!filter.allows(LogLevel::Warning));
    }

    #[test]
    fn test_unknown_level_rejected() {
        let err = LevelFilter::from_names(["error", "severe"]).unwrap_err();
        assert!(err.contains("severe"));
    }

    #[test]
    fn test_describe() {
        assert_eq!(LevelFilter::default().describe(), "all");
        let filter = LevelFilter::from_names(["fatal", "error"]).unwrap();
        assert_eq!(filter.describe(), "ERROR FATAL");
    }
}
