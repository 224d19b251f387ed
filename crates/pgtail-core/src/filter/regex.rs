//! Regex filters parsed from `/pattern/[c]` command tokens.
//!
//! Patterns are case-insensitive unless suffixed with `c`. Compilation
//! happens once, when the filter is defined.

use regex::{Regex, RegexBuilder};

/// How a pattern participates in the show decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Show lines matching any include.
    Include,
    /// Hide lines matching any exclude.
    Exclude,
    /// Show only lines matching every AND pattern.
    And,
}

impl FilterKind {
    /// Command prefix character for this kind.
    pub fn prefix(self) -> char {
        match self {
            FilterKind::Include => '+',
            FilterKind::Exclude => '-',
            FilterKind::And => '&',
        }
    }
}

/// Error from parsing a `/pattern/[c]` token.
#[derive(Debug)]
pub enum RegexTokenError {
    /// Token is not delimited by `/…/` (optionally suffixed `c`).
    BadSyntax(String),
    /// The pattern failed to compile.
    BadPattern(regex::Error),
}

impl std::fmt::Display for RegexTokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegexTokenError::BadSyntax(token) => {
                write!(f, "expected /pattern/[c], got: {}", token)
            }
            RegexTokenError::BadPattern(e) => write!(f, "invalid regex: {}", e),
        }
    }
}

impl std::error::Error for RegexTokenError {}

/// One compiled filter pattern.
#[derive(Debug, Clone)]
pub struct RegexFilter {
    pub raw: String,
    pub kind: FilterKind,
    pub case_sensitive: bool,
    compiled: Regex,
}

impl RegexFilter {
    /// Parse a command token: optional `+`/`-`/`&` prefix, `/pattern/`
    /// body, optional `c` suffix for case sensitivity. A bare `/pattern/`
    /// is an include.
    pub fn parse_token(token: &str) -> Result<Self, RegexTokenError> {
        let (kind, rest) = match token.chars().next() {
            Some('+') => (FilterKind::Include, &token[1..]),
            Some('-') => (FilterKind::Exclude, &token[1..]),
            Some('&') => (FilterKind::And, &token[1..]),
            _ => (FilterKind::Include, token),
        };
        Self::parse_delimited(rest, kind)
    }

    /// Parse a `/pattern/[c]` body with a fixed kind.
    pub fn parse_delimited(body: &str, kind: FilterKind) -> Result<Self, RegexTokenError> {
        let bad = || RegexTokenError::BadSyntax(body.to_string());

        let rest = body.strip_prefix('/').ok_or_else(bad)?;
        let (pattern, case_sensitive) = if let Some(p) = rest.strip_suffix("/c") {
            (p, true)
        } else if let Some(p) = rest.strip_suffix('/') {
            (p, false)
        } else {
            return Err(bad());
        };
        if pattern.is_empty() {
            return Err(bad());
        }

        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(RegexTokenError::BadPattern)?;
        Ok(Self {
            raw: pattern.to_string(),
            kind,
            case_sensitive,
            compiled,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.compiled.is_match(text)
    }

    /// Token form, e.g. `-/timeout/c`.
    pub fn describe(&self) -> String {
        format!(
            "{}/{}/{}",
            self.kind.prefix(),
            self.raw,
            if self.case_sensitive { "c" } else { "" }
        )
    }
}

/// The session's regex filter state: three disjoint pattern lists plus
/// highlight-only patterns that never hide anything.
#[derive(Debug, Clone, Default)]
pub struct RegexState {
    pub includes: Vec<RegexFilter>,
    pub excludes: Vec<RegexFilter>,
    pub ands: Vec<RegexFilter>,
    pub highlights: Vec<RegexFilter>,
}

impl RegexState {
    /// Add a filter to the list its kind selects. Returns a new state;
    /// the original stays valid for any snapshot still holding it.
    pub fn with(&self, filter: RegexFilter) -> Self {
        let mut next = self.clone();
        match filter.kind {
            FilterKind::Include => next.includes.push(filter),
            FilterKind::Exclude => next.excludes.push(filter),
            FilterKind::And => next.ands.push(filter),
        }
        next
    }

    pub fn with_highlight(&self, filter: RegexFilter) -> Self {
        let mut next = self.clone();
        next.highlights.push(filter);
        next
    }

    pub fn cleared(&self) -> Self {
        Self {
            highlights: self.highlights.clone(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty() && self.ands.is_empty()
    }

    /// The show decision: any include (or none defined), no exclude, and
    /// every AND pattern.
    pub fn should_show(&self, text: &str) -> bool {
        if !self.includes.is_empty() && !self.includes.iter().any(|f| f.is_match(text)) {
            return false;
        }
        if self.excludes.iter().any(|f| f.is_match(text)) {
            return false;
        }
        self.ands.iter().all(|f| f.is_match(text))
    }

    pub fn is_highlighted(&self, text: &str) -> bool {
        self.highlights.iter().any(|f| f.is_match(text))
    }

    /// All active filters in display order.
    pub fn describe(&self) -> Vec<String> {
        self.includes
            .iter()
            .chain(&self.excludes)
            .chain(&self.ands)
            .map(RegexFilter::describe)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(tokens: &[&str]) -> RegexState {
        let mut state = RegexState::default();
        for token in tokens {
            state = state.with(RegexFilter::parse_token(token).unwrap());
        }
        state
    }

    #[test]
    fn test_parse_token_kinds() {
        assert_eq!(
            RegexFilter::parse_token("+/dup/").unwrap().kind,
            FilterKind::Include
        );
        assert_eq!(
            RegexFilter::parse_token("-/dup/").unwrap().kind,
            FilterKind::Exclude
        );
        assert_eq!(
            RegexFilter::parse_token("&/dup/").unwrap().kind,
            FilterKind::And
        );
        assert_eq!(
            RegexFilter::parse_token("/dup/").unwrap().kind,
            FilterKind::Include
        );
    }

    #[test]
    fn test_case_sensitivity_suffix() {
        let insensitive = RegexFilter::parse_token("/Error/").unwrap();
        assert!(insensitive.is_match("ERROR: boom"));
        assert!(insensitive.is_match("error: boom"));

        let sensitive = RegexFilter::parse_token("/Error/c").unwrap();
        assert!(sensitive.is_match("Error: boom"));
        assert!(!sensitive.is_match("ERROR: boom"));
    }

    #[test]
    fn test_parse_rejects_bad_tokens() {
        for token in ["dup", "/dup", "dup/", "//", "+/x", ""] {
            assert!(
                RegexFilter::parse_token(token).is_err(),
                "token {token:?} should fail"
            );
        }
        assert!(matches!(
            RegexFilter::parse_token("/([unclosed/"),
            Err(RegexTokenError::BadPattern(_))
        ));
    }

    #[test]
    fn test_should_show_composition() {
        // No filters: everything shows.
        assert!(RegexState::default().should_show("anything"));

        // Include: only matches show.
        let s = state(&["+/duplicate/"]);
        assert!(s.should_show("duplicate key value"));
        assert!(!s.should_show("connection reset"));

        // Exclude beats include.
        let s = state(&["+/key/", "-/duplicate/"]);
        assert!(s.should_show("foreign key violation"));
        assert!(!s.should_show("duplicate key value"));

        // AND requires every pattern.
        let s = state(&["&/select/", "&/users/"]);
        assert!(s.should_show("select * from users"));
        assert!(!s.should_show("select * from orders"));
    }

    #[test]
    fn test_monotonicity() {
        let texts = ["duplicate key", "slow query", "timeout expired"];
        let base = state(&["+/key|query/"]);
        let shown: Vec<_> = texts.iter().filter(|t| base.should_show(t)).collect();

        // Adding an exclude can only shrink the shown set.
        let narrowed = base.with(RegexFilter::parse_token("-/slow/").unwrap());
        let shown_after: Vec<_> = texts.iter().filter(|t| narrowed.should_show(t)).collect();
        assert!(shown_after.iter().all(|t| shown.contains(t)));
        assert!(shown_after.len() < shown.len());
    }

    #[test]
    fn test_clear_keeps_highlights() {
        let s = state(&["+/x/"])
            .with_highlight(RegexFilter::parse_token("/hot/").unwrap())
            .cleared();
        assert!(s.is_empty());
        assert!(s.is_highlighted("a hot path"));
    }

    #[test]
    fn test_describe_round_trip() {
        let s = state(&["+/a/", "-/b/c", "&/c/"]);
        assert_eq!(s.describe(), vec!["+/a/", "-/b/c", "&/c/"]);
    }
}
