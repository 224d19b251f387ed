//! REPL command grammar.
//!
//! Tokenization is shell-like whitespace splitting with two extensions:
//! double-quoted strings for paths, and `/…/[c]` regex tokens kept intact
//! even when the pattern contains spaces. Unknown verbs get a suggestion
//! based on edit distance.

/// Known command verbs, in help order.
pub const COMMANDS: &[&str] = &[
    "list", "tail", "stop", "refresh", "levels", "filter", "highlight", "since", "until",
    "between", "time", "slow", "stats", "errors", "notify", "enable", "help", "quit", "exit",
];

/// A parsed REPL command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    List,
    Tail {
        target: String,
        since: Option<String>,
        from_start: bool,
    },
    Stop,
    Refresh,
    /// Empty list clears the filter.
    Levels(Vec<String>),
    /// Raw `[+|-|&]/re/[c]` token.
    FilterAdd(String),
    FilterShow,
    FilterClear,
    Highlight(String),
    HighlightClear,
    Since(String),
    Until(String),
    Between(String, String),
    TimeShow,
    TimeClear,
    SlowSet {
        warning: u64,
        slow: u64,
        critical: u64,
    },
    SlowOff,
    SlowShow,
    Stats,
    Errors(ErrorsCommand),
    Notify(NotifyCommand),
    Enable(String),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorsCommand {
    Summary,
    Trend,
    Live,
    Code(String),
    Since(String),
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotifyCommand {
    Status,
    On,
    Off,
    Levels(Vec<String>),
    Pattern(String),
    Rate(u32),
    Slow(u64),
    Quiet(String),
    Clear,
    Test,
}

/// Command parse failure: a one-line diagnostic, optionally a "did you
/// mean" suggestion.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub suggestion: Option<&'static str>,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
        }
    }

    fn usage(usage: &str) -> Self {
        Self::new(format!("usage: {}", usage))
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(s) = self.suggestion {
            write!(f, " (did you mean '{}'?)", s)?;
        }
        Ok(())
    }
}

/// Parse one input line. `Ok(None)` for blank input.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let tokens = tokenize(line);
    let Some((verb, args)) = tokens.split_first() else {
        return Ok(None);
    };

    let command = match verb.as_str() {
        "list" | "ls" => Command::List,
        "tail" => parse_tail(args)?,
        "stop" => Command::Stop,
        "refresh" => Command::Refresh,
        "levels" => Command::Levels(args.to_vec()),
        "filter" => match args {
            [] => Command::FilterShow,
            [one] if one == "clear" => Command::FilterClear,
            [one] => Command::FilterAdd(one.clone()),
            _ => return Err(ParseError::usage("filter [+|-|&]/pattern/[c] | filter clear")),
        },
        "highlight" => match args {
            [one] if one == "clear" => Command::HighlightClear,
            [one] => Command::Highlight(one.clone()),
            _ => return Err(ParseError::usage("highlight /pattern/[c] | highlight clear")),
        },
        "since" => match args {
            [spec] => Command::Since(spec.clone()),
            _ => return Err(ParseError::usage("since <time>")),
        },
        "until" => match args {
            [spec] => Command::Until(spec.clone()),
            _ => return Err(ParseError::usage("until <time>")),
        },
        "between" => match args {
            [from, to] => Command::Between(from.clone(), to.clone()),
            _ => return Err(ParseError::usage("between <from> <to>")),
        },
        "time" => match args {
            [] => Command::TimeShow,
            [one] if one == "clear" => Command::TimeClear,
            _ => return Err(ParseError::usage("time [clear]")),
        },
        "slow" => parse_slow(args)?,
        "stats" => Command::Stats,
        "errors" => parse_errors(args)?,
        "notify" => parse_notify(args)?,
        "enable" => match args {
            [id] => Command::Enable(id.clone()),
            _ => return Err(ParseError::usage("enable <id>")),
        },
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        unknown => {
            return Err(ParseError {
                message: format!("unknown command: {}", unknown),
                suggestion: suggest(unknown),
            });
        }
    };
    Ok(Some(command))
}

fn parse_tail(args: &[String]) -> Result<Command, ParseError> {
    let mut target = None;
    let mut since = None;
    let mut from_start = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--since" => match iter.next() {
                Some(spec) => since = Some(spec.clone()),
                None => return Err(ParseError::usage("tail <id|path> [--since <time>]")),
            },
            "--from-start" => from_start = true,
            _ if target.is_none() => target = Some(arg.clone()),
            other => {
                return Err(ParseError::new(format!("unexpected argument: {}", other)));
            }
        }
    }
    let target =
        target.ok_or_else(|| ParseError::usage("tail <id|path> [--since <time>] [--from-start]"))?;
    Ok(Command::Tail {
        target,
        since,
        from_start,
    })
}

fn parse_slow(args: &[String]) -> Result<Command, ParseError> {
    match args {
        [] => Ok(Command::SlowShow),
        [one] if one == "off" => Ok(Command::SlowOff),
        [w, s, c] => {
            let parse_ms = |arg: &String| {
                arg.parse::<u64>()
                    .map_err(|_| ParseError::new(format!("not a millisecond value: {}", arg)))
            };
            Ok(Command::SlowSet {
                warning: parse_ms(w)?,
                slow: parse_ms(s)?,
                critical: parse_ms(c)?,
            })
        }
        _ => Err(ParseError::usage("slow <warn> <slow> <critical> | slow off")),
    }
}

fn parse_errors(args: &[String]) -> Result<Command, ParseError> {
    let sub = match args {
        [] => ErrorsCommand::Summary,
        [one] if one == "clear" => ErrorsCommand::Clear,
        [one] if one == "--trend" => ErrorsCommand::Trend,
        [one] if one == "--live" => ErrorsCommand::Live,
        [flag, value] if flag == "--code" => ErrorsCommand::Code(value.to_uppercase()),
        [flag, value] if flag == "--since" => ErrorsCommand::Since(value.clone()),
        _ => {
            return Err(ParseError::usage(
                "errors [--trend | --live | --code <C> | --since <time> | clear]",
            ));
        }
    };
    Ok(Command::Errors(sub))
}

fn parse_notify(args: &[String]) -> Result<Command, ParseError> {
    let sub = match args {
        [] => NotifyCommand::Status,
        [one] => match one.as_str() {
            "on" => NotifyCommand::On,
            "off" => NotifyCommand::Off,
            "clear" => NotifyCommand::Clear,
            "test" => NotifyCommand::Test,
            _ => {
                return Err(ParseError::usage(
                    "notify [on|off|level <L…>|pattern /re/[i]|rate <N>|slow <ms>|quiet <HH:MM-HH:MM>|clear|test]",
                ));
            }
        },
        [sub, rest @ ..] => match (sub.as_str(), rest) {
            ("level" | "levels", names) if !names.is_empty() => {
                NotifyCommand::Levels(names.to_vec())
            }
            ("pattern", [token]) => NotifyCommand::Pattern(token.clone()),
            ("rate", [n]) => NotifyCommand::Rate(
                n.parse()
                    .map_err(|_| ParseError::new(format!("not a count: {}", n)))?,
            ),
            ("slow", [ms]) => NotifyCommand::Slow(
                ms.parse()
                    .map_err(|_| ParseError::new(format!("not a millisecond value: {}", ms)))?,
            ),
            ("quiet", [window]) => NotifyCommand::Quiet(window.clone()),
            _ => {
                return Err(ParseError::usage(
                    "notify [on|off|level <L…>|pattern /re/[i]|rate <N>|slow <ms>|quiet <HH:MM-HH:MM>|clear|test]",
                ));
            }
        },
    };
    Ok(Command::Notify(sub))
}

/// Whitespace tokenizer with `"…"` quoting and intact `/…/[c]` regex
/// tokens (spaces allowed between the delimiters).
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut token = String::new();
        if c == '"' {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '"' {
                    break;
                }
                token.push(ch);
            }
            tokens.push(token);
            continue;
        }

        let mut in_regex = false;
        let mut regex_closed = false;
        while let Some(&ch) = chars.peek() {
            if ch.is_whitespace() && !in_regex {
                break;
            }
            chars.next();
            token.push(ch);
            if ch == '/' && !regex_closed {
                if in_regex {
                    in_regex = false;
                    regex_closed = true;
                } else {
                    // Opening delimiter only at the token start, after an
                    // optional +/-/& prefix.
                    let before = &token[..token.len() - 1];
                    if before.is_empty() || matches!(before, "+" | "-" | "&") {
                        in_regex = true;
                    }
                }
            }
        }
        tokens.push(token);
    }

    tokens
}

/// Nearest known verb within edit distance 3.
pub fn suggest(input: &str) -> Option<&'static str> {
    COMMANDS
        .iter()
        .map(|&cmd| (levenshtein(input, cmd), cmd))
        .min()
        .filter(|&(distance, _)| distance <= 3)
        .map(|(_, cmd)| cmd)
}

/// Classic two-row edit distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitute = prev[j] + usize::from(ca != cb);
            row[j + 1] = substitute.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

/// Completion candidates for a partial input line: verbs for the first
/// word, per-verb keywords after that. Returns `(start_offset,
/// candidates)` for the word being completed.
pub fn completions(line: &str) -> (usize, Vec<String>) {
    let word_start = line
        .rfind(char::is_whitespace)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let word = &line[word_start..];
    let head = line[..word_start].trim();

    let candidates: Vec<&str> = if head.is_empty() {
        COMMANDS.to_vec()
    } else {
        match head.split_whitespace().next().unwrap_or("") {
            "errors" => vec!["--trend", "--live", "--code", "--since", "clear"],
            "notify" => vec![
                "on", "off", "level", "pattern", "rate", "slow", "quiet", "clear", "test",
            ],
            "filter" | "highlight" | "time" => vec!["clear"],
            "slow" => vec!["off"],
            "tail" => vec!["--since", "--from-start"],
            "levels" => crate::parse::LogLevel::ALL.map(|l| l.name()).to_vec(),
            _ => Vec::new(),
        }
    };

    let matches = candidates
        .into_iter()
        .filter(|c| c.to_lowercase().starts_with(&word.to_lowercase()))
        .map(str::to_string)
        .collect();
    (word_start, matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_plain() {
        assert_eq!(tokenize("tail 0"), vec!["tail", "0"]);
        assert_eq!(tokenize("  stop  "), vec!["stop"]);
        assert!(tokenize("").is_empty());
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_tokenize_quoted_path() {
        assert_eq!(
            tokenize(r#"tail "/var/log/my postgres/server.log""#),
            vec!["tail", "/var/log/my postgres/server.log"]
        );
    }

    #[test]
    fn test_tokenize_regex_with_spaces() {
        assert_eq!(
            tokenize("filter +/duplicate key/"),
            vec!["filter", "+/duplicate key/"]
        );
        assert_eq!(
            tokenize("filter -/connection reset/c extra"),
            vec!["filter", "-/connection reset/c", "extra"]
        );
        assert_eq!(tokenize("notify pattern /out of memory/i"), vec![
            "notify",
            "pattern",
            "/out of memory/i"
        ]);
    }

    #[test]
    fn test_parse_basic_commands() {
        assert_eq!(parse("list").unwrap(), Some(Command::List));
        assert_eq!(parse("stop").unwrap(), Some(Command::Stop));
        assert_eq!(parse("quit").unwrap(), Some(Command::Quit));
        assert_eq!(parse("exit").unwrap(), Some(Command::Quit));
        assert_eq!(parse("").unwrap(), None);
    }

    #[test]
    fn test_parse_tail() {
        assert_eq!(
            parse("tail 0").unwrap(),
            Some(Command::Tail {
                target: "0".to_string(),
                since: None,
                from_start: false
            })
        );
        assert_eq!(
            parse("tail 1 --since 5m --from-start").unwrap(),
            Some(Command::Tail {
                target: "1".to_string(),
                since: Some("5m".to_string()),
                from_start: true
            })
        );
        assert!(parse("tail").is_err());
        assert!(parse("tail 0 --since").is_err());
    }

    #[test]
    fn test_parse_filter_and_levels() {
        assert_eq!(
            parse("filter +/dup/").unwrap(),
            Some(Command::FilterAdd("+/dup/".to_string()))
        );
        assert_eq!(parse("filter clear").unwrap(), Some(Command::FilterClear));
        assert_eq!(parse("filter").unwrap(), Some(Command::FilterShow));
        assert_eq!(
            parse("levels ERROR FATAL").unwrap(),
            Some(Command::Levels(vec![
                "ERROR".to_string(),
                "FATAL".to_string()
            ]))
        );
        assert_eq!(parse("levels").unwrap(), Some(Command::Levels(Vec::new())));
    }

    #[test]
    fn test_parse_slow() {
        assert_eq!(
            parse("slow 100 500 1000").unwrap(),
            Some(Command::SlowSet {
                warning: 100,
                slow: 500,
                critical: 1000
            })
        );
        assert_eq!(parse("slow off").unwrap(), Some(Command::SlowOff));
        assert_eq!(parse("slow").unwrap(), Some(Command::SlowShow));
        assert!(parse("slow 100 500").is_err());
        assert!(parse("slow a b c").is_err());
    }

    #[test]
    fn test_parse_errors_subcommands() {
        assert_eq!(
            parse("errors").unwrap(),
            Some(Command::Errors(ErrorsCommand::Summary))
        );
        assert_eq!(
            parse("errors --trend").unwrap(),
            Some(Command::Errors(ErrorsCommand::Trend))
        );
        assert_eq!(
            parse("errors --code 23505").unwrap(),
            Some(Command::Errors(ErrorsCommand::Code("23505".to_string())))
        );
        assert_eq!(
            parse("errors --code 40p01").unwrap(),
            Some(Command::Errors(ErrorsCommand::Code("40P01".to_string())))
        );
        assert_eq!(
            parse("errors clear").unwrap(),
            Some(Command::Errors(ErrorsCommand::Clear))
        );
        assert!(parse("errors --trend --live").is_err());
    }

    #[test]
    fn test_parse_notify_subcommands() {
        assert_eq!(
            parse("notify").unwrap(),
            Some(Command::Notify(NotifyCommand::Status))
        );
        assert_eq!(
            parse("notify on").unwrap(),
            Some(Command::Notify(NotifyCommand::On))
        );
        assert_eq!(
            parse("notify level FATAL PANIC").unwrap(),
            Some(Command::Notify(NotifyCommand::Levels(vec![
                "FATAL".to_string(),
                "PANIC".to_string()
            ])))
        );
        assert_eq!(
            parse("notify pattern /deadlock/i").unwrap(),
            Some(Command::Notify(NotifyCommand::Pattern(
                "/deadlock/i".to_string()
            )))
        );
        assert_eq!(
            parse("notify rate 20").unwrap(),
            Some(Command::Notify(NotifyCommand::Rate(20)))
        );
        assert_eq!(
            parse("notify quiet 22:00-07:00").unwrap(),
            Some(Command::Notify(NotifyCommand::Quiet(
                "22:00-07:00".to_string()
            )))
        );
        assert!(parse("notify rate many").is_err());
        assert!(parse("notify bogus").is_err());
    }

    #[test]
    fn test_unknown_command_suggestion() {
        let err = parse("lst").unwrap_err();
        assert_eq!(err.suggestion, Some("list"));
        let err = parse("tial 0").unwrap_err();
        assert_eq!(err.suggestion, Some("tail"));
        // Nothing close.
        let err = parse("xylophone").unwrap_err();
        assert_eq!(err.suggestion, None);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("tail", "tail"), 0);
        assert_eq!(levenshtein("tial", "tail"), 2);
        assert_eq!(levenshtein("stp", "stop"), 1);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn test_completions() {
        let (start, words) = completions("ta");
        assert_eq!(start, 0);
        assert_eq!(words, vec!["tail"]);

        let (start, words) = completions("errors --t");
        assert_eq!(start, 7);
        assert_eq!(words, vec!["--trend"]);

        let (_, words) = completions("notify ");
        assert!(words.contains(&"pattern".to_string()));

        let (_, words) = completions("levels err");
        assert_eq!(words, vec!["ERROR"]);

        let (_, words) = completions("");
        assert_eq!(words.len(), COMMANDS.len());
    }
}
