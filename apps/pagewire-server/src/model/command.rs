use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::CharIndices;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Add,
    Replace,
    Set,
    Append,
    Get,
    Clean,
    Remove,
    CanAccess,
    Signout,
    Error,
}

struct CommandSpec {
    name: &'static str,
    kind: CommandKind,
    should_return: bool,
}

// The `f` variants behave like their base command but send no response.
const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "add", kind: CommandKind::Add, should_return: true },
    CommandSpec { name: "addf", kind: CommandKind::Add, should_return: false },
    CommandSpec { name: "replace", kind: CommandKind::Replace, should_return: true },
    CommandSpec { name: "replacef", kind: CommandKind::Replace, should_return: false },
    CommandSpec { name: "set", kind: CommandKind::Set, should_return: true },
    CommandSpec { name: "setf", kind: CommandKind::Set, should_return: false },
    CommandSpec { name: "append", kind: CommandKind::Append, should_return: true },
    CommandSpec { name: "appendf", kind: CommandKind::Append, should_return: false },
    CommandSpec { name: "get", kind: CommandKind::Get, should_return: true },
    CommandSpec { name: "clean", kind: CommandKind::Clean, should_return: true },
    CommandSpec { name: "cleanf", kind: CommandKind::Clean, should_return: false },
    CommandSpec { name: "remove", kind: CommandKind::Remove, should_return: true },
    CommandSpec { name: "removef", kind: CommandKind::Remove, should_return: false },
    CommandSpec { name: "canaccess", kind: CommandKind::CanAccess, should_return: true },
    CommandSpec { name: "signout", kind: CommandKind::Signout, should_return: true },
    CommandSpec { name: "error", kind: CommandKind::Error, should_return: false },
];

fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(name))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected '=' at position {0}")]
    UnexpectedEquals(usize),
    #[error("unterminated quoted value at position {0}")]
    UnterminatedQuote(usize),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// A command from a host client, either deserialized as-is or parsed from
/// the line syntax by [`Command::parse`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "i", default)]
    pub indent: usize,
    #[serde(rename = "n", default)]
    pub name: String,
    #[serde(rename = "v", default)]
    pub values: Vec<String>,
    #[serde(rename = "a", default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(rename = "l", default)]
    pub lines: Vec<String>,
    #[serde(rename = "c", default)]
    pub commands: Vec<Command>,
}

impl Command {
    pub fn new(name: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn kind(&self) -> Option<CommandKind> {
        lookup(&self.name).map(|spec| spec.kind)
    }

    pub fn is_supported(&self) -> bool {
        lookup(&self.name).is_some()
    }

    /// Whether the host waits for a result. Unknown commands always answer.
    pub fn should_return(&self) -> bool {
        lookup(&self.name).map_or(true, |spec| spec.should_return)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Parses a text command. The first non-blank line is the command itself;
    /// every later line is kept verbatim in `lines` for lazy parsing.
    /// With `parse_name` off the first bare token is a value, as in nested lines.
    pub fn parse(text: &str, parse_name: bool) -> Result<Option<Command>, ParseError> {
        let mut command: Option<Command> = None;
        for line in text.split('\n') {
            match command.as_mut() {
                None if line.trim().is_empty() => continue,
                None => command = Some(parse_line(line, parse_name)?),
                Some(command) => command.lines.push(line.trim_matches('\r').to_string()),
            }
        }
        Ok(command)
    }
}

fn count_indent(line: &str) -> usize {
    line.chars().take_while(|ch| ch.is_whitespace()).count()
}

fn parse_line(line: &str, parse_name: bool) -> Result<Command, ParseError> {
    let mut command = Command {
        indent: count_indent(line),
        ..Command::default()
    };

    let mut pending: Option<String> = None;
    let mut after_equals = false;

    let push_value = |command: &mut Command, value: String| {
        if parse_name && command.name.is_empty() {
            command.name = value;
        } else {
            command.values.push(value);
        }
    };

    for token in tokenize(line.trim_end_matches('\r'))? {
        match token {
            Token::Equals(position) => {
                if pending.is_none() || after_equals {
                    return Err(ParseError::UnexpectedEquals(position));
                }
                after_equals = true;
            }
            Token::Literal(literal) if after_equals => {
                if let Some(name) = pending.take() {
                    command.attrs.insert(name.to_lowercase(), literal);
                }
                after_equals = false;
            }
            Token::Literal(literal) => {
                if let Some(previous) = pending.replace(literal) {
                    push_value(&mut command, previous);
                }
            }
        }
    }

    if let Some(last) = pending {
        if after_equals {
            command.attrs.insert(last.to_lowercase(), String::new());
        } else {
            push_value(&mut command, last);
        }
    }

    if parse_name && !command.is_supported() {
        return Err(ParseError::UnknownCommand(command.name));
    }
    Ok(command)
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Equals(usize),
    Literal(String),
}

fn tokenize(line: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.char_indices().peekable();
    while let Some(&(offset, ch)) = chars.peek() {
        let position = offset + 1;
        if ch.is_whitespace() {
            chars.next();
        } else if ch == '=' {
            chars.next();
            tokens.push(Token::Equals(position));
        } else if ch == '"' || ch == '\'' {
            chars.next();
            tokens.push(Token::Literal(quoted(&mut chars, ch, position)?));
        } else {
            let mut word = String::new();
            while let Some(&(_, ch)) = chars.peek() {
                if ch.is_whitespace() || ch == '=' {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            tokens.push(Token::Literal(word));
        }
    }
    Ok(tokens)
}

fn quoted(
    chars: &mut Peekable<CharIndices<'_>>,
    delimiter: char,
    position: usize,
) -> Result<String, ParseError> {
    let mut value = String::new();
    while let Some((_, ch)) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, 't')) => value.push('\t'),
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            ch if ch == delimiter => return Ok(value),
            ch => value.push(ch),
        }
    }
    Err(ParseError::UnterminatedQuote(position))
}
