//! Protocol message definitions
//!
//! Defines the Command/Response value types exchanged between modules and
//! their text form on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing the text form of a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty message")]
    Empty,

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Missing correlation id")]
    MissingId,

    #[error("Invalid correlation id: {0:?}")]
    InvalidId(String),

    #[error("Unterminated parameter string")]
    UnterminatedParams,

    #[error("Unexpected token: {0:?}")]
    UnexpectedToken(String),
}

/// A request sent from one module to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    source: String,
    name: String,
    params: String,
    id: u32,
}

impl Command {
    pub fn new(
        source: impl Into<String>,
        name: impl Into<String>,
        params: impl Into<String>,
        id: u32,
    ) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            params: params.into(),
            id,
        }
    }

    /// Like [`new`](Self::new), but rejects a source or name the peer could not parse
    pub fn try_new(
        source: impl Into<String>,
        name: impl Into<String>,
        params: impl Into<String>,
        id: u32,
    ) -> Result<Self, ParseError> {
        let command = Self::new(source, name, params, id);
        validate_identifier(&command.source)?;
        validate_identifier(&command.name)?;
        Ok(command)
    }

    /// Module that issued the command
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &str {
        &self.params
    }

    /// Correlation id
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.source, self.name)?;
        write_params(f, &self.params)?;
        write!(f, " @{}", self.id)
    }
}

/// A reply to a previously sent [`Command`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    source: String,
    name: String,
    params: String,
    success: bool,
    id: u32,
}

impl Response {
    pub fn new(
        source: impl Into<String>,
        name: impl Into<String>,
        params: impl Into<String>,
        success: bool,
        id: u32,
    ) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            params: params.into(),
            success,
            id,
        }
    }

    /// Build the reply to `command`, answered by module `source`
    pub fn for_command(
        command: &Command,
        source: impl Into<String>,
        success: bool,
        params: impl Into<String>,
    ) -> Self {
        Self::new(source, command.name.clone(), params, success, command.id)
    }

    /// Module that produced the response
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Name of the command this response answers
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &str {
        &self.params
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Correlation id of the originating command
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.source, self.name)?;
        write_params(f, &self.params)?;
        write!(f, " {} @{}", u8::from(self.success), self.id)
    }
}

/// A command together with the response that answered it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponsePair {
    command: Command,
    response: Response,
}

impl CommandResponsePair {
    pub fn new(command: Command, response: Response) -> Self {
        Self { command, response }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn into_parts(self) -> (Command, Response) {
        (self.command, self.response)
    }
}

/// Any message that travels over a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Command(Command),
    Response(Response),
}

impl Message {
    /// Correlation id shared by a command and its response
    pub fn id(&self) -> u32 {
        match self {
            Message::Command(c) => c.id(),
            Message::Response(r) => r.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Message::Command(c) => c.name(),
            Message::Response(r) => r.name(),
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Message::Command(_))
    }

    pub fn source(&self) -> &str {
        match self {
            Message::Command(c) => c.source(),
            Message::Response(r) => r.source(),
        }
    }

    /// Check that the peer will be able to parse this message
    pub fn validate(&self) -> Result<(), ParseError> {
        validate_identifier(self.source())?;
        validate_identifier(self.name())
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Command(c) => c.fmt(f),
            Message::Response(r) => r.fmt(f),
        }
    }
}

impl FromStr for Message {
    type Err = ParseError;

    /// Parse `SOURCE NAME ["PARAMS"] [1|0] @ID`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = Tokenizer::new(s.trim());

        let source = match tokens.next()? {
            Some(Token::Word(w)) => identifier(w)?,
            Some(other) => return Err(ParseError::UnexpectedToken(other.to_string())),
            None => return Err(ParseError::Empty),
        };
        let name = match tokens.next()? {
            Some(Token::Word(w)) => identifier(w)?,
            Some(other) => return Err(ParseError::UnexpectedToken(other.to_string())),
            None => return Err(ParseError::MissingId),
        };

        let mut params = String::new();
        let mut success = None;
        let id = loop {
            match tokens.next()? {
                Some(Token::Quoted(p)) if params.is_empty() && success.is_none() => params = p,
                Some(Token::Word("1")) if success.is_none() => success = Some(true),
                Some(Token::Word("0")) if success.is_none() => success = Some(false),
                Some(Token::Word(w)) if w.starts_with('@') => {
                    let digits = &w[1..];
                    break digits
                        .parse::<u32>()
                        .map_err(|_| ParseError::InvalidId(digits.to_string()))?;
                }
                Some(other) => return Err(ParseError::UnexpectedToken(other.to_string())),
                None => return Err(ParseError::MissingId),
            }
        };

        if let Some(extra) = tokens.next()? {
            return Err(ParseError::UnexpectedToken(extra.to_string()));
        }

        Ok(match success {
            Some(success) => Message::Response(Response::new(source, name, params, success, id)),
            None => Message::Command(Command::new(source, name, params, id)),
        })
    }
}

/// Check that `word` can be used as a module or command name on the wire
pub fn validate_identifier(word: &str) -> Result<(), ParseError> {
    let valid = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ParseError::InvalidIdentifier(word.to_string()))
    }
}

fn identifier(word: &str) -> Result<String, ParseError> {
    validate_identifier(word)?;
    Ok(word.to_string())
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &str) -> fmt::Result {
    if params.is_empty() {
        return Ok(());
    }
    f.write_str(" \"")?;
    for c in params.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\0' => f.write_str("\\0")?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("\"")
}

enum Token<'a> {
    Word(&'a str),
    Quoted(String),
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => f.write_str(w),
            Token::Quoted(q) => write!(f, "\"{}\"", q),
        }
    }
}

struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn next(&mut self) -> Result<Option<Token<'a>>, ParseError> {
        self.rest = self.rest.trim_start();
        if self.rest.is_empty() {
            return Ok(None);
        }

        if let Some(body) = self.rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = body.char_indices();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some((_, '0')) => out.push('\0'),
                        Some((_, escaped)) => out.push(escaped),
                        None => return Err(ParseError::UnterminatedParams),
                    },
                    '"' => {
                        self.rest = &body[i + 1..];
                        return Ok(Some(Token::Quoted(out)));
                    }
                    c => out.push(c),
                }
            }
            return Err(ParseError::UnterminatedParams);
        }

        let end = self
            .rest
            .find(char::is_whitespace)
            .unwrap_or(self.rest.len());
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(Some(Token::Word(word)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let msg: Message = "vision find_object \"cup red\" @42".parse().unwrap();
        match msg {
            Message::Command(c) => {
                assert_eq!(c.source(), "vision");
                assert_eq!(c.name(), "find_object");
                assert_eq!(c.params(), "cup red");
                assert_eq!(c.id(), 42);
            }
            _ => panic!("Expected a command"),
        }
    }

    #[test]
    fn test_parse_response_without_params() {
        let msg: Message = "arm move_to 0 @7".parse().unwrap();
        match msg {
            Message::Response(r) => {
                assert_eq!(r.name(), "move_to");
                assert!(!r.success());
                assert_eq!(r.params(), "");
                assert_eq!(r.id(), 7);
            }
            _ => panic!("Expected a response"),
        }
    }

    #[test]
    fn test_escaped_params_survive_display() {
        let cmd = Command::new("speech", "say", r#"she said "hi" \o/"#, 3);
        let text = cmd.to_string();
        assert_eq!(text, r#"speech say "she said \"hi\" \\o/" @3"#);

        let parsed: Message = text.parse().unwrap();
        assert_eq!(parsed, Message::Command(cmd));
    }

    #[test]
    fn test_rejects_malformed_text() {
        assert_eq!("".parse::<Message>(), Err(ParseError::Empty));
        assert_eq!("mod cmd".parse::<Message>(), Err(ParseError::MissingId));
        assert_eq!(
            "mod cmd @x1".parse::<Message>(),
            Err(ParseError::InvalidId("x1".to_string()))
        );
        assert_eq!(
            "mod cmd \"open @1".parse::<Message>(),
            Err(ParseError::UnterminatedParams)
        );
        assert!(matches!(
            "mod cmd @1 trailing".parse::<Message>(),
            Err(ParseError::UnexpectedToken(_))
        ));
        assert!(matches!(
            "mo#d cmd @1".parse::<Message>(),
            Err(ParseError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_nul_in_params_is_escaped() {
        let cmd = Command::new("speech", "say", "x\0y", 1);
        let text = cmd.to_string();
        assert!(!text.contains('\0'));
        assert_eq!(text, r#"speech say "x\0y" @1"#);

        let parsed: Message = text.parse().unwrap();
        assert_eq!(parsed, Message::Command(cmd));

        // A literal backslash followed by zero stays two characters
        let literal = Command::new("speech", "say", r"x\0y", 2);
        let parsed: Message = literal.to_string().parse().unwrap();
        assert_eq!(parsed, Message::Command(literal));
    }

    #[test]
    fn test_identifiers_are_validated() {
        assert!(Command::try_new("arm", "alive", "", 1).is_ok());
        assert_eq!(
            Command::try_new("robot arm", "alive", "", 1),
            Err(ParseError::InvalidIdentifier("robot arm".to_string()))
        );
        assert!(Command::try_new("arm", "", "", 1).is_err());

        let unsendable = Message::Command(Command::new("robot arm", "alive", "", 1));
        assert!(unsendable.validate().is_err());
        assert!(unsendable.to_string().parse::<Message>().is_err());

        let reply = Message::Response(Response::new("board", "alive", "", true, 1));
        assert!(reply.validate().is_ok());
    }

    #[test]
    fn test_response_for_command() {
        let cmd = Command::new("planner", "read_var", "odometry", 9);
        let resp = Response::for_command(&cmd, "blackboard", true, "1.0 2.0");
        assert_eq!(resp.name(), "read_var");
        assert_eq!(resp.id(), 9);
        assert_eq!(resp.to_string(), "blackboard read_var \"1.0 2.0\" 1 @9");
    }
}
