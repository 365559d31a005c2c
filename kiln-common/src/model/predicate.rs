//! Guard expressions over a resolved option snapshot.
//!
//! Grammar: `a`, `a=value`, `!p`, `p & q`, `p | q` and parentheses, with `&`
//! binding tighter than `|`.
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::option::ResolvedOptions;
use crate::error::{KilnError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Predicate {
    Enabled(String),
    Equals(String, String),
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            source: input,
        };
        let predicate = parser.parse_or()?;
        if parser.pos != tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(predicate)
    }

    pub fn evaluate(&self, options: &ResolvedOptions) -> bool {
        match self {
            Predicate::Enabled(name) => options.is_enabled(name),
            Predicate::Equals(name, value) => options
                .get(name)
                .is_some_and(|current| current.matches_str(value)),
            Predicate::Not(inner) => !inner.evaluate(options),
            Predicate::All(parts) => parts.iter().all(|p| p.evaluate(options)),
            Predicate::Any(parts) => parts.iter().any(|p| p.evaluate(options)),
        }
    }

    /// Every option name the expression reads.
    pub fn referenced_options(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::Enabled(name) | Predicate::Equals(name, _) => {
                names.insert(name.as_str());
            }
            Predicate::Not(inner) => inner.collect_names(names),
            Predicate::All(parts) | Predicate::Any(parts) => {
                for part in parts {
                    part.collect_names(names);
                }
            }
        }
    }
}

/// Evaluate an optional guard; a missing guard always holds.
pub fn holds(guard: Option<&Predicate>, options: &ResolvedOptions) -> bool {
    guard.is_none_or(|p| p.evaluate(options))
}

impl TryFrom<String> for Predicate {
    type Error = KilnError;

    fn try_from(value: String) -> Result<Self> {
        Predicate::parse(&value)
    }
}

impl From<Predicate> for String {
    fn from(value: Predicate) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Enabled(name) => write!(f, "{name}"),
            Predicate::Equals(name, value) => write!(f, "{name}={value}"),
            Predicate::Not(inner) => match inner.as_ref() {
                Predicate::All(_) | Predicate::Any(_) => write!(f, "!({inner})"),
                _ => write!(f, "!{inner}"),
            },
            Predicate::All(parts) => write_joined(f, parts, " & ", |p| matches!(p, Predicate::Any(_))),
            Predicate::Any(parts) => write_joined(f, parts, " | ", |_| false),
        }
    }
}

fn write_joined(
    f: &mut fmt::Formatter<'_>,
    parts: &[Predicate],
    separator: &str,
    needs_parens: impl Fn(&Predicate) -> bool,
) -> fmt::Result {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        if needs_parens(part) {
            write!(f, "({part})")?;
        } else {
            write!(f, "{part}")?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Eq,
    Not,
    And,
    Or,
    Open,
    Close,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '/')
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                // accept both `&` and `&&`
                if chars.peek() == Some(&'&') {
                    chars.next();
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                tokens.push(Token::Or);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if is_ident_char(c) => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_ident_char(c) {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(KilnError::ParseError(
                    "predicate".to_string(),
                    format!("unexpected character '{other}' in '{input}'"),
                ))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> KilnError {
        KilnError::ParseError(
            "predicate".to_string(),
            format!("{msg} at token {} in '{}'", self.pos, self.source),
        )
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<Predicate> {
        let mut parts = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Predicate::Any(parts)
        })
    }

    fn parse_and(&mut self) -> Result<Predicate> {
        let mut parts = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Predicate::All(parts)
        })
    }

    fn parse_unary(&mut self) -> Result<Predicate> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Predicate::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(self.error("expected ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                if self.peek() == Some(&Token::Eq) {
                    self.pos += 1;
                    match self.peek() {
                        Some(Token::Ident(value)) => {
                            let value = value.clone();
                            self.pos += 1;
                            Ok(Predicate::Equals(name, value))
                        }
                        _ => Err(self.error("expected a value after '='")),
                    }
                } else {
                    Ok(Predicate::Enabled(name))
                }
            }
            _ => Err(self.error("expected an option name")),
        }
    }
}
