//! Message filters.
//!
//! [`Selector`] understands a conjunction of equality terms,
//! `name = 'text'` or `name = 42`, joined by `AND`. Besides application
//! properties it resolves `JMSPriority`, `JMSMessageID` and
//! `JMSDeliveryMode`.

use courier_core::{Error, Message, Result};
use std::fmt;

/// Decides whether a message is visible to a consumer or subscription.
pub trait Filter: Send + Sync + fmt::Debug {
    /// Whether `message` passes the filter.
    fn matches(&self, message: &Message) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Literal {
    Text(String),
    Number(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Term {
    name: String,
    value: Literal,
}

/// A parsed message selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    terms: Vec<Term>,
}

impl Selector {
    /// Parse a selector expression.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMessage`] when the expression is malformed.
    pub fn parse(source: &str) -> Result<Self> {
        let terms = split_and(source)
            .into_iter()
            .map(|term| parse_term(term, source))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { source: source.to_string(), terms })
    }

    /// Parse an optional selector; blank expressions select everything.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMessage`] when the expression is malformed.
    pub fn parse_optional(source: Option<&str>) -> Result<Option<Self>> {
        match source.map(str::trim) {
            None | Some("") => Ok(None),
            Some(expr) => Self::parse(expr).map(Some),
        }
    }

    /// The original expression.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Filter for Selector {
    fn matches(&self, message: &Message) -> bool {
        self.terms.iter().all(|term| {
            let actual = match term.name.as_str() {
                "JMSPriority" => Some(Literal::Number(i64::from(message.priority))),
                "JMSMessageID" => Some(Literal::Text(message.id.to_string())),
                "JMSDeliveryMode" => Some(Literal::Text(
                    if message.persistent { "PERSISTENT" } else { "NON_PERSISTENT" }.to_string(),
                )),
                name => message.property(name).map(|value| match value.parse::<i64>() {
                    Ok(number) if matches!(term.value, Literal::Number(_)) => {
                        Literal::Number(number)
                    },
                    _ => Literal::Text(value.to_string()),
                }),
            };
            actual.as_ref() == Some(&term.value)
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn split_and(source: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let bytes = source.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_quotes = !in_quotes,
            b' ' if !in_quotes => {
                let rest = &bytes[i..];
                if rest.len() >= 5 && rest[1..4].eq_ignore_ascii_case(b"AND") && rest[4] == b' ' {
                    terms.push(&source[start..i]);
                    start = i + 5;
                    i += 5;
                    continue;
                }
            },
            _ => {},
        }
        i += 1;
    }
    terms.push(&source[start..]);
    terms
}

fn parse_term(term: &str, source: &str) -> Result<Term> {
    let invalid = || Error::InvalidMessage { message: format!("invalid selector '{source}'") };
    let (name, value) = term.split_once('=').ok_or_else(invalid)?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return Err(invalid());
    }
    let value = if let Some(text) = value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
        Literal::Text(text.to_string())
    } else {
        Literal::Number(value.parse().map_err(|_| invalid())?)
    };
    Ok(Term { name: name.to_string(), value })
}
