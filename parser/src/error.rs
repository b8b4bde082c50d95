//! Error handling for the trace parser
//!
//! nom failures are collected in a [`ContextualError`] that remembers the
//! innermost `context()` label, then turned into a [`ParseError`] with a
//! line/column position once parsing has stopped.

use nom::error::{ContextError, ErrorKind, FromExternalError, ParseError as NomParseError};
use std::fmt;

/// Represents a position in source code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourcePosition {
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub column: usize,
}

impl SourcePosition {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Position at which `rest`, a suffix of `full`, starts
    pub fn of_suffix(full: &str, rest: &str) -> Self {
        let offset = full.len().saturating_sub(rest.len());
        let consumed = full.get(..offset).unwrap_or(full);
        let line = consumed.matches('\n').count() + 1;
        let column = match consumed.rfind('\n') {
            Some(newline) => offset - newline,
            None => offset + 1,
        };
        Self::new(line, column)
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// nom error type that keeps the context labels of a failure
#[derive(Debug, Clone, PartialEq)]
pub struct ContextualError<I> {
    pub input: I,
    pub code: ErrorKind,
    /// Innermost first
    pub contexts: Vec<&'static str>,
}

impl<I> ContextualError<I> {
    pub fn new(input: I, code: ErrorKind) -> Self {
        Self {
            input,
            code,
            contexts: Vec::new(),
        }
    }
}

impl<'a> NomParseError<&'a str> for ContextualError<&'a str> {
    fn from_error_kind(input: &'a str, kind: ErrorKind) -> Self {
        Self::new(input, kind)
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    /// Keep whichever alternative got further into the input
    fn or(self, other: Self) -> Self {
        if self.input.len() < other.input.len() {
            self
        } else {
            other
        }
    }
}

impl<'a> ContextError<&'a str> for ContextualError<&'a str> {
    fn add_context(_input: &'a str, context: &'static str, mut other: Self) -> Self {
        other.contexts.push(context);
        other
    }
}

impl<'a, E> FromExternalError<&'a str, E> for ContextualError<&'a str> {
    fn from_external_error(input: &'a str, kind: ErrorKind, _e: E) -> Self {
        Self::new(input, kind)
    }
}

/// A syntax error in a trace file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub position: SourcePosition,
    pub message: String,
}

impl ParseError {
    pub fn new(position: SourcePosition, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn from_nom(full: &str, error: ContextualError<&str>) -> Self {
        let position = SourcePosition::of_suffix(full, error.input);
        let near: String = error
            .input
            .lines()
            .next()
            .unwrap_or("")
            .chars()
            .take(24)
            .collect();
        let message = match error.contexts.first() {
            Some(context) if near.is_empty() => format!("expected {} at end of input", context),
            Some(context) => format!("expected {} near `{}`", context, near),
            None if near.is_empty() => "unexpected end of input".to_string(),
            None => format!("unexpected input `{}`", near),
        };
        Self::new(position, message)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_of_suffix() {
        let text = "abc\nde\nfgh";
        assert_eq!(SourcePosition::of_suffix(text, text), SourcePosition::new(1, 1));
        assert_eq!(SourcePosition::of_suffix(text, "e\nfgh"), SourcePosition::new(2, 2));
        assert_eq!(SourcePosition::of_suffix(text, "fgh"), SourcePosition::new(3, 1));
        assert_eq!(SourcePosition::of_suffix(text, ""), SourcePosition::new(3, 4));
    }
}
