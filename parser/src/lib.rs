//! Textual trace format
//!
//! Traces written as text are used by the compiler's tests, its benches and
//! the `tracejit` developer CLI. This crate only produces the syntax tree;
//! the compiler lowers it into IR.

use nom::IResult;

pub mod error;
pub mod trace_ast;
pub mod trace_parser;

pub use error::{ContextualError, ParseError, SourcePosition};
pub use trace_ast::*;
pub use trace_parser::{is_variable, parse_trace_file};

/// Raw nom result type of the trace grammar
pub type NomParseResult<'a, T> = IResult<&'a str, T, ContextualError<&'a str>>;
