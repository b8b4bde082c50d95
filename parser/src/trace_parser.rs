//! Trace file parser
//!
//! Whitespace is free-form; `#` starts a comment that runs to the end of
//! the line. Declarations come first, then the input list, then the
//! operations.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, hex_digit1, multispace1, one_of, satisfy},
    combinator::{all_consuming, cut, map, map_res, not, opt, recognize, value, verify},
    error::context,
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated},
    IResult, Parser,
};

use crate::error::{ContextualError, ParseError, SourcePosition};
use crate::trace_ast::*;

/// Parser result type with contextual errors
pub type PResult<'a, T> = IResult<&'a str, T, ContextualError<&'a str>>;

/// Parse a complete trace file
pub fn parse_trace_file(input: &str) -> Result<TraceFile, ParseError> {
    match all_consuming(|i| trace_file(input, i)).parse(input) {
        Ok((_, file)) => Ok(file),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ParseError::from_nom(input, e)),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::new(
            SourcePosition::of_suffix(input, ""),
            "unexpected end of input",
        )),
    }
}

fn trace_file<'a>(full: &'a str, input: &'a str) -> PResult<'a, TraceFile> {
    let (input, decls) = many0(|i| descr_decl(full, i)).parse(input)?;
    let (input, inputs) = context("input list", input_list).parse(input)?;
    let (input, ops) = many0(|i| op_line(full, i)).parse(input)?;
    let (input, _) = ws(input)?;
    Ok((input, TraceFile { decls, inputs, ops }))
}

// =============================================================================
// Whitespace and Tokens
// =============================================================================

/// Skip whitespace and comments
pub fn ws(input: &str) -> PResult<'_, ()> {
    value((), many0(alt((value((), multispace1), value((), line_comment))))).parse(input)
}

/// Line comment: # comment
fn line_comment(input: &str) -> PResult<'_, &str> {
    recognize((char('#'), take_while(|c: char| c != '\n'))).parse(input)
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parse a symbol with leading whitespace
fn symbol<'a>(
    sym: &'static str,
) -> impl Parser<&'a str, Output = &'a str, Error = ContextualError<&'a str>> {
    preceded(ws, tag(sym))
}

/// Parse a keyword that is not the prefix of a longer word
fn keyword<'a>(
    kw: &'static str,
) -> impl Parser<&'a str, Output = &'a str, Error = ContextualError<&'a str>> {
    preceded(ws, terminated(tag(kw), not(satisfy(is_word_char))))
}

/// Parse an identifier
pub fn identifier(input: &str) -> PResult<'_, String> {
    preceded(
        ws,
        map(
            recognize(pair(
                take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
                take_while(is_word_char),
            )),
            String::from,
        ),
    )
    .parse(input)
}

/// `i<n>`, `p<n>` or `f<n>`
pub fn is_variable(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some('i' | 'p' | 'f'))
        && !chars.as_str().is_empty()
        && chars.all(|c| c.is_ascii_digit())
}

fn variable(input: &str) -> PResult<'_, String> {
    verify(identifier, |name: &str| is_variable(name)).parse(input)
}

// =============================================================================
// Literals
// =============================================================================

fn parse_hex(text: &str) -> Result<i64, std::num::ParseIntError> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let digits = digits.trim_start_matches("0x");
    let value = u64::from_str_radix(digits, 16)? as i64;
    Ok(if negative { value.wrapping_neg() } else { value })
}

fn integer(input: &str) -> PResult<'_, i64> {
    preceded(
        ws,
        alt((
            map_res(recognize((opt(char('-')), tag("0x"), hex_digit1)), parse_hex),
            map_res(recognize((opt(char('-')), digit1)), |s: &str| s.parse::<i64>()),
        )),
    )
    .parse(input)
}

fn unsigned(input: &str) -> PResult<'_, u64> {
    map_res(integer, u64::try_from).parse(input)
}

fn float(input: &str) -> PResult<'_, f64> {
    preceded(
        ws,
        map_res(
            recognize((
                opt(char('-')),
                digit1,
                char('.'),
                digit1,
                opt((one_of("eE"), opt(char('-')), digit1)),
            )),
            |s: &str| s.parse::<f64>(),
        ),
    )
    .parse(input)
}

fn arg(input: &str) -> PResult<'_, Arg> {
    alt((
        map(float, Arg::Float),
        map(integer, Arg::Int),
        map(preceded(symbol("@"), cut(identifier)), Arg::Addr),
        map(
            preceded(
                keyword("ConstPtr"),
                cut(delimited(symbol("("), unsigned, symbol(")"))),
            ),
            Arg::Ptr,
        ),
        value(Arg::Null, keyword("NULL")),
        map(variable, Arg::Var),
    ))
    .parse(input)
}

// =============================================================================
// Declarations
// =============================================================================

fn value_kind(input: &str) -> PResult<'_, ValueKind> {
    alt((
        value(ValueKind::Int, keyword("int")),
        value(ValueKind::Ref, keyword("ref")),
        value(ValueKind::Float, keyword("float")),
        value(ValueKind::Void, keyword("void")),
    ))
    .parse(input)
}

#[derive(Debug, Clone)]
enum StructOption {
    Size(u64),
    Vtable(u64),
}

fn struct_decl(input: &str) -> PResult<'_, DescrKind> {
    let (input, _) = keyword("struct").parse(input)?;
    let option = alt((
        map(preceded((keyword("size"), symbol("=")), cut(unsigned)), StructOption::Size),
        map(preceded((keyword("vtable"), symbol("=")), cut(unsigned)), StructOption::Vtable),
    ));
    let (input, options) = delimited(
        cut(symbol("(")),
        separated_list0(symbol(","), option),
        cut(symbol(")")),
    )
    .parse(input)?;
    let (mut size, mut vtable) = (None, None);
    for option in options {
        match option {
            StructOption::Size(s) => size = Some(s),
            StructOption::Vtable(v) => vtable = Some(v),
        }
    }
    Ok((input, DescrKind::Struct { size, vtable }))
}

fn field_decl(input: &str) -> PResult<'_, DescrKind> {
    let (input, _) = keyword("field").parse(input)?;
    let (input, (owner, kind, immutable)) = delimited(
        cut(symbol("(")),
        (
            cut(identifier),
            preceded(cut(symbol(",")), cut(value_kind)),
            opt(preceded(symbol(","), keyword("immutable"))),
        ),
        cut(symbol(")")),
    )
    .parse(input)?;
    Ok((
        input,
        DescrKind::Field {
            owner,
            kind,
            immutable: immutable.is_some(),
        },
    ))
}

fn array_decl(input: &str) -> PResult<'_, DescrKind> {
    let (input, _) = keyword("array").parse(input)?;
    let (input, item) =
        delimited(cut(symbol("(")), cut(value_kind), cut(symbol(")"))).parse(input)?;
    Ok((input, DescrKind::Array { item }))
}

#[derive(Debug, Clone)]
enum CallOption {
    Elidable,
    Raises,
    Writes(Vec<String>),
    Addr(u64),
}

fn call_option(input: &str) -> PResult<'_, CallOption> {
    alt((
        value(CallOption::Elidable, keyword("elidable")),
        value(CallOption::Raises, keyword("raises")),
        map(
            preceded(
                (keyword("writes"), symbol("=")),
                cut(delimited(
                    symbol("["),
                    separated_list0(symbol(","), identifier),
                    symbol("]"),
                )),
            ),
            CallOption::Writes,
        ),
        map(preceded((keyword("addr"), symbol("=")), cut(unsigned)), CallOption::Addr),
    ))
    .parse(input)
}

fn call_decl(input: &str) -> PResult<'_, DescrKind> {
    let (input, _) = keyword("call").parse(input)?;
    let (input, _) = cut(symbol("(")).parse(input)?;
    let (input, args) = separated_list0(symbol(","), value_kind).parse(input)?;
    let (input, _) = cut(context("`->`", symbol("->"))).parse(input)?;
    let (input, result) = cut(value_kind).parse(input)?;
    let (input, options) = many0(preceded(symbol(","), cut(call_option))).parse(input)?;
    let (input, _) = cut(symbol(")")).parse(input)?;

    let mut effect = CallEffect::Unknown;
    let mut raises = false;
    let mut address = None;
    for option in options {
        match option {
            CallOption::Elidable => effect = CallEffect::Elidable,
            CallOption::Raises => raises = true,
            CallOption::Writes(names) => effect = CallEffect::Writes(names),
            CallOption::Addr(a) => address = Some(a),
        }
    }
    Ok((
        input,
        DescrKind::Call {
            args,
            result,
            effect,
            raises,
            address,
        },
    ))
}

/// `descr NAME = struct(...) | field(...) | array(...) | call(...)`
fn descr_decl<'a>(full: &'a str, input: &'a str) -> PResult<'a, DescrDecl> {
    let (input, _) = ws(input)?;
    let line = SourcePosition::of_suffix(full, input).line;
    let (input, _) = keyword("descr").parse(input)?;
    let (input, name) = cut(context("descriptor name", identifier)).parse(input)?;
    let (input, _) = cut(symbol("=")).parse(input)?;
    let (input, kind) = cut(context(
        "descriptor kind",
        alt((struct_decl, field_decl, array_decl, call_decl)),
    ))
    .parse(input)?;
    Ok((input, DescrDecl { name, kind, line }))
}

// =============================================================================
// Operations
// =============================================================================

fn input_list(input: &str) -> PResult<'_, Vec<String>> {
    delimited(
        symbol("["),
        separated_list0(symbol(","), variable),
        cut(symbol("]")),
    )
    .parse(input)
}

fn frame(input: &str) -> PResult<'_, Frame> {
    let position = (
        preceded(ws, map_res(digit1, |s: &str| s.parse::<u32>())),
        preceded(char(':'), map_res(digit1, |s: &str| s.parse::<u32>())),
    );
    map(
        (opt(position), separated_list0(symbol(","), arg)),
        |(position, values)| Frame { position, values },
    )
    .parse(input)
}

fn snapshot(input: &str) -> PResult<'_, Vec<Frame>> {
    delimited(
        symbol("["),
        separated_list0(symbol("|"), frame),
        cut(context("`]` closing the snapshot", symbol("]"))),
    )
    .parse(input)
}

fn branch<'a>(full: &'a str, input: &'a str) -> PResult<'a, Vec<OpLine>> {
    let (input, _) = symbol("{").parse(input)?;
    let (input, ops) = many0(|i| op_line(full, i)).parse(input)?;
    let (input, _) = cut(context("`}` closing the guard branch", symbol("}"))).parse(input)?;
    Ok((input, ops))
}

enum ArgItem {
    Arg(Arg),
    Descr(String),
}

fn arg_item(input: &str) -> PResult<'_, ArgItem> {
    alt((
        map(
            preceded((keyword("descr"), symbol("=")), cut(identifier)),
            ArgItem::Descr,
        ),
        map(arg, ArgItem::Arg),
    ))
    .parse(input)
}

/// `[result =] name(args[, descr=NAME]) [snapshot] [{ branch }]`
fn op_line<'a>(full: &'a str, input: &'a str) -> PResult<'a, OpLine> {
    let (input, _) = ws(input)?;
    let line = SourcePosition::of_suffix(full, input).line;
    let (input, result) = opt(terminated(variable, symbol("="))).parse(input)?;
    let (input, name) = identifier(input)?;
    let (input, items) = delimited(
        cut(context("argument list", symbol("("))),
        separated_list0(symbol(","), arg_item),
        cut(context("`)` closing the argument list", symbol(")"))),
    )
    .parse(input)?;
    let (input, snapshot) = opt(snapshot).parse(input)?;
    let (input, branch) = opt(|i| branch(full, i)).parse(input)?;

    let mut args = Vec::new();
    let mut descr = None;
    for item in items {
        match item {
            ArgItem::Arg(arg) => args.push(arg),
            ArgItem::Descr(name) => descr = Some(name),
        }
    }
    Ok((
        input,
        OpLine {
            line,
            result,
            name,
            args,
            descr,
            snapshot,
            branch,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables() {
        assert!(is_variable("i0"));
        assert!(is_variable("p12"));
        assert!(!is_variable("i"));
        assert!(!is_variable("int_add"));
        assert!(!is_variable("x3"));
    }

    #[test]
    fn test_arguments() {
        assert_eq!(arg("i3").unwrap().1, Arg::Var("i3".into()));
        assert_eq!(arg(" -7").unwrap().1, Arg::Int(-7));
        assert_eq!(arg("0x10").unwrap().1, Arg::Int(16));
        assert_eq!(arg("1.5").unwrap().1, Arg::Float(1.5));
        assert_eq!(arg("NULL").unwrap().1, Arg::Null);
        assert_eq!(arg("ConstPtr(0x20)").unwrap().1, Arg::Ptr(32));
        assert_eq!(arg("@Node").unwrap().1, Arg::Addr("Node".into()));
        assert!(arg("NULLX").is_err());
    }

    #[test]
    fn test_comments_are_whitespace() {
        let (rest, _) = ws("  # a comment\n\t# another\n  x").unwrap();
        assert_eq!(rest, "x");
    }
}
