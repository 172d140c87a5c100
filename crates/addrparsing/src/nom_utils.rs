use nom::error::ErrorKind;
use nom::Slice;
use nom_locate::LocatedSpan;
use std::fmt::{Debug, Write};

pub(crate) type Span<'a> = LocatedSpan<&'a [u8]>;
pub(crate) type IResult<'a, A, B> = nom::IResult<A, B, ParseError<Span<'a>>>;

pub(crate) fn make_span(input: &[u8]) -> Span {
    Span::new(input)
}

#[derive(Debug)]
pub(crate) enum ParseErrorKind {
    Context(&'static str),
    Char(char),
    Nom(ErrorKind),
}

#[derive(Debug)]
pub(crate) struct ParseError<I: Debug> {
    pub errors: Vec<(I, ParseErrorKind)>,
}

impl<I: Debug> nom::error::ContextError<I> for ParseError<I> {
    fn add_context(input: I, ctx: &'static str, mut other: Self) -> Self {
        other.errors.push((input, ParseErrorKind::Context(ctx)));
        other
    }
}

impl<I: Debug> nom::error::ParseError<I> for ParseError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        Self {
            errors: vec![(input, ParseErrorKind::Nom(kind))],
        }
    }

    fn append(input: I, kind: ErrorKind, mut other: Self) -> Self {
        other.errors.push((input, ParseErrorKind::Nom(kind)));
        other
    }

    fn from_char(input: I, c: char) -> Self {
        Self {
            errors: vec![(input, ParseErrorKind::Char(c))],
        }
    }
}

pub(crate) fn make_char_error<'a>(
    input: Span<'a>,
    expected: char,
) -> nom::Err<ParseError<Span<'a>>> {
    nom::Err::Error(ParseError {
        errors: vec![(input, ParseErrorKind::Char(expected))],
    })
}

/// Match a single byte satisfying `cond`. nom's own `satisfy` is
/// char oriented; the rfc5322 character classes are defined over
/// single bytes.
pub(crate) fn satisfy_byte<'a, F>(cond: F) -> impl Fn(Span<'a>) -> IResult<'a, Span<'a>, u8>
where
    F: Fn(u8) -> bool,
{
    move |input: Span<'a>| match input.first().copied() {
        Some(b) if cond(b) => Ok((input.slice(1..), b)),
        _ => Err(nom::Err::Error(ParseError {
            errors: vec![(input, ParseErrorKind::Nom(ErrorKind::Satisfy))],
        })),
    }
}

fn render_byte(b: u8) -> String {
    if b.is_ascii_graphic() {
        (b as char).to_string()
    } else {
        format!("0x{b:02x}")
    }
}

pub(crate) fn explain(input: Span, err: nom::Err<ParseError<Span<'_>>>) -> String {
    match err {
        nom::Err::Error(e) => {
            let mut result = String::new();
            for (i, (span, kind)) in e.errors.iter().enumerate() {
                if input.is_empty() {
                    match kind {
                        ParseErrorKind::Char(c) => {
                            write!(&mut result, "{i}: expected '{c}', got empty input\n\n")
                        }
                        ParseErrorKind::Context(s) => {
                            write!(&mut result, "{i}: in {s}, got empty input\n\n")
                        }
                        ParseErrorKind::Nom(e) => {
                            write!(&mut result, "{i}: in {e:?}, got empty input\n\n")
                        }
                    }
                    .ok();
                    continue;
                }

                let line_number = span.location_line();
                // Remap control bytes so that the caret column below
                // stays aligned with what is actually printed
                let line: String = String::from_utf8_lossy(span.get_line_beginning())
                    .chars()
                    .map(|c| match c {
                        '\t' => '\u{2409}',
                        '\r' => '\u{240d}',
                        '\n' => '\u{240a}',
                        _ => c,
                    })
                    .collect();
                let column = span.get_column();
                let mut caret = " ".repeat(column.saturating_sub(1));
                caret.push('^');
                for _ in 1..span.len() {
                    caret.push('_')
                }

                match kind {
                    ParseErrorKind::Char(expected) => {
                        if let Some(actual) = span.first() {
                            write!(
                                &mut result,
                                "{i}: at line {line_number}:\n\
                                    {line}\n\
                                    {caret}\n\
                                    expected '{expected}', found {}\n\n",
                                render_byte(*actual)
                            )
                        } else {
                            write!(
                                &mut result,
                                "{i}: at line {line_number}:\n\
                                    {line}\n\
                                    {caret}\n\
                                    expected '{expected}', got end of input\n\n",
                            )
                        }
                    }
                    ParseErrorKind::Context(context) => {
                        write!(
                            &mut result,
                            "{i}: at line {line_number}, in {context}:\n\
                                {line}\n\
                                {caret}\n\n",
                        )
                    }
                    ParseErrorKind::Nom(nom_err) => {
                        write!(
                            &mut result,
                            "{i}: at line {line_number}, in {nom_err:?}:\n\
                                {line}\n\
                                {caret}\n\n",
                        )
                    }
                }
                .ok();
            }
            result
        }
        _ => format!("{err:#}"),
    }
}
