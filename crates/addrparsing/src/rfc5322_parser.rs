use crate::nom_utils::{
    explain, make_char_error, make_span, satisfy_byte, IResult, ParseError, Span,
};
use crate::{AddrParsingError, Result};
use bstr::{BStr, BString, ByteSlice};
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, crlf};
#[cfg(test)]
use nom::combinator::all_consuming;
use nom::combinator::{map, opt, recognize};
use nom::error::context;
use nom::multi::{many0, many0_count, many1_count, separated_list1};
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated};
use nom::Slice;
use serde::{Deserialize, Serialize};

impl AddrParsingError {
    pub(crate) fn from_nom(input: Span, err: nom::Err<ParseError<Span<'_>>>) -> Self {
        AddrParsingError::AddrSpec(explain(input, err))
    }
}

// atext = ALPHA / DIGIT / "!" / "#" / "$" / "%" / "&" / "'" / "*" /
//         "+" / "-" / "/" / "=" / "?" / "^" / "_" / "`" / "{" / "|" /
//         "}" / "~"
fn is_atom_text(c: u8) -> bool {
    match c {
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'/' | b'=' | b'?'
        | b'^' | b'_' | b'`' | b'{' | b'|' | b'}' | b'~' => true,
        c => c.is_ascii_alphanumeric(),
    }
}

// obs-NO-WS-CTL = %d1-8 / %d11 / %d12 / %d14-31 / %d127
fn is_obs_no_ws_ctl(c: u8) -> bool {
    match c {
        0x01..=0x08 | 0x0b..=0x0c | 0x0e..=0x1f | 0x7f => true,
        _ => false,
    }
}

// dtext = %d33-90 / %d94-126 / obs-NO-WS-CTL
fn is_domain_text(c: u8) -> bool {
    match c {
        0x21..=0x5a | 0x5e..=0x7e => true,
        c => is_obs_no_ws_ctl(c),
    }
}

// qtext = %d33 / %d35-91 / %d93-126 / obs-NO-WS-CTL
fn is_quoted_text(c: u8) -> bool {
    match c {
        0x21 | 0x23..=0x5b | 0x5d..=0x7e => true,
        c => is_obs_no_ws_ctl(c),
    }
}

// ctext = %d33-39 / %d42-91 / %d93-126 / obs-NO-WS-CTL
fn is_comment_text(c: u8) -> bool {
    match c {
        0x21..=0x27 | 0x2a..=0x5b | 0x5d..=0x7e => true,
        c => is_obs_no_ws_ctl(c),
    }
}

// VCHAR = %d33-126
fn is_vchar(c: u8) -> bool {
    c >= 0x21 && c <= 0x7e
}

// WSP = SP / HTAB
fn is_wsp(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

// quoted-pair may escape VCHAR, WSP, CR, LF, NUL and the obsolete
// control set
fn is_quotable(c: u8) -> bool {
    match c {
        0x00 | b'\r' | b'\n' => true,
        c => is_wsp(c) || is_vchar(c) || is_obs_no_ws_ctl(c),
    }
}

fn wsp1(input: Span) -> IResult<Span, Span> {
    context("wsp", take_while1(is_wsp))(input)
}

fn ctext1(input: Span) -> IResult<Span, Span> {
    context("ctext", take_while1(is_comment_text))(input)
}

fn qtext1(input: Span) -> IResult<Span, Span> {
    context("qtext", take_while1(is_quoted_text))(input)
}

fn dtext1(input: Span) -> IResult<Span, Span> {
    context("dtext", take_while1(is_domain_text))(input)
}

// fws = (wsp+ ~ (crlf ~ wsp+)?) | (crlf ~ wsp+)+
// A fold only counts when the CRLF is followed by more whitespace;
// bare CR or bare LF never match. Matched bytes are discarded.
fn fws(input: Span) -> IResult<Span, ()> {
    context(
        "fws",
        alt((
            map(pair(wsp1, opt(pair(crlf, wsp1))), |_| ()),
            map(many1_count(pair(crlf, wsp1)), |_| ()),
        )),
    )(input)
}

// comment = "(" ~ (ctext+ | quoted_pair | comment | fws)* ~ ")"
// Nesting is tracked with a depth counter instead of recursive calls,
// so adversarial nesting depth costs no call stack. Comments are
// consumed and fully discarded.
fn comment(input: Span) -> IResult<Span, ()> {
    let (mut rest, _) = char('(')(input)?;
    let mut depth = 1usize;
    while depth > 0 {
        if let Ok((next, _)) = ctext1(rest) {
            rest = next;
            continue;
        }
        if let Ok((next, _)) = quoted_pair(rest) {
            rest = next;
            continue;
        }
        if let Ok((next, _)) = fws(rest) {
            rest = next;
            continue;
        }
        match rest.first().copied() {
            Some(b'(') => depth += 1,
            Some(b')') => depth -= 1,
            _ => return Err(make_char_error(rest, ')')),
        }
        rest = rest.slice(1..);
    }
    Ok((rest, ()))
}

#[cfg(test)]
#[test]
fn test_comment() {
    k9::snapshot!(
        parse_with(b"(wat)", comment),
        r#"
Ok(
    (),
)
"#
    );
    k9::snapshot!(
        parse_with(b"(outer (inner (deeper)) tail)", comment),
        r#"
Ok(
    (),
)
"#
    );
    assert!(parse_with(b"(unterminated", comment).is_err());
    assert!(parse_with(b"(bare \n lf)", comment).is_err());
}

// cfws = (comment | fws)*
// Always succeeds, consuming and discarding whatever it matched, so
// callers never need to wrap it in opt()
fn cfws(input: Span) -> IResult<Span, ()> {
    context("cfws", map(many0_count(alt((comment, fws))), |_| ()))(input)
}

// atom = atext+
fn atom(input: Span) -> IResult<Span, Span> {
    context("atom", take_while1(is_atom_text))(input)
}

// quoted_pair = "\" ~ (vchar | wsp | cr | lf | nul | obs_no_ws_ctl)
// The escape is preserved: the extracted value is the backslash
// followed by the escaped byte, never the bare byte.
fn quoted_pair(input: Span) -> IResult<Span, Span> {
    context(
        "quoted_pair",
        recognize(preceded(char('\\'), satisfy_byte(is_quotable))),
    )(input)
}

// quoted_string = DQUOTE ~ (fws? ~ (qtext+ | quoted_pair))* ~ fws? ~ DQUOTE
// The enclosing quotes are part of the extracted value; interior
// folding whitespace is not.
fn quoted_string(input: Span) -> IResult<Span, BString> {
    let (loc, bits) = context(
        "quoted_string",
        delimited(
            char('"'),
            terminated(many0(preceded(opt(fws), alt((qtext1, quoted_pair)))), opt(fws)),
            char('"'),
        ),
    )(input)?;

    let mut result = BString::from("\"");
    for bit in bits {
        result.extend_from_slice(bit.fragment());
    }
    result.push(b'"');
    Ok((loc, result))
}

#[cfg(test)]
#[test]
fn test_quoted_string() {
    k9::snapshot!(
        parse_with(b"\"hello world\"", quoted_string),
        r#"
Ok(
    "\"helloworld\"",
)
"#
    );
    k9::snapshot!(
        parse_with(b"\"fold\r\n ed\"", quoted_string),
        r#"
Ok(
    "\"folded\"",
)
"#
    );
    assert!(parse_with(b"\"unterminated", quoted_string).is_err());
}

// domain_literal = cfws ~ "[" ~ (fws? ~ dtext+)* ~ fws? ~ "]" ~ cfws
// The brackets are part of the extracted value; the whitespace is not.
fn domain_literal(input: Span) -> IResult<Span, BString> {
    let (loc, bits) = context(
        "domain_literal",
        delimited(
            preceded(cfws, char('[')),
            terminated(many0(preceded(opt(fws), dtext1)), opt(fws)),
            terminated(char(']'), cfws),
        ),
    )(input)?;

    let mut result = BString::from("[");
    for bit in bits {
        result.extend_from_slice(bit.fragment());
    }
    result.push(b']');
    Ok((loc, result))
}

// dotted_atoms = cfws ~ (atom | quoted_string) ~ cfws
//                ~ ("." ~ cfws ~ (atom | quoted_string) ~ cfws)*
// The dot separators are part of the extracted value; the cfws around
// each segment is not.
fn dotted_atoms(input: Span) -> IResult<Span, BString> {
    let (loc, segments) = context(
        "dotted_atoms",
        separated_list1(
            char('.'),
            delimited(
                cfws,
                alt((map(atom, |s: Span| BString::from(*s.fragment())), quoted_string)),
                cfws,
            ),
        ),
    )(input)?;

    let mut result = BString::default();
    for (n, segment) in segments.iter().enumerate() {
        if n > 0 {
            result.push(b'.');
        }
        result.extend_from_slice(segment);
    }
    Ok((loc, result))
}

#[cfg(test)]
#[test]
fn test_dotted_atoms() {
    k9::snapshot!(
        parse_with(b"hello", dotted_atoms),
        r#"
Ok(
    "hello",
)
"#
    );
    k9::snapshot!(
        parse_with(b"hello.there", dotted_atoms),
        r#"
Ok(
    "hello.there",
)
"#
    );
    k9::snapshot!(
        parse_with(b"(wat)hello", dotted_atoms),
        r#"
Ok(
    "hello",
)
"#
    );
    k9::snapshot!(
        parse_with(b"\"quoted\".atom", dotted_atoms),
        r#"
Ok(
    "\"quoted\".atom",
)
"#
    );
    assert!(parse_with(b"hello.", dotted_atoms).is_err());
}

// local_part = dotted_atoms
fn local_part(input: Span) -> IResult<Span, BString> {
    context("local_part", dotted_atoms)(input)
}

// domain = dotted_atoms | domain_literal
// Ordered choice: the literal form is only attempted once the dotted
// form has failed
fn domain(input: Span) -> IResult<Span, BString> {
    context("domain", alt((dotted_atoms, domain_literal)))(input)
}

// addr_spec = local_part ~ "@" ~ domain
fn addr_spec(input: Span) -> IResult<Span, Address> {
    let (loc, (local_part, domain)) =
        context("addr_spec", separated_pair(local_part, char('@'), domain))(input)?;
    Ok((loc, Address { local_part, domain }))
}

#[cfg(test)]
fn parse_with<'a, R, F>(input: &'a [u8], parser: F) -> Result<R>
where
    F: Fn(Span<'a>) -> IResult<'a, Span<'a>, R>,
{
    let span = make_span(input);
    let (_, result) =
        all_consuming(parser)(span).map_err(|err| AddrParsingError::from_nom(span, err))?;
    Ok(result)
}

#[cfg(test)]
#[test]
fn test_addr_spec() {
    k9::snapshot!(
        parse_with(b"darth.vader@a.galaxy.far.far.away", addr_spec),
        r#"
Ok(
    Address {
        local_part: "darth.vader",
        domain: "a.galaxy.far.far.away",
    },
)
"#
    );

    k9::snapshot!(
        parse_with(b"\"darth.vader\"@a.galaxy.far.far.away", addr_spec),
        r#"
Ok(
    Address {
        local_part: "\"darth.vader\"",
        domain: "a.galaxy.far.far.away",
    },
)
"#
    );

    k9::snapshot!(
        parse_with(b"\"darth\".vader@a.galaxy.far.far.away", addr_spec),
        r#"
Ok(
    Address {
        local_part: "\"darth\".vader",
        domain: "a.galaxy.far.far.away",
    },
)
"#
    );

    k9::snapshot!(
        parse_with(b"a@[127.0.0.1]", addr_spec),
        r#"
Ok(
    Address {
        local_part: "a",
        domain: "[127.0.0.1]",
    },
)
"#
    );

    assert!(parse_with(b"hello..there@example.com", addr_spec).is_err());
}

/// Validate `input` as an RFC 5322 `addr-spec`.
///
/// All parse failures collapse to `None`. The parser does not require
/// full-input consumption: trailing bytes after a syntactically valid
/// addr-spec are silently ignored.
pub fn parse_address(input: &[u8]) -> Option<Address> {
    Address::parse(input).ok()
}

/// A parsed RFC 5322 `addr-spec`: a local part and a domain.
///
/// Both parts are raw byte sequences. The grammar admits obsolete
/// control bytes, so they are not guaranteed to be valid UTF-8.
/// Equality, ordering and hashing are byte-wise, local part first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    local_part: BString,
    domain: BString,
}

impl Address {
    /// Construct an address directly from its two halves.
    ///
    /// No grammar validation happens on this path: the caller is
    /// responsible for supplying byte sequences that satisfy the
    /// `local-part` and `domain` productions. Use [`parse_address`]
    /// or [`Address::parse`] for untrusted input. The same applies
    /// to deserialized values.
    pub fn new<L: Into<BString>, D: Into<BString>>(local_part: L, domain: D) -> Self {
        Self {
            local_part: local_part.into(),
            domain: domain.into(),
        }
    }

    /// Parse an `addr-spec` from the start of `input`.
    ///
    /// Trailing bytes after a valid addr-spec are ignored, not
    /// rejected.
    pub fn parse(input: &[u8]) -> Result<Self> {
        let span = make_span(input);
        let (_, addr) = addr_spec(span).map_err(|err| AddrParsingError::from_nom(span, err))?;
        Ok(addr)
    }

    /// Parse a trusted constant, panicking if it is invalid.
    ///
    /// Intended for embedding known-valid addresses in code, never
    /// for validating external input.
    pub fn literal(text: &str) -> Self {
        match Self::parse(text.as_bytes()) {
            Ok(addr) => addr,
            Err(err) => panic!("invalid address literal {text:?}: {err:#}"),
        }
    }

    pub fn local_part(&self) -> &BStr {
        self.local_part.as_bstr()
    }

    pub fn domain(&self) -> &BStr {
        self.domain.as_bstr()
    }

    /// Canonical wire form: `local-part "@" domain`, byte for byte.
    /// Nothing is re-escaped or re-validated.
    pub fn to_byte_string(&self) -> BString {
        let mut result = BString::from(self.local_part.as_slice());
        result.push(b'@');
        result.extend_from_slice(&self.domain);
        result
    }

    /// Streaming equivalent of [`Address::to_byte_string`].
    pub fn write_to<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&self.local_part)?;
        out.write_all(b"@")?;
        out.write_all(&self.domain)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}@{}", self.local_part, self.domain)
    }
}

impl std::str::FromStr for Address {
    type Err = AddrParsingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s.as_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acceptance() {
        let cases: &[(&[u8], Address)] = &[
            (b"simple@example.com", Address::new("simple", "example.com")),
            (
                b"user.name+tag@sub.example.co",
                Address::new("user.name+tag", "sub.example.co"),
            ),
            (
                b"\"quoted local\"@example.com",
                Address::new("\"quotedlocal\"", "example.com"),
            ),
            (b"user@[192.168.0.1]", Address::new("user", "[192.168.0.1]")),
            (b"user(comment)@example.com", Address::new("user", "example.com")),
            (b"user@ (c) example.com", Address::new("user", "example.com")),
            (
                b"user(outer(inner))@example.com",
                Address::new("user", "example.com"),
            ),
        ];
        for (input, expected) in cases {
            let addr = parse_address(input)
                .unwrap_or_else(|| panic!("expected {:?} to parse", input.as_bstr()));
            k9::assert_equal!(&addr, expected, "{:?}", input.as_bstr());
        }
    }

    #[test]
    fn rejection() {
        let cases: &[&[u8]] = &[
            b"",
            b"@example.com",
            b"user@",
            b"user@@example.com",
            b"user@[unterminated",
            b"\"unterminated@example.com",
        ];
        for input in cases {
            assert!(
                parse_address(input).is_none(),
                "expected {:?} to be rejected",
                input.as_bstr()
            );
        }
    }

    #[test]
    fn round_trip() {
        let cases: &[&[u8]] = &[
            b"simple@example.com",
            b"user.name+tag@sub.example.co",
            b"\"a\\\"b\"@example.com",
            b"user@[192.168.0.1]",
        ];
        for input in cases {
            let addr = parse_address(input).unwrap();
            let wire = addr.to_byte_string();
            // These inputs carry no comments or folding whitespace, so
            // the wire form is the input itself
            k9::assert_equal!(wire.as_slice(), *input);
            let again = parse_address(&wire).unwrap();
            k9::assert_equal!(&again, &addr);
            k9::assert_equal!(again.to_byte_string(), wire);
        }
    }

    #[test]
    fn serialization_is_lossy_for_cfws() {
        // Comments and folding whitespace never survive a parse, so
        // re-parsing the wire form yields the same address even though
        // the original formatting is gone
        let addr = parse_address(b"user (a comment) @ (another) example.com").unwrap();
        k9::assert_equal!(addr.to_byte_string(), "user@example.com");
        k9::assert_equal!(parse_address(&addr.to_byte_string()), Some(addr));
    }

    #[test]
    fn quoted_pair_is_preserved() {
        let addr = parse_address(b"\"a\\\"b\"@example.com").unwrap();
        k9::assert_equal!(addr.local_part(), "\"a\\\"b\"");
        // backslash + quote survive as the literal two-byte escape
        k9::assert_equal!(addr.local_part().len(), 6);
    }

    #[test]
    fn folding_whitespace() {
        k9::assert_equal!(
            parse_address(b"user@example . com"),
            Some(Address::new("user", "example.com"))
        );
        k9::assert_equal!(
            parse_address(b"user@\r\n example.com"),
            Some(Address::new("user", "example.com"))
        );
        k9::assert_equal!(
            parse_address(b"\"fold\r\n ed\"@example.com"),
            Some(Address::new("\"folded\"", "example.com"))
        );
        // a fold requires CRLF; a bare LF is not whitespace
        k9::assert_equal!(parse_address(b"user@\n example.com"), None);
    }

    #[test]
    fn obsolete_control_bytes() {
        k9::assert_equal!(
            parse_address(b"user@[\x01ctl]"),
            Some(Address::new("user", "[\x01ctl]"))
        );
        k9::assert_equal!(
            parse_address(b"\"\x01\"@example.com"),
            Some(Address::new("\"\x01\"", "example.com"))
        );
        assert!(parse_address(b"user(\x07)@example.com").is_some());
    }

    #[test]
    fn trailing_input_is_ignored() {
        // The top level parser does not require full-input
        // consumption; anything after a valid addr-spec is ignored
        k9::assert_equal!(
            parse_address(b"user@example.com and then some"),
            Some(Address::new("user", "example.com"))
        );
        k9::assert_equal!(parse_address(b"a@b."), Some(Address::new("a", "b")));
    }

    #[test]
    fn ordering_and_equality() {
        assert!(Address::new("a", "b") < Address::new("a", "c"));
        assert!(Address::new("a", "b") < Address::new("b", "a"));
        k9::assert_equal!(Address::new("a", "b"), Address::new("a", "b"));
    }

    #[test]
    fn unchecked_constructor_bypasses_grammar() {
        let addr = Address::new("not valid!!", "also not valid");
        k9::assert_equal!(addr.to_byte_string(), "not valid!!@also not valid");
        k9::assert_equal!(addr.local_part(), "not valid!!");
        k9::assert_equal!(addr.domain(), "also not valid");
    }

    #[test]
    fn display_matches_wire_form() {
        let addr = Address::literal("user@[192.168.0.1]");
        k9::assert_equal!(format!("{addr}"), "user@[192.168.0.1]");

        let mut wire = Vec::new();
        addr.write_to(&mut wire).unwrap();
        k9::assert_equal!(addr.to_byte_string(), wire);
    }

    #[test]
    fn from_str() {
        let addr: Address = "user@example.com".parse().unwrap();
        k9::assert_equal!(addr, Address::new("user", "example.com"));
        assert!("not an address".parse::<Address>().is_err());
    }

    #[test]
    fn literal_constants() {
        let postmaster = Address::literal("postmaster@example.com");
        k9::assert_equal!(postmaster, Address::new("postmaster", "example.com"));
    }

    #[test]
    #[should_panic(expected = "invalid address literal")]
    fn literal_rejects_garbage() {
        Address::literal("not an address");
    }
}
