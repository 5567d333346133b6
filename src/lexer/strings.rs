//! String literal sub-states.
//!
//! A string is scanned in one of four states (single or triple quoted, with
//! `'` or `"`). Each state has a continue production, which consumes escape
//! pairs and ordinary characters, and an end production, which matches the
//! closing delimiter. The literal prefix picks the transform applied to the
//! collected body when the string closes.

use crate::parser_error::{ParseError, ParseErrorKind};
use crate::token::TokenKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringState {
    SingleQ1,
    SingleQ2,
    TripleQ1,
    TripleQ2,
}

impl StringState {
    pub fn quote(self) -> char {
        match self {
            StringState::SingleQ1 | StringState::TripleQ1 => '\'',
            StringState::SingleQ2 | StringState::TripleQ2 => '"',
        }
    }

    pub fn is_triple(self) -> bool {
        matches!(self, StringState::TripleQ1 | StringState::TripleQ2)
    }

    fn delimiter_len(self) -> usize {
        if self.is_triple() { 3 } else { 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Plain,
    Raw,
    Unicode,
    Bytes,
    RawBytes,
}

impl Prefix {
    /// Parses a literal prefix, case-insensitively.
    pub fn from_text(text: &str) -> Option<Prefix> {
        match text.to_ascii_lowercase().as_str() {
            "" => Some(Prefix::Plain),
            "r" => Some(Prefix::Raw),
            "u" => Some(Prefix::Unicode),
            "b" => Some(Prefix::Bytes),
            "br" | "rb" => Some(Prefix::RawBytes),
            _ => None,
        }
    }

    fn is_raw(self) -> bool {
        matches!(self, Prefix::Raw | Prefix::RawBytes)
    }

    fn is_bytes(self) -> bool {
        matches!(self, Prefix::Bytes | Prefix::RawBytes)
    }
}

/// Outcome of one step of the string state machine.
enum Step {
    /// Continue production: characters appended to the body.
    Continue(usize),
    /// End production: delimiter length consumed.
    End(usize),
}

/// Scans a string body starting just after the opening delimiter.
///
/// Returns the raw body and the number of characters consumed including the
/// closing delimiter. `line`/`column` locate the opening quote for errors.
pub fn scan_body(
    chars: &[char],
    start: usize,
    state: StringState,
    line: usize,
    column: usize,
) -> Result<(String, usize), ParseError> {
    let mut body = String::new();
    let mut pos = start;
    loop {
        match step(chars, pos, state) {
            Some(Step::Continue(n)) => {
                body.extend(&chars[pos..pos + n]);
                pos += n;
            }
            Some(Step::End(n)) => {
                pos += n;
                return Ok((body, pos - start));
            }
            None => {
                let what = if state.is_triple() { "triple-quoted string" } else { "string" };
                return Err(ParseError::new(
                    ParseErrorKind::UnterminatedString,
                    format!("unterminated {} literal", what),
                    line,
                    column,
                ));
            }
        }
    }
}

fn step(chars: &[char], pos: usize, state: StringState) -> Option<Step> {
    let ch = *chars.get(pos)?;
    let quote = state.quote();
    if ch == '\\' {
        // an escape pair always belongs to the body, even `\` + quote
        return chars.get(pos + 1).map(|_| Step::Continue(2));
    }
    if ch == quote {
        let n = state.delimiter_len();
        if chars.len() >= pos + n && chars[pos..pos + n].iter().all(|c| *c == quote) {
            return Some(Step::End(n));
        }
        return Some(Step::Continue(1));
    }
    if ch == '\n' && !state.is_triple() {
        return None;
    }
    Some(Step::Continue(1))
}

/// Applies the prefix transform to a closed string body.
pub fn finish(body: &str, prefix: Prefix, line: usize, column: usize) -> Result<TokenKind, ParseError> {
    let text = if prefix.is_raw() {
        body.to_string()
    } else {
        unescape(body, prefix.is_bytes()).map_err(|msg| ParseError::new(ParseErrorKind::Lex, msg, line, column))?
    };
    if prefix.is_bytes() {
        if body.chars().any(|c| !c.is_ascii()) {
            return Err(ParseError::new(
                ParseErrorKind::Lex,
                "bytes can only contain ASCII literal characters",
                line,
                column,
            ));
        }
        // escapes such as \xff decode to U+0080..U+00FF, one byte each
        let mut bytes = Vec::with_capacity(text.len());
        for c in text.chars() {
            let value = u8::try_from(c as u32)
                .map_err(|_| ParseError::new(ParseErrorKind::Lex, "escape out of range in bytes literal", line, column))?;
            bytes.push(value);
        }
        return Ok(TokenKind::Bytes(bytes));
    }
    Ok(TokenKind::String(text))
}

fn unescape(body: &str, bytes: bool) -> Result<String, String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let Some(esc) = chars.next() else {
            out.push('\\');
            break;
        };
        match esc {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\x0b'),
            '0'..='7' => {
                let mut value = esc.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(code_point(value)?);
            }
            'x' => out.push(code_point(hex_digits(&mut chars, 2, 'x')?)?),
            'u' if !bytes => out.push(code_point(hex_digits(&mut chars, 4, 'u')?)?),
            'U' if !bytes => out.push(code_point(hex_digits(&mut chars, 8, 'U')?)?),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

fn hex_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, count: usize, tag: char) -> Result<u32, String> {
    let mut value = 0u32;
    for _ in 0..count {
        let digit = chars
            .next()
            .and_then(|c| c.to_digit(16))
            .ok_or_else(|| format!("truncated \\{} escape", tag))?;
        value = value * 16 + digit;
    }
    Ok(value)
}

fn code_point(value: u32) -> Result<char, String> {
    char::from_u32(value).ok_or_else(|| format!("invalid code point {:#x} in escape", value))
}
