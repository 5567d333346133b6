//! Indentation passes.
//!
//! `Tracker` annotates raw tokens with `at_line_start` and `must_indent`,
//! driven by block openers (`:` and `::`) and NEWLINE. `IndentFilter`
//! then turns leading whitespace into INDENT/DEDENT tokens using a stack of
//! previously seen depths.

use std::collections::VecDeque;

use crate::parser_error::{ParseError, ParseErrorKind};
use crate::token::{Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndentState {
    NoIndent,
    MayIndent,
    MustIndent,
}

#[derive(Debug)]
pub struct Tracker {
    at_line_start: bool,
    state: IndentState,
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            at_line_start: true,
            state: IndentState::NoIndent,
        }
    }
}

impl Tracker {
    pub fn mark(&mut self, token: &mut Token) {
        token.at_line_start = self.at_line_start;
        token.must_indent = false;
        match token.kind {
            TokenKind::Colon | TokenKind::DoubleColon => {
                self.at_line_start = false;
                self.state = IndentState::MayIndent;
            }
            TokenKind::Newline => {
                self.at_line_start = true;
                if self.state == IndentState::MayIndent {
                    self.state = IndentState::MustIndent;
                }
            }
            TokenKind::Whitespace(_) => {
                self.at_line_start = true;
            }
            _ => {
                token.must_indent = self.state == IndentState::MustIndent;
                self.at_line_start = false;
                self.state = IndentState::NoIndent;
            }
        }
    }

    /// True when a block opener was followed by a newline and nothing else.
    pub fn awaiting_block(&self) -> bool {
        self.state == IndentState::MustIndent
    }
}

/// Deepest block nesting accepted.
pub const MAX_INDENT: usize = 100;

#[derive(Debug)]
pub struct IndentFilter {
    levels: Vec<usize>,
    depth: usize,
}

impl Default for IndentFilter {
    fn default() -> Self {
        Self {
            levels: vec![0],
            depth: 0,
        }
    }
}

impl IndentFilter {
    /// Feeds one tracked token, pushing the resulting tokens onto `out`.
    pub fn feed(&mut self, token: Token, out: &mut VecDeque<Token>) -> Result<(), ParseError> {
        match token.kind {
            TokenKind::Whitespace(width) => {
                self.depth = width;
                return Ok(());
            }
            TokenKind::Newline => {
                self.depth = 0;
                if !token.at_line_start {
                    out.push_back(token);
                }
                return Ok(());
            }
            _ => {}
        }

        let current = self.levels.last().copied().unwrap_or(0);
        if token.must_indent {
            if self.depth <= current {
                return Err(ParseError::new(
                    ParseErrorKind::ExpectedIndent,
                    "expected an indented block",
                    token.line,
                    token.column,
                ));
            }
            if self.levels.len() > MAX_INDENT {
                return Err(ParseError::new(
                    ParseErrorKind::TooDeep,
                    "too many levels of indentation",
                    token.line,
                    token.column,
                ));
            }
            self.levels.push(self.depth);
            out.push_back(Token::new(TokenKind::Indent, token.line, 1));
        } else if token.at_line_start {
            if self.depth > current {
                return Err(ParseError::new(
                    ParseErrorKind::UnexpectedIndent,
                    "unexpected indent",
                    token.line,
                    token.column,
                ));
            }
            if self.depth < current {
                let Some(index) = self.levels.iter().position(|level| *level == self.depth) else {
                    return Err(ParseError::new(
                        ParseErrorKind::UnindentMismatch,
                        "unindent does not match any outer indentation level",
                        token.line,
                        token.column,
                    ));
                };
                for _ in index + 1..self.levels.len() {
                    out.push_back(Token::new(TokenKind::Dedent, token.line, 1));
                }
                self.levels.truncate(index + 1);
            }
        }
        out.push_back(token);
        Ok(())
    }

    /// Closes every open block and appends ENDMARKER.
    pub fn finish(&mut self, awaiting_block: bool, line: usize, out: &mut VecDeque<Token>) -> Result<(), ParseError> {
        if awaiting_block {
            return Err(ParseError::new(
                ParseErrorKind::ExpectedIndent,
                "expected an indented block",
                line,
                1,
            ));
        }
        while self.levels.len() > 1 {
            self.levels.pop();
            out.push_back(Token::new(TokenKind::Dedent, line, 1));
        }
        out.push_back(Token::new(TokenKind::EndMarker, line, 1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kinds: Vec<TokenKind>) -> Result<Vec<TokenKind>, ParseError> {
        let mut tracker = Tracker::default();
        let mut filter = IndentFilter::default();
        let mut out = VecDeque::new();
        for kind in kinds {
            let mut token = Token::new(kind, 1, 1);
            tracker.mark(&mut token);
            filter.feed(token, &mut out)?;
        }
        filter.finish(tracker.awaiting_block(), 1, &mut out)?;
        Ok(out.into_iter().map(|t| t.kind).collect())
    }

    fn name(n: &str) -> TokenKind {
        TokenKind::Name(n.to_string())
    }

    #[test]
    fn test_block_produces_indent_and_dedent() {
        let kinds = run(vec![
            name("a"),
            TokenKind::Colon,
            TokenKind::Newline,
            TokenKind::Whitespace(4),
            name("b"),
            TokenKind::Newline,
            name("c"),
            TokenKind::Newline,
        ])
        .unwrap();
        assert_eq!(
            kinds,
            vec![
                name("a"),
                TokenKind::Colon,
                TokenKind::Newline,
                TokenKind::Indent,
                name("b"),
                TokenKind::Newline,
                TokenKind::Dedent,
                name("c"),
                TokenKind::Newline,
                TokenKind::EndMarker,
            ]
        );
    }

    #[test]
    fn test_colon_followed_by_inline_body() {
        let kinds = run(vec![name("a"), TokenKind::DoubleColon, name("b"), TokenKind::Newline]).unwrap();
        assert!(!kinds.contains(&TokenKind::Indent));
    }

    #[test]
    fn test_missing_block() {
        let err = run(vec![name("a"), TokenKind::Colon, TokenKind::Newline, name("b")]).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::ExpectedIndent);
        let err = run(vec![name("a"), TokenKind::Colon, TokenKind::Newline]).unwrap_err();
        assert_eq!(err.message, "expected an indented block");
    }

    #[test]
    fn test_unexpected_indent() {
        let err = run(vec![name("a"), TokenKind::Newline, TokenKind::Whitespace(2), name("b")]).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnexpectedIndent);
    }
}
