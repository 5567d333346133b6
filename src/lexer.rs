mod indent;
mod strings;

use std::collections::VecDeque;

use crate::grammar::Grammar;
use crate::parser_error::{ParseError, ParseErrorKind};
use crate::token::{Token, TokenKind};

use indent::{IndentFilter, Tracker};
use strings::{Prefix, StringState};

const TAB_WIDTH: usize = 8;

/// Raw scanner: produces tokens plus leading-whitespace markers, with
/// NEWLINE suppressed inside brackets. Indentation is resolved later.
pub struct Lexer<'a> {
    text: &'a str,
    source: Vec<char>,
    grammar: &'a Grammar,
    pos: usize,
    line: usize,
    col: usize,
    paren_depth: usize,
    line_start: bool,
    last_was_newline: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str, grammar: &'a Grammar) -> Self {
        Lexer {
            text,
            source: text.chars().collect(),
            grammar,
            pos: 0,
            line: 1,
            col: 1,
            paren_depth: 0,
            line_start: true,
            last_was_newline: true,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn error(&self, kind: ParseErrorKind, message: impl Into<String>, line: usize, col: usize) -> ParseError {
        let mut err = ParseError::new(kind, message, line, col);
        err.source_line = self.source_line(line);
        err
    }

    pub fn source_line(&self, line: usize) -> Option<String> {
        line.checked_sub(1)
            .and_then(|index| self.text.lines().nth(index))
            .map(|l| l.to_string())
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch == ' ' || ch == '\t' || ch == '\r' || ch == '\x0c' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    /// Measures the indentation of a fresh logical line. Blank and
    /// comment-only lines are consumed whole and yield `None`.
    fn read_indentation(&mut self) -> Option<Option<Token>> {
        let line = self.line;
        let mut width = 0;
        while let Some(ch) = self.current() {
            match ch {
                ' ' => width += 1,
                '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                '\x0c' | '\r' => {}
                _ => break,
            }
            self.advance();
        }
        match self.current() {
            Some('#') => {
                self.skip_comment();
                self.advance();
                self.line_start = true;
                None
            }
            Some('\n') => {
                self.advance();
                self.line_start = true;
                None
            }
            None => Some(None),
            Some(_) if width > 0 => Some(Some(Token::new(TokenKind::Whitespace(width), line, 1))),
            Some(_) => Some(None),
        }
    }

    /// Produces the next raw token, or `None` at end of input.
    pub fn next_token(&mut self) -> Result<Option<Token>, ParseError> {
        loop {
            if self.line_start && self.paren_depth == 0 {
                self.line_start = false;
                match self.read_indentation() {
                    None => continue,
                    Some(Some(ws)) => return Ok(Some(ws)),
                    Some(None) => {}
                }
            }

            self.skip_whitespace();
            let (line, col) = (self.line, self.col);

            let Some(ch) = self.current() else {
                if self.paren_depth > 0 {
                    return Err(self.error(ParseErrorKind::Syntax, "unexpected end of input in multi-line statement", line, col));
                }
                if !self.last_was_newline {
                    self.last_was_newline = true;
                    return Ok(Some(Token::new(TokenKind::Newline, line, col)));
                }
                return Ok(None);
            };

            let kind = match ch {
                '#' => {
                    self.skip_comment();
                    continue;
                }
                '\n' => {
                    self.advance();
                    if self.paren_depth > 0 {
                        continue;
                    }
                    self.line_start = true;
                    TokenKind::Newline
                }
                '\\' => {
                    let next = self.peek();
                    if next == Some('\n') || (next == Some('\r') && self.source.get(self.pos + 2) == Some(&'\n')) {
                        self.advance();
                        self.skip_whitespace();
                        self.advance();
                        continue;
                    }
                    return Err(self.error(
                        ParseErrorKind::Lex,
                        "unexpected character after line continuation character",
                        line,
                        col,
                    ));
                }
                '\'' | '"' => self.read_string(Prefix::Plain, line, col)?,
                c if c.is_ascii_digit() => self.read_number(line, col)?,
                '.' if self.peek().is_some_and(|c| c.is_ascii_digit()) => self.read_number(line, col)?,
                c if c.is_alphabetic() || c == '_' => self.read_identifier(line, col)?,
                _ => self.read_operator(line, col)?,
            };
            self.last_was_newline = kind == TokenKind::Newline;
            return Ok(Some(Token::new(kind, line, col)));
        }
    }

    fn read_string(&mut self, prefix: Prefix, line: usize, col: usize) -> Result<TokenKind, ParseError> {
        let quote = self.current().unwrap_or('"');
        let triple = self.source.len() >= self.pos + 3 && self.source[self.pos..self.pos + 3].iter().all(|c| *c == quote);
        let state = match (triple, quote) {
            (false, '\'') => StringState::SingleQ1,
            (false, _) => StringState::SingleQ2,
            (true, '\'') => StringState::TripleQ1,
            (true, _) => StringState::TripleQ2,
        };
        for _ in 0..if triple { 3 } else { 1 } {
            self.advance();
        }
        let (body, used) = strings::scan_body(&self.source, self.pos, state, line, col).map_err(|mut e| {
            e.source_line = self.source_line(line);
            e
        })?;
        for _ in 0..used {
            self.advance();
        }
        strings::finish(&body, prefix, line, col).map_err(|mut e| {
            e.source_line = self.source_line(line);
            e
        })
    }

    fn read_number(&mut self, line: usize, col: usize) -> Result<TokenKind, ParseError> {
        let radix = match (self.current(), self.peek()) {
            (Some('0'), Some('x' | 'X')) => Some(16),
            (Some('0'), Some('o' | 'O')) => Some(8),
            (Some('0'), Some('b' | 'B')) => Some(2),
            _ => None,
        };

        if let Some(radix) = radix {
            self.advance();
            self.advance();
            let mut digits = String::new();
            while let Some(ch) = self.current() {
                if ch.is_digit(radix) {
                    digits.push(ch);
                } else if ch != '_' {
                    break;
                }
                self.advance();
            }
            if digits.is_empty() {
                return Err(self.error(ParseErrorKind::Lex, "invalid integer literal", line, col));
            }
            let value = i64::from_str_radix(&digits, radix)
                .map_err(|_| self.error(ParseErrorKind::Lex, "integer literal too large", line, col))?;
            return Ok(TokenKind::Integer(value));
        }

        let mut digits = String::new();
        let mut is_float = false;
        let mut seen_exp = false;
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                digits.push(ch);
            } else if ch == '_' && self.peek().is_some_and(|c| c.is_ascii_digit()) {
            } else if ch == '.' && !is_float && !seen_exp {
                is_float = true;
                digits.push('.');
            } else if (ch == 'e' || ch == 'E') && !seen_exp {
                let sign = matches!(self.peek(), Some('+' | '-'));
                let after = if sign { self.source.get(self.pos + 2).copied() } else { self.peek() };
                if !after.is_some_and(|c| c.is_ascii_digit()) {
                    break;
                }
                seen_exp = true;
                is_float = true;
                digits.push('e');
                if sign {
                    self.advance();
                    digits.push(self.current().unwrap_or('+'));
                }
            } else {
                break;
            }
            self.advance();
        }

        if self.current().is_some_and(|c| c.is_alphabetic() || c == '_') {
            return Err(self.error(ParseErrorKind::Lex, "invalid numeric literal", line, col));
        }

        if is_float {
            let value: f64 = digits
                .parse()
                .map_err(|_| self.error(ParseErrorKind::Lex, format!("invalid float: {}", digits), line, col))?;
            Ok(TokenKind::Float(value))
        } else {
            if digits.len() > 1 && digits.starts_with('0') && digits.chars().any(|c| c != '0') {
                return Err(self.error(
                    ParseErrorKind::Lex,
                    "leading zeros in decimal integer literals are not permitted",
                    line,
                    col,
                ));
            }
            let value: i64 = digits
                .parse()
                .map_err(|_| self.error(ParseErrorKind::Lex, "integer literal too large", line, col))?;
            Ok(TokenKind::Integer(value))
        }
    }

    fn read_identifier(&mut self, line: usize, col: usize) -> Result<TokenKind, ParseError> {
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        if matches!(self.current(), Some('\'' | '"')) {
            if let Some(prefix) = Prefix::from_text(&ident) {
                return self.read_string(prefix, line, col);
            }
        }

        Ok(match self.grammar.keyword(&ident) {
            Some(keyword) => TokenKind::Keyword(keyword),
            None => TokenKind::Name(ident),
        })
    }

    fn read_operator(&mut self, line: usize, col: usize) -> Result<TokenKind, ParseError> {
        for len in (1..=3).rev() {
            if self.pos + len > self.source.len() {
                continue;
            }
            let text: String = self.source[self.pos..self.pos + len].iter().collect();
            if let Some(kind) = self.operator(&text) {
                for _ in 0..len {
                    self.advance();
                }
                match kind {
                    TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => self.paren_depth += 1,
                    TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                        self.paren_depth = self.paren_depth.saturating_sub(1)
                    }
                    _ => {}
                }
                return Ok(kind);
            }
        }
        let ch = self.current().unwrap_or(' ');
        Err(self.error(ParseErrorKind::Lex, format!("unexpected character: '{}'", ch), line, col))
    }

    fn operator(&self, text: &str) -> Option<TokenKind> {
        let matmul = self.grammar.matmul_operator;
        let kind = match text {
            "**=" => TokenKind::AugAssign("**"),
            "//=" => TokenKind::AugAssign("//"),
            "<<=" => TokenKind::AugAssign("<<"),
            ">>=" => TokenKind::AugAssign(">>"),
            "+=" => TokenKind::AugAssign("+"),
            "-=" => TokenKind::AugAssign("-"),
            "*=" => TokenKind::AugAssign("*"),
            "/=" => TokenKind::AugAssign("/"),
            "%=" => TokenKind::AugAssign("%"),
            "&=" => TokenKind::AugAssign("&"),
            "|=" => TokenKind::AugAssign("|"),
            "^=" => TokenKind::AugAssign("^"),
            "@=" if matmul => TokenKind::AugAssign("@"),
            "**" => TokenKind::DoubleStar,
            "//" => TokenKind::DoubleSlash,
            "<<" => TokenKind::LeftShift,
            ">>" => TokenKind::RightShift,
            "<=" => TokenKind::LessEqual,
            ">=" => TokenKind::GreaterEqual,
            "==" => TokenKind::EqEqual,
            "!=" => TokenKind::NotEqual,
            "->" => TokenKind::Arrow,
            "=>" => TokenKind::RightArrow,
            ":=" => TokenKind::ColonEqual,
            "::" => TokenKind::DoubleColon,
            "+" => TokenKind::Plus,
            "-" => TokenKind::Minus,
            "*" => TokenKind::Star,
            "/" => TokenKind::Slash,
            "%" => TokenKind::Percent,
            "@" if matmul => TokenKind::At,
            "&" => TokenKind::Ampersand,
            "|" => TokenKind::Pipe,
            "^" => TokenKind::Caret,
            "~" => TokenKind::Tilde,
            "<" => TokenKind::Less,
            ">" => TokenKind::Greater,
            "=" => TokenKind::Equal,
            "." => TokenKind::Dot,
            "," => TokenKind::Comma,
            ":" => TokenKind::Colon,
            ";" => TokenKind::Semicolon,
            "(" => TokenKind::LParen,
            ")" => TokenKind::RParen,
            "[" => TokenKind::LBracket,
            "]" => TokenKind::RBracket,
            "{" => TokenKind::LBrace,
            "}" => TokenKind::RBrace,
            _ => return None,
        };
        Some(kind)
    }
}

/// Lazy token sequence with indentation resolved.
///
/// The first failure is captured and the stream ends; callers retrieve it
/// with [`TokenStream::take_error`] once they stop consuming.
pub struct TokenStream<'a> {
    lexer: Lexer<'a>,
    tracker: Tracker,
    indent: IndentFilter,
    pending: VecDeque<Token>,
    error: Option<ParseError>,
    finished: bool,
}

pub fn tokenize<'a>(source: &'a str, grammar: &'a Grammar) -> TokenStream<'a> {
    TokenStream {
        lexer: Lexer::new(source, grammar),
        tracker: Tracker::default(),
        indent: IndentFilter::default(),
        pending: VecDeque::new(),
        error: None,
        finished: false,
    }
}

impl TokenStream<'_> {
    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<ParseError> {
        self.error.take()
    }

    pub fn source_line(&self, line: usize) -> Option<String> {
        self.lexer.source_line(line)
    }

    fn fail(&mut self, mut err: ParseError) {
        if err.source_line.is_none() {
            err.source_line = self.lexer.source_line(err.line);
        }
        log::trace!("lexer stopped: {}", err);
        self.error = Some(err);
        self.pending.clear();
        self.finished = true;
    }

    fn pump(&mut self) {
        match self.lexer.next_token() {
            Ok(Some(mut token)) => {
                self.tracker.mark(&mut token);
                if let Err(err) = self.indent.feed(token, &mut self.pending) {
                    self.fail(err);
                }
            }
            Ok(None) => {
                self.finished = true;
                let awaiting = self.tracker.awaiting_block();
                if let Err(err) = self.indent.finish(awaiting, self.lexer.line, &mut self.pending) {
                    self.fail(err);
                }
            }
            Err(err) => self.fail(err),
        }
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Some(token);
            }
            if self.finished {
                return None;
            }
            self.pump();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let grammar = Grammar::default();
        let mut stream = tokenize(source, &grammar);
        let out: Vec<TokenKind> = stream.by_ref().map(|t| t.kind).collect();
        assert!(stream.error().is_none(), "unexpected error: {:?}", stream.error());
        out
    }

    fn failure(source: &str) -> ParseError {
        let grammar = Grammar::default();
        let mut stream = tokenize(source, &grammar);
        stream.by_ref().for_each(drop);
        stream.take_error().expect("expected a lexing error")
    }

    fn name(n: &str) -> TokenKind {
        TokenKind::Name(n.to_string())
    }

    #[test]
    fn test_declare_block() {
        let t = kinds("declare Main(Window):\n    attr x: int = 1\n");
        assert_eq!(
            t,
            vec![
                TokenKind::Keyword("declare"),
                name("Main"),
                TokenKind::LParen,
                name("Window"),
                TokenKind::RParen,
                TokenKind::Colon,
                TokenKind::Newline,
                TokenKind::Indent,
                TokenKind::Keyword("attr"),
                name("x"),
                TokenKind::Colon,
                name("int"),
                TokenKind::Equal,
                TokenKind::Integer(1),
                TokenKind::Newline,
                TokenKind::Dedent,
                TokenKind::EndMarker,
            ]
        );
    }

    #[test]
    fn test_nested_indentation_balances() {
        let src = "a:\n    b:\n        c\n    d\n\n# note\ne\n";
        let t = kinds(src);
        let indents = t.iter().filter(|k| **k == TokenKind::Indent).count();
        let dedents = t.iter().filter(|k| **k == TokenKind::Dedent).count();
        assert_eq!(indents, 2);
        assert_eq!(dedents, 2);
        let mut depth = 0i32;
        for k in &t {
            match k {
                TokenKind::Indent => depth += 1,
                TokenKind::Dedent => depth -= 1,
                _ => {}
            }
            assert!(depth >= 0);
        }
        assert_eq!(depth, 0);
    }

    #[test]
    fn test_unindent_mismatch() {
        let err = failure("a:\n    b\n  c\n");
        assert_eq!(err.kind, ParseErrorKind::UnindentMismatch);
        assert_eq!(err.message, "unindent does not match any outer indentation level");
        assert_eq!(err.line, 3);
        assert_eq!(err.source_line.as_deref(), Some("  c"));
    }

    #[test]
    fn test_unexpected_indent() {
        let err = failure("a\n    b\n");
        assert_eq!(err.kind, ParseErrorKind::UnexpectedIndent);
    }

    #[test]
    fn test_brackets_suppress_newline() {
        let t = kinds("x = (1,\n     2)\n");
        assert_eq!(t.iter().filter(|k| **k == TokenKind::Newline).count(), 1);
        assert!(!t.contains(&TokenKind::Indent));
    }

    #[test]
    fn test_line_continuation() {
        let t = kinds("x = 1 + \\\n    2\n");
        assert_eq!(t.iter().filter(|k| **k == TokenKind::Newline).count(), 1);
        assert!(t.contains(&TokenKind::Integer(2)));
    }

    #[test]
    fn test_binding_operators() {
        let t = kinds("a << b\nc >> d\ne := f\ng :: h\ni => (j)\n");
        for op in [
            TokenKind::LeftShift,
            TokenKind::RightShift,
            TokenKind::ColonEqual,
            TokenKind::DoubleColon,
            TokenKind::RightArrow,
        ] {
            assert!(t.contains(&op), "missing {:?}", op);
        }
    }

    #[test]
    fn test_strings_and_prefixes() {
        let t = kinds("x = 'a' \"b\" r'\\n' b'z' '''t\nu'''\n");
        assert_eq!(
            &t[2..7],
            &[
                TokenKind::String("a".into()),
                TokenKind::String("b".into()),
                TokenKind::String("\\n".into()),
                TokenKind::Bytes(vec![b'z']),
                TokenKind::String("t\nu".into()),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let t = kinds("0x1f 0o17 0b11 1_000 1.5 .5 2e3 10\n");
        assert_eq!(
            &t[..8],
            &[
                TokenKind::Integer(31),
                TokenKind::Integer(15),
                TokenKind::Integer(3),
                TokenKind::Integer(1000),
                TokenKind::Float(1.5),
                TokenKind::Float(0.5),
                TokenKind::Float(2000.0),
                TokenKind::Integer(10),
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = failure("x = 'abc\n");
        assert_eq!(err.kind, ParseErrorKind::UnterminatedString);
        assert_eq!((err.line, err.column), (1, 5));
    }

    #[test]
    fn test_matmul_depends_on_grammar() {
        assert!(kinds("a @ b\n").contains(&TokenKind::At));
        let legacy = Grammar::legacy();
        let mut stream = tokenize("a @ b\n", &legacy);
        stream.by_ref().for_each(drop);
        assert_eq!(stream.take_error().map(|e| e.kind), Some(ParseErrorKind::Lex));
    }

    #[test]
    fn test_positions() {
        let grammar = Grammar::default();
        let tokens: Vec<Token> = tokenize("ab = 12\n", &grammar).collect();
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (1, 4));
        assert_eq!((tokens[2].line, tokens[2].column), (1, 6));
    }

    #[test]
    fn test_indentation_limit() {
        let src: String = (0..=super::indent::MAX_INDENT + 1).map(|i| format!("{}a:\n", " ".repeat(i))).collect();
        let src = format!("{}{}b\n", src, " ".repeat(super::indent::MAX_INDENT + 2));
        let err = failure(&src);
        assert_eq!(err.kind, ParseErrorKind::TooDeep);
        assert_eq!(err.message, "too many levels of indentation");
    }
}
