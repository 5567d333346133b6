use std::io::{self, Write};

use crate::token::{Token, TokenKind};

pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints source text instead of Debug
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_debug_repr: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";
    const BLU: &'static str = "\x1b[34m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_debug_repr = false;
        self
    }

    pub fn dump(&self, tokens: impl IntoIterator<Item = Token>, out: &mut impl Write) -> io::Result<()> {
        for token in tokens {
            writeln!(out, "{}", self.format(&token))?;
        }
        Ok(())
    }

    pub fn format(&self, token: &Token) -> String {
        let kind = Self::kind(&token.kind);
        let (colr, reset) = if self.color {
            (Self::color(&token.kind), Self::RESET)
        } else {
            ("", "")
        };
        let text = if self.show_debug_repr {
            format!("{:?}", token.kind)
        } else {
            token.kind.to_string()
        };
        format!(
            "[{:02}:{:02}] {}{:<8} {}{}",
            token.line, token.column, colr, kind, text, reset
        )
    }

    fn kind(kind: &TokenKind) -> &'static str {
        use TokenKind::*;
        match kind {
            Newline | Indent | Dedent | EndMarker | Whitespace(_) => "LAYOUT",
            Integer(_) | Float(_) => "NUMBER",
            String(_) | Bytes(_) => "STRING",
            Name(_) => "NAME",
            Keyword(_) => "KEYWORD",
            LParen | RParen | LBracket | RBracket | LBrace | RBrace => "BRACKET",
            Equal | ColonEqual | DoubleColon | Arrow | RightArrow | AugAssign(_) => "BIND",
            Dot | Comma | Colon | Semicolon => "PUNCT",
            _ => "OP",
        }
    }

    fn color(kind: &TokenKind) -> &'static str {
        use TokenKind::*;
        match kind {
            Newline | Indent | Dedent | EndMarker | Whitespace(_) => Self::DIM,
            String(_) | Bytes(_) => Self::GRN,
            Integer(_) | Float(_) => Self::CYN,
            Name(_) => Self::YEL,
            Keyword(_) => Self::BLU,
            Equal | ColonEqual | DoubleColon | Arrow | RightArrow | AugAssign(_) => Self::MAG,
            _ => Self::RESET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Grammar;
    use crate::lexer::tokenize;

    #[test]
    fn test_plain_dump_lists_operators() {
        let grammar = Grammar::default();
        let mut out = Vec::new();
        TokenDumper::new()
            .no_color()
            .pretty()
            .dump(tokenize("x := y\n", &grammar), &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[01:01] NAME     x");
        assert_eq!(lines[1], "[01:03] BIND     :=");
        assert!(lines.last().unwrap().contains("ENDMARKER"));
    }
}
