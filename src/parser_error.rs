/// Category of a syntax failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// No lexical rule matched, or a literal was malformed.
    Lex,
    /// Unterminated string literal.
    UnterminatedString,
    /// Indentation increased where no block was opened.
    UnexpectedIndent,
    /// A dedent landed on a depth never seen on the indent stack.
    UnindentMismatch,
    /// A block opener was not followed by an indented block.
    ExpectedIndent,
    /// The token stream does not match the grammar.
    Syntax,
    /// Assignment or deletion of something that is not a target.
    InvalidTarget,
    /// Expressions or blocks nested past the supported depth.
    TooDeep,
}

impl ParseErrorKind {
    pub fn is_indentation(self) -> bool {
        matches!(
            self,
            ParseErrorKind::UnexpectedIndent | ParseErrorKind::UnindentMismatch | ParseErrorKind::ExpectedIndent
        )
    }

    fn label(self) -> &'static str {
        match self {
            ParseErrorKind::Lex | ParseErrorKind::UnterminatedString => "lex error",
            ParseErrorKind::UnexpectedIndent
            | ParseErrorKind::UnindentMismatch
            | ParseErrorKind::ExpectedIndent => "indentation error",
            ParseErrorKind::Syntax | ParseErrorKind::InvalidTarget | ParseErrorKind::TooDeep => "syntax error",
        }
    }
}

/// A lexing or parsing error with source location.
///
/// `line` and `column` are 1-based. `source_line` holds the offending line of
/// text (without its line terminator) when it is known.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{filename}:{line}:{column}: {}: {message}", kind.label())]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    pub filename: String,
    pub line: usize,
    pub column: usize,
    pub source_line: Option<String>,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            kind,
            message: message.into(),
            filename: String::new(),
            line,
            column,
            source_line: None,
        }
    }

    pub fn in_file(mut self, filename: &str) -> Self {
        self.filename = filename.to_string();
        self
    }

    /// Fills in the file name and offending line from the full source text.
    pub fn located(mut self, filename: &str, source: &str) -> Self {
        self.filename = filename.to_string();
        if self.source_line.is_none() && self.line > 0 {
            self.source_line = source.lines().nth(self.line - 1).map(|l| l.to_string());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_location() {
        let err = ParseError::new(ParseErrorKind::Syntax, "unexpected ')'", 3, 7).located("main.kn", "a\nb\nfoo())\n");
        assert_eq!(err.to_string(), "main.kn:3:7: syntax error: unexpected ')'");
        assert_eq!(err.source_line.as_deref(), Some("foo())"));
    }

    #[test]
    fn test_indentation_kinds() {
        assert!(ParseErrorKind::UnindentMismatch.is_indentation());
        assert!(!ParseErrorKind::InvalidTarget.is_indentation());
    }
}
