use crate::bytecode::ConsistencyError;
use crate::parser_error::ParseError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Source that parses but cannot be compiled.
    #[error("{filename}:{line}: compile error: {message}{}", hint.as_ref().map(|h| format!("\n  hint: {}", h)).unwrap_or_default())]
    Invalid {
        filename: String,
        line: usize,
        message: String,
        hint: Option<String>,
    },

    /// A generated unit failed its structural checks. Always a compiler bug.
    #[error("compile error: internal error in '{unit}': {source}")]
    Consistency {
        unit: String,
        #[source]
        source: ConsistencyError,
    },

    #[error("compile error: internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn invalid(filename: &str, line: usize, message: impl Into<String>) -> Self {
        CompileError::Invalid {
            filename: filename.to_string(),
            line,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(self, text: impl Into<String>) -> Self {
        match self {
            CompileError::Invalid {
                filename,
                line,
                message,
                ..
            } => CompileError::Invalid {
                filename,
                line,
                message,
                hint: Some(text.into()),
            },
            other => other,
        }
    }

    pub fn consistency(unit: &str, source: ConsistencyError) -> Self {
        CompileError::Consistency {
            unit: unit.to_string(),
            source,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Label;

    #[test]
    fn test_invalid_display() {
        let err = CompileError::invalid("main.kn", 4, "'break' outside loop");
        assert_eq!(err.to_string(), "main.kn:4: compile error: 'break' outside loop");

        let err = err.with_hint("move it into a for or while body");
        let msg = err.to_string();
        assert!(msg.contains("\n  hint: move it into a for or while body"));
    }

    #[test]
    fn test_consistency_keeps_source() {
        let err = CompileError::consistency("Main.construct", ConsistencyError::UndefinedLabel(Label(2)));
        assert!(err.to_string().contains("'Main.construct'"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
