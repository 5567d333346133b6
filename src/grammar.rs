//! Grammar strategy.
//!
//! The set of reserved words and optional operators is not process-global:
//! a `Grammar` value is chosen once when the compiler is built and threaded
//! through the lexer and parser.

use serde::{Deserialize, Serialize};

/// Every word the lexer can ever treat as reserved.
const KNOWN_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
    // declarative words
    "declare", "template", "attr", "event", "alias", "func", "const",
];

const BASE_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "break", "class", "continue", "def", "del",
    "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is",
    "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

const DECLARATIVE_KEYWORDS: &[&str] = &["declare", "template", "attr", "event", "alias", "func", "const"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Grammar {
    /// Host-language reserved words.
    pub keywords: Vec<String>,
    /// Reserved words of the declarative layer.
    pub declarative_keywords: Vec<String>,
    /// Whether `@` lexes as the matrix multiplication operator.
    pub matmul_operator: bool,
    /// Whether `async` and `await` are reserved.
    pub async_keywords: bool,
}

impl Default for Grammar {
    fn default() -> Self {
        Self::modern()
    }
}

impl Grammar {
    pub fn modern() -> Self {
        Self {
            keywords: BASE_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            declarative_keywords: DECLARATIVE_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            matmul_operator: true,
            async_keywords: true,
        }
    }

    /// Older host grammar: no `@` operator, `async`/`await` are plain names.
    pub fn legacy() -> Self {
        Self {
            matmul_operator: false,
            async_keywords: false,
            ..Self::modern()
        }
    }

    /// Loads a grammar from its JSON form, rejecting unknown keywords.
    pub fn from_json(text: &str) -> Result<Self, GrammarError> {
        let grammar: Grammar = serde_json::from_str(text).map_err(|e| GrammarError::Format(e.to_string()))?;
        for word in grammar.keywords.iter().chain(&grammar.declarative_keywords) {
            if !KNOWN_KEYWORDS.contains(&word.as_str()) {
                return Err(GrammarError::UnknownKeyword(word.clone()));
            }
        }
        Ok(grammar)
    }

    /// Returns the interned keyword if `word` is reserved in this grammar.
    pub fn keyword(&self, word: &str) -> Option<&'static str> {
        let known = KNOWN_KEYWORDS.iter().copied().find(|k| *k == word)?;
        let enabled = if known == "async" || known == "await" {
            self.async_keywords
        } else {
            self.keywords.iter().any(|k| k == word) || self.declarative_keywords.iter().any(|k| k == word)
        };
        enabled.then_some(known)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GrammarError {
    #[error("invalid grammar configuration: {0}")]
    Format(String),
    #[error("unknown keyword '{0}' in grammar configuration")]
    UnknownKeyword(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modern_reserves_async() {
        let g = Grammar::modern();
        assert_eq!(g.keyword("await"), Some("await"));
        assert_eq!(g.keyword("declare"), Some("declare"));
        assert_eq!(g.keyword("window"), None);
    }

    #[test]
    fn test_legacy_frees_async() {
        let g = Grammar::legacy();
        assert_eq!(g.keyword("async"), None);
        assert!(!g.matmul_operator);
        assert_eq!(g.keyword("for"), Some("for"));
    }

    #[test]
    fn test_from_json_partial() {
        let g = Grammar::from_json(r#"{ "matmul_operator": false }"#).unwrap();
        assert!(!g.matmul_operator);
        assert_eq!(g.keyword("template"), Some("template"));
    }

    #[test]
    fn test_from_json_unknown_keyword() {
        let err = Grammar::from_json(r#"{ "keywords": ["frobnicate"] }"#).unwrap_err();
        assert_eq!(err, GrammarError::UnknownKeyword("frobnicate".to_string()));
    }
}
