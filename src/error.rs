//! Error types for the query compiler.
//!
//! Every stage of the pipeline reports failure as a [`SyntaxError`] positioned on the
//! offending token. Collaborators (resolvers, expression parsers, config loading) have
//! their own small error types that the factory converts at the call site.

use thiserror::Error;

use crate::token::{Located, Span};

/// The single error kind of the tokenise → structure → build pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct SyntaxError {
    message: String,
    span: Option<Span>,
    text: Option<String>,
}

impl SyntaxError {
    /// An error that is not attached to any token, e.g. an empty query.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            span: None,
            text: None,
        }
    }

    /// An error positioned on a token or token group.
    pub fn at(token: &impl Located, message: impl Into<String>) -> Self {
        let (span, text) = token.location();
        Self {
            message: message.into(),
            span: Some(span),
            text: Some(text.to_string()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Byte range of the offending token within the query text.
    pub fn span(&self) -> Option<Span> {
        self.span
    }

    /// Source text of the offending token.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

/// Result type for the compiler pipeline
pub type SyntaxResult<T> = Result<T, SyntaxError>;

/// Failure to resolve a document name to a [`crate::ast::DocRef`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("{doc_type} \"{name}\" not found")]
    NotFound { doc_type: String, name: String },

    #[error("Multiple {doc_type} documents found with name \"{name}\"")]
    Ambiguous { doc_type: String, name: String },
}

/// Failure reported by an embedded expression or date expression parser.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ExpressionError(pub String);

impl ExpressionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure to load a document catalog.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file does not exist: {0}")]
    Missing(String),

    #[error("Unable to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to parse config {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SyntaxError::new("No tokens");
        assert_eq!(err.to_string(), "No tokens");
        assert_eq!(err.span(), None);
        assert_eq!(err.text(), None);

        let err = ResolveError::NotFound {
            doc_type: "Dictionary".to_string(),
            name: "Feeds".to_string(),
        };
        assert_eq!(err.to_string(), "Dictionary \"Feeds\" not found");

        let err = ResolveError::Ambiguous {
            doc_type: "View".to_string(),
            name: "Events".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Multiple View documents found with name \"Events\""
        );

        let err = ConfigError::Missing("catalog.json".to_string());
        assert_eq!(err.to_string(), "Config file does not exist: catalog.json");
    }

    #[test]
    fn test_positioned_error() {
        struct Fake;
        impl Located for Fake {
            fn location(&self) -> (Span, &str) {
                (Span::new(5, 10), "where")
            }
        }

        let err = SyntaxError::at(&Fake, "Unexpected where after select");
        assert_eq!(err.message(), "Unexpected where after select");
        assert_eq!(err.span(), Some(Span::new(5, 10)));
        assert_eq!(err.text(), Some("where"));
    }
}
