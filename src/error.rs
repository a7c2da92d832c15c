// Error types for the NNEF front end
//
// Every failure while lexing, parsing or evaluating a document is reported
// as a single Error carrying the position it was raised at. Errors raised
// while evaluating an inlined fragment body get the invocation site chained
// on as an origin, so the rendered message reads as a small call trace:
//
//   graph.nnef:3:9: undeclared identifier 'w'
//     evaluated from graph.nnef:12:5

use crate::token::Position;
use std::fmt;

/// Result type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that can occur during lexing, parsing or evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub position: Option<Position>,
}

/// Broad classification of an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Lexical,
    Syntax,
    Type,
    Scope,
    Semantic,
    Evaluation,
    Assertion,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    // Lexer errors
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    // Parser errors
    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },
    #[error("unsupported version {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },
    #[error("could not handle extension '{0}'")]
    UnhandledExtension(String),

    // Type checking
    #[error("{0}")]
    Type(String),

    // Name resolution
    #[error("undeclared {what} '{name}'")]
    Undeclared { what: &'static str, name: String },
    #[error("duplicate {what} '{name}'")]
    Duplicate { what: &'static str, name: String },

    // Structural rules on declarations and assignments
    #[error("{0}")]
    Semantic(String),

    // Constant evaluation and flattening
    #[error("{0}")]
    Evaluation(String),

    // Internal invariant violations
    #[error("internal error: {0}")]
    Assertion(String),
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::UnterminatedString | ErrorKind::InvalidNumber(_) => ErrorCategory::Lexical,
            ErrorKind::UnexpectedToken { .. }
            | ErrorKind::UnsupportedVersion { .. }
            | ErrorKind::UnhandledExtension(_) => ErrorCategory::Syntax,
            ErrorKind::Type(_) => ErrorCategory::Type,
            ErrorKind::Undeclared { .. } | ErrorKind::Duplicate { .. } => ErrorCategory::Scope,
            ErrorKind::Semantic(_) => ErrorCategory::Semantic,
            ErrorKind::Evaluation(_) => ErrorCategory::Evaluation,
            ErrorKind::Assertion(_) => ErrorCategory::Assertion,
        }
    }
}

impl Error {
    pub fn new(kind: ErrorKind, position: Position) -> Self {
        Self {
            kind,
            position: Some(position),
        }
    }

    pub fn type_error(msg: impl Into<String>, position: &Position) -> Self {
        Self::new(ErrorKind::Type(msg.into()), position.clone())
    }

    pub fn semantic(msg: impl Into<String>, position: &Position) -> Self {
        Self::new(ErrorKind::Semantic(msg.into()), position.clone())
    }

    pub fn evaluation(msg: impl Into<String>, position: &Position) -> Self {
        Self::new(ErrorKind::Evaluation(msg.into()), position.clone())
    }

    /// An internal defect. Never triggered by user input.
    pub fn assertion(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Assertion(msg.into()),
            position: None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Attach `origin` as the outermost call site of this error.
    pub fn chained(mut self, origin: &Position) -> Self {
        self.position = Some(match self.position {
            Some(position) => position.with_origin(origin.clone()),
            None => origin.without_origin(),
        });
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(position) = &self.position {
            write!(f, "{position}: ")?;
        }
        write!(f, "{}", self.kind)?;
        if let Some(position) = &self.position {
            for origin in position.origins() {
                write!(f, "\n  evaluated from {origin}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pos(line: usize, column: usize) -> Position {
        Position::new(Arc::from("test.nnef"), line, column)
    }

    #[test]
    fn test_display_without_origin() {
        let err = Error::new(
            ErrorKind::Undeclared {
                what: "identifier",
                name: "w".into(),
            },
            pos(3, 9),
        );
        assert_eq!(err.to_string(), "test.nnef:3:9: undeclared identifier 'w'");
        assert_eq!(err.category(), ErrorCategory::Scope);
    }

    #[test]
    fn test_chained_trace_is_outermost_last() {
        let err = Error::evaluation("index out of range", &pos(2, 5))
            .chained(&pos(7, 3))
            .chained(&pos(12, 1));
        assert_eq!(
            err.to_string(),
            "test.nnef:2:5: index out of range\n  evaluated from test.nnef:7:3\n  evaluated from test.nnef:12:1"
        );
    }

    #[test]
    fn test_chained_without_position_takes_origin() {
        let err = Error::assertion("boom").chained(&pos(1, 1));
        assert_eq!(err.position, Some(pos(1, 1)));
        assert_eq!(err.category(), ErrorCategory::Assertion);
    }
}
