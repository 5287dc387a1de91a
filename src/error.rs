use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::value::Value;

pub type Result<T> = std::result::Result<T, Error>;

/// Position of an expression in the original program source.
///
/// The engine never reads source text itself; locations are attached by the
/// front end through [`crate::ast::Expr::WithLocation`] and carried on tokens
/// so uncaught-error reports can show where a failure came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    /// True for the zero location used when a front end supplied none.
    pub fn is_unknown(&self) -> bool {
        self.line == 0 && self.column == 0
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "<unknown>")
        } else {
            write!(f, "line {}, column {}", self.line, self.column)
        }
    }
}

/// Errors that kill a single token.
///
/// All of these unwind through the token's exception-handler stack and fall
/// back to an uncaught-error report; none of them stop the engine (resource
/// limits can be configured fatal, see [`crate::engine::Config`]).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TokenError {
    /// A value raised by program code and never caught.
    #[error("uncaught exception: {0}")]
    Raised(Value),

    /// An external call reported failure through its continuation.
    #[error("site error: {message}")]
    Site {
        message: String,
        cause: Option<String>,
    },

    #[error("stack depth limit of {limit} exceeded")]
    StackLimit { limit: usize },

    #[error("token limit of {limit} exceeded")]
    TokenLimit { limit: usize },

    #[error("call to an uncallable value: {0}")]
    Uncallable(Value),

    #[error("no site bound to the name `{0}`")]
    UnknownSite(String),

    #[error("wrong number of arguments: expected {expected}, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("type error: expected {expected}, got {actual}")]
    Type {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,
}

impl TokenError {
    /// The value delivered to a program-level exception handler.
    ///
    /// Raised values pass through unchanged; engine-made errors are handed to
    /// handlers as their message string.
    pub fn to_value(&self) -> Value {
        match self {
            TokenError::Raised(v) => v.clone(),
            other => Value::String(other.to_string()),
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            TokenError::Site { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Stack and token budget overruns; these are the errors that
    /// `Config::fatal_resource_errors` escalates.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            TokenError::StackLimit { .. } | TokenError::TokenLimit { .. }
        )
    }
}

/// Fatal conditions that terminate the whole engine, bypassing program-level
/// handlers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An internal invariant was violated (a dead token rescheduled, a corrupt
    /// arena key, an environment index past its depth). Always a bug.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// A resource-limit error escalated by `Config::fatal_resource_errors`.
    #[error("fatal resource error: {0}")]
    Resource(TokenError),
}

/// Errors produced while compiling an expression tree into a node graph.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("unbound variable: index {index} at binding depth {depth}")]
    UnboundVariable { index: usize, depth: usize },

    #[error("closure declaration group is empty")]
    EmptyDefGroup,
}

/// Unified error type for the crate's public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Structured report delivered through the uncaught-error hook.
///
/// `backtrace` is the chain of call-site locations, innermost first.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub backtrace: Vec<SourceLocation>,
    pub cause: Option<String>,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.message)?;
        writeln!(f, "Backtrace:")?;
        for location in &self.backtrace {
            writeln!(f, "  {location}")?;
        }
        if let Some(cause) = &self.cause {
            writeln!(f, "Caused by: {cause}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_location_display() {
        assert_eq!(SourceLocation::new(3, 9).to_string(), "line 3, column 9");
        assert_eq!(SourceLocation::default().to_string(), "<unknown>");
    }

    #[test]
    fn test_raised_error_keeps_value() {
        let err = TokenError::Raised(Value::Integer(42));
        assert_eq!(err.to_value(), Value::Integer(42));
    }

    #[test]
    fn test_engine_errors_become_handler_strings() {
        let err = TokenError::DivisionByZero;
        assert_eq!(
            err.to_value(),
            Value::String("division by zero".to_string())
        );
    }

    #[test]
    fn test_resource_limit_classification() {
        assert!(TokenError::StackLimit { limit: 4 }.is_resource_limit());
        assert!(TokenError::TokenLimit { limit: 4 }.is_resource_limit());
        assert!(!TokenError::DivisionByZero.is_resource_limit());
    }

    #[test]
    fn test_report_display() {
        let report = ErrorReport {
            message: "boom".to_string(),
            backtrace: vec![SourceLocation::new(1, 2)],
            cause: Some("disk on fire".to_string()),
        };
        let text = report.to_string();
        assert!(text.contains("Error: boom"));
        assert!(text.contains("line 1, column 2"));
        assert!(text.contains("Caused by: disk on fire"));
    }
}
