//! Expression error type

use thiserror::Error;

/// Errors produced while lexing, parsing, or evaluating a `${...}` expression
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    /// Lexical error (bad character, unterminated string)
    #[error("lex error at offset {offset}: {message}")]
    Lex {
        /// Byte offset into the expression source
        offset: usize,
        /// What went wrong
        message: String,
    },

    /// Syntax error
    #[error("parse error: {0}")]
    Parse(String),

    /// A path segment did not resolve and no `?` guard was present
    #[error("unresolved reference: {0}")]
    Unresolved(String),

    /// Operands or arguments had the wrong type
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Runtime evaluation failure (division by zero, bad conversion)
    #[error("evaluation error: {0}")]
    Eval(String),
}

impl ExprError {
    /// Lexical error at a byte offset
    pub fn lex(offset: usize, message: impl Into<String>) -> Self {
        Self::Lex {
            offset,
            message: message.into(),
        }
    }

    /// Syntax error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Unresolved path or identifier
    pub fn unresolved(msg: impl Into<String>) -> Self {
        Self::Unresolved(msg.into())
    }

    /// Type mismatch
    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::TypeMismatch(msg.into())
    }

    /// Evaluation failure
    pub fn eval(msg: impl Into<String>) -> Self {
        Self::Eval(msg.into())
    }
}
