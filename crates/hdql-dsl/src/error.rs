//! Parse errors with source positions.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A location in the query text. `line` and `column` are 1-based and count
/// characters, `offset` is the 0-based character offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const START: Position = Position {
        offset: 0,
        line: 1,
        column: 1,
    };
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unexpected {found} at {position}; expected one of: {}", .expected.join(", "))]
    UnexpectedToken {
        found: String,
        expected: Vec<String>,
        position: Position,
    },

    #[error("unexpected end of query at {position}; expected one of: {}", .expected.join(", "))]
    UnexpectedEnd {
        expected: Vec<String>,
        position: Position,
    },

    #[error("unmatched parenthesis at {position}")]
    UnmatchedParen { position: Position },

    #[error("unterminated string literal starting at {position}")]
    UnterminatedString { position: Position },

    #[error("unknown function `{name}` at {position}")]
    UnknownFunction { name: String, position: Position },

    #[error("unknown parameter `{name}` for `{function}` at {position}")]
    UnknownParameter {
        name: String,
        function: String,
        position: Position,
    },

    #[error("invalid value for `{name}` at {position}: {message}")]
    InvalidParameter {
        name: String,
        message: String,
        position: Position,
    },

    #[error("invalid number `{text}` at {position}")]
    InvalidNumber { text: String, position: Position },

    #[error("unexpected character `{ch}` at {position}")]
    UnexpectedCharacter { ch: char, position: Position },
}

impl ParseError {
    pub fn position(&self) -> Position {
        match self {
            ParseError::UnexpectedToken { position, .. }
            | ParseError::UnexpectedEnd { position, .. }
            | ParseError::UnmatchedParen { position }
            | ParseError::UnterminatedString { position }
            | ParseError::UnknownFunction { position, .. }
            | ParseError::UnknownParameter { position, .. }
            | ParseError::InvalidParameter { position, .. }
            | ParseError::InvalidNumber { position, .. }
            | ParseError::UnexpectedCharacter { position, .. } => *position,
        }
    }
}
