use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;
use crate::span::Position;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read source: {0}")]
    SourceIo(#[from] std::io::Error),
    #[error("prelude directory was not found at {0}")]
    MissingPrelude(PathBuf),
    #[error("{position}: {message}, got {found} instead")]
    Syntax {
        position: Position,
        message: String,
        found: String,
    },
    #[error("unknown variable name '{0}'")]
    UnknownVariable(String),
    #[error("unknown function referenced: '{0}'")]
    UnknownFunction(String),
    #[error("incorrect number of arguments passed to '{callee}': expected {expected}, got {found}")]
    ArgumentCount {
        callee: String,
        expected: usize,
        found: usize,
    },
    #[error("redefinition of function '{0}'")]
    Redefinition(String),
    #[error(
        "redefinition of function '{name}' with different argument count: declared with {declared}, got {found}"
    )]
    ArityRedefinition {
        name: String,
        declared: usize,
        found: usize,
    },
    #[error("invalid binary operator '{0}'")]
    InvalidOperator(char),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CoreError {
    pub fn is_syntax(&self) -> bool {
        matches!(self, CoreError::Syntax { .. })
    }
}
