//! Error types.

use sqlparser::parser::ParserError;
use thiserror::Error;

/// A statement could not be parameterized.
///
/// Parameterization never loses the caller's input: every variant carries the
/// original statement text, available through [`ParseError::original`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("failed to parse statement: {source}")]
    Syntax {
        original: String,
        #[source]
        source: ParserError,
    },

    #[error("statement contains no SQL")]
    Empty { original: String },
}

impl ParseError {
    /// The statement text exactly as the caller supplied it.
    pub fn original(&self) -> &str {
        match self {
            ParseError::Syntax { original, .. } | ParseError::Empty { original } => original,
        }
    }

    /// Consume the error and return the caller's statement text.
    pub fn into_original(self) -> String {
        match self {
            ParseError::Syntax { original, .. } | ParseError::Empty { original } => original,
        }
    }
}

/// The transaction sampler cannot be built from the supplied configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("an adapted sampler is required")]
    MissingSampler,

    #[error("service name could not be resolved from the resource")]
    MissingServiceName,
}

/// A dialect name that has no supported grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported SQL dialect: {0}")]
pub struct UnknownDialect(pub String);
