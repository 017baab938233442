//! Engine error types
//!
//! These cover construction-time failures (bad schema documents, bad
//! configuration). Nothing in here crosses the state-machine boundary:
//! transitions and validation report problems as data.

use thiserror::Error;

/// Errors raised while building or checking engine inputs
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid schema document: {0}")]
    InvalidSchema(String),

    #[error("duplicate section id '{0}'")]
    DuplicateSection(String),

    #[error("duplicate field '{field}' in section '{section}'")]
    DuplicateField { section: String, field: String },

    #[error("repeating section '{0}' has neither fields nor a relation")]
    EmptyRepeatingSection(String),

    #[error("invalid pattern for field '{field}': {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("'{0}' cannot be used in a field address")]
    InvalidIdentifier(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
