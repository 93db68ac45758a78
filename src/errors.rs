//! Typed error hierarchy for the Scout run orchestrator.
//!
//! Every operation exposed by the `factory` subsystem returns `ScoutError`,
//! which carries a machine-checkable [`ErrorKind`] alongside a readable
//! message. Storage and process helpers below the core use `anyhow` and are
//! wrapped into `Database`/`Resource` at component boundaries.

use serde::Serialize;
use thiserror::Error;

/// Stable classification of a failure, exposed to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Upstream,
    Resource,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Upstream => "upstream",
            Self::Resource => "resource",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the run orchestrator.
#[derive(Debug, Error)]
pub enum ScoutError {
    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Resource(String),

    #[error("Database error: {0:#}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Upstream(_) => ErrorKind::Upstream,
            Self::Resource(_) => ErrorKind::Resource,
            Self::Database(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Wrap a tracker/model failure, keeping the full context chain.
    pub fn upstream(err: anyhow::Error) -> Self {
        Self::Upstream(format!("{:#}", err))
    }

    /// Wrap a filesystem/process failure, keeping the full context chain.
    pub fn resource(err: anyhow::Error) -> Self {
        Self::Resource(format!("{:#}", err))
    }
}

pub type ScoutResult<T> = std::result::Result<T, ScoutError>;
