//! Error taxonomy for the history engine.
//!
//! Structural problems (missing rows, invalid operations) surface before any
//! streaming side effects. Faults during an in-flight generation are absorbed
//! into the persisted message instead — see `generation`.

use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A referenced chat, message, or profile does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The operation is not valid for the referenced entity.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The stored tree is inconsistent (dangling parent, cycle). Fatal for
    /// the read that hit it, never silently truncated.
    #[error("data integrity fault: {0}")]
    DataIntegrity(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Model collaborator errors.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no API key configured for provider: {0}")]
    MissingProviderKey(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("stream error: {0}")]
    Stream(String),
}
