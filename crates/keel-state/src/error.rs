//! Error types for the Keel state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// An insert found its key (or a unique field) already taken.
    #[error("{kind} already exists: {key}")]
    Conflict { kind: &'static str, key: String },

    /// A record the write depends on is gone.
    #[error("{kind} not found: {key}")]
    Missing { kind: &'static str, key: String },

    /// A formation without a domain already hosts its one app.
    #[error("formation {0} already hosts an app")]
    FormationFull(String),
}
