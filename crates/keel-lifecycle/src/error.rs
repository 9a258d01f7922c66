//! Lifecycle error types.

use thiserror::Error;

use keel_state::NodeState;

/// Errors raised while building, converging or destroying nodes.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("node with fqdn '{fqdn}' already exists in layer '{layer}'")]
    DuplicateNode { layer: String, fqdn: String },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node {node} is {state}, expected up")]
    NodeNotUp { node: String, state: NodeState },

    #[error("provider '{0}' not found")]
    ProviderNotFound(String),

    #[error("provider failure for {target}: {reason}")]
    ProviderFailure { target: String, reason: String },

    #[error("converge failed on {node}: {reason}")]
    ConvergeFailure { node: String, reason: String },

    #[error("remote execution failed: {0}")]
    Environment(String),

    #[error("invalid ssh key: {0}")]
    InvalidKey(String),

    #[error("state store error: {0}")]
    State(#[from] keel_state::StateError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
