//! Orchestrator error types.

use thiserror::Error;

use keel_lifecycle::LifecycleError;
use keel_state::StateError;
use keel_placement::PlacementError;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid scaling format: {0}")]
    InvalidScaleFormat(String),

    #[error("no provider credentials available")]
    NoProviderCredentials,

    #[error("a node with fqdn={fqdn} already exists in layer {layer}")]
    DuplicateNode { layer: String, fqdn: String },

    #[error("layer already exists: {0}")]
    DuplicateLayer(String),

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("no eligible node for container type '{0}'")]
    NoEligibleNode(String),

    #[error("layer not found: {0}")]
    LayerNotFound(String),

    #[error("provider failure: {0}")]
    ProviderFailure(String),

    #[error("converge failure: {0}")]
    ConvergeFailure(String),

    #[error("{0}")]
    Environment(String),

    #[error("formation {0} does not support multiple apps")]
    FormationAppLimit(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("No logs for {0}")]
    NoLogs(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("state store error: {0}")]
    State(StateError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<LifecycleError> for OrchestratorError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::DuplicateNode { layer, fqdn } => Self::DuplicateNode { layer, fqdn },
            LifecycleError::NodeNotFound(id) => Self::NotFound(format!("node {id}")),
            e @ LifecycleError::NodeNotUp { .. } => Self::Validation(e.to_string()),
            e @ LifecycleError::ProviderNotFound(_) => Self::Validation(e.to_string()),
            e @ LifecycleError::ProviderFailure { .. } => Self::ProviderFailure(e.to_string()),
            e @ LifecycleError::ConvergeFailure { .. } => Self::ConvergeFailure(e.to_string()),
            LifecycleError::Environment(msg) => Self::Environment(msg),
            e @ LifecycleError::InvalidKey(_) => Self::Validation(e.to_string()),
            LifecycleError::State(e) => e.into(),
        }
    }
}

impl From<StateError> for OrchestratorError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Conflict { kind, key } => Self::AlreadyExists { kind, id: key },
            StateError::Missing { kind, key } => Self::NotFound(format!("{kind} {key}")),
            StateError::FormationFull(formation) => Self::FormationAppLimit(formation),
            e => Self::State(e),
        }
    }
}

impl From<PlacementError> for OrchestratorError {
    fn from(e: PlacementError) -> Self {
        match e {
            PlacementError::NoEligibleNode { container_type } => Self::NoEligibleNode(container_type),
        }
    }
}
