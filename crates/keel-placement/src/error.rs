//! Placement error types.

use thiserror::Error;

/// Errors produced while computing a placement plan.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no eligible node for container type '{container_type}'")]
    NoEligibleNode { container_type: String },
}

pub type PlacementResult<T> = Result<T, PlacementError>;
