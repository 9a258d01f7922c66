//! Keel placement engine: container layout and balancing.
//!
//! This crate decides where containers live. It does NOT touch the store or
//! talk to nodes: it reads a snapshot of a formation (nodes, layers,
//! containers) and produces plans that the orchestrator commits.
//!
//! # Components
//!
//! - **`scorer`**: Node eligibility and load accounting
//! - **`layout`**: Scale an app's container counts (add/remove plan)
//! - **`balance`**: Re-place stranded containers and even out node load

pub mod balance;
pub mod error;
pub mod layout;
pub mod scorer;

pub use balance::{BalancePlan, balance};
pub use error::{PlacementError, PlacementResult};
pub use layout::{LayoutPlan, compute_layout};
pub use scorer::{NodeLoads, Topology};
