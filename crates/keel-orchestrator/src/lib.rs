//! keel-orchestrator: the control plane's decision layer.
//!
//! Ties the state store, placement engine and node lifecycle together:
//!
//! - **`validator`**: Parses scale requests before anything is touched
//! - **`databag`**: Renders the document nodes converge against
//! - **`controller`**: Converges every `up` node of a formation concurrently
//! - **`dispatcher`**: Maps app, release and formation events to converges
//! - **`resource`**: Owner-scoped loading plus create/destroy side effects
//! - **`service`** / **`scale`**: The `Orchestrator` facade the API calls
//!
//! Placement inside a formation is serialized by a per-formation lock and
//! scale requests for one app by a per-app lock (`locks`).

pub mod controller;
pub mod databag;
pub mod dispatcher;
pub mod error;
pub mod locks;
pub mod resource;
pub mod scale;
pub mod service;
#[cfg(test)]
mod testing;
pub mod validator;

pub use controller::{ConvergeReport, FormationController, NodeReport};
pub use databag::{AppBag, Databag};
pub use dispatcher::{Dispatcher, TeardownReport};
pub use error::{OrchestratorError, OrchestratorResult};
pub use resource::ScopedResource;
pub use service::{
    AppInput, BuildInput, FlavorInput, FlavorUpdate, FormationInput, LayerInput, NodeInput,
    Orchestrator, ProviderInput,
};
