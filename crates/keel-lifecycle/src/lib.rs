//! keel-lifecycle: node lifecycle and the capabilities behind it.
//!
//! Keel never talks to a cloud or a node directly. Two capability traits
//! stand in for the outside world:
//!
//! - **`Provisioner`**: builds and destroys layers and nodes at a provider
//! - **`RemoteExecutor`**: converges and runs commands on nodes
//!
//! `NodeLifecycle` drives nodes through their states on top of these and
//! records every transition in the state store. Command-backed
//! implementations hand the work to external programs; in-process fakes live
//! in `fake` (enabled by the `testing` feature).

pub mod command;
pub mod error;
pub mod executor;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod keys;
pub mod lifecycle;
pub mod provisioner;

pub use command::ProgramSpec;
pub use error::{LifecycleError, LifecycleResult};
pub use executor::{CommandExecutor, CommandOutput, ExecTarget, RemoteExecutor};
pub use keys::{generate_ssh_keypair, keypair_from_parts};
pub use lifecycle::{DestroyOutcome, LifecycleTimeouts, NodeConverge, NodeLifecycle};
pub use provisioner::{CommandProvisioner, LayerSpec, NodeSpec, ProvisionedNode, Provisioner};
