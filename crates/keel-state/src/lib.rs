//! keel-state: embedded state store for Keel.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for providers, formations, layers, nodes, apps, containers and the
//! config/build/release history of each app.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{formation}/{layer}`, `{app}:{type}:{num}`,
//! `{app}:{version}`) keep related records adjacent so prefix scans return
//! them in order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
