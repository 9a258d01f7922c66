//! redb table definitions for the Keel state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Numeric key segments are zero-padded so that lexical order matches numeric
//! order within a prefix.

use redb::TableDefinition;

/// Provider credentials keyed by `{owner}/{id}`.
pub const PROVIDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("providers");

/// Flavors keyed by `{owner}/{id}`.
pub const FLAVORS: TableDefinition<&str, &[u8]> = TableDefinition::new("flavors");

/// Formations keyed by `{id}`.
pub const FORMATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("formations");

/// Layers keyed by `{formation}/{layer}`.
pub const LAYERS: TableDefinition<&str, &[u8]> = TableDefinition::new("layers");

/// Nodes keyed by id, which is `{formation}.{layer}.{num}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Apps keyed by `{id}`.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Containers keyed by `{app}:{type}:{num:06}`.
pub const CONTAINERS: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

/// Config versions keyed by `{app}:{version:010}`.
pub const CONFIGS: TableDefinition<&str, &[u8]> = TableDefinition::new("configs");

/// Builds keyed by `{app}:{id}`.
pub const BUILDS: TableDefinition<&str, &[u8]> = TableDefinition::new("builds");

/// Releases keyed by `{app}:{version:010}`.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");
