//! Domain types for the Keel state store.
//!
//! These types represent the persisted state of provider credentials,
//! formations, layers, nodes, apps, containers and the per-app release
//! history. All types are serializable to/from JSON for storage in redb
//! tables.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type ProviderId = String;
pub type FormationId = String;
pub type LayerId = String;
pub type NodeId = String;
pub type AppId = String;
pub type BuildId = String;
pub type FlavorId = String;

/// Seconds since the Unix epoch, used for every `created_at`/`updated_at`.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Provider ──────────────────────────────────────────────────────

/// Cloud provider credentials owned by a user.
///
/// The `creds` map is opaque to Keel; it is handed to the provisioner as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provider {
    pub id: ProviderId,
    pub owner: String,
    /// Provider kind: "ec2", "digitalocean", "static", ...
    pub kind: String,
    #[serde(default)]
    pub creds: Map<String, Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Provider {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.owner, self.id)
    }

    /// A provider is usable for scaling only once credentials are filled in.
    pub fn has_credentials(&self) -> bool {
        !self.creds.is_empty()
    }
}

// ── Flavor ────────────────────────────────────────────────────────

/// A reusable layer template owned by a user.
///
/// Layers created from a flavor start from its provider and params.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flavor {
    pub id: FlavorId,
    pub owner: String,
    pub provider: ProviderId,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Flavor {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.owner, self.id)
    }
}

/// Overlay `update` onto `params`. A `null` value removes the key.
pub fn merge_params(params: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, value) in update {
        if value.is_null() {
            params.remove(key);
        } else {
            params.insert(key.clone(), value.clone());
        }
    }
}

// ── Formation ─────────────────────────────────────────────────────

/// An owned cluster of layers and nodes hosting apps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Formation {
    pub id: FormationId,
    pub owner: String,
    /// Wildcard domain for app routing. Without one the formation can host
    /// a single app only.
    #[serde(default)]
    pub domain: Option<String>,
    /// Users granted use of this formation besides the owner.
    #[serde(default)]
    pub collaborators: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Formation {
    pub fn supports_multiple_apps(&self) -> bool {
        self.domain.as_deref().is_some_and(|d| !d.is_empty())
    }

    pub fn is_visible_to(&self, user: &str) -> bool {
        self.owner == user || self.collaborators.iter().any(|c| c == user)
    }
}

// ── Layer ─────────────────────────────────────────────────────────

/// SSH keypair used to reach the nodes of a layer.
///
/// `Debug` never prints the private key.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct SshKeypair {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for SshKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshKeypair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// A named node template within a formation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Layer {
    pub id: LayerId,
    pub formation: FormationId,
    pub owner: String,
    /// Provider record (owned by `owner`) whose credentials build this layer.
    pub provider: ProviderId,
    /// Flavor the layer was created from, if any.
    #[serde(default)]
    pub flavor: Option<FlavorId>,
    pub instance_type: String,
    /// Provider-specific parameters (region, image, zone, ...).
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Whether nodes of this layer host app containers.
    #[serde(default = "default_true")]
    pub runtime: bool,
    /// Whether nodes of this layer route traffic to containers.
    #[serde(default)]
    pub proxy: bool,
    /// Container types accepted by this layer. Empty accepts every type.
    #[serde(default)]
    pub container_types: Vec<String>,
    pub ssh_username: String,
    pub ssh_keypair: SshKeypair,
    pub created_at: u64,
}

fn default_true() -> bool {
    true
}

impl Layer {
    pub fn table_key(&self) -> String {
        layer_key(&self.formation, &self.id)
    }

    /// Whether a container of `container_type` may be placed on this layer.
    pub fn accepts(&self, container_type: &str) -> bool {
        self.runtime
            && (self.container_types.is_empty()
                || self.container_types.iter().any(|t| t == container_type))
    }
}

pub fn layer_key(formation: &str, layer: &str) -> String {
    format!("{formation}/{layer}")
}

// ── Node ──────────────────────────────────────────────────────────

/// Lifecycle state of a provisioned machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Requested,
    Building,
    Up,
    Converging,
    Down,
    Destroyed,
}

impl NodeState {
    /// `up`, or converging from `up`: the node keeps its containers.
    pub fn is_active(self) -> bool {
        matches!(self, NodeState::Up | NodeState::Converging)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Requested => "requested",
            NodeState::Building => "building",
            NodeState::Up => "up",
            NodeState::Converging => "converging",
            NodeState::Down => "down",
            NodeState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// One provisioned machine belonging to a layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub formation: FormationId,
    pub layer: LayerId,
    pub owner: String,
    /// Per-layer ordinal, never reused while the node exists.
    pub num: u32,
    pub fqdn: String,
    pub state: NodeState,
    /// Identity assigned by the provider once built.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Connection facts returned by the provider (address, host keys, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Node {
    pub fn node_id(formation: &str, layer: &str, num: u32) -> NodeId {
        format!("{formation}.{layer}.{num}")
    }
}

// ── App ───────────────────────────────────────────────────────────

/// A deployable unit bound to a formation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub id: AppId,
    pub owner: String,
    pub formation: FormationId,
    #[serde(default)]
    pub collaborators: Vec<String>,
    /// Desired container layout: container type → replica count.
    #[serde(default)]
    pub structure: BTreeMap<String, u32>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl App {
    pub fn is_visible_to(&self, user: &str) -> bool {
        self.owner == user || self.collaborators.iter().any(|c| c == user)
    }
}

// ── Container ─────────────────────────────────────────────────────

/// One replica of an app's container type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Container {
    pub app: AppId,
    pub formation: FormationId,
    pub owner: String,
    pub container_type: String,
    /// Ordinal within (app, type); contiguous from 1.
    pub num: u32,
    /// Hosting node, `None` while unplaced.
    #[serde(default)]
    pub node: Option<NodeId>,
    pub created_at: u64,
}

impl Container {
    pub fn table_key(&self) -> String {
        container_key(&self.app, &self.container_type, self.num)
    }

    /// Short human label, e.g. `myapp.web.2`.
    pub fn label(&self) -> String {
        format!("{}.{}.{}", self.app, self.container_type, self.num)
    }
}

pub fn container_key(app: &str, container_type: &str, num: u32) -> String {
    format!("{app}:{container_type}:{num:06}")
}

// ── Config / Build / Release ──────────────────────────────────────

/// One immutable version of an app's environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: AppId,
    pub owner: String,
    pub version: u32,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    pub created_at: u64,
}

impl Config {
    pub fn table_key(&self) -> String {
        versioned_key(&self.app, self.version)
    }

    /// The initial, empty config every app starts from.
    pub fn initial(app: &str, owner: &str, now: u64) -> Self {
        Self {
            app: app.to_string(),
            owner: owner.to_string(),
            version: 1,
            values: BTreeMap::new(),
            created_at: now,
        }
    }

    /// Produce the next version by merging `update` over these values.
    ///
    /// A `null` in `update` removes that key.
    pub fn merged(&self, update: &Map<String, Value>, owner: &str, now: u64) -> Self {
        let mut values = self.values.clone();
        for (key, value) in update {
            if value.is_null() {
                values.remove(key);
            } else {
                values.insert(key.clone(), value.clone());
            }
        }
        Self {
            app: self.app.clone(),
            owner: owner.to_string(),
            version: self.version + 1,
            values,
            created_at: now,
        }
    }
}

/// A built artifact for an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Build {
    pub id: BuildId,
    pub app: AppId,
    pub owner: String,
    /// Image reference the nodes pull, e.g. `registry/app:sha`.
    pub image: String,
    #[serde(default)]
    pub sha: Option<String>,
    /// Container type → command.
    #[serde(default)]
    pub procfile: BTreeMap<String, String>,
    pub created_at: u64,
}

impl Build {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.app, self.id)
    }
}

/// A config version paired with a build: the unit converged onto nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    pub app: AppId,
    pub owner: String,
    pub version: u32,
    pub config_version: u32,
    #[serde(default)]
    pub build: Option<BuildId>,
    pub summary: String,
    pub created_at: u64,
}

impl Release {
    pub fn table_key(&self) -> String {
        versioned_key(&self.app, self.version)
    }
}

pub fn versioned_key(app: &str, version: u32) -> String {
    format!("{app}:{version:010}")
}
