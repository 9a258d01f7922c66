//! Orchestrator: the single entry point the API calls into.
//!
//! Owns the store, the node lifecycle, the formation controller, the
//! dispatcher and the lock registries. Every public method takes the
//! requesting user and resolves resources through [`ScopedResource`], so a
//! user only ever sees what they own or were granted.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use keel_lifecycle::{
    CommandOutput, LifecycleTimeouts, NodeConverge, NodeLifecycle, Provisioner, RemoteExecutor,
    generate_ssh_keypair, keypair_from_parts,
};
use keel_state::{
    App, Build, Config, Container, Flavor, Formation, Layer, Node, NodeState, Provider, Release,
    StateError, StateStore, epoch_secs, layer_key, merge_params,
};

use crate::controller::{ConvergeReport, FormationController};
use crate::databag::{self, AppBag, Databag};
use crate::dispatcher::Dispatcher;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::locks::LockRegistry;
use crate::resource::ScopedResource;
use crate::validator::validate_id;

// ── Request bodies ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderInput {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub creds: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlavorInput {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Partial flavor update. `params` merge into the stored ones; a null value
/// removes its key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlavorUpdate {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormationInput {
    pub id: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub collaborators: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerInput {
    pub id: String,
    /// Required unless `flavor` names one.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub flavor: Option<String>,
    /// Falls back to the flavor's `instance_type` param.
    #[serde(default)]
    pub instance_type: Option<String>,
    /// Merged over the flavor's params, if any.
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default = "default_true")]
    pub runtime: bool,
    #[serde(default)]
    pub proxy: bool,
    #[serde(default)]
    pub container_types: Vec<String>,
    #[serde(default = "default_ssh_username")]
    pub ssh_username: String,
    #[serde(default)]
    pub ssh_private_key: Option<String>,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_ssh_username() -> String {
    "ubuntu".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInput {
    pub fqdn: String,
    pub layer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppInput {
    pub id: String,
    pub formation: String,
    #[serde(default)]
    pub collaborators: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildInput {
    pub image: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub procfile: BTreeMap<String, String>,
}

// ── Orchestrator ───────────────────────────────────────────────────

pub struct Orchestrator {
    pub(crate) store: StateStore,
    pub(crate) lifecycle: Arc<NodeLifecycle>,
    pub(crate) controller: FormationController,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) app_locks: LockRegistry,
    pub(crate) placement_locks: LockRegistry,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        provisioner: Arc<dyn Provisioner>,
        executor: Arc<dyn RemoteExecutor>,
        timeouts: LifecycleTimeouts,
    ) -> Self {
        let lifecycle = Arc::new(NodeLifecycle::new(
            store.clone(),
            provisioner,
            executor,
            timeouts,
        ));
        let controller = FormationController::new(lifecycle.clone());
        let dispatcher = Dispatcher::new(controller.clone(), lifecycle.clone());
        Self {
            store,
            lifecycle,
            controller,
            dispatcher,
            app_locks: LockRegistry::default(),
            placement_locks: LockRegistry::default(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<NodeLifecycle> {
        &self.lifecycle
    }

    // ── Generic scoped access ──────────────────────────────────────

    /// Load a resource `user` may see.
    pub fn get<R: ScopedResource>(&self, user: &str, key: &str) -> OrchestratorResult<R> {
        R::load(&self.store, key)?
            .filter(|r| r.visible_to(user))
            .ok_or_else(|| OrchestratorError::NotFound(format!("{} {key}", R::KIND)))
    }

    /// Load a resource `user` owns.
    pub(crate) fn owned<R: ScopedResource>(&self, user: &str, key: &str) -> OrchestratorResult<R> {
        R::load(&self.store, key)?
            .filter(|r| r.owner() == user)
            .ok_or_else(|| OrchestratorError::NotFound(format!("{} {key}", R::KIND)))
    }

    /// Destroy a resource `user` owns, with all its side effects.
    pub async fn destroy<R: ScopedResource>(&self, user: &str, key: &str) -> OrchestratorResult<()> {
        let resource: R = self.owned(user, key)?;
        resource.on_destroy(self).await
    }

    pub(crate) fn formation_of(&self, app: &App) -> OrchestratorResult<Formation> {
        self.store
            .get_formation(&app.formation)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("formation {}", app.formation)))
    }

    // ── Providers ──────────────────────────────────────────────────

    pub fn list_providers(&self, user: &str) -> OrchestratorResult<Vec<Provider>> {
        Ok(self.store.list_providers(user)?)
    }

    /// Create or replace provider credentials.
    pub fn put_provider(&self, user: &str, input: ProviderInput) -> OrchestratorResult<Provider> {
        validate_id("provider", &input.id)?;
        let now = epoch_secs();
        let created_at = self
            .store
            .get_provider(user, &input.id)?
            .map_or(now, |p| p.created_at);
        let provider = Provider {
            id: input.id,
            owner: user.to_string(),
            kind: input.kind,
            creds: input.creds,
            created_at,
            updated_at: now,
        };
        self.store.put_provider(&provider)?;
        info!(owner = %user, provider = %provider.id, "provider stored");
        Ok(provider)
    }

    // ── Flavors ────────────────────────────────────────────────────

    pub fn list_flavors(&self, user: &str) -> OrchestratorResult<Vec<Flavor>> {
        Ok(self.store.list_flavors(user)?)
    }

    pub fn get_flavor(&self, user: &str, id: &str) -> OrchestratorResult<Flavor> {
        self.store
            .get_flavor(user, id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("flavor {id}")))
    }

    pub fn create_flavor(&self, user: &str, input: FlavorInput) -> OrchestratorResult<Flavor> {
        validate_id("flavor", &input.id)?;
        self.require_provider(user, &input.provider)?;
        let now = epoch_secs();
        let flavor = Flavor {
            id: input.id,
            owner: user.to_string(),
            provider: input.provider,
            params: input.params,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_flavor(&flavor)?;
        info!(owner = %user, flavor = %flavor.id, "flavor created");
        Ok(flavor)
    }

    /// Change a flavor's provider and merge params into it.
    pub fn update_flavor(
        &self,
        user: &str,
        id: &str,
        update: FlavorUpdate,
    ) -> OrchestratorResult<Flavor> {
        if let Some(provider) = &update.provider {
            self.require_provider(user, provider)?;
        }
        let flavor = self
            .store
            .update_flavor(user, id, |flavor| {
                if let Some(provider) = update.provider {
                    flavor.provider = provider;
                }
                merge_params(&mut flavor.params, &update.params);
                flavor.updated_at = epoch_secs();
            })?
            .ok_or_else(|| OrchestratorError::NotFound(format!("flavor {id}")))?;
        info!(owner = %user, flavor = %id, "flavor updated");
        Ok(flavor)
    }

    /// Delete a flavor. Layers created from it keep their copied params.
    pub fn destroy_flavor(&self, user: &str, id: &str) -> OrchestratorResult<()> {
        if !self.store.delete_flavor(user, id)? {
            return Err(OrchestratorError::NotFound(format!("flavor {id}")));
        }
        info!(owner = %user, flavor = %id, "flavor destroyed");
        Ok(())
    }

    fn require_provider(&self, user: &str, provider: &str) -> OrchestratorResult<()> {
        match self.store.get_provider(user, provider)? {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::Validation(format!(
                "unknown provider '{provider}'"
            ))),
        }
    }

    // ── Formations ─────────────────────────────────────────────────

    pub fn list_formations(&self, user: &str) -> OrchestratorResult<Vec<Formation>> {
        Ok(self
            .store
            .list_formations()?
            .into_iter()
            .filter(|f| f.visible_to(user))
            .collect())
    }

    pub async fn create_formation(
        &self,
        user: &str,
        input: FormationInput,
    ) -> OrchestratorResult<Formation> {
        validate_id("formation", &input.id)?;
        let now = epoch_secs();
        let formation = Formation {
            id: input.id,
            owner: user.to_string(),
            domain: input.domain.filter(|d| !d.is_empty()),
            collaborators: input.collaborators,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_formation(&formation)?;
        info!(owner = %user, formation = %formation.id, "formation created");
        formation.on_create(self).await?;
        Ok(formation)
    }

    pub fn calculate_formation(&self, user: &str, id: &str) -> OrchestratorResult<Databag> {
        let formation: Formation = self.get(user, id)?;
        self.controller.calculate(&formation)
    }

    pub async fn converge_formation(
        &self,
        user: &str,
        id: &str,
    ) -> OrchestratorResult<ConvergeReport> {
        let formation: Formation = self.get(user, id)?;
        self.controller.converge(&formation).await
    }

    // ── Layers ─────────────────────────────────────────────────────

    pub fn list_layers(&self, user: &str, formation: &str) -> OrchestratorResult<Vec<Layer>> {
        let formation: Formation = self.owned(user, formation)?;
        Ok(self.store.list_layers(&formation.id)?)
    }

    pub fn get_layer(&self, user: &str, formation: &str, layer: &str) -> OrchestratorResult<Layer> {
        self.get(user, &layer_key(formation, layer))
    }

    /// Create a layer and build its provider resources.
    ///
    /// The returned layer carries the private key; no later read does.
    pub async fn create_layer(
        &self,
        user: &str,
        formation: &str,
        input: LayerInput,
    ) -> OrchestratorResult<Layer> {
        let formation: Formation = self.owned(user, formation)?;
        validate_id("layer", &input.id)?;

        let flavor = input
            .flavor
            .as_deref()
            .map(|id| self.get_flavor(user, id))
            .transpose()?;
        let Some(provider) = input
            .provider
            .or_else(|| flavor.as_ref().map(|f| f.provider.clone()))
        else {
            return Err(OrchestratorError::Validation(
                "a layer needs a provider or a flavor".to_string(),
            ));
        };
        self.require_provider(user, &provider)?;

        let mut params = flavor.as_ref().map(|f| f.params.clone()).unwrap_or_default();
        merge_params(&mut params, &input.params);
        let Some(instance_type) = input.instance_type.or_else(|| {
            params
                .get("instance_type")
                .and_then(Value::as_str)
                .map(str::to_string)
        }) else {
            return Err(OrchestratorError::Validation(
                "instance_type is required".to_string(),
            ));
        };

        let ssh_keypair = match (input.ssh_private_key, input.ssh_public_key) {
            (None, None) => {
                let comment = format!("{}-{}", formation.id, input.id);
                tokio::task::spawn_blocking(move || generate_ssh_keypair(&comment))
                    .await
                    .map_err(|e| OrchestratorError::Internal(format!("key generation: {e}")))??
            }
            (Some(private), Some(public)) => keypair_from_parts(&private, &public)?,
            _ => {
                return Err(OrchestratorError::Validation(
                    "ssh_private_key and ssh_public_key must be supplied together".to_string(),
                ));
            }
        };

        let layer = Layer {
            id: input.id,
            formation: formation.id.clone(),
            owner: user.to_string(),
            provider,
            flavor: flavor.map(|f| f.id),
            instance_type,
            params,
            runtime: input.runtime,
            proxy: input.proxy,
            container_types: input.container_types,
            ssh_username: input.ssh_username,
            ssh_keypair,
            created_at: epoch_secs(),
        };
        self.store.insert_layer(&layer).map_err(|e| match e {
            StateError::Conflict { .. } => OrchestratorError::DuplicateLayer(layer.id.clone()),
            e => e.into(),
        })?;

        if let Err(e) = layer.on_create(self).await {
            warn!(layer = %layer.table_key(), error = %e, "layer build failed, removing record");
            self.store.delete_layer(&layer.formation, &layer.id)?;
            return Err(e);
        }
        info!(owner = %user, layer = %layer.table_key(), "layer created");
        Ok(layer)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Nodes owned by `user` across all formations.
    pub fn list_nodes(&self, user: &str) -> OrchestratorResult<Vec<Node>> {
        Ok(self
            .store
            .list_nodes()?
            .into_iter()
            .filter(|n| n.owner == user)
            .collect())
    }

    pub fn list_formation_nodes(&self, user: &str, formation: &str) -> OrchestratorResult<Vec<Node>> {
        let formation: Formation = self.owned(user, formation)?;
        Ok(self.store.list_nodes_for_formation(&formation.id)?)
    }

    pub fn get_node(&self, user: &str, id: &str) -> OrchestratorResult<Node> {
        self.store
            .get_node(id)?
            .filter(|n| n.owner == user)
            .ok_or_else(|| OrchestratorError::NotFound(format!("node {id}")))
    }

    /// Register a node with a known fqdn and build it.
    ///
    /// A failed build is an error; the node stays on record as `down`.
    pub async fn add_node(
        &self,
        user: &str,
        formation: &str,
        input: NodeInput,
    ) -> OrchestratorResult<Node> {
        let formation: Formation = self.owned(user, formation)?;
        let layer = self
            .store
            .get_layer(&formation.id, &input.layer)?
            .ok_or_else(|| OrchestratorError::LayerNotFound(input.layer.clone()))?;

        let node = self.lifecycle.new_node(&layer, Some(&input.fqdn))?;
        Ok(self.lifecycle.build(&node.id).await?)
    }

    /// Destroy a node and re-place the containers it hosted.
    pub async fn destroy_node(&self, user: &str, id: &str) -> OrchestratorResult<()> {
        let node = self.get_node(user, id)?;
        let _placement = self.placement_locks.acquire(&node.formation).await;
        let outcome = self.lifecycle.destroy(&node.id).await?;
        if outcome.unplaced > 0 {
            self.rebalance_locked(&node.formation)?;
        }
        Ok(())
    }

    /// Take a node out of service without destroying its machine, then move
    /// its containers onto the remaining active nodes.
    pub async fn mark_node_down(&self, user: &str, id: &str) -> OrchestratorResult<Node> {
        let node = self.get_node(user, id)?;
        let _placement = self.placement_locks.acquire(&node.formation).await;
        let node = self.lifecycle.mark_down(&node.id)?;
        let plan = self.rebalance_locked(&node.formation)?;
        info!(node = %node.id, moved = plan.moved.len(), stranded = plan.stranded, "node marked down");
        Ok(node)
    }

    /// Converge a single node against its formation's databag.
    pub async fn converge_node(&self, user: &str, id: &str) -> OrchestratorResult<NodeConverge> {
        let node = self.get_node(user, id)?;
        let formation = self
            .store
            .get_formation(&node.formation)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("formation {}", node.formation)))?;
        let bag = self.controller.calculate(&formation)?;
        let payload =
            serde_json::to_value(&bag).map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        Ok(self.lifecycle.converge(&node.id, &payload).await?)
    }

    // ── Apps ───────────────────────────────────────────────────────

    pub fn list_apps(&self, user: &str) -> OrchestratorResult<Vec<App>> {
        Ok(self
            .store
            .list_apps()?
            .into_iter()
            .filter(|a| a.visible_to(user))
            .collect())
    }

    /// Create an app with its initial config and release, then converge.
    pub async fn create_app(&self, user: &str, input: AppInput) -> OrchestratorResult<App> {
        validate_id("app", &input.id)?;
        let formation: Formation = self.get(user, &input.formation)?;

        let now = epoch_secs();
        let app = App {
            id: input.id,
            owner: user.to_string(),
            formation: formation.id.clone(),
            collaborators: input.collaborators,
            structure: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        let config = Config::initial(&app.id, user, now);
        let release = Release {
            app: app.id.clone(),
            owner: user.to_string(),
            version: 1,
            config_version: config.version,
            build: None,
            summary: format!("{user} created initial release"),
            created_at: now,
        };
        self.store.create_app(&app, &config, &release)?;
        info!(owner = %user, app = %app.id, formation = %formation.id, "app created");

        app.on_create(self).await?;
        Ok(app)
    }

    pub fn calculate_app(&self, user: &str, id: &str) -> OrchestratorResult<AppBag> {
        let app: App = self.get(user, id)?;
        let formation = self.formation_of(&app)?;
        databag::render_app(&self.store, &formation, &app)
    }

    pub async fn app_logs(&self, user: &str, id: &str) -> OrchestratorResult<String> {
        let app: App = self.get(user, id)?;
        match self.lifecycle.logs(&app.id).await {
            Ok(Some(logs)) => Ok(logs),
            Ok(None) => Err(OrchestratorError::NoLogs(app.id)),
            Err(e) => {
                warn!(app = %app.id, error = %e, "log retrieval failed");
                Err(OrchestratorError::NoLogs(app.id))
            }
        }
    }

    /// Run a one-off command on a node hosting the app, or any runtime node.
    pub async fn run_app(
        &self,
        user: &str,
        id: &str,
        command: &str,
    ) -> OrchestratorResult<CommandOutput> {
        let app: App = self.get(user, id)?;
        let nodes: Vec<Node> = self
            .store
            .list_nodes_for_formation(&app.formation)?
            .into_iter()
            .filter(|n| n.state == NodeState::Up)
            .collect();

        let hosting = self
            .store
            .list_containers_for_app(&app.id)?
            .into_iter()
            .filter_map(|c| c.node)
            .find_map(|id| nodes.iter().find(|n| n.id == id));
        let node = match hosting {
            Some(node) => Some(node),
            None => {
                let runtime: Vec<String> = self
                    .store
                    .list_layers(&app.formation)?
                    .into_iter()
                    .filter(|l| l.runtime)
                    .map(|l| l.id)
                    .collect();
                nodes.iter().find(|n| runtime.contains(&n.layer))
            }
        };
        let Some(node) = node else {
            return Err(OrchestratorError::Environment(format!(
                "no up nodes available to run {}",
                app.id
            )));
        };

        info!(app = %app.id, node = %node.id, "running command");
        Ok(self.lifecycle.run(node, command).await?)
    }

    // ── Config / builds / releases ─────────────────────────────────

    pub fn latest_config(&self, user: &str, app: &str) -> OrchestratorResult<Config> {
        let app: App = self.get(user, app)?;
        self.store
            .latest_config(&app.id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("config for {}", app.id)))
    }

    /// Merge `values` into the latest config and release it.
    pub async fn create_config(
        &self,
        user: &str,
        app: &str,
        values: &Value,
    ) -> OrchestratorResult<Config> {
        let Some(update) = values.as_object() else {
            return Err(OrchestratorError::Validation(
                "values must be a JSON object".to_string(),
            ));
        };
        let app: App = self.get(user, app)?;
        let formation = self.formation_of(&app)?;

        let config = {
            let _app = self.app_locks.acquire(&app.id).await;
            let now = epoch_secs();
            let prior = self
                .store
                .latest_config(&app.id)?
                .unwrap_or_else(|| Config::initial(&app.id, &app.owner, now));
            let config = prior.merged(update, user, now);
            let release = self.next_release(&app, user, config.version, None, "changed config")?;
            self.store.put_config_release(&config, &release)?;
            info!(app = %app.id, version = config.version, release = release.version, "config released");
            config
        };

        self.dispatcher.config_created(&formation).await?;
        Ok(config)
    }

    /// The build of the latest release.
    pub fn latest_build(&self, user: &str, app: &str) -> OrchestratorResult<Build> {
        let app: App = self.get(user, app)?;
        self.store
            .latest_release(&app.id)?
            .and_then(|r| r.build)
            .map(|id| self.store.get_build(&app.id, &id))
            .transpose()?
            .flatten()
            .ok_or_else(|| OrchestratorError::NotFound(format!("build for {}", app.id)))
    }

    /// Record a new build and release it.
    pub async fn create_build(
        &self,
        user: &str,
        app: &str,
        input: BuildInput,
    ) -> OrchestratorResult<Build> {
        if input.image.trim().is_empty() {
            return Err(OrchestratorError::Validation("image is required".to_string()));
        }
        let app: App = self.get(user, app)?;
        let formation = self.formation_of(&app)?;

        let build = {
            let _app = self.app_locks.acquire(&app.id).await;
            let build = Build {
                id: uuid::Uuid::new_v4().to_string(),
                app: app.id.clone(),
                owner: user.to_string(),
                image: input.image,
                sha: input.sha,
                procfile: input.procfile,
                created_at: epoch_secs(),
            };
            let config_version = self.store.latest_config(&app.id)?.map_or(1, |c| c.version);
            let summary = format!("deployed {}", build.image);
            let release =
                self.next_release(&app, user, config_version, Some(build.id.clone()), &summary)?;
            self.store.put_build_release(&build, &release)?;
            info!(app = %app.id, build = %build.id, release = release.version, "build released");
            build
        };

        self.dispatcher.build_created(&formation).await?;
        Ok(build)
    }

    pub fn latest_release(&self, user: &str, app: &str) -> OrchestratorResult<Release> {
        let app: App = self.get(user, app)?;
        self.store
            .latest_release(&app.id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("release for {}", app.id)))
    }

    /// Next release of `app`. A config-only release keeps the current build.
    fn next_release(
        &self,
        app: &App,
        user: &str,
        config_version: u32,
        build: Option<String>,
        what: &str,
    ) -> OrchestratorResult<Release> {
        let prior = self.store.latest_release(&app.id)?;
        let version = prior.as_ref().map_or(1, |r| r.version + 1);
        let build = build.or_else(|| prior.and_then(|r| r.build));
        Ok(Release {
            app: app.id.clone(),
            owner: user.to_string(),
            version,
            config_version,
            build,
            summary: format!("{user} {what}"),
            created_at: epoch_secs(),
        })
    }

    // ── Containers ─────────────────────────────────────────────────

    /// Containers of an app, optionally narrowed to a type and ordinal.
    pub fn list_containers(
        &self,
        user: &str,
        app: &str,
        container_type: Option<&str>,
        num: Option<u32>,
    ) -> OrchestratorResult<Vec<Container>> {
        let app: App = self.get(user, app)?;
        let containers: Vec<Container> = self
            .store
            .list_containers_for_app(&app.id)?
            .into_iter()
            .filter(|c| container_type.is_none_or(|t| c.container_type == t))
            .filter(|c| num.is_none_or(|n| c.num == n))
            .collect();
        if num.is_some() && containers.is_empty() {
            return Err(OrchestratorError::NotFound(format!(
                "container {}.{}.{}",
                app.id,
                container_type.unwrap_or_default(),
                num.unwrap_or_default()
            )));
        }
        Ok(containers)
    }
}
