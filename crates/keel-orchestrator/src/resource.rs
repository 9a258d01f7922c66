//! Owner-scoped resources and their lifecycle hooks.
//!
//! Every top-level resource is owned by one user and may be shared with
//! collaborators. `ScopedResource` gives the orchestrator one way to load a
//! resource on behalf of a user and to run the side effects of creating or
//! destroying it.

use async_trait::async_trait;
use tracing::{info, warn};

use keel_state::{App, Formation, Layer, StateResult, StateStore};

use crate::error::OrchestratorResult;
use crate::service::Orchestrator;

#[async_trait]
pub trait ScopedResource: Sized + Send + Sync {
    /// Human name used in "not found" errors.
    const KIND: &'static str;

    fn owner(&self) -> &str;

    /// Whether `user` may read and use this resource.
    fn visible_to(&self, user: &str) -> bool {
        self.owner() == user
    }

    fn load(store: &StateStore, key: &str) -> StateResult<Option<Self>>;

    /// Side effects after the record is stored.
    async fn on_create(&self, orch: &Orchestrator) -> OrchestratorResult<()>;

    /// Tear down the resource and everything it owns.
    async fn on_destroy(&self, orch: &Orchestrator) -> OrchestratorResult<()>;
}

#[async_trait]
impl ScopedResource for Formation {
    const KIND: &'static str = "formation";

    fn owner(&self) -> &str {
        &self.owner
    }

    fn visible_to(&self, user: &str) -> bool {
        self.is_visible_to(user)
    }

    fn load(store: &StateStore, key: &str) -> StateResult<Option<Self>> {
        store.get_formation(key)
    }

    async fn on_create(&self, orch: &Orchestrator) -> OrchestratorResult<()> {
        orch.dispatcher.formation_created(self).await?;
        Ok(())
    }

    async fn on_destroy(&self, orch: &Orchestrator) -> OrchestratorResult<()> {
        let report = {
            let _placement = orch.placement_locks.acquire(&self.id).await;
            orch.dispatcher.formation_destroyed(self).await?
        };
        orch.placement_locks.forget(&self.id);
        if !report.provider_errors.is_empty() {
            warn!(
                formation = %self.id,
                errors = ?report.provider_errors,
                "formation destroyed with provider errors"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ScopedResource for Layer {
    const KIND: &'static str = "layer";

    fn owner(&self) -> &str {
        &self.owner
    }

    fn load(store: &StateStore, key: &str) -> StateResult<Option<Self>> {
        match key.split_once('/') {
            Some((formation, layer)) => store.get_layer(formation, layer),
            None => Ok(None),
        }
    }

    async fn on_create(&self, orch: &Orchestrator) -> OrchestratorResult<()> {
        orch.lifecycle.build_layer(self).await?;
        Ok(())
    }

    async fn on_destroy(&self, orch: &Orchestrator) -> OrchestratorResult<()> {
        let _placement = orch.placement_locks.acquire(&self.formation).await;
        let mut nodes = orch.store.list_nodes_for_layer(&self.formation, &self.id)?;
        nodes.sort_by(|a, b| b.num.cmp(&a.num));
        for node in nodes {
            orch.lifecycle.destroy(&node.id).await?;
        }
        orch.lifecycle.destroy_layer(self).await?;
        orch.rebalance_locked(&self.formation)?;
        info!(layer = %self.table_key(), "layer torn down");
        Ok(())
    }
}

#[async_trait]
impl ScopedResource for App {
    const KIND: &'static str = "app";

    fn owner(&self) -> &str {
        &self.owner
    }

    fn visible_to(&self, user: &str) -> bool {
        self.is_visible_to(user)
    }

    fn load(store: &StateStore, key: &str) -> StateResult<Option<Self>> {
        store.get_app(key)
    }

    async fn on_create(&self, orch: &Orchestrator) -> OrchestratorResult<()> {
        let formation = orch.formation_of(self)?;
        orch.dispatcher.app_created(&formation).await?;
        Ok(())
    }

    async fn on_destroy(&self, orch: &Orchestrator) -> OrchestratorResult<()> {
        {
            let _app = orch.app_locks.acquire(&self.id).await;
            let _placement = orch.placement_locks.acquire(&self.formation).await;
            orch.store.purge_app(&self.id)?;
        }
        orch.app_locks.forget(&self.id);

        match orch.store.get_formation(&self.formation)? {
            Some(formation) => {
                orch.dispatcher.app_destroyed(&formation).await?;
            }
            None => orch.controller.converge_controller().await?,
        }
        info!(app = %self.id, "app destroyed");
        Ok(())
    }
}
