//! Release propagation dispatcher.
//!
//! Turns app, release and formation events into converges. Every event is
//! an explicit call made after the triggering write commits, and every call
//! waits for the converges it starts.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use keel_lifecycle::NodeLifecycle;
use keel_state::{Formation, NodeState};

use crate::controller::{ConvergeReport, FormationController};
use crate::error::OrchestratorResult;

/// What a formation teardown left behind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub nodes_destroyed: u32,
    pub layers_destroyed: u32,
    pub apps_destroyed: u32,
    /// Provider errors swallowed along the way.
    pub provider_errors: Vec<String>,
}

#[derive(Clone)]
pub struct Dispatcher {
    controller: FormationController,
    lifecycle: Arc<NodeLifecycle>,
}

impl Dispatcher {
    pub fn new(controller: FormationController, lifecycle: Arc<NodeLifecycle>) -> Self {
        Self {
            controller,
            lifecycle,
        }
    }

    pub async fn app_created(&self, formation: &Formation) -> OrchestratorResult<ConvergeReport> {
        self.converge_with_controller(formation).await
    }

    pub async fn app_destroyed(&self, formation: &Formation) -> OrchestratorResult<ConvergeReport> {
        self.converge_with_controller(formation).await
    }

    /// A new config version only concerns the nodes of its formation.
    pub async fn config_created(&self, formation: &Formation) -> OrchestratorResult<ConvergeReport> {
        self.controller.converge(formation).await
    }

    /// Builds take the same path as configs.
    pub async fn build_created(&self, formation: &Formation) -> OrchestratorResult<ConvergeReport> {
        self.controller.converge(formation).await
    }

    /// Build a new formation's layers and requested nodes, then converge it.
    pub async fn formation_created(
        &self,
        formation: &Formation,
    ) -> OrchestratorResult<ConvergeReport> {
        let store = self.lifecycle.store();
        for layer in store.list_layers(&formation.id)? {
            self.lifecycle.build_layer(&layer).await?;
        }

        let requested: Vec<String> = store
            .list_nodes_for_formation(&formation.id)?
            .into_iter()
            .filter(|n| n.state == NodeState::Requested)
            .map(|n| n.id)
            .collect();
        let handles: Vec<_> = requested
            .iter()
            .map(|id| {
                let lifecycle = self.lifecycle.clone();
                let id = id.clone();
                tokio::spawn(async move { lifecycle.build(&id).await })
            })
            .collect();
        for (id, result) in requested.iter().zip(join_all(handles).await) {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(node = %id, error = %e, "initial node build failed"),
                Err(e) => warn!(node = %id, error = %e, "initial node build task failed"),
            }
        }

        info!(formation = %formation.id, "formation built");
        self.controller.converge(formation).await
    }

    /// Tear a formation down: nodes, layers, apps, then the record itself,
    /// followed by exactly one controller converge.
    ///
    /// Best-effort throughout: provider errors are collected, not raised.
    /// The caller must hold the formation's placement lock.
    pub async fn formation_destroyed(
        &self,
        formation: &Formation,
    ) -> OrchestratorResult<TeardownReport> {
        let store = self.lifecycle.store();
        let mut report = TeardownReport::default();

        let nodes: Vec<String> = store
            .list_nodes_for_formation(&formation.id)?
            .into_iter()
            .map(|n| n.id)
            .collect();
        let handles: Vec<_> = nodes
            .iter()
            .map(|id| {
                let lifecycle = self.lifecycle.clone();
                let id = id.clone();
                tokio::spawn(async move { lifecycle.destroy(&id).await })
            })
            .collect();
        for (id, result) in nodes.iter().zip(join_all(handles).await) {
            match result {
                Ok(Ok(outcome)) => {
                    report.nodes_destroyed += 1;
                    report.provider_errors.extend(outcome.provider_error);
                }
                Ok(Err(e)) => report.provider_errors.push(format!("{id}: {e}")),
                Err(e) => report.provider_errors.push(format!("{id}: {e}")),
            }
        }

        for layer in store.list_layers(&formation.id)? {
            if let Some(err) = self.lifecycle.destroy_layer(&layer).await? {
                report.provider_errors.push(err);
            }
            report.layers_destroyed += 1;
        }

        for app in store.list_apps_for_formation(&formation.id)? {
            store.purge_app(&app.id)?;
            report.apps_destroyed += 1;
        }

        store.delete_formation(&formation.id)?;

        if let Err(e) = self.controller.converge_controller().await {
            warn!(formation = %formation.id, error = %e, "controller converge after teardown failed");
        }

        info!(
            formation = %formation.id,
            nodes = report.nodes_destroyed,
            layers = report.layers_destroyed,
            apps = report.apps_destroyed,
            provider_errors = report.provider_errors.len(),
            "formation destroyed"
        );
        Ok(report)
    }

    /// Converge the formation and the controller concurrently; both finish
    /// before this returns. A controller failure is logged, not raised.
    async fn converge_with_controller(
        &self,
        formation: &Formation,
    ) -> OrchestratorResult<ConvergeReport> {
        let (report, controller) = tokio::join!(
            self.controller.converge(formation),
            self.controller.converge_controller()
        );
        if let Err(e) = controller {
            warn!(formation = %formation.id, error = %e, "controller converge failed");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    fn dispatcher(fx: &Fixture) -> Dispatcher {
        let controller = FormationController::new(fx.lifecycle.clone());
        Dispatcher::new(controller, fx.lifecycle.clone())
    }

    #[tokio::test]
    async fn app_events_converge_formation_and_controller() {
        let fx = Fixture::new();
        let formation = fx.formation("dev", Some("example.com"));
        let layer = fx.layer("dev", "runtime");
        fx.up_nodes(&layer, 2).await;

        let report = dispatcher(&fx).app_created(&formation).await.unwrap();

        assert_eq!(report.nodes.len(), 2);
        assert_eq!(fx.executor.controller_converges(), 1);

        dispatcher(&fx).app_destroyed(&formation).await.unwrap();
        assert_eq!(fx.executor.controller_converges(), 2);
    }

    #[tokio::test]
    async fn release_events_skip_the_controller() {
        let fx = Fixture::new();
        let formation = fx.formation("dev", Some("example.com"));
        let layer = fx.layer("dev", "runtime");
        fx.up_nodes(&layer, 1).await;

        dispatcher(&fx).config_created(&formation).await.unwrap();
        dispatcher(&fx).build_created(&formation).await.unwrap();

        assert_eq!(fx.executor.converged_nodes().len(), 2);
        assert_eq!(fx.executor.controller_converges(), 0);
    }

    #[tokio::test]
    async fn formation_created_builds_requested_nodes() {
        let fx = Fixture::new();
        let formation = fx.formation("dev", None);
        let layer = fx.layer("dev", "runtime");
        fx.lifecycle.new_node(&layer, None).unwrap();
        fx.lifecycle.new_node(&layer, None).unwrap();

        let report = dispatcher(&fx).formation_created(&formation).await.unwrap();

        assert_eq!(fx.provisioner.layer_builds(), 1);
        assert_eq!(fx.provisioner.provision_calls(), 2);
        assert_eq!(report.nodes.len(), 2);
    }

    #[tokio::test]
    async fn teardown_survives_a_failing_deprovision() {
        let fx = Fixture::new();
        let formation = fx.formation("dev", Some("example.com"));
        let runtime = fx.layer("dev", "runtime");
        let proxy = fx.layer("dev", "proxy");
        let mut nodes = fx.up_nodes(&runtime, 2).await;
        nodes.extend(fx.up_nodes(&proxy, 1).await);
        fx.app("api", "dev");
        fx.provisioner.fail_deprovision(&nodes[1]);

        let report = dispatcher(&fx).formation_destroyed(&formation).await.unwrap();

        assert_eq!(report.nodes_destroyed, 3);
        assert_eq!(report.layers_destroyed, 2);
        assert_eq!(report.apps_destroyed, 1);
        assert_eq!(report.provider_errors.len(), 1);
        assert_eq!(fx.executor.controller_converges(), 1);

        assert!(fx.store.get_formation("dev").unwrap().is_none());
        assert!(fx.store.list_nodes_for_formation("dev").unwrap().is_empty());
        assert!(fx.store.list_layers("dev").unwrap().is_empty());
        assert!(fx.store.get_app("api").unwrap().is_none());
    }
}
