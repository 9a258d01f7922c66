//! Scaling and balancing.
//!
//! App scaling asks the placement engine for a plan and commits it in one
//! transaction; formation scaling adds or removes nodes per layer. Both
//! validate the request completely before touching anything.

use std::collections::BTreeMap;

use futures::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use keel_placement::{BalancePlan, Topology, balance, compute_layout};
use keel_state::{App, Formation, epoch_secs};

use crate::controller::ConvergeReport;
use crate::databag::Databag;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::service::Orchestrator;
use crate::validator::{parse_structure, require_credentials};

impl Orchestrator {
    /// Scale an app's container types, then converge its formation.
    pub async fn scale_app(
        &self,
        user: &str,
        id: &str,
        body: &Value,
    ) -> OrchestratorResult<ConvergeReport> {
        let requested = parse_structure(body)?;
        let app: App = self.get(user, id)?;
        let formation = self.formation_of(&app)?;

        {
            let _app = self.app_locks.acquire(&app.id).await;
            let _placement = self.placement_locks.acquire(&formation.id).await;

            // Reload under the lock: a concurrent scale may have committed.
            let mut app = self
                .store
                .get_app(&app.id)?
                .ok_or_else(|| OrchestratorError::NotFound(format!("app {id}")))?;

            let topology = Topology::new(
                &self.store.list_nodes_for_formation(&formation.id)?,
                &self.store.list_layers(&formation.id)?,
            );
            let containers = self.store.list_containers_for_formation(&formation.id)?;
            let now = epoch_secs();
            let plan = compute_layout(&topology, &containers, &app, &requested, now)?;

            app.structure.extend(requested.iter().map(|(t, n)| (t.clone(), *n)));
            app.structure.retain(|_, n| *n > 0);
            app.updated_at = now;
            self.store
                .commit_app_layout(&app, &plan.to_add, &plan.removal_keys())?;

            info!(
                app = %app.id,
                added = plan.to_add.len(),
                removed = plan.to_remove.len(),
                unplaced = plan.to_add.iter().filter(|c| c.node.is_none()).count(),
                "app scaled"
            );
        }

        self.controller.converge(&formation).await
    }

    /// Scale a formation's layers to the requested node counts.
    ///
    /// New nodes are built concurrently; surplus nodes go highest ordinal
    /// first. Containers are rebalanced before the formation converges.
    pub async fn scale_formation(
        &self,
        user: &str,
        id: &str,
        body: &Value,
    ) -> OrchestratorResult<Databag> {
        let requested = parse_structure(body)?;
        let formation: Formation = self.owned(user, id)?;
        require_credentials(&self.store, &formation.owner)?;

        let mut layers = BTreeMap::new();
        for name in requested.keys() {
            let layer = self
                .store
                .get_layer(&formation.id, name)?
                .ok_or_else(|| OrchestratorError::LayerNotFound(name.clone()))?;
            layers.insert(name.clone(), layer);
        }

        let mut to_build = Vec::new();
        let mut to_destroy = Vec::new();
        for (name, &count) in &requested {
            let layer = &layers[name];
            let mut nodes = self.store.list_nodes_for_layer(&formation.id, name)?;
            let current = nodes.len() as u32;
            if count > current {
                for _ in current..count {
                    to_build.push(self.lifecycle.new_node(layer, None)?.id);
                }
            } else if count < current {
                nodes.sort_by(|a, b| b.num.cmp(&a.num));
                to_destroy.extend(
                    nodes
                        .into_iter()
                        .take((current - count) as usize)
                        .map(|n| n.id),
                );
            }
        }

        let handles: Vec<_> = to_build
            .iter()
            .map(|node_id| {
                let lifecycle = self.lifecycle.clone();
                let node_id = node_id.clone();
                tokio::spawn(async move { lifecycle.build(&node_id).await })
            })
            .collect();
        let mut failures = Vec::new();
        for (node_id, result) in to_build.iter().zip(join_all(handles).await) {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(e) => failures.push(format!("{node_id}: {e}")),
            }
        }

        {
            let _placement = self.placement_locks.acquire(&formation.id).await;
            for node_id in &to_destroy {
                let outcome = self.lifecycle.destroy(node_id).await?;
                if let Some(reason) = outcome.provider_error {
                    warn!(node = %node_id, %reason, "surplus node destroyed with provider error");
                }
            }
            self.rebalance_locked(&formation.id)?;
        }

        info!(
            formation = %formation.id,
            built = to_build.len() - failures.len(),
            destroyed = to_destroy.len(),
            failed = failures.len(),
            "formation scaled"
        );

        if !failures.is_empty() {
            return Err(OrchestratorError::ProviderFailure(failures.join("; ")));
        }

        let report = self.controller.converge(&formation).await?;
        Ok(report.databag)
    }

    /// Even out container placement, returning the resulting databag.
    ///
    /// Nodes are not converged.
    pub async fn balance_formation(&self, user: &str, id: &str) -> OrchestratorResult<Databag> {
        let formation: Formation = self.get(user, id)?;
        {
            let _placement = self.placement_locks.acquire(&formation.id).await;
            self.rebalance_locked(&formation.id)?;
        }
        self.controller.calculate(&formation)
    }

    /// Balance and commit. The caller must hold the placement lock.
    pub(crate) fn rebalance_locked(&self, formation: &str) -> OrchestratorResult<BalancePlan> {
        let topology = Topology::new(
            &self.store.list_nodes_for_formation(formation)?,
            &self.store.list_layers(formation)?,
        );
        let containers = self.store.list_containers_for_formation(formation)?;
        let plan = balance(&topology, &containers);
        if !plan.is_empty() {
            self.store.apply_container_changes(&plan.moved, &[])?;
        }
        if plan.stranded > 0 {
            warn!(formation = %formation, stranded = plan.stranded, "containers left unplaced");
        }
        info!(formation = %formation, moved = plan.moved.len(), "formation balanced");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use keel_state::NodeState;

    use crate::error::OrchestratorError;
    use crate::testing::Fixture;

    fn ordinals(fx: &Fixture, app: &str, ty: &str) -> Vec<u32> {
        fx.store
            .list_containers_for_app(app)
            .unwrap()
            .into_iter()
            .filter(|c| c.container_type == ty)
            .map(|c| c.num)
            .collect()
    }

    #[tokio::test]
    async fn scale_app_places_on_least_loaded_nodes() {
        let fx = Fixture::new();
        fx.formation("dev", Some("example.com"));
        let layer = fx.layer("dev", "runtime");
        let nodes = fx.up_nodes(&layer, 2).await;
        fx.app("api", "dev");

        let report = fx
            .orchestrator
            .scale_app("alice", "api", &json!({"web": 3, "worker": "1"}))
            .await
            .unwrap();

        assert!(report.ok());
        assert_eq!(ordinals(&fx, "api", "web"), vec![1, 2, 3]);
        assert_eq!(ordinals(&fx, "api", "worker"), vec![1]);
        let on_first = fx
            .store
            .list_containers_for_app("api")
            .unwrap()
            .iter()
            .filter(|c| c.node.as_deref() == Some(nodes[0].as_str()))
            .count();
        assert_eq!(on_first, 2);

        let app = fx.store.get_app("api").unwrap().unwrap();
        assert_eq!(app.structure["web"], 3);
        assert_eq!(report.databag.apps["api"].containers["web"].len(), 3);
    }

    #[tokio::test]
    async fn scale_round_trip_restores_ordinals() {
        let fx = Fixture::new();
        fx.formation("dev", Some("example.com"));
        let layer = fx.layer("dev", "runtime");
        fx.up_nodes(&layer, 2).await;
        fx.app("api", "dev");
        let orch = &fx.orchestrator;

        orch.scale_app("alice", "api", &json!({"web": 2})).await.unwrap();
        orch.scale_app("alice", "api", &json!({"web": 5})).await.unwrap();
        assert_eq!(ordinals(&fx, "api", "web"), vec![1, 2, 3, 4, 5]);
        orch.scale_app("alice", "api", &json!({"web": 2})).await.unwrap();
        assert_eq!(ordinals(&fx, "api", "web"), vec![1, 2]);

        orch.scale_app("alice", "api", &json!({"web": 0})).await.unwrap();
        assert!(ordinals(&fx, "api", "web").is_empty());
        let app = fx.store.get_app("api").unwrap().unwrap();
        assert!(!app.structure.contains_key("web"));
    }

    #[tokio::test]
    async fn invalid_count_leaves_containers_unchanged() {
        let fx = Fixture::new();
        fx.formation("dev", Some("example.com"));
        let layer = fx.layer("dev", "runtime");
        fx.up_nodes(&layer, 1).await;
        fx.app("api", "dev");
        fx.orchestrator
            .scale_app("alice", "api", &json!({"web": 2}))
            .await
            .unwrap();
        let converges = fx.executor.converged_nodes().len();

        let err = fx
            .orchestrator
            .scale_app("alice", "api", &json!({"web": "abc"}))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::InvalidScaleFormat(_)));
        assert_eq!(ordinals(&fx, "api", "web"), vec![1, 2]);
        assert_eq!(fx.executor.converged_nodes().len(), converges);
    }

    #[tokio::test]
    async fn scale_without_eligible_node_commits_nothing() {
        let fx = Fixture::new();
        fx.formation("dev", Some("example.com"));
        fx.layer("dev", "runtime");
        fx.app("api", "dev");

        let err = fx
            .orchestrator
            .scale_app("alice", "api", &json!({"web": 1}))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::NoEligibleNode(t) if t == "web"));
        assert!(fx.store.list_containers_for_app("api").unwrap().is_empty());
        assert!(fx.store.get_app("api").unwrap().unwrap().structure.is_empty());
    }

    #[tokio::test]
    async fn collaborators_can_scale_apps() {
        let fx = Fixture::new();
        fx.formation("dev", Some("example.com"));
        let layer = fx.layer("dev", "runtime");
        fx.up_nodes(&layer, 1).await;
        let mut app = fx.app("api", "dev");
        app.collaborators.push("bob".to_string());
        fx.store.put_app(&app).unwrap();

        fx.orchestrator
            .scale_app("bob", "api", &json!({"web": 1}))
            .await
            .unwrap();
        let err = fx
            .orchestrator
            .scale_app("mallory", "api", &json!({"web": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn scale_formation_builds_and_trims_nodes() {
        let fx = Fixture::new();
        fx.formation("dev", Some("example.com"));
        fx.layer("dev", "runtime");

        let bag = fx
            .orchestrator
            .scale_formation("alice", "dev", &json!({"runtime": 3}))
            .await
            .unwrap();
        assert_eq!(bag.layers["runtime"].nodes.len(), 3);
        assert_eq!(fx.provisioner.provision_calls(), 3);
        assert!(
            fx.store
                .list_nodes_for_formation("dev")
                .unwrap()
                .iter()
                .all(|n| n.state == NodeState::Up)
        );

        fx.orchestrator
            .scale_formation("alice", "dev", &json!({"runtime": 1}))
            .await
            .unwrap();
        let nums: Vec<u32> = fx
            .store
            .list_nodes_for_layer("dev", "runtime")
            .unwrap()
            .iter()
            .map(|n| n.num)
            .collect();
        assert_eq!(nums, vec![1]);
        assert_eq!(fx.provisioner.deprovision_calls(), 2);
    }

    #[tokio::test]
    async fn scale_formation_rebalances_containers_off_removed_nodes() {
        let fx = Fixture::new();
        fx.formation("dev", Some("example.com"));
        let layer = fx.layer("dev", "runtime");
        fx.up_nodes(&layer, 2).await;
        fx.app("api", "dev");
        fx.orchestrator
            .scale_app("alice", "api", &json!({"web": 4}))
            .await
            .unwrap();

        fx.orchestrator
            .scale_formation("alice", "dev", &json!({"runtime": 1}))
            .await
            .unwrap();

        let containers = fx.store.list_containers_for_app("api").unwrap();
        assert_eq!(containers.len(), 4);
        assert!(
            containers
                .iter()
                .all(|c| c.node.as_deref() == Some("dev.runtime.1"))
        );
    }

    #[tokio::test]
    async fn scale_formation_requires_credentials() {
        let fx = Fixture::new();
        fx.formation_owned_by("solo", "carol");
        let err = fx
            .orchestrator
            .scale_formation("carol", "solo", &json!({"runtime": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoProviderCredentials));
    }

    #[tokio::test]
    async fn scale_formation_checks_every_layer_first() {
        let fx = Fixture::new();
        fx.formation("dev", Some("example.com"));
        fx.layer("dev", "runtime");

        let err = fx
            .orchestrator
            .scale_formation("alice", "dev", &json!({"runtime": 2, "zzz": 1}))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::LayerNotFound(l) if l == "zzz"));
        assert!(fx.store.list_nodes_for_formation("dev").unwrap().is_empty());
        assert_eq!(fx.provisioner.provision_calls(), 0);
    }

    #[tokio::test]
    async fn scale_formation_reports_provider_failure() {
        let fx = Fixture::new();
        fx.formation("dev", Some("example.com"));
        fx.layer("dev", "runtime");
        fx.provisioner.fail_provision("dev.runtime.2");

        let err = fx
            .orchestrator
            .scale_formation("alice", "dev", &json!({"runtime": 2}))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::ProviderFailure(_)));
        let states: Vec<NodeState> = fx
            .store
            .list_nodes_for_layer("dev", "runtime")
            .unwrap()
            .iter()
            .map(|n| n.state)
            .collect();
        assert_eq!(states, vec![NodeState::Up, NodeState::Down]);
    }

    #[tokio::test]
    async fn balance_is_idempotent() {
        let fx = Fixture::new();
        fx.formation("dev", Some("example.com"));
        let layer = fx.layer("dev", "runtime");
        fx.up_nodes(&layer, 1).await;
        fx.app("api", "dev");
        fx.orchestrator
            .scale_app("alice", "api", &json!({"web": 4}))
            .await
            .unwrap();
        fx.up_nodes(&layer, 1).await;

        fx.orchestrator.balance_formation("alice", "dev").await.unwrap();
        let first = fx.store.list_containers_for_app("api").unwrap();
        fx.orchestrator.balance_formation("alice", "dev").await.unwrap();
        let second = fx.store.list_containers_for_app("api").unwrap();

        assert_eq!(first, second);
        let on_new = first
            .iter()
            .filter(|c| c.node.as_deref() == Some("dev.runtime.2"))
            .count();
        assert_eq!(on_new, 2);
    }
}
