//! Node lifecycle manager.
//!
//! Drives each node through its states:
//!
//! ```text
//! requested ─build─► building ─ok─► up ◄──► converging
//!                        │                     │
//!                        └──fail──► down ◄─fail┘
//! any ─destroy─► (removed)
//! ```
//!
//! Every provider and executor call is bounded by a timeout; a timeout is a
//! failure like any other and moves the node to `down`. Destroy is
//! best-effort: the record goes away even if the provider refuses.
//!
//! State changes are read-modify-writes against the stored record, never a
//! write-back of a copy loaded before an await. A node destroyed while its
//! build or converge is in flight stays destroyed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use keel_state::{Layer, Node, NodeId, NodeState, Provider, StateError, StateStore, epoch_secs};

use crate::error::{LifecycleError, LifecycleResult};
use crate::executor::{CommandOutput, ExecTarget, RemoteExecutor};
use crate::provisioner::{LayerSpec, NodeSpec, Provisioner};

/// Upper bounds for external calls.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimeouts {
    pub provider: Duration,
    pub converge: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self {
            provider: Duration::from_secs(600),
            converge: Duration::from_secs(300),
        }
    }
}

/// Result of converging one node.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NodeConverge {
    pub node: NodeId,
    pub output: String,
    pub exit_code: i32,
}

/// Result of destroying one node.
#[derive(Debug, Clone, Serialize)]
pub struct DestroyOutcome {
    pub node: NodeId,
    /// Containers that lost their placement.
    pub unplaced: u32,
    /// Set when the provider refused or timed out; the record is gone anyway.
    pub provider_error: Option<String>,
}

/// Creates, builds, converges and destroys nodes.
pub struct NodeLifecycle {
    store: StateStore,
    provisioner: Arc<dyn Provisioner>,
    executor: Arc<dyn RemoteExecutor>,
    timeouts: LifecycleTimeouts,
}

impl NodeLifecycle {
    pub fn new(
        store: StateStore,
        provisioner: Arc<dyn Provisioner>,
        executor: Arc<dyn RemoteExecutor>,
        timeouts: LifecycleTimeouts,
    ) -> Self {
        Self {
            store,
            provisioner,
            executor,
            timeouts,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Register a new node in `layer` in the `requested` state.
    ///
    /// Without an fqdn one is derived from the layer and ordinal.
    pub fn new_node(&self, layer: &Layer, fqdn: Option<&str>) -> LifecycleResult<Node> {
        let now = epoch_secs();
        let inserted = self
            .store
            .insert_next_node(&layer.formation, &layer.id, |num| Node {
                id: Node::node_id(&layer.formation, &layer.id, num),
                formation: layer.formation.clone(),
                layer: layer.id.clone(),
                owner: layer.owner.clone(),
                num,
                fqdn: match fqdn {
                    Some(f) => f.to_string(),
                    None => format!("{}-{}.{}", layer.id, num, layer.formation),
                },
                state: NodeState::Requested,
                provider_id: None,
                metadata: Default::default(),
                created_at: now,
                updated_at: now,
            });

        match inserted {
            Ok(node) => {
                info!(node = %node.id, fqdn = %node.fqdn, "node requested");
                Ok(node)
            }
            Err(StateError::Conflict { key, .. }) => Err(LifecycleError::DuplicateNode {
                layer: layer.id.clone(),
                fqdn: key,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Provision a node through the provider.
    ///
    /// No retry: a failed build leaves the node `down`.
    ///
    /// If the node is destroyed while the provider call is in flight, the
    /// machine it produced is deprovisioned again and `NodeNotFound` is
    /// returned.
    pub async fn build(&self, node_id: &str) -> LifecycleResult<Node> {
        let node = self.load_node(node_id)?;
        let layer = self.load_layer(&node)?;
        let provider = self.load_provider(&layer)?;

        let node = self
            .transition(node_id, NodeState::Building, |_| {})?
            .ok_or_else(|| LifecycleError::NodeNotFound(node_id.to_string()))?;
        let spec = NodeSpec::new(&node, &layer);

        let result = timeout(
            self.timeouts.provider,
            self.provisioner.provision(&provider, &spec),
        )
        .await;

        let reason = match result {
            Ok(Ok(provisioned)) => {
                let provider_id = provisioned.provider_id.clone();
                let built = self.transition(node_id, NodeState::Up, |n| {
                    n.provider_id = Some(provisioned.provider_id);
                    if let Some(fqdn) = provisioned.fqdn {
                        n.fqdn = fqdn;
                    }
                    n.metadata = provisioned.metadata;
                })?;
                let Some(built) = built else {
                    warn!(node = %node_id, %provider_id, "node destroyed during build, releasing machine");
                    let orphan = Node {
                        provider_id: Some(provider_id),
                        ..node
                    };
                    if let Err(reason) = self.deprovision(&orphan).await {
                        warn!(node = %node_id, %reason, "releasing orphaned machine failed");
                    }
                    return Err(LifecycleError::NodeNotFound(node_id.to_string()));
                };
                info!(node = %built.id, provider_id = ?built.provider_id, "node built");
                return Ok(built);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("provision timed out after {:?}", self.timeouts.provider),
        };

        self.transition(node_id, NodeState::Down, |_| {})?;
        warn!(node = %node_id, %reason, "node build failed");
        Err(LifecycleError::ProviderFailure {
            target: node_id.to_string(),
            reason,
        })
    }

    /// Deprovision and remove a node. Its containers become unplaced.
    pub async fn destroy(&self, node_id: &str) -> LifecycleResult<DestroyOutcome> {
        let node = self.load_node(node_id)?;

        let provider_error = match &node.provider_id {
            Some(_) => self.deprovision(&node).await.err(),
            None => None,
        };
        if let Some(reason) = &provider_error {
            warn!(node = %node.id, %reason, "deprovision failed, removing node anyway");
        }

        let unplaced = self.store.remove_node(&node.id)?;
        info!(node = %node.id, unplaced, "node destroyed");

        Ok(DestroyOutcome {
            node: node.id,
            unplaced,
            provider_error,
        })
    }

    async fn deprovision(&self, node: &Node) -> Result<(), String> {
        let layer = self.load_layer(node).map_err(|e| e.to_string())?;
        let provider = self.load_provider(&layer).map_err(|e| e.to_string())?;
        let spec = NodeSpec::new(node, &layer);

        match timeout(
            self.timeouts.provider,
            self.provisioner.deprovision(&provider, &spec),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "deprovision timed out after {:?}",
                self.timeouts.provider
            )),
        }
    }

    /// Re-apply `databag` to an `up` node.
    ///
    /// A non-zero exit code is returned as output, not as an error; only an
    /// executor failure or timeout marks the node `down`.
    pub async fn converge(&self, node_id: &str, databag: &Value) -> LifecycleResult<NodeConverge> {
        let node = self.load_node(node_id)?;
        let layer = self.load_layer(&node)?;

        // Claim the node: only an `up` node moves to `converging`.
        let node = self
            .store
            .update_node(node_id, |n| {
                if n.state != NodeState::Up {
                    return false;
                }
                debug!(node = %n.id, from = %n.state, to = "converging", "node state change");
                n.state = NodeState::Converging;
                n.updated_at = epoch_secs();
                true
            })?
            .ok_or_else(|| LifecycleError::NodeNotFound(node_id.to_string()))?;
        if node.state != NodeState::Converging {
            return Err(LifecycleError::NodeNotUp {
                node: node.id,
                state: node.state,
            });
        }
        let target = ExecTarget::new(&node, &layer);
        debug!(node = %node.id, "converging node");

        let result = timeout(
            self.timeouts.converge,
            self.executor.converge(&target, databag),
        )
        .await;

        let reason = match result {
            Ok(Ok(out)) => {
                if self.transition(node_id, NodeState::Up, |_| {})?.is_none() {
                    warn!(node = %node.id, "node destroyed during converge");
                    return Err(LifecycleError::NodeNotFound(node.id));
                }
                if out.succeeded() {
                    info!(node = %node.id, "node converged");
                } else {
                    warn!(node = %node.id, exit_code = out.exit_code, "converge exited non-zero");
                }
                return Ok(NodeConverge {
                    node: node.id,
                    output: out.output,
                    exit_code: out.exit_code,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("converge timed out after {:?}", self.timeouts.converge),
        };

        self.transition(node_id, NodeState::Down, |_| {})?;
        warn!(node = %node.id, %reason, "converge failed, node marked down");
        Err(LifecycleError::ConvergeFailure {
            node: node.id,
            reason,
        })
    }

    /// Apply an external health-failure signal.
    pub fn mark_down(&self, node_id: &str) -> LifecycleResult<Node> {
        let node = self
            .transition(node_id, NodeState::Down, |_| {})?
            .ok_or_else(|| LifecycleError::NodeNotFound(node_id.to_string()))?;
        warn!(node = %node.id, "node marked down");
        Ok(node)
    }

    /// Prepare provider-side resources for a layer.
    pub async fn build_layer(&self, layer: &Layer) -> LifecycleResult<()> {
        let provider = self.load_provider(layer)?;
        let spec = LayerSpec::from_layer(layer);
        let reason = match timeout(
            self.timeouts.provider,
            self.provisioner.build_layer(&provider, &spec),
        )
        .await
        {
            Ok(Ok(())) => {
                info!(layer = %layer.table_key(), "layer built");
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("build timed out after {:?}", self.timeouts.provider),
        };
        Err(LifecycleError::ProviderFailure {
            target: layer.table_key(),
            reason,
        })
    }

    /// Tear down provider-side layer resources and delete the layer record.
    ///
    /// The layer's nodes must already be gone. Returns the provider error,
    /// if any, without failing.
    pub async fn destroy_layer(&self, layer: &Layer) -> LifecycleResult<Option<String>> {
        let provider_error = match self.load_provider(layer) {
            Ok(provider) => {
                let spec = LayerSpec::from_layer(layer);
                match timeout(
                    self.timeouts.provider,
                    self.provisioner.destroy_layer(&provider, &spec),
                )
                .await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!(
                        "destroy timed out after {:?}",
                        self.timeouts.provider
                    )),
                }
            }
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = &provider_error {
            warn!(layer = %layer.table_key(), %reason, "layer teardown failed, removing anyway");
        }

        self.store.delete_layer(&layer.formation, &layer.id)?;
        info!(layer = %layer.table_key(), "layer destroyed");
        Ok(provider_error)
    }

    /// Run a command on a node.
    pub async fn run(&self, node: &Node, command: &str) -> LifecycleResult<CommandOutput> {
        let layer = self.load_layer(node)?;
        let target = ExecTarget::new(node, &layer);
        match timeout(self.timeouts.converge, self.executor.run(&target, command)).await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(e)) => Err(LifecycleError::Environment(e.to_string())),
            Err(_) => Err(LifecycleError::Environment(format!(
                "run timed out after {:?}",
                self.timeouts.converge
            ))),
        }
    }

    /// Fetch an app's logs from the controller.
    pub async fn logs(&self, app: &str) -> LifecycleResult<Option<String>> {
        match timeout(self.timeouts.converge, self.executor.logs(app)).await {
            Ok(Ok(logs)) => Ok(logs),
            Ok(Err(e)) => Err(LifecycleError::Environment(e.to_string())),
            Err(_) => Err(LifecycleError::Environment(format!(
                "logs timed out after {:?}",
                self.timeouts.converge
            ))),
        }
    }

    /// Converge the control-plane node.
    pub async fn converge_controller(&self) -> LifecycleResult<CommandOutput> {
        match timeout(self.timeouts.converge, self.executor.converge_controller()).await {
            Ok(Ok(out)) => {
                info!(exit_code = out.exit_code, "controller converged");
                Ok(out)
            }
            Ok(Err(e)) => Err(LifecycleError::Environment(e.to_string())),
            Err(_) => Err(LifecycleError::Environment(format!(
                "controller converge timed out after {:?}",
                self.timeouts.converge
            ))),
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn load_node(&self, node_id: &str) -> LifecycleResult<Node> {
        self.store
            .get_node(node_id)?
            .ok_or_else(|| LifecycleError::NodeNotFound(node_id.to_string()))
    }

    fn load_layer(&self, node: &Node) -> LifecycleResult<Layer> {
        self.store
            .get_layer(&node.formation, &node.layer)?
            .ok_or_else(|| LifecycleError::ProviderFailure {
                target: node.id.clone(),
                reason: format!("layer '{}' not found", node.layer),
            })
    }

    fn load_provider(&self, layer: &Layer) -> LifecycleResult<Provider> {
        self.store
            .get_provider(&layer.owner, &layer.provider)?
            .ok_or_else(|| LifecycleError::ProviderNotFound(layer.provider.clone()))
    }

    /// Move the stored node to `state`, applying `update` in the same write.
    ///
    /// `None` when the node has been removed; nothing is written then.
    fn transition(
        &self,
        node_id: &str,
        state: NodeState,
        update: impl FnOnce(&mut Node),
    ) -> LifecycleResult<Option<Node>> {
        let node = self.store.update_node(node_id, |n| {
            debug!(node = %n.id, from = %n.state, to = %state, "node state change");
            n.state = state;
            n.updated_at = epoch_secs();
            update(n);
            true
        })?;
        if node.is_none() {
            debug!(node = %node_id, to = %state, "node gone, state change dropped");
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeExecutor, FakeProvisioner};
    use keel_state::{Container, SshKeypair};
    use serde_json::{Map, json};

    struct Harness {
        lifecycle: NodeLifecycle,
        provisioner: Arc<FakeProvisioner>,
        executor: Arc<FakeExecutor>,
        layer: Layer,
    }

    fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let mut creds = Map::new();
        creds.insert("key".to_string(), json!("secret"));
        store
            .put_provider(&Provider {
                id: "fake".to_string(),
                owner: "alice".to_string(),
                kind: "fake".to_string(),
                creds,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        let layer = Layer {
            id: "runtime".to_string(),
            formation: "dev".to_string(),
            owner: "alice".to_string(),
            provider: "fake".to_string(),
            flavor: None,
            instance_type: "small".to_string(),
            params: Map::new(),
            runtime: true,
            proxy: false,
            container_types: Vec::new(),
            ssh_username: "ubuntu".to_string(),
            ssh_keypair: SshKeypair {
                private_key: "private".to_string(),
                public_key: "public".to_string(),
            },
            created_at: 0,
        };
        store.put_layer(&layer).unwrap();

        let provisioner = Arc::new(FakeProvisioner::default());
        let executor = Arc::new(FakeExecutor::default());
        let lifecycle = NodeLifecycle::new(
            store,
            provisioner.clone(),
            executor.clone(),
            LifecycleTimeouts {
                provider: Duration::from_millis(200),
                converge: Duration::from_millis(200),
            },
        );
        Harness {
            lifecycle,
            provisioner,
            executor,
            layer,
        }
    }

    // ── new_node ───────────────────────────────────────────────────

    #[test]
    fn duplicate_fqdn_in_same_layer_is_rejected() {
        let h = harness();
        h.lifecycle.new_node(&h.layer, Some("a.example.com")).unwrap();

        let err = h
            .lifecycle
            .new_node(&h.layer, Some("a.example.com"))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateNode { .. }));

        // Same fqdn in another layer is fine.
        let mut other = h.layer.clone();
        other.id = "proxy".to_string();
        h.lifecycle.store().put_layer(&other).unwrap();
        let node = h.lifecycle.new_node(&other, Some("a.example.com")).unwrap();
        assert_eq!(node.id, "dev.proxy.1");
    }

    #[test]
    fn concurrent_new_nodes_get_distinct_ordinals() {
        let h = harness();

        let mut ids: Vec<String> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..6)
                .map(|_| scope.spawn(|| h.lifecycle.new_node(&h.layer, None).unwrap().id))
                .collect();
            handles.into_iter().map(|t| t.join().unwrap()).collect()
        });

        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
        assert_eq!(
            h.lifecycle
                .store()
                .list_nodes_for_layer("dev", "runtime")
                .unwrap()
                .len(),
            6
        );
    }

    #[test]
    fn ordinals_increase_per_layer() {
        let h = harness();
        let n1 = h.lifecycle.new_node(&h.layer, None).unwrap();
        let n2 = h.lifecycle.new_node(&h.layer, None).unwrap();
        assert_eq!((n1.num, n2.num), (1, 2));
        assert_eq!(n2.fqdn, "runtime-2.dev");
        assert_eq!(n2.state, NodeState::Requested);
    }

    // ── build ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn build_success_brings_node_up() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, None).unwrap();

        let built = h.lifecycle.build(&node.id).await.unwrap();

        assert_eq!(built.state, NodeState::Up);
        assert_eq!(built.provider_id.as_deref(), Some("fake-dev.runtime.1"));
        let stored = h.lifecycle.store().get_node(&node.id).unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Up);
    }

    #[tokio::test]
    async fn build_failure_marks_node_down() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, None).unwrap();
        h.provisioner.fail_provision(&node.id);

        let err = h.lifecycle.build(&node.id).await.unwrap_err();

        assert!(matches!(err, LifecycleError::ProviderFailure { .. }));
        let stored = h.lifecycle.store().get_node(&node.id).unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Down);
        assert_eq!(h.provisioner.provision_calls(), 1);
    }

    #[tokio::test]
    async fn build_timeout_marks_node_down() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, None).unwrap();
        h.provisioner.set_delay(Duration::from_secs(5));

        let err = h.lifecycle.build(&node.id).await.unwrap_err();

        assert!(err.to_string().contains("timed out"));
        let stored = h.lifecycle.store().get_node(&node.id).unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Down);
    }

    #[tokio::test]
    async fn destroy_during_build_keeps_node_gone() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, Some("a.example.com")).unwrap();
        h.provisioner.set_delay(Duration::from_millis(80));

        let (built, destroyed) = tokio::join!(h.lifecycle.build(&node.id), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.lifecycle.destroy(&node.id).await
        });

        assert!(matches!(built.unwrap_err(), LifecycleError::NodeNotFound(_)));
        assert!(destroyed.unwrap().provider_error.is_none());
        assert!(h.lifecycle.store().get_node(&node.id).unwrap().is_none());
        // The machine provisioned for the destroyed node is released.
        assert_eq!(h.provisioner.provision_calls(), 1);
        assert_eq!(h.provisioner.deprovision_calls(), 1);
    }

    // ── destroy ────────────────────────────────────────────────────

    #[tokio::test]
    async fn destroy_removes_node_even_when_provider_fails() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, None).unwrap();
        h.lifecycle.build(&node.id).await.unwrap();
        h.lifecycle
            .store()
            .apply_container_changes(
                &[Container {
                    app: "api".to_string(),
                    formation: "dev".to_string(),
                    owner: "alice".to_string(),
                    container_type: "web".to_string(),
                    num: 1,
                    node: Some(node.id.clone()),
                    created_at: 0,
                }],
                &[],
            )
            .unwrap();
        h.provisioner.fail_deprovision(&node.id);

        let outcome = h.lifecycle.destroy(&node.id).await.unwrap();

        assert!(outcome.provider_error.is_some());
        assert_eq!(outcome.unplaced, 1);
        assert!(h.lifecycle.store().get_node(&node.id).unwrap().is_none());
        let c = h
            .lifecycle
            .store()
            .get_container("api", "web", 1)
            .unwrap()
            .unwrap();
        assert_eq!(c.node, None);
    }

    #[tokio::test]
    async fn destroy_skips_provider_for_unbuilt_node() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, Some("static.local")).unwrap();

        let outcome = h.lifecycle.destroy(&node.id).await.unwrap();

        assert!(outcome.provider_error.is_none());
        assert_eq!(h.provisioner.deprovision_calls(), 0);
    }

    // ── converge ───────────────────────────────────────────────────

    #[tokio::test]
    async fn converge_requires_up_node() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, None).unwrap();

        let err = h.lifecycle.converge(&node.id, &json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::NodeNotUp {
                state: NodeState::Requested,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn converge_returns_to_up_with_output() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, None).unwrap();
        h.lifecycle.build(&node.id).await.unwrap();
        h.executor.set_exit_code(&node.id, 3);

        let result = h.lifecycle.converge(&node.id, &json!({"k": 1})).await.unwrap();

        assert_eq!(result.exit_code, 3);
        let stored = h.lifecycle.store().get_node(&node.id).unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Up);
        assert_eq!(h.executor.converged_nodes(), vec![node.id.clone()]);
    }

    #[tokio::test]
    async fn converge_failure_marks_node_down() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, None).unwrap();
        h.lifecycle.build(&node.id).await.unwrap();
        h.executor.fail_converge(&node.id);

        let err = h.lifecycle.converge(&node.id, &json!({})).await.unwrap_err();

        assert!(matches!(err, LifecycleError::ConvergeFailure { .. }));
        let stored = h.lifecycle.store().get_node(&node.id).unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Down);
    }

    #[tokio::test]
    async fn destroy_during_converge_keeps_node_gone() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, None).unwrap();
        h.lifecycle.build(&node.id).await.unwrap();
        h.executor.set_converge_delay(Duration::from_millis(80));

        let empty = json!({});
        let (converged, destroyed) = tokio::join!(h.lifecycle.converge(&node.id, &empty), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.lifecycle.destroy(&node.id).await
        });

        assert!(matches!(converged.unwrap_err(), LifecycleError::NodeNotFound(_)));
        destroyed.unwrap();
        assert!(h.lifecycle.store().get_node(&node.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn converging_node_cannot_be_claimed_twice() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, None).unwrap();
        h.lifecycle.build(&node.id).await.unwrap();
        h.executor.set_converge_delay(Duration::from_millis(50));

        let empty = json!({});
        let (first, second) = tokio::join!(
            h.lifecycle.converge(&node.id, &empty),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                h.lifecycle.converge(&node.id, &empty).await
            }
        );

        first.unwrap();
        assert!(matches!(
            second.unwrap_err(),
            LifecycleError::NodeNotUp {
                state: NodeState::Converging,
                ..
            }
        ));
        let stored = h.lifecycle.store().get_node(&node.id).unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Up);
    }

    #[tokio::test]
    async fn mark_down_applies_health_signal() {
        let h = harness();
        let node = h.lifecycle.new_node(&h.layer, None).unwrap();
        h.lifecycle.build(&node.id).await.unwrap();

        let node = h.lifecycle.mark_down(&node.id).unwrap();
        assert_eq!(node.state, NodeState::Down);
    }

    // ── layers ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn destroy_layer_deletes_record_despite_provider_error() {
        let h = harness();
        h.provisioner.fail_layer_teardown();

        let err = h.lifecycle.destroy_layer(&h.layer).await.unwrap();

        assert!(err.is_some());
        assert!(h.lifecycle.store().get_layer("dev", "runtime").unwrap().is_none());
    }

    #[tokio::test]
    async fn build_layer_needs_known_provider() {
        let h = harness();
        let mut layer = h.layer.clone();
        layer.provider = "missing".to_string();

        let err = h.lifecycle.build_layer(&layer).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ProviderNotFound(_)));

        h.lifecycle.build_layer(&h.layer).await.unwrap();
        assert_eq!(h.provisioner.layer_builds(), 1);
    }
}
