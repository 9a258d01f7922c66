//! In-process fake capabilities with failure injection.
//!
//! Available to this crate's tests and, with the `testing` feature, to
//! downstream crates.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use keel_state::Provider;

use crate::executor::{CommandOutput, ExecTarget, RemoteExecutor};
use crate::provisioner::{LayerSpec, NodeSpec, ProvisionedNode, Provisioner};

/// Provisioner that succeeds unless told otherwise.
///
/// Provisioned nodes get `provider_id = "fake-{node_id}"`.
#[derive(Default)]
pub struct FakeProvisioner {
    failing_provision: Mutex<HashSet<String>>,
    failing_deprovision: Mutex<HashSet<String>>,
    fail_layer_teardown: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
    provision_calls: AtomicUsize,
    deprovision_calls: AtomicUsize,
    layer_builds: AtomicUsize,
    layer_destroys: AtomicUsize,
}

impl FakeProvisioner {
    pub fn fail_provision(&self, node_id: &str) {
        lock(&self.failing_provision).insert(node_id.to_string());
    }

    pub fn fail_deprovision(&self, node_id: &str) {
        lock(&self.failing_deprovision).insert(node_id.to_string());
    }

    pub fn fail_layer_teardown(&self) {
        *lock(&self.fail_layer_teardown) = true;
    }

    /// Delay every provider call, to exercise timeouts.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn deprovision_calls(&self) -> usize {
        self.deprovision_calls.load(Ordering::SeqCst)
    }

    pub fn layer_builds(&self) -> usize {
        self.layer_builds.load(Ordering::SeqCst)
    }

    pub fn layer_destroys(&self) -> usize {
        self.layer_destroys.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn build_layer(&self, _provider: &Provider, _layer: &LayerSpec) -> anyhow::Result<()> {
        self.pause().await;
        self.layer_builds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy_layer(&self, _provider: &Provider, layer: &LayerSpec) -> anyhow::Result<()> {
        self.pause().await;
        self.layer_destroys.fetch_add(1, Ordering::SeqCst);
        if *lock(&self.fail_layer_teardown) {
            anyhow::bail!("fake teardown failure for layer {}", layer.layer);
        }
        Ok(())
    }

    async fn provision(
        &self,
        _provider: &Provider,
        node: &NodeSpec,
    ) -> anyhow::Result<ProvisionedNode> {
        self.pause().await;
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing_provision).contains(&node.node_id) {
            anyhow::bail!("fake provision failure for {}", node.node_id);
        }
        Ok(ProvisionedNode {
            provider_id: format!("fake-{}", node.node_id),
            fqdn: None,
            metadata: Default::default(),
        })
    }

    async fn deprovision(&self, _provider: &Provider, node: &NodeSpec) -> anyhow::Result<()> {
        self.pause().await;
        self.deprovision_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing_deprovision).contains(&node.node_id) {
            anyhow::bail!("fake deprovision failure for {}", node.node_id);
        }
        Ok(())
    }
}

/// Executor that records every converge.
#[derive(Default)]
pub struct FakeExecutor {
    failing_converge: Mutex<HashSet<String>>,
    exit_codes: Mutex<HashMap<String, i32>>,
    logs: Mutex<HashMap<String, String>>,
    converged: Mutex<Vec<String>>,
    databags: Mutex<Vec<Value>>,
    runs: Mutex<Vec<(String, String)>>,
    converge_delay: Mutex<Option<Duration>>,
    controller_converges: AtomicUsize,
}

impl FakeExecutor {
    pub fn fail_converge(&self, node_id: &str) {
        lock(&self.failing_converge).insert(node_id.to_string());
    }

    pub fn set_exit_code(&self, node_id: &str, code: i32) {
        lock(&self.exit_codes).insert(node_id.to_string(), code);
    }

    /// Delay every node converge.
    pub fn set_converge_delay(&self, delay: Duration) {
        *lock(&self.converge_delay) = Some(delay);
    }

    pub fn set_logs(&self, app: &str, logs: &str) {
        lock(&self.logs).insert(app.to_string(), logs.to_string());
    }

    /// Node ids converged so far, in call order.
    pub fn converged_nodes(&self) -> Vec<String> {
        lock(&self.converged).clone()
    }

    /// The databag passed to the most recent node converge.
    pub fn last_databag(&self) -> Option<Value> {
        lock(&self.databags).last().cloned()
    }

    /// `(node_id, command)` pairs run so far.
    pub fn runs(&self) -> Vec<(String, String)> {
        lock(&self.runs).clone()
    }

    pub fn controller_converges(&self) -> usize {
        self.controller_converges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn converge(&self, target: &ExecTarget, databag: &Value) -> anyhow::Result<CommandOutput> {
        let delay = *lock(&self.converge_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.failing_converge).contains(&target.node_id) {
            anyhow::bail!("fake converge failure for {}", target.node_id);
        }
        lock(&self.converged).push(target.node_id.clone());
        lock(&self.databags).push(databag.clone());
        let exit_code = lock(&self.exit_codes)
            .get(&target.node_id)
            .copied()
            .unwrap_or(0);
        Ok(CommandOutput {
            output: format!("converged {}\n", target.node_id),
            exit_code,
        })
    }

    async fn run(&self, target: &ExecTarget, command: &str) -> anyhow::Result<CommandOutput> {
        lock(&self.runs).push((target.node_id.clone(), command.to_string()));
        Ok(CommandOutput {
            output: format!("{command}\n"),
            exit_code: 0,
        })
    }

    async fn logs(&self, app: &str) -> anyhow::Result<Option<String>> {
        Ok(lock(&self.logs).get(app).cloned())
    }

    async fn converge_controller(&self) -> anyhow::Result<CommandOutput> {
        self.controller_converges.fetch_add(1, Ordering::SeqCst);
        Ok(CommandOutput {
            output: "controller converged\n".to_string(),
            exit_code: 0,
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
