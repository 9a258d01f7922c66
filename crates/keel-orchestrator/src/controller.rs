//! Formation convergence controller.
//!
//! Converging a formation renders its databag once, then converges every
//! `up` node concurrently and waits for all of them. One node failing never
//! stops its siblings; failures land in the report instead.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use keel_lifecycle::NodeLifecycle;
use keel_state::{Formation, NodeState};

use crate::databag::{self, Databag};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Outcome of one node's converge.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NodeReport {
    pub node: String,
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Outcome of a formation converge.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConvergeReport {
    pub databag: Databag,
    pub nodes: Vec<NodeReport>,
}

impl ConvergeReport {
    pub fn ok(&self) -> bool {
        self.nodes.iter().all(|n| n.ok)
    }
}

#[derive(Clone)]
pub struct FormationController {
    lifecycle: Arc<NodeLifecycle>,
}

impl FormationController {
    pub fn new(lifecycle: Arc<NodeLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Render the databag without touching any node.
    pub fn calculate(&self, formation: &Formation) -> OrchestratorResult<Databag> {
        databag::render(self.lifecycle.store(), formation)
    }

    /// Converge every `up` node of the formation.
    pub async fn converge(&self, formation: &Formation) -> OrchestratorResult<ConvergeReport> {
        let databag = self.calculate(formation)?;
        let payload = Arc::new(
            serde_json::to_value(&databag)
                .map_err(|e| OrchestratorError::Validation(e.to_string()))?,
        );

        let up: Vec<String> = self
            .lifecycle
            .store()
            .list_nodes_for_formation(&formation.id)?
            .into_iter()
            .filter(|n| n.state == NodeState::Up)
            .map(|n| n.id)
            .collect();

        let handles: Vec<_> = up
            .iter()
            .map(|node_id| {
                let lifecycle = self.lifecycle.clone();
                let payload = payload.clone();
                let node_id = node_id.clone();
                tokio::spawn(async move { lifecycle.converge(&node_id, &payload).await })
            })
            .collect();

        let results = join_all(handles).await;

        let mut nodes = Vec::with_capacity(up.len());
        for (node_id, result) in up.into_iter().zip(results) {
            let report = match result {
                Ok(Ok(converged)) => NodeReport {
                    node: node_id,
                    ok: converged.exit_code == 0,
                    exit_code: Some(converged.exit_code),
                    output: Some(converged.output),
                    error: None,
                },
                Ok(Err(e)) => NodeReport {
                    node: node_id,
                    ok: false,
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                },
                Err(join_err) => NodeReport {
                    node: node_id,
                    ok: false,
                    exit_code: None,
                    output: None,
                    error: Some(format!("converge task failed: {join_err}")),
                },
            };
            if !report.ok {
                warn!(formation = %formation.id, node = %report.node, "node converge failed");
            }
            nodes.push(report);
        }

        info!(
            formation = %formation.id,
            nodes = nodes.len(),
            failed = nodes.iter().filter(|n| !n.ok).count(),
            "formation converged"
        );

        Ok(ConvergeReport { databag, nodes })
    }

    /// Converge the control-plane node itself.
    pub async fn converge_controller(&self) -> OrchestratorResult<()> {
        self.lifecycle.converge_controller().await?;
        Ok(())
    }
}
