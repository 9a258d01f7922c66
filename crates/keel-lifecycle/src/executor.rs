//! Remote execution capability: converge and run commands on nodes.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};

use keel_state::{Layer, Node, SshKeypair};

use crate::command::{ProgramSpec, run_checked, run_program};

/// Everything needed to reach one node.
///
/// `Debug` prints the keypair redacted.
#[derive(Debug, Clone, Serialize)]
pub struct ExecTarget {
    pub node_id: String,
    pub fqdn: String,
    pub ssh_username: String,
    pub ssh_keypair: SshKeypair,
    pub metadata: Map<String, Value>,
}

impl ExecTarget {
    pub fn new(node: &Node, layer: &Layer) -> Self {
        Self {
            node_id: node.id.clone(),
            fqdn: node.fqdn.clone(),
            ssh_username: layer.ssh_username.clone(),
            ssh_keypair: layer.ssh_keypair.clone(),
            metadata: node.metadata.clone(),
        }
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes configuration and commands on remote nodes.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Apply the rendered databag to a node.
    async fn converge(&self, target: &ExecTarget, databag: &Value) -> anyhow::Result<CommandOutput>;

    /// Run an ad-hoc command on a node.
    async fn run(&self, target: &ExecTarget, command: &str) -> anyhow::Result<CommandOutput>;

    /// Fetch the aggregated logs of an app, `None` when there are none.
    async fn logs(&self, app: &str) -> anyhow::Result<Option<String>>;

    /// Re-apply configuration on the control-plane node itself.
    async fn converge_controller(&self) -> anyhow::Result<CommandOutput>;
}

/// Executor backed by an external program (SSH wrapper, config tool, ...).
///
/// Invoked as `<program> <args..> <action>` with action one of `converge`,
/// `run`, `logs`, `converge-controller`.
pub struct CommandExecutor {
    spec: ProgramSpec,
    controller_fqdn: String,
}

impl CommandExecutor {
    pub fn new(spec: ProgramSpec, controller_fqdn: impl Into<String>) -> Self {
        Self {
            spec,
            controller_fqdn: controller_fqdn.into(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for CommandExecutor {
    async fn converge(&self, target: &ExecTarget, databag: &Value) -> anyhow::Result<CommandOutput> {
        let payload = json!({ "target": target, "databag": databag });
        let out = run_program(&self.spec, "converge", &payload).await?;
        Ok(CommandOutput {
            output: out.stdout,
            exit_code: out.exit_code,
        })
    }

    async fn run(&self, target: &ExecTarget, command: &str) -> anyhow::Result<CommandOutput> {
        let payload = json!({ "target": target, "command": command });
        let out = run_program(&self.spec, "run", &payload).await?;
        Ok(CommandOutput {
            output: out.stdout,
            exit_code: out.exit_code,
        })
    }

    async fn logs(&self, app: &str) -> anyhow::Result<Option<String>> {
        let payload = json!({ "app": app, "controller": self.controller_fqdn });
        let out = run_checked(&self.spec, "logs", &payload).await?;
        Ok(Some(out.stdout).filter(|s| !s.is_empty()))
    }

    async fn converge_controller(&self) -> anyhow::Result<CommandOutput> {
        let payload = json!({ "controller": self.controller_fqdn });
        let out = run_program(&self.spec, "converge-controller", &payload).await?;
        Ok(CommandOutput {
            output: out.stdout,
            exit_code: out.exit_code,
        })
    }
}
