//! Provider capability: creates and removes cloud resources.
//!
//! Keel treats the provider as a black box: it hands over the owner's
//! opaque credentials plus a declarative spec and gets connection facts back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use keel_state::{Layer, Node, Provider};

use crate::command::{ProgramSpec, run_checked};

/// Declarative description of a layer's provider-side resources.
#[derive(Debug, Clone, Serialize)]
pub struct LayerSpec {
    pub formation: String,
    pub layer: String,
    pub instance_type: String,
    pub params: Map<String, Value>,
    pub ssh_username: String,
    pub ssh_public_key: String,
}

impl LayerSpec {
    pub fn from_layer(layer: &Layer) -> Self {
        Self {
            formation: layer.formation.clone(),
            layer: layer.id.clone(),
            instance_type: layer.instance_type.clone(),
            params: layer.params.clone(),
            ssh_username: layer.ssh_username.clone(),
            ssh_public_key: layer.ssh_keypair.public_key.clone(),
        }
    }
}

/// Declarative description of one node to provision or remove.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSpec {
    pub node_id: String,
    pub fqdn: String,
    #[serde(flatten)]
    pub layer: LayerSpec,
    /// Identity from a previous provision, if any.
    pub provider_id: Option<String>,
    pub metadata: Map<String, Value>,
}

impl NodeSpec {
    pub fn new(node: &Node, layer: &Layer) -> Self {
        Self {
            node_id: node.id.clone(),
            fqdn: node.fqdn.clone(),
            layer: LayerSpec::from_layer(layer),
            provider_id: node.provider_id.clone(),
            metadata: node.metadata.clone(),
        }
    }
}

/// Connection facts returned by a successful provision.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProvisionedNode {
    pub provider_id: String,
    /// Provider-assigned hostname, replacing the requested one when set.
    #[serde(default)]
    pub fqdn: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Builds and tears down provider resources.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn build_layer(&self, provider: &Provider, layer: &LayerSpec) -> anyhow::Result<()>;

    async fn destroy_layer(&self, provider: &Provider, layer: &LayerSpec) -> anyhow::Result<()>;

    async fn provision(
        &self,
        provider: &Provider,
        node: &NodeSpec,
    ) -> anyhow::Result<ProvisionedNode>;

    async fn deprovision(&self, provider: &Provider, node: &NodeSpec) -> anyhow::Result<()>;
}

/// Provisioner backed by an external program (one per provider tooling).
///
/// Invoked as `<program> <args..> <action>` where action is one of
/// `build-layer`, `destroy-layer`, `provision`, `deprovision`. The payload
/// carries `{provider: {kind, creds}, spec}`; `provision` must print a
/// `ProvisionedNode` as JSON on stdout.
pub struct CommandProvisioner {
    spec: ProgramSpec,
}

impl CommandProvisioner {
    pub fn new(spec: ProgramSpec) -> Self {
        Self { spec }
    }

    fn payload(provider: &Provider, spec: &impl Serialize) -> Value {
        json!({
            "provider": { "kind": provider.kind, "creds": provider.creds },
            "spec": spec,
        })
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn build_layer(&self, provider: &Provider, layer: &LayerSpec) -> anyhow::Result<()> {
        run_checked(&self.spec, "build-layer", &Self::payload(provider, layer)).await?;
        Ok(())
    }

    async fn destroy_layer(&self, provider: &Provider, layer: &LayerSpec) -> anyhow::Result<()> {
        run_checked(&self.spec, "destroy-layer", &Self::payload(provider, layer)).await?;
        Ok(())
    }

    async fn provision(
        &self,
        provider: &Provider,
        node: &NodeSpec,
    ) -> anyhow::Result<ProvisionedNode> {
        let output = run_checked(&self.spec, "provision", &Self::payload(provider, node)).await?;
        let provisioned = serde_json::from_str(output.stdout.trim())?;
        Ok(provisioned)
    }

    async fn deprovision(&self, provider: &Provider, node: &NodeSpec) -> anyhow::Result<()> {
        run_checked(&self.spec, "deprovision", &Self::payload(provider, node)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Provider {
        let mut creds = Map::new();
        creds.insert("token".to_string(), json!("t0ken"));
        Provider {
            id: "static".to_string(),
            owner: "alice".to_string(),
            kind: "static".to_string(),
            creds,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn node_spec() -> NodeSpec {
        NodeSpec {
            node_id: "dev.runtime.1".to_string(),
            fqdn: "runtime-1.dev.local".to_string(),
            layer: LayerSpec {
                formation: "dev".to_string(),
                layer: "runtime".to_string(),
                instance_type: "small".to_string(),
                params: Map::new(),
                ssh_username: "ubuntu".to_string(),
                ssh_public_key: "ssh-rsa AAAA".to_string(),
            },
            provider_id: None,
            metadata: Map::new(),
        }
    }

    fn sh(script: &str) -> CommandProvisioner {
        CommandProvisioner::new(ProgramSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "provider".to_string()],
        })
    }

    #[tokio::test]
    async fn provision_parses_program_output() {
        let p = sh(r#"cat >/dev/null; echo '{"provider_id":"i-123","fqdn":"ec2-1.aws"}'"#);
        let out = p.provision(&provider(), &node_spec()).await.unwrap();
        assert_eq!(out.provider_id, "i-123");
        assert_eq!(out.fqdn.as_deref(), Some("ec2-1.aws"));
        assert!(out.metadata.is_empty());
    }

    #[tokio::test]
    async fn payload_carries_creds_and_flattened_spec() {
        // Echo the payload back as metadata.
        let p = sh(r#"printf '{"provider_id":"x","metadata":'; cat; printf '}'"#);
        let out = p.provision(&provider(), &node_spec()).await.unwrap();
        assert_eq!(out.metadata["provider"]["creds"]["token"], "t0ken");
        assert_eq!(out.metadata["spec"]["layer"], "runtime");
        assert_eq!(out.metadata["spec"]["fqdn"], "runtime-1.dev.local");
    }

    #[tokio::test]
    async fn failing_program_fails_deprovision() {
        let p = sh("exit 1");
        assert!(p.deprovision(&provider(), &node_spec()).await.is_err());
    }
}
