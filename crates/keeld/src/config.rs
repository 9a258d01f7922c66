//! keeld.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keel_lifecycle::{LifecycleTimeouts, ProgramSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    pub provisioner: ProgramSpec,
    pub executor: ProgramSpec,
    #[serde(default)]
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/keel")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_provider_secs")]
    pub provider_secs: u64,
    #[serde(default = "default_converge_secs")]
    pub converge_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            provider_secs: default_provider_secs(),
            converge_secs: default_converge_secs(),
        }
    }
}

fn default_provider_secs() -> u64 {
    600
}

fn default_converge_secs() -> u64 {
    300
}

impl TimeoutsConfig {
    pub fn lifecycle(&self) -> LifecycleTimeouts {
        LifecycleTimeouts {
            provider: Duration::from_secs(self.provider_secs),
            converge: Duration::from_secs(self.converge_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// fqdn of the control-plane node, handed to the executor.
    #[serde(default = "default_controller_fqdn")]
    pub fqdn: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            fqdn: default_controller_fqdn(),
        }
    }
}

fn default_controller_fqdn() -> String {
    "localhost".to_string()
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: KeelConfig = toml::from_str(content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = KeelConfig::from_toml(
            r#"
            [server]
            port = 9000
            data_dir = "/tmp/keel"

            [timeouts]
            provider_secs = 30
            converge_secs = 10

            [provisioner]
            program = "/usr/bin/provision"
            args = ["--dry-run"]

            [executor]
            program = "/usr/bin/converge"

            [controller]
            fqdn = "keel.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.data_dir, PathBuf::from("/tmp/keel"));
        assert_eq!(config.timeouts.lifecycle().provider, Duration::from_secs(30));
        assert_eq!(config.provisioner.args, vec!["--dry-run".to_string()]);
        assert!(config.executor.args.is_empty());
        assert_eq!(config.controller.fqdn, "keel.example.com");
    }

    #[test]
    fn sections_besides_programs_default() {
        let config = KeelConfig::from_toml(
            r#"
            [provisioner]
            program = "p"

            [executor]
            program = "e"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.timeouts.converge_secs, 300);
        assert_eq!(config.controller.fqdn, "localhost");
    }

    #[test]
    fn programs_are_required() {
        assert!(KeelConfig::from_toml("[server]\nport = 1\n").is_err());
    }

    #[test]
    fn sample_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("keeld.toml");
        let config = KeelConfig::from_file(&path).unwrap();
        assert_eq!(config.controller.fqdn, "keel.internal");
    }
}
