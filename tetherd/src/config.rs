//! Agent configuration.
//!
//! Loaded from a TOML file (`tetherd.toml`), every section optional; the
//! CLI overrides individual fields. How the file is produced (settings UI,
//! provisioning) is not this crate's concern.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Where and how to dial the controller.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControllerConfig {
    /// WebSocket URL template; may contain a `{deviceId}` placeholder.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub service_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Generated and logged at startup when empty.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default = "default_locale")]
    pub locale: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: default_device_name(),
            locale: default_locale(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_local_host")]
    pub local_host: String,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// HTTP channel listen address; absent disables the channel.
    #[serde(default)]
    pub http_listen: Option<String>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            local_host: default_local_host(),
            local_port: default_local_port(),
            http_listen: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallConfig {
    /// Install transactions stage their parts here.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    /// Command that finalizes a staged transaction; the staged part paths
    /// are appended to its arguments. Absent means installs are not
    /// permitted on this device.
    #[serde(default)]
    pub committer: Option<CommandSpec>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            committer: None,
        }
    }
}

/// An external command: binary plus fixed arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The automation bridge helper handles UI-state, gesture, input, and
/// signaling operations; one invocation per operation.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_bridge_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            binary: String::new(),
            args: Vec::new(),
            timeout_secs: default_bridge_timeout_secs(),
        }
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "tether-device".to_string())
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    8722
}

fn default_spool_dir() -> PathBuf {
    std::env::temp_dir().join("tetherd-install")
}

fn default_bridge_timeout_secs() -> u64 {
    20
}

pub fn load(path: Option<&Path>) -> Result<AgentConfig> {
    let Some(path) = path else {
        return Ok(AgentConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let cfg = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: AgentConfig = toml::from_str(
            r#"
            [controller]
            url = "wss://ctl.example.com/device/{deviceId}"
            token = "tok"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.controller.url, "wss://ctl.example.com/device/{deviceId}");
        assert_eq!(cfg.channels.local_port, 8722);
        assert_eq!(cfg.device.locale, "en-US");
        assert!(cfg.install.committer.is_none());
        assert!(cfg.bridge.binary.is_empty());
    }

    #[test]
    fn full_config_round_trips() {
        let cfg: AgentConfig = toml::from_str(
            r#"
            [controller]
            url = "wss://ctl/device/{deviceId}"
            token = "t"
            user_id = "u"
            service_key = "k"

            [device]
            id = "dev-1"
            name = "Lab Phone"
            locale = "de-DE"

            [channels]
            local_host = "0.0.0.0"
            local_port = 9001
            http_listen = "127.0.0.1:9002"

            [install]
            spool_dir = "/tmp/spool"
            committer = { binary = "pkg-commit", args = ["--wait"] }

            [bridge]
            binary = "tether-bridge"
            args = ["--json"]
            timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.device.id, "dev-1");
        assert_eq!(cfg.channels.http_listen.as_deref(), Some("127.0.0.1:9002"));
        let committer = cfg.install.committer.unwrap();
        assert_eq!(committer.binary, "pkg-commit");
        assert_eq!(committer.args, vec!["--wait".to_string()]);
        assert_eq!(cfg.bridge.timeout_secs, 5);
    }

    #[test]
    fn missing_file_is_an_error_with_path_context() {
        let err = load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
