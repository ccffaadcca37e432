use cluster::Ipv4Subnet;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, ScorchError};

pub const DEFAULT_USER_COMPONENT_PREFIX: &str = "phenix-scorch-component-";

/// Engine settings, usually read from the `[scorch]` table of `scorch.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorchConfig {
    /// Root for per-experiment data: SOH results, stored experiments, output logs
    pub base_dir: PathBuf,
    /// Executable prefix for components without a built-in implementation
    pub user_component_prefix: String,
    /// Program spawned by `break` components
    pub break_shell: String,
    /// How long a read-write terminal claim waits for its websocket
    pub terminal_claim_window_secs: u64,
    /// Terminal replay buffer cap in bytes
    pub terminal_history_limit: usize,
    /// Pool tap subnets are carved from
    pub tap_subnet_pool: Ipv4Subnet,
    pub pause_poll_interval_ms: u64,
    pub actor_call_timeout_secs: u64,
    /// Write finished component output under `base_dir/scorch`
    pub persist_output: bool,
    /// Cluster control binary
    pub minimega_binary: PathBuf,
    pub minimega_namespace: Option<String>,
    /// Health-check program run by `soh` components
    pub soh_program: PathBuf,
}

impl Default for ScorchConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data"),
            user_component_prefix: DEFAULT_USER_COMPONENT_PREFIX.to_string(),
            break_shell: "bash".to_string(),
            terminal_claim_window_secs: 5,
            terminal_history_limit: 1024 * 1024,
            tap_subnet_pool: default_tap_pool(),
            pause_poll_interval_ms: 1000,
            actor_call_timeout_secs: 30,
            persist_output: false,
            minimega_binary: PathBuf::from("minimega"),
            minimega_namespace: None,
            soh_program: PathBuf::from("phenix-soh"),
        }
    }
}

fn default_tap_pool() -> Ipv4Subnet {
    Ipv4Subnet::from_network(Ipv4Addr::new(172, 30, 0, 0), 16)
}

impl ScorchConfig {
    /// Parse from TOML text. The engine settings may sit at the top level or
    /// under a `[scorch]` table.
    pub fn from_toml(content: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Wrapper {
            scorch: Option<ScorchConfig>,
        }

        let value: toml::Value =
            toml::from_str(content).map_err(|e| ScorchError::Config(e.to_string()))?;

        let config = if value.get("scorch").is_some() {
            let wrapper: Wrapper = value
                .try_into()
                .map_err(|e: toml::de::Error| ScorchError::Config(e.to_string()))?;
            wrapper.scorch.unwrap_or_default()
        } else {
            value
                .try_into()
                .map_err(|e: toml::de::Error| ScorchError::Config(e.to_string()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                debug!(path = %path.display(), "Loaded scorch config");
                Self::from_toml(&content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file does not exist, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let prefix = self.tap_subnet_pool.prefix();
        if !(16..=24).contains(&prefix) {
            return Err(ScorchError::Config(format!(
                "tap_subnet_pool must be between /16 and /24, got /{}",
                prefix
            )));
        }
        if self.pause_poll_interval_ms == 0 {
            return Err(ScorchError::Config(
                "pause_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn claim_window(&self) -> Duration {
        Duration::from_secs(self.terminal_claim_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.actor_call_timeout_secs)
    }

    /// Directory SOH results and output logs for one experiment live under.
    pub fn experiment_dir(&self, experiment: &str) -> PathBuf {
        self.base_dir.join("scorch").join(experiment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScorchConfig::default();
        assert_eq!(config.user_component_prefix, "phenix-scorch-component-");
        assert_eq!(config.claim_window(), Duration::from_secs(5));
        assert_eq!(config.tap_subnet_pool.to_string(), "172.30.0.0/16");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = ScorchConfig::from_toml(
            r#"
            [scorch]
            break_shell = "sh"
            persist_output = true
            "#,
        )
        .unwrap();
        assert_eq!(config.break_shell, "sh");
        assert!(config.persist_output);
        assert_eq!(config.terminal_history_limit, 1024 * 1024);
    }

    #[test]
    fn test_top_level_toml() {
        let config = ScorchConfig::from_toml("pause_poll_interval_ms = 250").unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_oversized_pool() {
        let result = ScorchConfig::from_toml(r#"tap_subnet_pool = "10.0.0.0/8""#);
        assert!(matches!(result, Err(ScorchError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScorchConfig::load(&dir.path().join("scorch.toml")).await.unwrap();
        assert_eq!(config, ScorchConfig::default());
    }
}
