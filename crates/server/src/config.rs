use serde::{Deserialize, Serialize};
use tracing::debug;

/// HTTP settings, read from the `[server]` table of `scorch.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Pull the `[server]` table out of a full config file; other tables are
    /// ignored and a missing table yields defaults.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(default)]
            server: ServerConfig,
        }

        let wrapper: Wrapper = toml::from_str(content)?;
        debug!(bind = %wrapper.server.bind, "Loaded server config");
        Ok(wrapper.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "127.0.0.1:3000");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_missing_table_uses_defaults() {
        let config = ServerConfig::from_toml("[scorch]\nbreak_shell = \"sh\"\n").unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_partial_table() {
        let config = ServerConfig::from_toml("[server]\nbind = \"0.0.0.0:8080\"\n").unwrap();
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.log_level, "info");
    }
}
