//! Typed view of `decora.yaml`
//!
//! ```yaml
//! bridge:
//!   name: Home
//!   bind: 0.0.0.0:8124
//! decora_wifi:
//!   username: !secret leviton_email
//!   password: !secret leviton_password
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;

pub const CONFIG_FILE: &str = "decora.yaml";

pub const DEFAULT_BIND: &str = "0.0.0.0:8124";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSection,

    /// Credentials to import as a config entry on startup
    #[serde(default)]
    pub decora_wifi: Option<DecoraWifiYaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_bind")]
    pub bind: String,

    /// Override of the myLeviton API base URL
    #[serde(default)]
    pub api_base_url: Option<String>,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind: default_bind(),
            api_base_url: None,
        }
    }
}

fn default_name() -> String {
    "Home".to_string()
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DecoraWifiYaml {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for DecoraWifiYaml {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoraWifiYaml")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl BridgeConfig {
    /// Load `decora.yaml` from `config_dir`; a missing file gives the defaults
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            info!(?path, "No configuration file, using defaults");
            return Ok(Self::default());
        }

        let mut loader = YamlLoader::new(config_dir)?;
        let value = loader.load_file(&path)?;
        if value.is_null() {
            return Ok(Self::default());
        }

        let config: Self =
            serde_yaml::from_value(value).map_err(|source| ConfigError::ParseYaml {
                path: path.clone(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if let Some(ref creds) = self.decora_wifi {
            if creds.username.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "decora_wifi.username".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if self.bridge.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                key: "bridge.bind".to_string(),
                reason: format!("'{}' is not a socket address", self.bridge.bind),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = BridgeConfig::load(dir.path()).unwrap();
        assert_eq!(config.bridge.bind, DEFAULT_BIND);
        assert!(config.decora_wifi.is_none());
    }

    #[test]
    fn test_full_config() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("secrets.yaml"), "pw: hunter2\n").unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "bridge:\n  bind: 127.0.0.1:9000\n  api_base_url: http://localhost:1234/api\ndecora_wifi:\n  username: me@example.com\n  password: !secret pw\n",
        )
        .unwrap();

        let config = BridgeConfig::load(dir.path()).unwrap();
        assert_eq!(config.bridge.name, "Home");
        assert_eq!(config.bridge.bind, "127.0.0.1:9000");
        assert_eq!(
            config.bridge.api_base_url.as_deref(),
            Some("http://localhost:1234/api")
        );
        let creds = config.decora_wifi.unwrap();
        assert_eq!(creds.password, "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_bad_bind_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "bridge:\n  bind: everywhere\n").unwrap();
        assert!(matches!(
            BridgeConfig::load(dir.path()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_empty_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        let config = BridgeConfig::load(dir.path()).unwrap();
        assert_eq!(config.bridge.name, "Home");
    }
}
