//! YAML configuration for the Decora Wi-Fi bridge
//!
//! `decora.yaml` in the config directory describes the bridge itself and may
//! carry myLeviton credentials to import. Values can come from
//! `secrets.yaml` (`!secret`) or the environment (`!env_var`).

mod bridge_config;
mod error;
mod loader;
mod secrets;

pub use bridge_config::{BridgeConfig, BridgeSection, DecoraWifiYaml, CONFIG_FILE, DEFAULT_BIND};
pub use error::{ConfigError, ConfigResult};
pub use loader::YamlLoader;
pub use secrets::Secrets;
