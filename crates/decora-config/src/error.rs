use std::path::PathBuf;
use thiserror::Error;

/// Result of loading configuration
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Problems with `decora.yaml`, `secrets.yaml` or an included file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read
    #[error("cannot read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A config file is not YAML
    #[error("{path} is not valid YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `!secret` names a key missing from `secrets.yaml`
    #[error("no secret named {key} in secrets.yaml")]
    SecretNotFound { key: String },

    /// `!env_var` without a default names an unset variable
    #[error("{var} is not set in the environment")]
    EnvVarNotFound { var: String },

    /// `!include` chain loops back to a file already being loaded
    #[error("{path} includes itself")]
    CircularInclude { path: PathBuf },

    /// A key parsed but its value is unusable
    #[error("bad value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}
