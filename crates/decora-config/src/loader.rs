//! YAML loader resolving the bridge's custom tags
//!
//! - `!secret key` substitutes a value from `secrets.yaml`
//! - `!env_var VAR` or `!env_var VAR default` substitutes an environment variable
//! - `!include path` inlines another YAML file, relative to the including file

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub struct YamlLoader {
    config_dir: PathBuf,
    secrets: Secrets,
    include_stack: HashSet<PathBuf>,
}

impl YamlLoader {
    /// Loader for `config_dir`, reading its `secrets.yaml`
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            include_stack: HashSet::new(),
        }
    }

    /// Load a file (relative paths resolve against the config dir)
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        };
        debug!(?path, "Loading YAML file");

        if self.include_stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.include_stack.insert(path.clone());
        let result = self.load_string(&content, &path);
        self.include_stack.remove(&path);
        result
    }

    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: source_path.to_path_buf(),
                source,
            })?;
        self.process_value(value, source_path)
    }

    fn process_value(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.process_tagged(*tagged, source_path),
            Value::Mapping(map) => {
                let mut result = serde_yaml::Mapping::new();
                for (k, v) in map {
                    result.insert(k, self.process_value(v, source_path)?);
                }
                Ok(Value::Mapping(result))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.process_value(v, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn process_tagged(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, "Processing tag");

        match tag.as_str() {
            "!secret" => {
                let key = tag_argument(&tag, tagged.value)?;
                Ok(Value::String(self.secrets.get(&key)?.to_string()))
            }
            "!env_var" => {
                let arg = tag_argument(&tag, tagged.value)?;
                let (var, default) = match arg.split_once(char::is_whitespace) {
                    Some((var, default)) => (var.to_string(), Some(default.trim().to_string())),
                    None => (arg, None),
                };
                match (std::env::var(&var), default) {
                    (Ok(value), _) => Ok(Value::String(value)),
                    (Err(_), Some(default)) => Ok(Value::String(default)),
                    (Err(_), None) => Err(ConfigError::EnvVarNotFound { var }),
                }
            }
            "!include" => {
                let target = PathBuf::from(tag_argument(&tag, tagged.value)?);
                let target = if target.is_absolute() {
                    target
                } else {
                    source_path
                        .parent()
                        .unwrap_or(&self.config_dir)
                        .join(target)
                };
                self.load_file(target)
            }
            _ => Ok(Value::Tagged(Box::new(TaggedValue {
                tag: tagged.tag,
                value: self.process_value(tagged.value, source_path)?,
            }))),
        }
    }
}

fn tag_argument(tag: &str, value: Value) -> ConfigResult<String> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(ConfigError::InvalidValue {
            key: tag.to_string(),
            reason: "tag argument must be a string".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_secret_substitution() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "secrets.yaml", "leviton_password: hunter2\n");
        write(
            dir.path(),
            "decora.yaml",
            "decora_wifi:\n  username: me@example.com\n  password: !secret leviton_password\n",
        );

        let mut loader = YamlLoader::new(dir.path()).unwrap();
        let value = loader.load_file("decora.yaml").unwrap();
        assert_eq!(value["decora_wifi"]["password"].as_str(), Some("hunter2"));
    }

    #[test]
    fn test_missing_secret_fails() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "decora.yaml", "password: !secret nope\n");

        let mut loader = YamlLoader::new(dir.path()).unwrap();
        assert!(matches!(
            loader.load_file("decora.yaml"),
            Err(ConfigError::SecretNotFound { .. })
        ));
    }

    #[test]
    fn test_env_var_with_default() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("DECORA_TEST_LOADER_USER", "env@example.com");
        write(
            dir.path(),
            "decora.yaml",
            "user: !env_var DECORA_TEST_LOADER_USER\nbind: !env_var DECORA_TEST_LOADER_UNSET 0.0.0.0:8124\n",
        );

        let mut loader = YamlLoader::new(dir.path()).unwrap();
        let value = loader.load_file("decora.yaml").unwrap();
        assert_eq!(value["user"].as_str(), Some("env@example.com"));
        assert_eq!(value["bind"].as_str(), Some("0.0.0.0:8124"));
    }

    #[test]
    fn test_env_var_missing() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "decora.yaml", "user: !env_var DECORA_TEST_LOADER_NEVER_SET\n");

        let mut loader = YamlLoader::new(dir.path()).unwrap();
        assert!(matches!(
            loader.load_file("decora.yaml"),
            Err(ConfigError::EnvVarNotFound { .. })
        ));
    }

    #[test]
    fn test_include_and_cycle() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "decora.yaml", "decora_wifi: !include account.yaml\n");
        write(dir.path(), "account.yaml", "username: me@example.com\n");

        let mut loader = YamlLoader::new(dir.path()).unwrap();
        let value = loader.load_file("decora.yaml").unwrap();
        assert_eq!(
            value["decora_wifi"]["username"].as_str(),
            Some("me@example.com")
        );

        write(dir.path(), "loop.yaml", "again: !include loop.yaml\n");
        assert!(matches!(
            loader.load_file("loop.yaml"),
            Err(ConfigError::CircularInclude { .. })
        ));
    }
}
