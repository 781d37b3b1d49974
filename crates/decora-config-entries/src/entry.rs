//! Config entry types
//!
//! A ConfigEntry is one configured instance of an integration, e.g. one
//! myLeviton account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state_machine::InvalidTransition;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    #[default]
    NotLoaded,
    SetupInProgress,
    Loaded,
    /// Setup failed and will not be retried automatically
    SetupError,
    /// Setup failed on a transient error and is scheduled to retry
    SetupRetry,
    UnloadInProgress,
    /// Unload failed; the entry cannot be reloaded
    FailedUnload,
}

impl ConfigEntryState {
    /// Whether the entry may be unloaded from this state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
                | ConfigEntryState::NotLoaded
        )
    }
}

/// Where a config entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Created through a config flow
    #[default]
    User,
    /// Imported from `decora.yaml`
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// ULID
    pub entry_id: String,

    pub domain: String,

    pub title: String,

    /// Data captured by the config flow (credentials)
    #[serde(default)]
    pub data: Map<String, Value>,

    /// User-adjustable options
    #[serde(default)]
    pub options: Map<String, Value>,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<ConfigEntryDisabledBy>,

    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Explanation for a failed state
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Consecutive setup retries
    #[serde(skip, default)]
    pub tries: u32,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: Map::new(),
            options: Map::new(),
            version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            disabled_by: None,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            tries: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// String field of `data`
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Move to `new_state` if the lifecycle allows it
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.try_transition(new_state)?;
        self.reason = reason;

        if !matches!(
            new_state,
            ConfigEntryState::SetupRetry | ConfigEntryState::SetupInProgress
        ) {
            self.tries = 0;
        }
        Ok(())
    }
}

/// Partial update applied by [`crate::ConfigEntries::update`]
#[derive(Debug, Default)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub options: Option<Map<String, Value>>,
    pub disabled_by: Option<Option<ConfigEntryDisabledBy>>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: Map<String, Value>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn disabled_by(mut self, disabled_by: Option<ConfigEntryDisabledBy>) -> Self {
        self.disabled_by = Some(disabled_by);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let mut data = Map::new();
        data.insert("username".to_string(), json!("me@example.com"));

        let entry = ConfigEntry::new("decora_wifi", "Decora WiFi (me@example.com)")
            .with_data(data)
            .with_unique_id("me@example.com")
            .with_source(ConfigEntrySource::Import);

        assert_eq!(entry.unique_id.as_deref(), Some("me@example.com"));
        assert_eq!(entry.source, ConfigEntrySource::Import);
        assert_eq!(entry.data_str("username"), Some("me@example.com"));
        assert_eq!(entry.data_str("password"), None);
        assert_eq!(entry.state, ConfigEntryState::NotLoaded);
    }

    #[test]
    fn test_runtime_fields_not_persisted() {
        let mut entry = ConfigEntry::new("decora_wifi", "Test");
        entry.try_set_state(ConfigEntryState::SetupInProgress, None).unwrap();
        entry.tries = 3;

        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("state").is_none());
        assert!(json.get("tries").is_none());

        let parsed: ConfigEntry = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.state, ConfigEntryState::NotLoaded);
        assert_eq!(parsed.tries, 0);
        assert_eq!(parsed.entry_id, entry.entry_id);
    }

    #[test]
    fn test_try_set_state_resets_tries() {
        let mut entry = ConfigEntry::new("decora_wifi", "Test");
        entry.try_set_state(ConfigEntryState::SetupInProgress, None).unwrap();
        entry.try_set_state(ConfigEntryState::SetupRetry, Some("timeout".into())).unwrap();
        entry.tries = 2;
        entry.try_set_state(ConfigEntryState::SetupInProgress, None).unwrap();
        assert_eq!(entry.tries, 2);
        entry.try_set_state(ConfigEntryState::Loaded, None).unwrap();
        assert_eq!(entry.tries, 0);
        assert!(entry.reason.is_none());

        assert!(entry.try_set_state(ConfigEntryState::SetupInProgress, None).is_err());
        assert!(entry.is_loaded());
    }
}
