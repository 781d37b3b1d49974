//! Entity state snapshots

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Context, EntityId, STATE_UNAVAILABLE, STATE_UNKNOWN};

/// The state of an entity at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// Entity this state belongs to
    pub entity_id: EntityId,

    /// The state value ("on", "off", "75", "unavailable", ...)
    pub state: String,

    /// Extra data such as brightness or unit of measurement
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// Last time the state value itself changed
    pub last_changed: DateTime<Utc>,

    /// Last time the state or its attributes were written
    pub last_updated: DateTime<Utc>,

    /// Context of the write that produced this state
    pub context: Context,
}

impl State {
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
            context,
        }
    }

    /// Derive the next state, keeping `last_changed` when the value is unchanged
    pub fn with_update(
        &self,
        new_state: impl Into<String>,
        new_attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        let new_state = new_state.into();
        let last_changed = if self.state == new_state {
            self.last_changed
        } else {
            now
        };

        Self {
            entity_id: self.entity_id.clone(),
            state: new_state,
            attributes: new_attributes,
            last_changed,
            last_updated: now,
            context,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.state == STATE_UNAVAILABLE
    }

    pub fn is_unknown(&self) -> bool {
        self.state == STATE_UNKNOWN
    }

    /// Read an attribute as a concrete type
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps and context are bookkeeping, not part of the value
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_update_keeps_last_changed() {
        let id = EntityId::new("light", "porch").unwrap();
        let first = State::new(id, "on", HashMap::new(), Context::new());

        std::thread::sleep(std::time::Duration::from_millis(5));
        let same = first.with_update(
            "on",
            HashMap::from([("brightness".to_string(), json!(128))]),
            Context::new(),
        );
        assert_eq!(same.last_changed, first.last_changed);
        assert!(same.last_updated > first.last_updated);

        let off = same.with_update("off", HashMap::new(), Context::new());
        assert!(off.last_changed > first.last_changed);
    }

    #[test]
    fn test_attribute_typed() {
        let id = EntityId::new("fan", "bedroom").unwrap();
        let state = State::new(
            id,
            "on",
            HashMap::from([("percentage".to_string(), json!(75))]),
            Context::new(),
        );
        assert_eq!(state.attribute::<u8>("percentage"), Some(75));
        assert_eq!(state.attribute::<String>("percentage"), None);
        assert!(!state.is_unavailable());
    }
}
