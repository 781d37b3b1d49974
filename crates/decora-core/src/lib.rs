//! Core types for the Decora Wi-Fi bridge
//!
//! Everything the bridge publishes or consumes is expressed in the Home
//! Assistant entity model: an [`EntityId`] names a thing, a [`State`] is its
//! current value, [`Event`]s announce changes and [`ServiceCall`]s ask an
//! integration to act.

mod context;
mod entity_id;
mod event;
mod service_call;
mod state;

pub use context::Context;
pub use entity_id::{slugify, EntityId, EntityIdError};
pub use event::{Event, EventData, EventType};
pub use service_call::ServiceCall;
pub use state::State;

/// State value for an entity that is on
pub const STATE_ON: &str = "on";

/// State value for an entity that is off
pub const STATE_OFF: &str = "off";

/// State value published while the backing device cannot be reached
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value for an entity with no known value
pub const STATE_UNKNOWN: &str = "unknown";

/// Standard event types fired on the bus
pub mod events {
    use super::*;

    /// An entity's state was written
    pub const STATE_CHANGED: &str = "state_changed";

    /// A service was invoked
    pub const CALL_SERVICE: &str = "call_service";

    /// The bridge is shutting down
    pub const HOMEASSISTANT_STOP: &str = "homeassistant_stop";

    /// A config entry's data or options changed
    pub const CONFIG_ENTRY_UPDATED: &str = "config_entry_updated";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Data for CALL_SERVICE events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct CallServiceData {
        pub domain: String,
        pub service: String,
        pub service_data: serde_json::Value,
    }

    impl EventData for CallServiceData {
        fn event_type() -> &'static str {
            CALL_SERVICE
        }
    }

    /// Data for CONFIG_ENTRY_UPDATED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ConfigEntryUpdatedData {
        pub entry_id: String,
        pub domain: String,
    }

    impl EventData for ConfigEntryUpdatedData {
        fn event_type() -> &'static str {
            CONFIG_ENTRY_UPDATED
        }
    }
}
