//! Event types for the bridge event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;

/// Typed event payloads name their own event type
pub trait EventData: Clone + Send + Sync + 'static {
    /// Type string the payload is fired under
    fn event_type() -> &'static str;
}

/// Event type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    /// Wrap an event type string
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    /// The raw type string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wildcard type used to subscribe to every event
    pub fn match_all() -> Self {
        Self("*".to_string())
    }

    /// Whether this is the `*` wildcard
    pub fn is_match_all(&self) -> bool {
        self.0 == "*"
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event fired on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    /// Type string subscribers filter on
    pub event_type: EventType,

    /// Payload; raw JSON unless the event is typed
    pub data: T,

    /// When the bus accepted the event
    pub time_fired: DateTime<Utc>,

    /// Who caused the event
    pub context: Context,
}

impl<T> Event<T> {
    /// Event stamped with the current time
    pub fn new(event_type: impl Into<EventType>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            time_fired: Utc::now(),
            context,
        }
    }

    /// Swap the payload, keeping type, time and context
    pub fn map_data<U>(self, f: impl FnOnce(T) -> U) -> Event<U> {
        Event {
            event_type: self.event_type,
            data: f(self.data),
            time_fired: self.time_fired,
            context: self.context,
        }
    }
}

impl<T: EventData> Event<T> {
    /// Event whose type comes from the payload
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(T::event_type(), data, context)
    }
}
