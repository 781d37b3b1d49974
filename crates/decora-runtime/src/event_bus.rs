//! Broadcast event bus
//!
//! One `broadcast` channel per event type plus a wildcard channel that sees
//! every event. Firing with no subscribers is not an error.

use dashmap::DashMap;
use decora_core::{Context, Event, EventData, EventType};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    listeners: DashMap<EventType, broadcast::Sender<Event>>,
    match_all_sender: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all_sender, _) = broadcast::channel(capacity);
        Self {
            listeners: DashMap::new(),
            match_all_sender,
            capacity,
        }
    }

    /// Subscribe to one event type, or to everything with `"*"`
    pub fn subscribe(&self, event_type: impl Into<EventType>) -> broadcast::Receiver<Event> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing to event type");

        if event_type.is_match_all() {
            return self.match_all_sender.subscribe();
        }

        self.listeners
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to a typed event; payloads that fail to decode are skipped
    pub fn subscribe_typed<T>(&self) -> TypedEventReceiver<T>
    where
        T: EventData + serde::de::DeserializeOwned,
    {
        TypedEventReceiver {
            rx: self.subscribe(T::event_type()),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn fire(&self, event: Event) {
        debug!(event_type = %event.event_type, "Firing event");

        if let Some(sender) = self.listeners.get(&event.event_type) {
            let _ = sender.send(event.clone());
        }
        let _ = self.match_all_sender.send(event);
    }

    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let event = Event::typed(data, context);
        match serde_json::to_value(&event.data) {
            Ok(json) => self.fire(event.map_data(|_| json)),
            Err(e) => warn!(event_type = T::event_type(), error = %e, "Unserializable event data"),
        }
    }

    /// Number of event types with a channel
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(event.map_data(|_| data));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decora_core::events::{ConfigEntryUpdatedData, HOMEASSISTANT_STOP};
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_and_fire() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(HOMEASSISTANT_STOP);

        bus.fire(Event::new(HOMEASSISTANT_STOP, json!({}), Context::new()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type.as_str(), HOMEASSISTANT_STOP);
    }

    #[test]
    fn test_other_event_types_do_not_wake_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(HOMEASSISTANT_STOP);
        let mut recv = tokio_test::task::spawn(rx.recv());

        tokio_test::assert_pending!(recv.poll());
        bus.fire(Event::new("state_changed", json!({}), Context::new()));
        assert!(!recv.is_woken());
        tokio_test::assert_pending!(recv.poll());

        bus.fire(Event::new(HOMEASSISTANT_STOP, json!({}), Context::new()));
        assert!(recv.is_woken());
        let event = tokio_test::assert_ready_ok!(recv.poll());
        assert_eq!(event.event_type.as_str(), HOMEASSISTANT_STOP);
    }

    #[tokio::test]
    async fn test_match_all_sees_everything() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EventType::match_all());

        bus.fire(Event::new("event_a", json!({}), Context::new()));
        bus.fire(Event::new("event_b", json!({}), Context::new()));

        assert_eq!(rx.recv().await.unwrap().event_type.as_str(), "event_a");
        assert_eq!(rx.recv().await.unwrap().event_type.as_str(), "event_b");
    }

    #[tokio::test]
    async fn test_typed_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_typed::<ConfigEntryUpdatedData>();

        bus.fire_typed(
            ConfigEntryUpdatedData {
                entry_id: "01HX".to_string(),
                domain: "decora_wifi".to_string(),
            },
            Context::new(),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.data.entry_id, "01HX");
        assert_eq!(received.data.domain, "decora_wifi");
    }

    #[tokio::test]
    async fn test_no_cross_event_delivery() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("event_a");
        let mut rx_b = bus.subscribe("event_b");

        bus.fire(Event::new("event_a", json!({"n": 1}), Context::new()));

        assert_eq!(rx_a.recv().await.unwrap().data["n"], 1);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(bus.listener_count(), 2);
    }
}
