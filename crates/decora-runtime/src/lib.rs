//! Runtime for the Decora Wi-Fi bridge
//!
//! The [`Hub`] bundles the shared services every integration and the REST
//! API work against: the event bus, the state store, the service registry
//! and the device/entity registries.

mod event_bus;
mod service_registry;
mod state_store;

pub use event_bus::{EventBus, TypedEventReceiver};
pub use service_registry::{
    ServiceDescription, ServiceError, ServiceFuture, ServiceHandler, ServiceRegistry,
    ServiceResult,
};
pub use state_store::StateStore;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use decora_core::events::HOMEASSISTANT_STOP;
use decora_core::{Context, Event};
use decora_registries::Registries;
use tracing::info;

/// Shared handles to the bridge's runtime services
#[derive(Clone)]
pub struct Hub {
    pub bus: Arc<EventBus>,
    pub states: Arc<StateStore>,
    pub services: Arc<ServiceRegistry>,
    pub registries: Arc<Registries>,
    config_dir: PathBuf,
}

impl Hub {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        let config_dir = config_dir.as_ref().to_path_buf();
        let bus = Arc::new(EventBus::new());
        Self {
            states: Arc::new(StateStore::new(Arc::clone(&bus))),
            services: Arc::new(ServiceRegistry::new(Arc::clone(&bus))),
            registries: Arc::new(Registries::new(&config_dir)),
            bus,
            config_dir,
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Announce shutdown to everything listening for `homeassistant_stop`
    pub fn fire_stop(&self) {
        info!("Firing stop event");
        self.bus.fire(Event::new(
            HOMEASSISTANT_STOP,
            serde_json::json!({}),
            Context::new(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_shares_one_bus() {
        let dir = tempfile::TempDir::new().unwrap();
        let hub = Hub::new(dir.path());
        let mut rx = hub.bus.subscribe(HOMEASSISTANT_STOP);

        let clone = hub.clone();
        clone.fire_stop();

        assert_eq!(
            rx.recv().await.unwrap().event_type.as_str(),
            HOMEASSISTANT_STOP
        );
        assert_eq!(hub.config_dir(), dir.path());
    }
}
