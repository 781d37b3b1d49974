//! Decora bridge registries
//!
//! Persistent registries for devices (one per physical switch) and entities
//! (lights, fans, numbers and sensors created for those switches). Both are
//! stored as versioned JSON under `<config>/.storage/`.

pub mod device_registry;
pub mod entity_registry;
pub mod storage;

pub use device_registry::{
    format_mac, DeviceConnection, DeviceEntry, DeviceIdentifier, DeviceInfo, DeviceRegistry,
    CONNECTION_NETWORK_MAC,
};
pub use entity_registry::{
    DisabledBy, EntityCategory, EntityEntry, EntityRegistration, EntityRegistry,
    EntityRegistryError,
};
pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};

use std::path::Path;
use std::sync::Arc;

/// Device and entity registries sharing one storage directory
pub struct Registries {
    pub storage: Arc<Storage>,
    pub devices: DeviceRegistry,
    pub entities: EntityRegistry,
}

impl Registries {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        let storage = Arc::new(Storage::new(config_dir));
        Self {
            devices: DeviceRegistry::new(Arc::clone(&storage)),
            entities: EntityRegistry::new(Arc::clone(&storage)),
            storage,
        }
    }

    pub async fn load_all(&self) -> StorageResult<()> {
        self.devices.load().await?;
        self.entities.load().await?;
        Ok(())
    }

    pub async fn save_all(&self) -> StorageResult<()> {
        self.devices.save().await?;
        self.entities.save().await?;
        Ok(())
    }

    /// Forget everything a removed config entry registered
    pub fn remove_config_entry(&self, config_entry_id: &str) {
        let entities = self.entities.remove_config_entry(config_entry_id);
        let devices = self.devices.remove_config_entry(config_entry_id);
        tracing::info!(
            config_entry_id,
            entities,
            devices,
            "Removed config entry from registries"
        );
    }
}
