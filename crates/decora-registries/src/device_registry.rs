//! Device Registry
//!
//! One entry per physical switch, found again across restarts by its
//! `(domain, id)` identifier or by a network connection such as its MAC.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::storage::{Storable, Storage, StorageResult};

pub const STORAGE_KEY: &str = "core.device_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Connection type for MAC addresses
pub const CONNECTION_NETWORK_MAC: &str = "mac";

/// A `(domain, id)` pair identifying a device within an integration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn domain(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// A `(type, id)` pair such as `("mac", "00:07:a6:18:36:7e")`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConnection(pub String, pub String);

impl DeviceConnection {
    /// Build a connection, normalizing MAC addresses
    pub fn new(conn_type: impl Into<String>, id: impl Into<String>) -> Self {
        let conn_type = conn_type.into();
        let id = id.into();
        let id = if conn_type == CONNECTION_NETWORK_MAC {
            format_mac(&id)
        } else {
            id
        };
        Self(conn_type, id)
    }

    pub fn connection_type(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// Normalize a MAC address to lowercase colon-separated form
///
/// Accepts colon, dash or dot separated input as well as 12 bare hex digits.
/// Anything else is returned unchanged.
pub fn format_mac(mac: &str) -> String {
    let count = |sep: char| mac.chars().filter(|c| *c == sep).count();

    if mac.len() == 17 && count(':') == 5 {
        return mac.to_lowercase();
    }

    let stripped = if mac.len() == 17 && count('-') == 5 {
        mac.replace('-', "")
    } else if mac.len() == 14 && count('.') == 2 {
        mac.replace('.', "")
    } else if mac.len() == 12 && mac.chars().all(|c| c.is_ascii_hexdigit()) {
        mac.to_string()
    } else {
        return mac.to_string();
    };

    let lower = stripped.to_lowercase();
    let pairs: Vec<&str> = (0..lower.len())
        .step_by(2)
        .filter_map(|i| lower.get(i..i + 2))
        .collect();
    pairs.join(":")
}

/// Descriptive information an integration supplies when registering a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<DeviceIdentifier>,
    #[serde(default)]
    pub connections: Vec<DeviceConnection>,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
}

/// A registered device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,

    #[serde(default)]
    pub identifiers: Vec<DeviceIdentifier>,

    #[serde(default)]
    pub connections: Vec<DeviceConnection>,

    #[serde(default)]
    pub config_entries: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_by_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identifiers: Vec::new(),
            connections: Vec::new(),
            config_entries: Vec::new(),
            name: None,
            name_by_user: None,
            manufacturer: None,
            model: None,
            sw_version: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// User name if set, else the integration-supplied name
    pub fn display_name(&self) -> &str {
        self.name_by_user
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("")
    }

    /// Merge integration info; returns whether anything changed
    fn merge(&mut self, config_entry_id: &str, info: &DeviceInfo) -> bool {
        let mut changed = false;

        if !self.config_entries.iter().any(|e| e == config_entry_id) {
            self.config_entries.push(config_entry_id.to_string());
            changed = true;
        }
        for ident in &info.identifiers {
            if !self.identifiers.contains(ident) {
                self.identifiers.push(ident.clone());
                changed = true;
            }
        }
        for conn in &info.connections {
            if !self.connections.contains(conn) {
                self.connections.push(conn.clone());
                changed = true;
            }
        }

        for (field, value) in [
            (&mut self.name, &info.name),
            (&mut self.manufacturer, &info.manufacturer),
            (&mut self.model, &info.model),
            (&mut self.sw_version, &info.sw_version),
        ] {
            if value.is_some() && *field != *value {
                *field = value.clone();
                changed = true;
            }
        }

        if changed {
            self.modified_at = Utc::now();
        }
        changed
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    pub devices: Vec<DeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Device Registry with identifier, connection and config entry indexes
pub struct DeviceRegistry {
    storage: Arc<Storage>,

    by_id: DashMap<String, Arc<DeviceEntry>>,

    /// identifier key -> device id
    by_identifier: DashMap<String, String>,

    /// connection key -> device id
    by_connection: DashMap<String, String>,

    /// config entry id -> device ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl DeviceRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_id: DashMap::new(),
            by_identifier: DashMap::new(),
            by_connection: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.storage.load::<DeviceRegistryData>().await? {
            info!(count = data.devices.len(), "Loading devices from storage");
            for entry in data.devices {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut devices: Vec<DeviceEntry> =
            self.by_id.iter().map(|r| (**r.value()).clone()).collect();
        devices.sort_by_key(|d| d.created_at);

        self.storage.save(&DeviceRegistryData { devices }).await?;
        debug!(count = self.by_id.len(), "Saved devices to storage");
        Ok(())
    }

    fn index_entry(&self, entry: Arc<DeviceEntry>) {
        let device_id = entry.id.clone();

        for identifier in &entry.identifiers {
            self.by_identifier.insert(identifier.key(), device_id.clone());
        }
        for connection in &entry.connections {
            self.by_connection.insert(connection.key(), device_id.clone());
        }
        for config_entry_id in &entry.config_entries {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(device_id.clone());
        }

        self.by_id.insert(device_id, entry);
    }

    fn unindex_entry(&self, entry: &DeviceEntry) {
        for identifier in &entry.identifiers {
            self.by_identifier.remove(&identifier.key());
        }
        for connection in &entry.connections {
            self.by_connection.remove(&connection.key());
        }
        for config_entry_id in &entry.config_entries {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.id);
            }
        }
        self.by_id.remove(&entry.id);
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    pub fn get_by_identifier(&self, domain: &str, id: &str) -> Option<Arc<DeviceEntry>> {
        let key = DeviceIdentifier::new(domain, id).key();
        self.by_identifier
            .get(&key)
            .and_then(|device_id| self.get(&device_id))
    }

    pub fn get_by_connection(&self, conn_type: &str, id: &str) -> Option<Arc<DeviceEntry>> {
        let key = DeviceConnection::new(conn_type, id).key();
        self.by_connection
            .get(&key)
            .and_then(|device_id| self.get(&device_id))
    }

    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Find the device by any identifier or connection, creating it when unknown,
    /// and merge `info` into it
    #[instrument(skip(self, info), fields(name = ?info.name))]
    pub fn get_or_create(&self, config_entry_id: &str, info: &DeviceInfo) -> Arc<DeviceEntry> {
        let existing = info
            .identifiers
            .iter()
            .find_map(|i| self.get_by_identifier(i.domain(), i.id()))
            .or_else(|| {
                info.connections
                    .iter()
                    .find_map(|c| self.get_by_connection(c.connection_type(), c.id()))
            });

        match existing {
            Some(existing) => {
                let mut entry = (*existing).clone();
                if !entry.merge(config_entry_id, info) {
                    return existing;
                }
                debug!(device_id = %entry.id, "Updated device");
                self.unindex_entry(&existing);
                let entry = Arc::new(entry);
                self.index_entry(Arc::clone(&entry));
                entry
            }
            None => {
                let mut entry = DeviceEntry::new();
                entry.merge(config_entry_id, info);
                info!(device_id = %entry.id, name = ?entry.name, "Registered new device");
                let entry = Arc::new(entry);
                self.index_entry(Arc::clone(&entry));
                entry
            }
        }
    }

    /// Detach a config entry; devices left without any entry are removed
    pub fn remove_config_entry(&self, config_entry_id: &str) -> usize {
        let mut removed = 0;
        for device in self.get_by_config_entry_id(config_entry_id) {
            self.unindex_entry(&device);
            let mut entry = (*device).clone();
            entry.config_entries.retain(|e| e != config_entry_id);
            if entry.config_entries.is_empty() {
                removed += 1;
            } else {
                entry.modified_at = Utc::now();
                self.index_entry(Arc::new(entry));
            }
        }
        self.by_config_entry_id.remove(config_entry_id);
        removed
    }

    pub fn devices(&self) -> Vec<Arc<DeviceEntry>> {
        self.by_id.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
