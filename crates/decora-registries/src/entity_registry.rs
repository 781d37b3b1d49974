//! Entity Registry
//!
//! Maps an integration's stable unique_id to the entity_id it was given the
//! first time it was seen, so ids survive restarts and renames of the device.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::storage::{Storable, Storage, StorageResult};

#[derive(Debug, Error, Clone)]
pub enum EntityRegistryError {
    #[error("Entity not found: {0}")]
    NotFound(String),
}

pub const STORAGE_KEY: &str = "core.entity_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Reason an entity was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledBy {
    /// The owning config entry is disabled
    ConfigEntry,
    /// The entity's device is disabled
    Device,
    /// The integration registers it disabled until the user opts in
    Integration,
    /// The user turned it off
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Config,
    Diagnostic,
}

/// A registered entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Registry id, stable across entity id changes
    pub id: String,

    /// Current `domain.object_id`
    pub entity_id: String,

    /// Integration-provided id, unique within domain and platform
    pub unique_id: String,

    /// Integration that created the entity
    pub platform: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,

    /// User-set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Integration-supplied name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<EntityCategory>,
    /// Set while the entity must not be published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.entity_id)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    fn unique_key(&self) -> String {
        unique_key(self.domain(), &self.platform, &self.unique_id)
    }
}

fn unique_key(domain: &str, platform: &str, unique_id: &str) -> String {
    format!("{}|{}|{}", domain, platform, unique_id)
}

/// What an integration knows about an entity when it registers it
#[derive(Debug, Clone)]
pub struct EntityRegistration<'a> {
    pub domain: &'a str,
    pub platform: &'a str,
    pub unique_id: &'a str,
    /// object_id to use when the entity is new
    pub suggested_object_id: &'a str,
    pub config_entry_id: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub original_name: Option<&'a str>,
    pub entity_category: Option<EntityCategory>,
    /// Registered as disabled by the integration when first created
    pub disabled_by_default: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistryData {
    pub entities: Vec<EntityEntry>,
}

impl Storable for EntityRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Entity Registry preserving registration order
pub struct EntityRegistry {
    storage: Arc<Storage>,

    by_entity_id: RwLock<IndexMap<String, Arc<EntityEntry>>>,

    /// `domain|platform|unique_id` -> entity_id
    by_unique_id: DashMap<String, String>,

    /// config entry id -> entity ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl EntityRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_entity_id: RwLock::new(IndexMap::new()),
            by_unique_id: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.storage.load::<EntityRegistryData>().await? {
            info!(count = data.entities.len(), "Loading entities from storage");
            for entry in data.entities {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let entities: Vec<EntityEntry> = self.iter().iter().map(|e| (**e).clone()).collect();
        let count = entities.len();
        self.storage.save(&EntityRegistryData { entities }).await?;
        debug!(count, "Saved entities to storage");
        Ok(())
    }

    fn index_entry(&self, entry: Arc<EntityEntry>) {
        let entity_id = entry.entity_id.clone();

        self.by_unique_id
            .insert(entry.unique_key(), entity_id.clone());

        if let Some(ref config_entry_id) = entry.config_entry_id {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }

        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.insert(entity_id, entry);
        }
    }

    fn unindex_entry(&self, entry: &EntityEntry) {
        self.by_unique_id.remove(&entry.unique_key());

        if let Some(ref config_entry_id) = entry.config_entry_id {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.entity_id);
            }
        }

        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.shift_remove(&entry.entity_id);
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .ok()
            .and_then(|idx| idx.get(entity_id).cloned())
    }

    pub fn get_by_unique_id(
        &self,
        domain: &str,
        platform: &str,
        unique_id: &str,
    ) -> Option<Arc<EntityEntry>> {
        self.by_unique_id
            .get(&unique_key(domain, platform, unique_id))
            .and_then(|entity_id| self.get(&entity_id))
    }

    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Return the entry for this unique_id, registering it on first sight
    ///
    /// Existing entries keep their entity_id and disabled state; device,
    /// config entry, name and category are refreshed from `reg`.
    #[instrument(skip(self, reg), fields(platform = reg.platform, unique_id = reg.unique_id))]
    pub fn get_or_create(&self, reg: &EntityRegistration<'_>) -> Arc<EntityEntry> {
        if let Some(existing) = self.get_by_unique_id(reg.domain, reg.platform, reg.unique_id) {
            let stale = existing.device_id.as_deref() != reg.device_id
                || existing.config_entry_id.as_deref() != reg.config_entry_id
                || existing.original_name.as_deref() != reg.original_name
                || existing.entity_category != reg.entity_category;
            if !stale {
                return existing;
            }
            let updated = self.update(&existing.entity_id, |e| {
                e.device_id = reg.device_id.map(String::from);
                e.config_entry_id = reg.config_entry_id.map(String::from);
                e.original_name = reg.original_name.map(String::from);
                e.entity_category = reg.entity_category;
            });
            return updated.unwrap_or(existing);
        }

        let entity_id = self.generate_entity_id(reg.domain, reg.suggested_object_id);
        let now = Utc::now();
        let entry = EntityEntry {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id: entity_id.clone(),
            unique_id: reg.unique_id.to_string(),
            platform: reg.platform.to_string(),
            device_id: reg.device_id.map(String::from),
            config_entry_id: reg.config_entry_id.map(String::from),
            name: None,
            original_name: reg.original_name.map(String::from),
            entity_category: reg.entity_category,
            disabled_by: reg.disabled_by_default.then_some(DisabledBy::Integration),
            created_at: now,
            modified_at: now,
        };

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        info!(entity_id = %entity_id, "Registered new entity");
        entry
    }

    /// Apply `f` to a copy of the entry and store it
    pub fn update<F>(&self, entity_id: &str, f: F) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let existing = self
            .get(entity_id)
            .ok_or_else(|| EntityRegistryError::NotFound(entity_id.to_string()))?;

        let mut entry = (*existing).clone();
        f(&mut entry);
        entry.modified_at = Utc::now();

        self.unindex_entry(&existing);
        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        Ok(entry)
    }

    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let entry = self.get(entity_id)?;
        self.unindex_entry(&entry);
        info!(entity_id, "Removed entity");
        Some(entry)
    }

    /// Drop every entity created by a config entry
    pub fn remove_config_entry(&self, config_entry_id: &str) -> usize {
        let entries = self.get_by_config_entry_id(config_entry_id);
        for entry in &entries {
            self.unindex_entry(entry);
        }
        self.by_config_entry_id.remove(config_entry_id);
        entries.len()
    }

    /// Pick `{domain}.{object_id}`, appending `_2`, `_3`, ... while taken
    pub fn generate_entity_id(&self, domain: &str, suggested_object_id: &str) -> String {
        let preferred = format!("{}.{}", domain, suggested_object_id);
        if !self.is_registered(&preferred) {
            return preferred;
        }

        (2..)
            .map(|n| format!("{}_{}", preferred, n))
            .find(|candidate| !self.is_registered(candidate))
            .unwrap_or(preferred)
    }

    pub fn is_registered(&self, entity_id: &str) -> bool {
        self.by_entity_id
            .read()
            .map(|idx| idx.contains_key(entity_id))
            .unwrap_or(false)
    }

    /// All entries in registration order
    pub fn iter(&self) -> Vec<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .map(|idx| idx.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_entity_id.read().map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
