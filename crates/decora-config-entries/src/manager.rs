//! Config entries manager
//!
//! Owns every config entry, persists them under `core.config_entries`, and
//! drives each entry through setup, unload, reload and removal by calling
//! the [`IntegrationHandler`] registered for its domain.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use decora_core::events::ConfigEntryUpdatedData;
use decora_core::Context;
use decora_registries::{Storable, StorageError, StorageResult};
use decora_runtime::Hub;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::entry::{ConfigEntry, ConfigEntryState, ConfigEntryUpdate};
use crate::state_machine::{calculate_retry_delay, InvalidTransition};

pub const STORAGE_KEY: &str = "core.config_entries";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Failures of config entry bookkeeping and lifecycle calls
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error("No integration registered for domain {0}")]
    NoHandler(String),

    #[error("Setup failed: {0}")]
    SetupFailed(String),

    #[error("Unload failed: {0}")]
    UnloadFailed(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    /// Every stored entry, oldest first
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Why an integration could not set up an entry
#[derive(Debug, Clone, Error)]
pub enum SetupError {
    /// Transient failure (cloud unreachable); setup is retried with backoff
    #[error("not ready: {0}")]
    NotReady(String),

    /// Permanent failure (bad credentials); the entry stays in SetupError
    #[error("{0}")]
    Failed(String),
}

/// Lifecycle hooks an integration provides for its config entries
#[async_trait]
pub trait IntegrationHandler: Send + Sync {
    async fn setup_entry(
        &self,
        entries: Arc<ConfigEntries>,
        entry: &ConfigEntry,
    ) -> Result<(), SetupError>;

    async fn unload_entry(&self, entry: &ConfigEntry) -> Result<(), String>;

    /// Called after the entry is unloaded and before it is forgotten
    async fn remove_entry(&self, _entry: &ConfigEntry) {}
}

/// Invoked with the updated entry after its data or options change
pub type UpdateListener =
    Arc<dyn Fn(Arc<ConfigEntries>, ConfigEntry) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct ConfigEntries {
    hub: Hub,

    /// entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// domain -> entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    /// Serializes setup and unload
    setup_lock: Mutex<()>,

    handlers: DashMap<String, Arc<dyn IntegrationHandler>>,

    update_listeners: DashMap<String, Vec<UpdateListener>>,
}

impl ConfigEntries {
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            setup_lock: Mutex::new(()),
            handlers: DashMap::new(),
            update_listeners: DashMap::new(),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.hub.registries.storage.load::<ConfigEntriesData>().await? {
            info!(count = data.entries.len(), "Loading config entries");
            for entry in data.entries {
                self.index_entry(entry);
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut entries: Vec<ConfigEntry> = self.entries.iter().map(|r| r.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.hub
            .registries
            .storage
            .save(&ConfigEntriesData { entries })
            .await?;
        debug!(count = self.entries.len(), "Saved config entries");
        Ok(())
    }

    fn index_entry(&self, entry: ConfigEntry) {
        let entry_id = entry.entry_id.clone();
        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id.clone());
        }
        self.entries.insert(entry_id, entry);
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.entries.remove(&entry.entry_id);
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    fn require(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        self.get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))
    }

    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> = self
            .by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .and_then(|entry_id| self.get(&entry_id))
    }

    /// All entries, oldest first
    pub fn entries(&self) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> = self.entries.iter().map(|r| r.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn register_handler(&self, domain: impl Into<String>, handler: Arc<dyn IntegrationHandler>) {
        let domain = domain.into();
        debug!(%domain, "Registered integration handler");
        self.handlers.insert(domain, handler);
    }

    pub fn add_update_listener(&self, entry_id: &str, listener: UpdateListener) {
        self.update_listeners
            .entry(entry_id.to_string())
            .or_default()
            .push(listener);
    }

    /// Store a new entry; a `(domain, unique_id)` pair can only be claimed once
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            // Claim the unique id in the same shard lock as the lookup
            match self
                .by_unique_id
                .entry((entry.domain.clone(), unique_id.clone()))
            {
                Entry::Occupied(_) => {
                    return Err(ConfigEntriesError::AlreadyExists {
                        domain: entry.domain.clone(),
                        unique_id: unique_id.clone(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(entry.entry_id.clone());
                }
            }
        }

        self.index_entry(entry.clone());
        self.save().await?;
        info!(
            entry_id = %entry.entry_id,
            domain = %entry.domain,
            title = %entry.title,
            "Added config entry"
        );
        Ok(entry)
    }

    /// Apply `update`, persist, announce it and run the entry's update listeners
    pub async fn update(
        self: &Arc<Self>,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let updated = {
            let mut entry = self
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
            if let Some(title) = update.title {
                entry.title = title;
            }
            if let Some(data) = update.data {
                entry.data = data;
            }
            if let Some(options) = update.options {
                entry.options = options;
            }
            if let Some(disabled_by) = update.disabled_by {
                entry.disabled_by = disabled_by;
            }
            entry.modified_at = Utc::now();
            entry.clone()
        };
        self.save().await?;
        debug!(entry_id, "Updated config entry");

        self.hub.bus.fire_typed(
            ConfigEntryUpdatedData {
                entry_id: updated.entry_id.clone(),
                domain: updated.domain.clone(),
            },
            Context::new(),
        );

        let listeners = self
            .update_listeners
            .get(entry_id)
            .map(|l| l.value().clone())
            .unwrap_or_default();
        for listener in listeners {
            listener(Arc::clone(self), updated.clone()).await;
        }

        Ok(self.get(entry_id).unwrap_or(updated))
    }

    /// Unload, run the integration's removal hook and drop everything the
    /// entry registered
    #[instrument(skip(self))]
    pub async fn remove(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self.require(entry_id)?;

        if let Err(err) = self.unload(entry_id).await {
            warn!(%err, "Unload before removal failed");
        }
        let handler = self.handlers.get(&entry.domain).map(|h| Arc::clone(h.value()));
        if let Some(handler) = handler {
            handler.remove_entry(&entry).await;
        }

        self.unindex_entry(&entry);
        self.update_listeners.remove(entry_id);
        self.save().await?;

        self.hub.registries.remove_config_entry(entry_id);
        self.hub.registries.save_all().await?;

        info!(title = %entry.title, domain = %entry.domain, "Removed config entry");
        Ok(entry)
    }

    fn transition(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<()> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(state, reason)?;
        debug!(entry_id, ?state, "Config entry state changed");
        Ok(())
    }

    /// Set up one entry through its integration
    ///
    /// A [`SetupError::NotReady`] leaves the entry in SetupRetry and schedules
    /// another attempt after [`calculate_retry_delay`].
    #[instrument(skip(self))]
    pub async fn setup(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;

        let entry = self.require(entry_id)?;
        if entry.is_disabled() {
            debug!("Skipping setup of disabled entry");
            return Ok(());
        }
        if entry.is_loaded() {
            return Ok(());
        }

        self.transition(entry_id, ConfigEntryState::SetupInProgress, None)?;

        let handler = match self.handlers.get(&entry.domain) {
            Some(h) => Arc::clone(h.value()),
            None => {
                let reason = format!("integration {} not found", entry.domain);
                self.transition(entry_id, ConfigEntryState::SetupError, Some(reason))?;
                return Err(ConfigEntriesError::NoHandler(entry.domain));
            }
        };

        match handler.setup_entry(Arc::clone(self), &entry).await {
            Ok(()) => {
                self.transition(entry_id, ConfigEntryState::Loaded, None)?;
                info!(title = %entry.title, "Config entry set up");
                Ok(())
            }
            Err(SetupError::NotReady(reason)) => {
                self.transition(entry_id, ConfigEntryState::SetupRetry, Some(reason.clone()))?;
                let tries = self
                    .entries
                    .get_mut(entry_id)
                    .map(|mut e| {
                        e.tries += 1;
                        e.tries
                    })
                    .unwrap_or(1);
                let delay = calculate_retry_delay(tries - 1);
                warn!(%reason, tries, delay, "Config entry not ready, retrying later");
                self.schedule_retry(entry_id.to_string(), tries, delay);
                Err(ConfigEntriesError::SetupFailed(reason))
            }
            Err(SetupError::Failed(reason)) => {
                warn!(%reason, "Config entry setup failed");
                self.transition(entry_id, ConfigEntryState::SetupError, Some(reason.clone()))?;
                Err(ConfigEntriesError::SetupFailed(reason))
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, entry_id: String, tries: u32, delay: f64) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            let still_waiting = manager
                .get(&entry_id)
                .map(|e| e.state == ConfigEntryState::SetupRetry && e.tries == tries)
                .unwrap_or(false);
            if still_waiting {
                if let Err(err) = retry_setup(manager, entry_id).await {
                    debug!(%err, "Setup retry did not succeed");
                }
            }
        });
    }

    /// Unload one entry; entries that never finished setup just go back to
    /// NotLoaded
    #[instrument(skip(self))]
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;

        let entry = self.require(entry_id)?;
        if !entry.state.is_recoverable() {
            return Err(ConfigEntriesError::CannotUnload(entry.state));
        }
        self.update_listeners.remove(entry_id);
        if entry.state == ConfigEntryState::NotLoaded {
            return Ok(());
        }

        let was_loaded = entry.is_loaded();
        self.transition(entry_id, ConfigEntryState::UnloadInProgress, None)?;

        let handler = self.handlers.get(&entry.domain).map(|h| Arc::clone(h.value()));
        let result = match handler {
            Some(handler) if was_loaded => handler.unload_entry(&entry).await,
            _ => Ok(()),
        };

        match result {
            Ok(()) => {
                self.transition(entry_id, ConfigEntryState::NotLoaded, None)?;
                info!(title = %entry.title, "Config entry unloaded");
                Ok(())
            }
            Err(reason) => {
                self.transition(entry_id, ConfigEntryState::FailedUnload, Some(reason.clone()))?;
                Err(ConfigEntriesError::UnloadFailed(reason))
            }
        }
    }

    pub async fn reload(self: &Arc<Self>, entry_id: &str) -> ConfigEntriesResult<()> {
        info!(entry_id, "Reloading config entry");
        self.unload(entry_id).await?;
        self.setup(entry_id).await
    }

    /// Set up every entry, oldest first
    pub async fn setup_all(self: &Arc<Self>) -> Vec<(String, ConfigEntriesResult<()>)> {
        let mut results = Vec::new();
        for entry in self.entries() {
            let result = self.setup(&entry.entry_id).await;
            results.push((entry.entry_id, result));
        }
        results
    }

    pub async fn unload_all(&self) {
        for entry in self.entries() {
            if let Err(err) = self.unload(&entry.entry_id).await {
                warn!(entry_id = %entry.entry_id, %err, "Failed to unload config entry");
            }
        }
    }
}

// Boxed so the spawned retry does not make `setup` recursive in its own type.
fn retry_setup(
    manager: Arc<ConfigEntries>,
    entry_id: String,
) -> BoxFuture<'static, ConfigEntriesResult<()>> {
    Box::pin(async move { manager.setup(&entry_id).await })
}
