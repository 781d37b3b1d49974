//! Polling coordinator
//!
//! One coordinator per config entry owns the myLeviton session and the last
//! known switch data. Entities never talk to the cloud for reads; they render
//! from the snapshot handed to coordinator listeners after every update.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use decora_client::{DecoraApi, DecoraError, IotSwitch};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::classification::{build_devices, DecoraDevice, DeviceType, DeviceTypeOverride};
use crate::constants::UPDATE_INTERVAL;

#[derive(Debug, Error)]
#[error("update failed: {0}")]
pub struct UpdateFailed(#[from] pub DecoraError);

impl UpdateFailed {
    pub fn is_auth_error(&self) -> bool {
        self.0.is_auth_error()
    }
}

/// Switches from the last successful update, classified
#[derive(Debug, Clone, Default)]
pub struct CoordinatorData {
    pub devices: Vec<DecoraDevice>,
    /// serial -> switch
    pub switches: BTreeMap<String, IotSwitch>,
}

impl CoordinatorData {
    pub fn new(
        switches: BTreeMap<String, IotSwitch>,
        overrides: &HashMap<String, DeviceTypeOverride>,
    ) -> Self {
        Self {
            devices: build_devices(&switches, overrides),
            switches,
        }
    }

    pub fn lights(&self) -> impl Iterator<Item = &DecoraDevice> {
        self.devices
            .iter()
            .filter(|d| d.device_type == DeviceType::Light)
    }

    pub fn fans(&self) -> impl Iterator<Item = &DecoraDevice> {
        self.devices.iter().filter(|d| d.device_type == DeviceType::Fan)
    }

    pub fn device(&self, serial: &str) -> Option<&DecoraDevice> {
        self.devices.iter().find(|d| d.id == serial)
    }
}

/// Called after every update attempt with the current data and whether the
/// attempt succeeded
pub type CoordinatorListener = Arc<dyn Fn(&CoordinatorData, bool) + Send + Sync>;

pub struct DecoraCoordinator {
    api: Arc<dyn DecoraApi>,
    username: String,
    password: String,
    overrides: HashMap<String, DeviceTypeOverride>,
    update_interval: Duration,

    data: RwLock<Arc<CoordinatorData>>,
    last_update_success: AtomicBool,

    /// Serializes updates so the poll loop and command refreshes never interleave
    refresh_lock: Mutex<()>,

    listeners: StdMutex<Vec<(u64, CoordinatorListener)>>,
    next_listener_id: AtomicU64,

    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl DecoraCoordinator {
    pub fn new(
        api: Arc<dyn DecoraApi>,
        username: impl Into<String>,
        password: impl Into<String>,
        overrides: HashMap<String, DeviceTypeOverride>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            api,
            username: username.into(),
            password: password.into(),
            overrides,
            update_interval: UPDATE_INTERVAL,
            data: RwLock::new(Arc::new(CoordinatorData::default())),
            last_update_success: AtomicBool::new(false),
            refresh_lock: Mutex::new(()),
            listeners: StdMutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn api(&self) -> &Arc<dyn DecoraApi> {
        &self.api
    }

    pub fn last_update_success(&self) -> bool {
        self.last_update_success.load(Ordering::SeqCst)
    }

    /// Latest snapshot
    pub async fn data(&self) -> Arc<CoordinatorData> {
        Arc::clone(&*self.data.read().await)
    }

    pub async fn switch(&self, serial: &str) -> Option<IotSwitch> {
        self.data.read().await.switches.get(serial).cloned()
    }

    /// Merge the switch returned by an update so entities see it immediately
    ///
    /// Fields missing from the response keep their last polled value.
    pub async fn apply_switch_update(&self, serial: &str, switch: IotSwitch) {
        let mut data = self.data.write().await;
        let mut updated = (**data).clone();
        let merged = match updated.switches.get(serial) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.data.extend(switch.data);
                merged
            }
            None => switch,
        };
        if let Some(device) = updated.devices.iter_mut().find(|d| d.id == serial) {
            device.switch = merged.clone();
        }
        updated.switches.insert(serial.to_string(), merged);
        *data = Arc::new(updated);
    }

    pub fn add_listener(&self, listener: CoordinatorListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener));
        }
        id
    }

    pub fn remove_listener(&self, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    async fn notify_listeners(&self) {
        let data = self.data().await;
        let success = self.last_update_success();
        let listeners: Vec<CoordinatorListener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(&data, success);
        }
    }

    async fn login(&self) -> Result<(), UpdateFailed> {
        self.api.login(&self.username, &self.password).await?;
        debug!("Logged in to myLeviton");
        Ok(())
    }

    async fn discover(&self) -> Result<BTreeMap<String, IotSwitch>, DecoraError> {
        let switches: BTreeMap<String, IotSwitch> = self
            .api
            .discover_switches()
            .await?
            .into_iter()
            .map(|s| (s.serial().to_string(), s))
            .collect();
        info!(count = switches.len(), "Discovered Decora Wi-Fi devices");
        Ok(switches)
    }

    /// Refresh every known switch; a switch that fails keeps its old data
    async fn refresh_known(&self, known: &BTreeMap<String, IotSwitch>) -> BTreeMap<String, IotSwitch> {
        let mut refreshed = BTreeMap::new();
        for (serial, switch) in known {
            match self.api.refresh_switch(&switch.id).await {
                Ok(fresh) => {
                    refreshed.insert(serial.clone(), fresh);
                }
                Err(err) => {
                    warn!(%serial, %err, "Failed to refresh switch");
                    refreshed.insert(serial.clone(), switch.clone());
                }
            }
        }
        refreshed
    }

    async fn fetch(&self) -> Result<BTreeMap<String, IotSwitch>, UpdateFailed> {
        if !self.api.is_authenticated().await {
            self.login().await?;
        }

        let known = self.data.read().await.switches.clone();
        let attempt = if known.is_empty() {
            self.discover().await
        } else {
            Ok(self.refresh_known(&known).await)
        };

        match attempt {
            Ok(switches) => Ok(switches),
            Err(err) => {
                warn!(%err, "Update failed, attempting re-login");
                self.api.clear_session().await;
                self.login().await?;
                Ok(self.discover().await?)
            }
        }
    }

    /// Fetch new data and notify listeners
    ///
    /// On failure the previous data is kept and listeners still run, so
    /// entities can report themselves unavailable.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), UpdateFailed> {
        let _guard = self.refresh_lock.lock().await;

        let result = match self.fetch().await {
            Ok(switches) => {
                let data = CoordinatorData::new(switches, &self.overrides);
                debug!(
                    lights = data.lights().count(),
                    fans = data.fans().count(),
                    "Device summary"
                );
                *self.data.write().await = Arc::new(data);
                self.last_update_success.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                warn!(%err, "Error fetching Decora Wi-Fi data");
                self.last_update_success.store(false, Ordering::SeqCst);
                Err(err)
            }
        };

        self.notify_listeners().await;
        result
    }

    /// Login and discovery during entry setup
    pub async fn first_refresh(&self) -> Result<(), UpdateFailed> {
        self.refresh().await
    }

    /// Refresh after a command; failures only get logged
    pub async fn request_refresh(&self) {
        if let Err(err) = self.refresh().await {
            debug!(%err, "Refresh after command failed");
        }
    }

    /// Send attributes to a switch, apply the response and refresh
    pub async fn update_switch(
        &self,
        serial: &str,
        attributes: Map<String, Value>,
    ) -> Result<(), DecoraError> {
        let Some(switch) = self.switch(serial).await else {
            debug!(%serial, "Ignoring command for unknown switch");
            return Ok(());
        };
        let updated = self.api.update_switch(&switch.id, attributes).await?;
        self.apply_switch_update(serial, updated).await;
        self.request_refresh().await;
        Ok(())
    }

    /// Start polling every update interval
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Coordinator already polling");
            return;
        }

        let coordinator = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = self.update_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately; the first refresh already ran
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let _ = coordinator.refresh().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Coordinator poll loop stopping");
                        break;
                    }
                }
            }
            coordinator.running.store(false, Ordering::SeqCst);
        });
        info!(interval_secs = period.as_secs(), "Coordinator polling started");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop polling and log out; logout errors are ignored
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if self.api.is_authenticated().await {
            if let Err(err) = self.api.logout().await {
                debug!(%err, "Logout failed, session may already be closed");
            }
        }
    }
}
