//! Entry setup and teardown
//!
//! [`DecoraWifi`] is the integration's handle on the bridge: it sets up one
//! coordinator per config entry, creates that entry's entities and owns the
//! shared entity index the services dispatch through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use decora_client::{DecoraApi, DecoraResult, DecoraSession};
use decora_config_entries::{
    ConfigEntries, ConfigEntry, FlowManager, IntegrationHandler, SetupError,
};
use decora_core::events::HOMEASSISTANT_STOP;
use decora_core::{Context, EntityId};
use decora_runtime::{Hub, ServiceResult};
use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classification::{parse_overrides, DeviceType};
use crate::config_flow::DecoraFlowFactory;
use crate::constants::{CONF_PASSWORD, CONF_USERNAME, DOMAIN, UPDATE_INTERVAL};
use crate::coordinator::{CoordinatorData, DecoraCoordinator};
use crate::entity::{device_info, EntityIndex, PlatformContext, PlatformEntity};
use crate::fan::{self, FanEntity};
use crate::light::{self, LightEntity};
use crate::number::{self, NumberEntity};
use crate::sensor::SensorEntity;

/// Builds a fresh myLeviton client for each entry and each credential check
pub type ApiFactory = Arc<dyn Fn() -> DecoraResult<Arc<dyn DecoraApi>> + Send + Sync>;

/// Factory for real sessions, optionally against another base URL
pub fn session_factory(base_url: Option<String>) -> ApiFactory {
    Arc::new(move || {
        let session = match &base_url {
            Some(url) => DecoraSession::with_base_url(url.clone())?,
            None => DecoraSession::new()?,
        };
        Ok(Arc::new(session) as Arc<dyn DecoraApi>)
    })
}

/// What a loaded entry holds on to
struct EntryRuntime {
    coordinator: Arc<DecoraCoordinator>,
    entity_ids: Vec<EntityId>,
    listener_id: u64,
    stop_task: JoinHandle<()>,
}

pub struct DecoraWifi {
    hub: Hub,
    api_factory: ApiFactory,
    update_interval: Duration,
    index: EntityIndex,
    runtimes: DashMap<String, EntryRuntime>,
}

impl DecoraWifi {
    pub fn new(hub: Hub, api_factory: ApiFactory) -> Self {
        Self {
            hub,
            api_factory,
            update_interval: UPDATE_INTERVAL,
            index: Arc::new(DashMap::new()),
            runtimes: DashMap::new(),
        }
    }

    pub fn with_update_interval(mut self, update_interval: Duration) -> Self {
        self.update_interval = update_interval;
        self
    }

    /// Register the entry handler, the flows and the entity services
    pub fn register(self: &Arc<Self>, entries: &ConfigEntries, flows: &FlowManager) -> ServiceResult {
        entries.register_handler(DOMAIN, Arc::clone(self) as Arc<dyn IntegrationHandler>);
        flows.register(DOMAIN, Arc::new(DecoraFlowFactory::new(Arc::clone(self))));

        let services = &self.hub.services;
        light::register_services(services, &self.index)?;
        fan::register_services(services, &self.index)?;
        number::register_services(services, &self.index)?;

        info!("Decora Wi-Fi integration registered");
        Ok(())
    }

    pub fn new_api(&self) -> DecoraResult<Arc<dyn DecoraApi>> {
        (self.api_factory)()
    }

    /// Coordinator of a loaded entry
    pub fn coordinator(&self, entry_id: &str) -> Option<Arc<DecoraCoordinator>> {
        self.runtimes
            .get(entry_id)
            .map(|runtime| Arc::clone(&runtime.coordinator))
    }

    /// Entities published for a loaded entry
    pub fn entity_ids(&self, entry_id: &str) -> Vec<EntityId> {
        self.runtimes
            .get(entry_id)
            .map(|runtime| runtime.entity_ids.clone())
            .unwrap_or_default()
    }

    /// Register devices and create entities for every switch
    fn create_entities(
        &self,
        entry_id: &str,
        coordinator: &Arc<DecoraCoordinator>,
        data: &CoordinatorData,
    ) -> Vec<PlatformEntity> {
        let ctx = PlatformContext {
            hub: &self.hub,
            entry_id,
            coordinator,
        };

        let mut entities = Vec::new();
        for device in &data.devices {
            let device_id = self
                .hub
                .registries
                .devices
                .get_or_create(entry_id, &device_info(device))
                .id
                .clone();

            match device.device_type {
                DeviceType::Light => {
                    if let Some(light) = LightEntity::create(&ctx, device, &device_id) {
                        entities.push(PlatformEntity::Light(light));
                    }
                }
                DeviceType::Fan => {
                    if let Some(fan) = FanEntity::create(&ctx, device, &device_id) {
                        entities.push(PlatformEntity::Fan(fan));
                    }
                }
            }
            entities.extend(
                NumberEntity::create_all(&ctx, device, &device_id)
                    .into_iter()
                    .map(PlatformEntity::Number),
            );
            entities.extend(
                SensorEntity::create_all(&ctx, device, &device_id)
                    .into_iter()
                    .map(PlatformEntity::Sensor),
            );
        }

        info!(
            lights = data.lights().count(),
            fans = data.fans().count(),
            entities = entities.len(),
            "Set up Decora Wi-Fi entities"
        );
        entities
    }

    /// Shut the coordinator down when the bridge stops
    fn spawn_stop_listener(&self, coordinator: Arc<DecoraCoordinator>) -> JoinHandle<()> {
        let mut stop_rx = self.hub.bus.subscribe(HOMEASSISTANT_STOP);
        tokio::spawn(async move {
            loop {
                match stop_rx.recv().await {
                    Ok(_) => {
                        coordinator.shutdown().await;
                        break;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl IntegrationHandler for DecoraWifi {
    async fn setup_entry(
        &self,
        entries: Arc<ConfigEntries>,
        entry: &ConfigEntry,
    ) -> Result<(), SetupError> {
        let entry_id = entry.entry_id.as_str();
        let (Some(username), Some(password)) =
            (entry.data_str(CONF_USERNAME), entry.data_str(CONF_PASSWORD))
        else {
            return Err(SetupError::Failed("missing credentials".into()));
        };
        let overrides = parse_overrides(&entry.options);

        let api = self
            .new_api()
            .map_err(|err| SetupError::NotReady(err.to_string()))?;
        let coordinator = Arc::new(
            DecoraCoordinator::new(api, username, password, overrides)
                .with_update_interval(self.update_interval),
        );

        if let Err(err) = coordinator.first_refresh().await {
            coordinator.shutdown().await;
            return Err(if err.is_auth_error() {
                SetupError::Failed("invalid_auth".into())
            } else {
                SetupError::NotReady(err.to_string())
            });
        }

        let data = coordinator.data().await;
        let entities = self.create_entities(entry_id, &coordinator, &data);
        if let Err(err) = self.hub.registries.save_all().await {
            warn!(%err, "Failed to save registries");
        }

        let entity_ids: Vec<EntityId> = entities
            .iter()
            .map(|entity| entity.entity().entity_id().clone())
            .collect();
        for entity in &entities {
            self.index
                .insert(entity.entity().entity_id().to_string(), entity.clone());
        }

        let states = Arc::clone(&self.hub.states);
        for entity in &entities {
            entity.entity().publish(&states, &data, coordinator.last_update_success());
        }
        let listener_id = coordinator.add_listener(Arc::new(move |data: &CoordinatorData, ok: bool| {
            for entity in &entities {
                entity.entity().publish(&states, data, ok);
            }
        }));

        coordinator.start();
        let stop_task = self.spawn_stop_listener(Arc::clone(&coordinator));

        entries.add_update_listener(
            entry_id,
            Arc::new(|entries: Arc<ConfigEntries>, entry: ConfigEntry| {
                async move {
                    debug!(entry_id = %entry.entry_id, "Options updated, reloading");
                    if let Err(err) = entries.reload(&entry.entry_id).await {
                        warn!(entry_id = %entry.entry_id, %err, "Reload after options update failed");
                    }
                }
                .boxed()
            }),
        );

        self.runtimes.insert(
            entry_id.to_string(),
            EntryRuntime {
                coordinator,
                entity_ids,
                listener_id,
                stop_task,
            },
        );
        info!(%entry_id, "Decora Wi-Fi integration set up");
        Ok(())
    }

    async fn unload_entry(&self, entry: &ConfigEntry) -> Result<(), String> {
        let Some((_, runtime)) = self.runtimes.remove(&entry.entry_id) else {
            return Ok(());
        };

        runtime.coordinator.remove_listener(runtime.listener_id);
        runtime.coordinator.shutdown().await;
        runtime.stop_task.abort();

        for entity_id in &runtime.entity_ids {
            self.index.remove(&entity_id.to_string());
            self.hub.states.remove(entity_id, Context::new());
        }
        info!(entry_id = %entry.entry_id, "Decora Wi-Fi entry unloaded");
        Ok(())
    }

    async fn remove_entry(&self, entry: &ConfigEntry) {
        debug!(entry_id = %entry.entry_id, "Removing Decora Wi-Fi integration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::{switch, FakeApi};
    use decora_config_entries::{ConfigEntryState, ConfigEntryUpdate};
    use serde_json::{json, Map, Value};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Bridge {
        _dir: TempDir,
        hub: Hub,
        api: Arc<FakeApi>,
        entries: Arc<ConfigEntries>,
        flows: FlowManager,
        integration: Arc<DecoraWifi>,
    }

    fn bridge(switches: Vec<Value>) -> Bridge {
        let dir = TempDir::new().unwrap();
        let hub = Hub::new(dir.path());
        let api = FakeApi::with_switches(switches.into_iter().map(switch).collect());
        let factory_api = Arc::clone(&api);
        let factory: ApiFactory =
            Arc::new(move || Ok(Arc::clone(&factory_api) as Arc<dyn DecoraApi>));

        let entries = Arc::new(ConfigEntries::new(hub.clone()));
        let flows = FlowManager::new(Arc::clone(&entries));
        let integration = Arc::new(DecoraWifi::new(hub.clone(), factory));
        integration.register(&entries, &flows).unwrap();

        Bridge {
            _dir: dir,
            hub,
            api,
            entries,
            flows,
            integration,
        }
    }

    fn home() -> Vec<Value> {
        vec![
            json!({
                "id": 11, "serial": "AA01", "name": "Kitchen", "model": "DW6HD",
                "power": "ON", "brightness": 60, "canSetLevel": true,
                "minLevel": 1, "maxLevel": 100, "presetLevel": 80, "dimLED": 3,
                "fadeOnTime": 2, "rssi": -52, "mac": "00-07-A6-18-36-7E"
            }),
            json!({
                "id": 12, "serial": "BB02", "name": "Bedroom Fan", "model": "DW4SF",
                "power": "ON", "brightness": 75
            }),
        ]
    }

    async fn configure(bridge: &Bridge) -> String {
        let form = bridge.flows.start_config_flow(DOMAIN).await.unwrap();
        let done = bridge
            .flows
            .progress(
                &form.flow_id,
                json!({"username": "Me@Example.com", "password": "pw"}),
            )
            .await
            .unwrap();
        done.result.unwrap()["entry_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_config_flow_sets_up_entities() {
        let bridge = bridge(home());
        let entry_id = configure(&bridge).await;

        let entry = bridge.entries.get(&entry_id).unwrap();
        assert_eq!(entry.state, ConfigEntryState::Loaded);
        assert_eq!(entry.title, "Decora WiFi (Me@Example.com)");
        assert_eq!(entry.unique_id.as_deref(), Some("me@example.com"));
        assert_eq!(entry.options["device_overrides"], json!({}));

        let light = bridge.hub.states.get("light.kitchen").unwrap();
        assert_eq!(light.state, "on");
        assert_eq!(light.attributes["brightness"], json!(153));
        assert_eq!(light.attributes["color_mode"], json!("brightness"));
        assert_eq!(light.attributes["supported_features"], json!(32));

        let fan = bridge.hub.states.get("fan.bedroom_fan").unwrap();
        assert_eq!(fan.attributes["percentage"], json!(75));
        assert_eq!(fan.attributes["preset_mode"], json!("Medium High"));
        assert_eq!(fan.attributes["supported_features"], json!(57));

        let preset = bridge.hub.states.get("number.kitchen_preset_level").unwrap();
        assert_eq!(preset.state, "80");
        assert_eq!(preset.attributes["unit_of_measurement"], json!("%"));
        assert!(bridge.hub.states.get("number.kitchen_led_brightness").is_some());

        // Disabled by default: registered but not published
        assert!(bridge.hub.states.get("number.kitchen_fade_on_time").is_none());
        assert!(bridge.hub.states.get("sensor.kitchen_wifi_signal").is_none());
        assert!(bridge
            .hub
            .registries
            .entities
            .is_registered("sensor.kitchen_wifi_signal"));

        let device = bridge
            .hub
            .registries
            .devices
            .get_by_identifier(DOMAIN, "AA01")
            .unwrap();
        assert_eq!(device.manufacturer.as_deref(), Some("Leviton"));
        assert!(bridge
            .hub
            .registries
            .devices
            .get_by_connection("mac", "00:07:a6:18:36:7e")
            .is_some());
    }

    #[tokio::test]
    async fn test_duplicate_account_aborts() {
        let bridge = bridge(home());
        configure(&bridge).await;

        let form = bridge.flows.start_config_flow(DOMAIN).await.unwrap();
        let result = bridge
            .flows
            .progress(
                &form.flow_id,
                json!({"username": "me@example.com", "password": "pw"}),
            )
            .await
            .unwrap();
        assert_eq!(result.reason.as_deref(), Some("already_configured"));
    }

    #[tokio::test]
    async fn test_invalid_auth_shows_form_error() {
        let bridge = bridge(home());
        bridge.api.reject_login.store(true, Ordering::SeqCst);

        let form = bridge.flows.start_config_flow(DOMAIN).await.unwrap();
        let result = bridge
            .flows
            .progress(&form.flow_id, json!({"username": "me", "password": "bad"}))
            .await
            .unwrap();
        assert_eq!(result.errors.unwrap()["base"], "invalid_auth");
        assert!(bridge.entries.is_empty());
    }

    #[tokio::test]
    async fn test_services_send_commands() {
        let bridge = bridge(home());
        configure(&bridge).await;
        let services = &bridge.hub.services;

        services
            .call(
                "light",
                "turn_on",
                json!({"entity_id": "light.kitchen", "brightness": 255, "transition": 3}),
                Context::new(),
            )
            .await
            .unwrap();
        services
            .call(
                "fan",
                "set_percentage",
                json!({"entity_id": "fan.bedroom_fan", "percentage": 30}),
                Context::new(),
            )
            .await
            .unwrap();
        services
            .call(
                "fan",
                "set_preset_mode",
                json!({"entity_id": "fan.bedroom_fan", "preset_mode": "Turbo"}),
                Context::new(),
            )
            .await
            .unwrap();
        services
            .call(
                "number",
                "set_value",
                json!({"entity_id": "number.kitchen_led_brightness", "value": 5.0}),
                Context::new(),
            )
            .await
            .unwrap();

        let updates = bridge.api.updates.lock().unwrap().clone();
        let sent: Vec<(String, Value)> = updates
            .into_iter()
            .map(|(id, attrs)| (id, Value::Object(attrs)))
            .collect();
        assert_eq!(
            sent,
            vec![
                (
                    "11".to_string(),
                    json!({"power": "ON", "brightness": 100, "fadeOnTime": 3, "fadeOffTime": 3})
                ),
                ("12".to_string(), json!({"power": "ON", "brightness": 50})),
                ("12".to_string(), json!({"power": "ON", "brightness": 50})),
                ("11".to_string(), json!({"dimLED": 5})),
            ]
        );

        let led = bridge.hub.states.get("number.kitchen_led_brightness").unwrap();
        assert_eq!(led.state, "5");

        let err = services
            .call(
                "number",
                "set_value",
                json!({"entity_id": "number.kitchen_led_brightness", "value": 9}),
                Context::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[tokio::test]
    async fn test_service_targets() {
        let bridge = bridge(vec![
            json!({"id": 11, "serial": "AA01", "name": "Kitchen", "model": "DW6HD", "power": "ON", "brightness": 60}),
            json!({"id": 13, "serial": "CC03", "name": "Porch", "model": "DW15S", "power": "ON"}),
        ]);
        configure(&bridge).await;
        let services = &bridge.hub.services;

        // An empty list targets nothing
        services
            .call("light", "turn_off", json!({"entity_id": []}), Context::new())
            .await
            .unwrap();
        assert!(bridge.api.updates.lock().unwrap().is_empty());

        // A target of the wrong type is rejected before any command goes out
        for bad in [json!(42), json!({"id": "light.kitchen"}), json!(["light.kitchen", 7])] {
            let err = services
                .call("light", "turn_off", json!({"entity_id": bad}), Context::new())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("entity_id"), "{err}");
        }
        assert!(bridge.api.updates.lock().unwrap().is_empty());

        services
            .call("light", "turn_off", json!({"entity_id": ["light.porch"]}), Context::new())
            .await
            .unwrap();
        let sent: Vec<String> = bridge
            .api
            .updates
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(sent, vec!["13"]);

        // No entity_id at all reaches every light
        services
            .call("light", "turn_off", json!({}), Context::new())
            .await
            .unwrap();
        let mut sent: Vec<String> = bridge
            .api
            .updates
            .lock()
            .unwrap()
            .iter()
            .skip(1)
            .map(|(id, _)| id.clone())
            .collect();
        sent.sort();
        assert_eq!(sent, vec!["11", "13"]);
    }

    #[tokio::test]
    async fn test_fan_off_state_and_toggle() {
        let bridge = bridge(home());
        configure(&bridge).await;

        bridge
            .hub
            .services
            .call(
                "fan",
                "set_percentage",
                json!({"entity_id": "fan.bedroom_fan", "percentage": 0}),
                Context::new(),
            )
            .await
            .unwrap();
        let fan = bridge.hub.states.get("fan.bedroom_fan").unwrap();
        assert_eq!(fan.state, "off");
        assert_eq!(fan.attributes["percentage"], json!(0));
        assert_eq!(fan.attributes["preset_mode"], Value::Null);

        bridge
            .hub
            .services
            .call("fan", "toggle", json!({"entity_id": "fan.bedroom_fan"}), Context::new())
            .await
            .unwrap();
        let fan = bridge.hub.states.get("fan.bedroom_fan").unwrap();
        assert_eq!(fan.state, "on");
        assert_eq!(fan.attributes["percentage"], json!(50));
    }

    #[tokio::test]
    async fn test_options_flow_overrides_and_reloads() {
        let bridge = bridge(home());
        let entry_id = configure(&bridge).await;

        let form = bridge.flows.start_options_flow(&entry_id).await.unwrap();
        let labels: Vec<&str> = form.data_schema.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(labels, vec!["Kitchen (DW6HD)", "Bedroom Fan (DW4SF)"]);
        assert_eq!(
            form.description_placeholders.as_ref().unwrap()["devices"],
            "2"
        );
        let auto_label = &form.data_schema[1].options.as_ref().unwrap()[0].label;
        assert_eq!(auto_label, "Auto (fan)");

        bridge
            .flows
            .progress(
                &form.flow_id,
                json!({"Kitchen (DW6HD)": "auto", "Bedroom Fan (DW4SF)": "light"}),
            )
            .await
            .unwrap();

        let entry = bridge.entries.get(&entry_id).unwrap();
        assert_eq!(entry.options["device_overrides"], json!({"BB02": "light"}));
        assert_eq!(entry.state, ConfigEntryState::Loaded);

        // Reloaded with the fan controller as a light
        assert!(bridge.hub.states.get("fan.bedroom_fan").is_none());
        assert_eq!(
            bridge.hub.states.get("light.bedroom_fan").unwrap().state,
            "on"
        );
    }

    #[tokio::test]
    async fn test_options_flow_without_devices_aborts() {
        let bridge = bridge(vec![]);
        let entry_id = configure(&bridge).await;
        assert!(bridge.integration.coordinator(&entry_id).is_some());
        let logins = bridge.api.logins.load(Ordering::SeqCst);

        let result = bridge.flows.start_options_flow(&entry_id).await.unwrap();
        assert_eq!(result.reason.as_deref(), Some("no_devices"));
        // The loaded coordinator answers; no fresh login
        assert_eq!(bridge.api.logins.load(Ordering::SeqCst), logins);
    }

    #[tokio::test]
    async fn test_cannot_connect_shows_form_error() {
        let bridge = bridge(home());
        bridge.api.login_unreachable.store(true, Ordering::SeqCst);

        let form = bridge.flows.start_config_flow(DOMAIN).await.unwrap();
        let result = bridge
            .flows
            .progress(&form.flow_id, json!({"username": "me", "password": "pw"}))
            .await
            .unwrap();
        assert_eq!(result.errors.unwrap()["base"], "cannot_connect");
        assert!(bridge.entries.is_empty());

        // The form stays open; a retry after the outage creates the entry
        bridge.api.login_unreachable.store(false, Ordering::SeqCst);
        bridge.api.fail_discovery_once.store(true, Ordering::SeqCst);
        let result = bridge
            .flows
            .progress(&form.flow_id, json!({"username": "me", "password": "pw"}))
            .await
            .unwrap();
        assert_eq!(result.errors.unwrap()["base"], "cannot_connect");

        let done = bridge
            .flows
            .progress(&form.flow_id, json!({"username": "me", "password": "pw"}))
            .await
            .unwrap();
        assert!(done.result.is_some());
        assert_eq!(bridge.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_options_flow_duplicate_labels() {
        let bridge = bridge(vec![
            json!({"id": 21, "serial": "AA01", "name": "Lamp", "model": "DW6HD", "power": "ON", "brightness": 50}),
            json!({"id": 22, "serial": "AA02", "name": "Lamp", "model": "DW6HD", "power": "ON", "brightness": 50}),
        ]);
        let entry_id = configure(&bridge).await;

        let form = bridge.flows.start_options_flow(&entry_id).await.unwrap();
        let labels: Vec<&str> = form.data_schema.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(labels, vec!["Lamp (DW6HD)", "Lamp (DW6HD) [AA02]"]);

        bridge
            .flows
            .progress(
                &form.flow_id,
                json!({"Lamp (DW6HD)": "light", "Lamp (DW6HD) [AA02]": "fan"}),
            )
            .await
            .unwrap();

        let entry = bridge.entries.get(&entry_id).unwrap();
        assert_eq!(
            entry.options["device_overrides"],
            json!({"AA01": "light", "AA02": "fan"})
        );
        assert!(bridge.hub.states.get("light.lamp").is_some());
        assert!(bridge.hub.states.get("fan.lamp").is_some());
    }

    #[tokio::test]
    async fn test_options_flow_logs_in_without_coordinator() {
        let bridge = bridge(home());
        let entry_id = configure(&bridge).await;
        bridge.entries.unload(&entry_id).await.unwrap();
        assert!(bridge.integration.coordinator(&entry_id).is_none());
        let logins = bridge.api.logins.load(Ordering::SeqCst);

        let form = bridge.flows.start_options_flow(&entry_id).await.unwrap();
        let labels: Vec<&str> = form.data_schema.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(labels, vec!["Kitchen (DW6HD)", "Bedroom Fan (DW4SF)"]);
        assert_eq!(bridge.api.logins.load(Ordering::SeqCst), logins + 1);
        // Validation logs out again
        assert!(!bridge.api.authenticated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_options_flow_without_coordinator_cannot_connect() {
        let bridge = bridge(home());
        let entry_id = configure(&bridge).await;
        bridge.entries.unload(&entry_id).await.unwrap();
        bridge.api.login_unreachable.store(true, Ordering::SeqCst);

        let result = bridge.flows.start_options_flow(&entry_id).await.unwrap();
        assert_eq!(result.reason.as_deref(), Some("cannot_connect"));
        assert!(bridge.flows.in_progress().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_after_failed_update() {
        let bridge = bridge(home());
        let entry_id = configure(&bridge).await;
        let coordinator = bridge.integration.coordinator(&entry_id).unwrap();

        bridge.api.authenticated.store(false, Ordering::SeqCst);
        bridge.api.reject_login.store(true, Ordering::SeqCst);
        assert!(coordinator.refresh().await.is_err());

        let light = bridge.hub.states.get("light.kitchen").unwrap();
        assert_eq!(light.state, "unavailable");
        assert_eq!(light.attributes["friendly_name"], json!("Kitchen"));
    }

    #[tokio::test]
    async fn test_unload_removes_states_and_logs_out() {
        let bridge = bridge(home());
        let entry_id = configure(&bridge).await;
        assert_eq!(bridge.integration.entity_ids(&entry_id).len(), 4);

        bridge.entries.unload(&entry_id).await.unwrap();

        assert!(bridge.hub.states.get("light.kitchen").is_none());
        assert!(bridge.integration.coordinator(&entry_id).is_none());
        assert!(!bridge.api.authenticated.load(Ordering::SeqCst));

        // Services no longer reach the unloaded entry
        bridge
            .hub
            .services
            .call("light", "turn_off", json!({"entity_id": "light.kitchen"}), Context::new())
            .await
            .unwrap();
        assert!(bridge.api.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_auth_on_setup_is_permanent() {
        let bridge = bridge(home());
        let entry_id = configure(&bridge).await;
        bridge.entries.unload(&entry_id).await.unwrap();

        bridge.api.reject_login.store(true, Ordering::SeqCst);
        assert!(bridge.entries.setup(&entry_id).await.is_err());
        assert_eq!(
            bridge.entries.get(&entry_id).unwrap().state,
            ConfigEntryState::SetupError
        );
    }

    #[tokio::test]
    async fn test_stop_event_shuts_down_coordinator() {
        let bridge = bridge(home());
        let entry_id = configure(&bridge).await;
        let coordinator = bridge.integration.coordinator(&entry_id).unwrap();
        assert!(coordinator.is_running());

        bridge.hub.fire_stop();
        for _ in 0..50 {
            if !coordinator.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!coordinator.is_running());
        assert!(!bridge.api.authenticated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_options_update_reloads_entry() {
        let bridge = bridge(home());
        let entry_id = configure(&bridge).await;
        let logins = bridge.api.logins.load(Ordering::SeqCst);

        bridge
            .entries
            .update(&entry_id, ConfigEntryUpdate::new().options(Map::new()))
            .await
            .unwrap();

        assert!(bridge.api.logins.load(Ordering::SeqCst) > logins);
        assert_eq!(
            bridge.entries.get(&entry_id).unwrap().state,
            ConfigEntryState::Loaded
        );
    }
}
