//! Shared entity plumbing
//!
//! Every platform entity wraps an [`EntityBase`]: its registered entity id,
//! the switch serial it renders and the coordinator it reads from. Entities
//! are rebuilt on every entry setup and published to the state store from
//! coordinator snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use decora_client::{DecoraError, IotSwitch};
use decora_core::{slugify, Context, EntityId, ServiceCall, STATE_UNAVAILABLE};
use decora_registries::{
    DeviceConnection, DeviceIdentifier, DeviceInfo, EntityCategory, EntityRegistration,
    CONNECTION_NETWORK_MAC,
};
use decora_runtime::{Hub, ServiceError, StateStore};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::classification::DecoraDevice;
use crate::constants::{DEFAULT_MODEL, DOMAIN, MANUFACTURER};
use crate::coordinator::{CoordinatorData, DecoraCoordinator};
use crate::fan::FanEntity;
use crate::light::LightEntity;
use crate::number::NumberEntity;
use crate::sensor::SensorEntity;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Client(#[from] DecoraError),

    #[error("{value} is outside {min}..={max} for {entity_id}")]
    OutOfRange {
        entity_id: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

impl From<CommandError> for ServiceError {
    fn from(err: CommandError) -> Self {
        ServiceError::CallFailed(err.to_string())
    }
}

/// Device registry entry for a switch
pub fn device_info(device: &DecoraDevice) -> DeviceInfo {
    let switch = &device.switch;
    let model = if device.model.is_empty() {
        DEFAULT_MODEL.to_string()
    } else {
        device.model.clone()
    };

    DeviceInfo {
        identifiers: vec![DeviceIdentifier::new(DOMAIN, &device.id)],
        connections: switch
            .mac()
            .map(|mac| vec![DeviceConnection::new(CONNECTION_NETWORK_MAC, mac)])
            .unwrap_or_default(),
        name: Some(device.name.clone()),
        manufacturer: Some(MANUFACTURER.to_string()),
        model: Some(model),
        sw_version: switch.version().map(String::from),
    }
}

pub struct EntityBase {
    pub entity_id: EntityId,
    pub unique_id: String,
    /// Serial of the switch this entity renders
    pub serial: String,
    pub friendly_name: String,
    pub coordinator: Arc<DecoraCoordinator>,
}

impl EntityBase {
    /// The switch from `data`, if the entity is available
    pub fn available_switch<'a>(&self, data: &'a CoordinatorData, success: bool) -> Option<&'a IotSwitch> {
        if !success {
            return None;
        }
        data.switches
            .get(&self.serial)
            .filter(|switch| switch.connected())
    }

    pub fn available(&self, data: &CoordinatorData, success: bool) -> bool {
        self.available_switch(data, success).is_some()
    }

    /// Current switch snapshot, for commands
    pub async fn switch(&self) -> Option<IotSwitch> {
        self.coordinator.switch(&self.serial).await
    }
}

pub trait DecoraEntity: Send + Sync {
    fn base(&self) -> &EntityBase;

    /// State string and attributes for an available switch
    fn state(&self, switch: &IotSwitch) -> (String, HashMap<String, Value>);

    fn entity_id(&self) -> &EntityId {
        &self.base().entity_id
    }

    fn publish(&self, states: &StateStore, data: &CoordinatorData, success: bool) {
        let base = self.base();
        let (state, mut attributes) = match base.available_switch(data, success) {
            Some(switch) => self.state(switch),
            None => (STATE_UNAVAILABLE.to_string(), HashMap::new()),
        };
        attributes.insert(
            "friendly_name".to_string(),
            Value::String(base.friendly_name.clone()),
        );
        states.set(base.entity_id.clone(), state, attributes, Context::new());
    }
}

/// Any entity the integration created
#[derive(Clone)]
pub enum PlatformEntity {
    Light(Arc<LightEntity>),
    Fan(Arc<FanEntity>),
    Number(Arc<NumberEntity>),
    Sensor(Arc<SensorEntity>),
}

impl PlatformEntity {
    pub fn entity(&self) -> &dyn DecoraEntity {
        match self {
            PlatformEntity::Light(e) => e.as_ref(),
            PlatformEntity::Fan(e) => e.as_ref(),
            PlatformEntity::Number(e) => e.as_ref(),
            PlatformEntity::Sensor(e) => e.as_ref(),
        }
    }

    pub fn as_light(&self) -> Option<&Arc<LightEntity>> {
        match self {
            PlatformEntity::Light(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_fan(&self) -> Option<&Arc<FanEntity>> {
        match self {
            PlatformEntity::Fan(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&Arc<NumberEntity>> {
        match self {
            PlatformEntity::Number(e) => Some(e),
            _ => None,
        }
    }
}

/// Live entities of every loaded entry, keyed by entity id
pub type EntityIndex = Arc<DashMap<String, PlatformEntity>>;

/// Entities a service call targets
///
/// A call without `entity_id` targets every entity of the platform. An
/// empty list targets nothing, and an `entity_id` that is neither a string
/// nor an array of strings is rejected.
pub(crate) fn resolve_targets<T>(
    index: &EntityIndex,
    call: &ServiceCall,
    platform: &str,
    select: fn(&PlatformEntity) -> Option<&Arc<T>>,
) -> Result<Vec<Arc<T>>, ServiceError> {
    match call.service_data.get("entity_id") {
        None => {
            return Ok(index
                .iter()
                .filter_map(|entry| select(entry.value()).cloned())
                .collect())
        }
        Some(Value::String(_)) => {}
        Some(Value::Array(ids)) if ids.iter().all(Value::is_string) => {}
        Some(other) => {
            return Err(ServiceError::InvalidData(format!(
                "entity_id must be a string or a list of strings, got {other}"
            )))
        }
    }

    Ok(call
        .target_entities(platform)
        .iter()
        .filter_map(|entity_id| {
            let found = index
                .get(&entity_id.to_string())
                .and_then(|entry| select(entry.value()).cloned());
            if found.is_none() {
                debug!(%entity_id, "Service target is not a Decora Wi-Fi entity");
            }
            found
        })
        .collect())
}

/// What a platform knows about an entity before registration
pub struct EntityParams<'a> {
    pub platform: &'a str,
    pub unique_id: String,
    /// Appended to the device name; `None` for a device's main entity
    pub name: Option<&'a str>,
    pub category: Option<EntityCategory>,
    pub disabled_by_default: bool,
}

/// Everything platforms need while creating entities for one entry
pub struct PlatformContext<'a> {
    pub hub: &'a Hub,
    pub entry_id: &'a str,
    pub coordinator: &'a Arc<DecoraCoordinator>,
}

impl PlatformContext<'_> {
    /// Register an entity for `device`
    ///
    /// Returns `None` for entities disabled in the entity registry; those are
    /// never published.
    pub fn register(
        &self,
        device: &DecoraDevice,
        device_id: &str,
        params: EntityParams<'_>,
    ) -> Option<EntityBase> {
        let device_name = if device.name.is_empty() {
            device.id.as_str()
        } else {
            device.name.as_str()
        };
        let friendly_name = match params.name {
            Some(name) => format!("{} {}", device_name, name),
            None => device_name.to_string(),
        };

        let entry = self.hub.registries.entities.get_or_create(&EntityRegistration {
            domain: params.platform,
            platform: DOMAIN,
            unique_id: &params.unique_id,
            suggested_object_id: &slugify(&friendly_name),
            config_entry_id: Some(self.entry_id),
            device_id: Some(device_id),
            original_name: params.name,
            entity_category: params.category,
            disabled_by_default: params.disabled_by_default,
        });

        if entry.is_disabled() {
            debug!(entity_id = %entry.entity_id, "Skipping disabled entity");
            return None;
        }

        let entity_id = match entry.entity_id.parse::<EntityId>() {
            Ok(entity_id) => entity_id,
            Err(err) => {
                warn!(entity_id = %entry.entity_id, %err, "Registered entity id is invalid");
                return None;
            }
        };

        Some(EntityBase {
            entity_id,
            unique_id: params.unique_id,
            serial: device.id.clone(),
            friendly_name,
            coordinator: Arc::clone(self.coordinator),
        })
    }
}
