//! Diagnostic sensors, all disabled until the user enables them

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use decora_client::IotSwitch;
use decora_core::STATE_UNKNOWN;
use decora_registries::EntityCategory;
use serde_json::{json, Value};

use crate::classification::DecoraDevice;
use crate::constants::PLATFORM_SENSOR;
use crate::entity::{DecoraEntity, EntityBase, EntityParams, PlatformContext};
use crate::number::{reports, value_state};

#[derive(Debug, Clone, Copy)]
pub struct SensorDescription {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
}

pub const SENSOR_DESCRIPTIONS: [SensorDescription; 3] = [
    SensorDescription {
        key: "rssi",
        name: "WiFi signal",
        unit: Some("dBm"),
        device_class: Some("signal_strength"),
        state_class: Some("measurement"),
    },
    SensorDescription {
        key: "localIP",
        name: "IP address",
        unit: None,
        device_class: None,
        state_class: None,
    },
    SensorDescription {
        key: "lastUpdated",
        name: "Last updated",
        unit: None,
        device_class: Some("timestamp"),
        state_class: None,
    },
];

/// `2026-01-07T20:02:27.000Z` as UTC RFC 3339
pub fn parse_timestamp(value: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc).to_rfc3339())
}

pub struct SensorEntity {
    base: EntityBase,
    description: SensorDescription,
}

impl SensorEntity {
    pub fn create_all(
        ctx: &PlatformContext<'_>,
        device: &DecoraDevice,
        device_id: &str,
    ) -> Vec<Arc<Self>> {
        SENSOR_DESCRIPTIONS
            .iter()
            .filter(|description| reports(&device.switch, description.key))
            .filter_map(|description| {
                let base = ctx.register(
                    device,
                    device_id,
                    EntityParams {
                        platform: PLATFORM_SENSOR,
                        unique_id: format!("{}_{}", device.id, description.key),
                        name: Some(description.name),
                        category: Some(EntityCategory::Diagnostic),
                        disabled_by_default: true,
                    },
                )?;
                Some(Arc::new(Self {
                    base,
                    description: *description,
                }))
            })
            .collect()
    }
}

impl DecoraEntity for SensorEntity {
    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn state(&self, switch: &IotSwitch) -> (String, HashMap<String, Value>) {
        let description = &self.description;
        let raw = switch.get(description.key);

        let state = if description.device_class == Some("timestamp") {
            raw.and_then(Value::as_str)
                .and_then(parse_timestamp)
                .unwrap_or_else(|| STATE_UNKNOWN.to_string())
        } else {
            value_state(raw)
        };

        let mut attributes = HashMap::new();
        if let Some(unit) = description.unit {
            attributes.insert("unit_of_measurement".into(), json!(unit));
        }
        if let Some(device_class) = description.device_class {
            attributes.insert("device_class".into(), json!(device_class));
        }
        if let Some(state_class) = description.state_class {
            attributes.insert("state_class".into(), json!(state_class));
        }
        (state, attributes)
    }
}
