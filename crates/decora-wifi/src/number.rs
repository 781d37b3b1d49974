//! Configuration numbers
//!
//! Switch settings such as the preset level and LED brightness. A number is
//! only created when the switch reports its field.

use std::collections::HashMap;
use std::sync::Arc;

use decora_client::IotSwitch;
use decora_core::{ServiceCall, STATE_UNKNOWN};
use decora_registries::EntityCategory;
use decora_runtime::{ServiceDescription, ServiceError, ServiceRegistry, ServiceResult};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::classification::DecoraDevice;
use crate::constants::PLATFORM_NUMBER;
use crate::entity::{
    resolve_targets, CommandError, DecoraEntity, EntityBase, EntityIndex, EntityParams,
    PlatformContext, PlatformEntity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberMode {
    Auto,
    Slider,
}

impl NumberMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumberMode::Auto => "auto",
            NumberMode::Slider => "slider",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NumberDescription {
    /// Switch field
    pub key: &'static str,
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub unit: Option<&'static str>,
    pub mode: NumberMode,
    pub enabled_by_default: bool,
}

pub const NUMBER_DESCRIPTIONS: [NumberDescription; 4] = [
    NumberDescription {
        key: "presetLevel",
        name: "Preset level",
        min: 0.0,
        max: 100.0,
        step: 1.0,
        unit: Some("%"),
        mode: NumberMode::Auto,
        enabled_by_default: true,
    },
    NumberDescription {
        key: "dimLED",
        name: "LED brightness",
        min: 0.0,
        max: 7.0,
        step: 1.0,
        unit: None,
        mode: NumberMode::Slider,
        enabled_by_default: true,
    },
    NumberDescription {
        key: "fadeOnTime",
        name: "Fade on time",
        min: 0.0,
        max: 255.0,
        step: 1.0,
        unit: None,
        mode: NumberMode::Auto,
        enabled_by_default: false,
    },
    NumberDescription {
        key: "fadeOffTime",
        name: "Fade off time",
        min: 0.0,
        max: 255.0,
        step: 1.0,
        unit: None,
        mode: NumberMode::Auto,
        enabled_by_default: false,
    },
];

/// Whether the switch reports a non-null value for `key`
pub(crate) fn reports(switch: &IotSwitch, key: &str) -> bool {
    switch.get(key).is_some_and(|value| !value.is_null())
}

/// State string for a raw switch field
pub(crate) fn value_state(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => STATE_UNKNOWN.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub struct NumberEntity {
    base: EntityBase,
    description: NumberDescription,
}

impl NumberEntity {
    /// One entity per description the switch reports
    pub fn create_all(
        ctx: &PlatformContext<'_>,
        device: &DecoraDevice,
        device_id: &str,
    ) -> Vec<Arc<Self>> {
        NUMBER_DESCRIPTIONS
            .iter()
            .filter(|description| reports(&device.switch, description.key))
            .filter_map(|description| {
                let base = ctx.register(
                    device,
                    device_id,
                    EntityParams {
                        platform: PLATFORM_NUMBER,
                        unique_id: format!("{}_{}", device.id, description.key),
                        name: Some(description.name),
                        category: Some(EntityCategory::Config),
                        disabled_by_default: !description.enabled_by_default,
                    },
                )?;
                Some(Arc::new(Self {
                    base,
                    description: *description,
                }))
            })
            .collect()
    }

    pub fn description(&self) -> &NumberDescription {
        &self.description
    }

    pub async fn set_value(&self, value: f64) -> Result<(), CommandError> {
        let NumberDescription { key, min, max, .. } = self.description;
        if !(min..=max).contains(&value) {
            return Err(CommandError::OutOfRange {
                entity_id: self.base.entity_id.to_string(),
                value,
                min,
                max,
            });
        }

        let int_value = value as i64;
        debug!(entity_id = %self.base.entity_id, key, int_value, "Setting number");
        let mut attributes = Map::new();
        attributes.insert(key.to_string(), json!(int_value));
        self.base
            .coordinator
            .update_switch(&self.base.serial, attributes)
            .await?;
        Ok(())
    }
}

impl DecoraEntity for NumberEntity {
    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn state(&self, switch: &IotSwitch) -> (String, HashMap<String, Value>) {
        let description = &self.description;
        let mut attributes = HashMap::new();
        attributes.insert("min".into(), json!(description.min));
        attributes.insert("max".into(), json!(description.max));
        attributes.insert("step".into(), json!(description.step));
        attributes.insert("mode".into(), json!(description.mode.as_str()));
        if let Some(unit) = description.unit {
            attributes.insert("unit_of_measurement".into(), json!(unit));
        }
        (value_state(switch.get(description.key)), attributes)
    }
}

/// `number.set_value`
pub fn register_services(services: &ServiceRegistry, index: &EntityIndex) -> ServiceResult {
    let entities = Arc::clone(index);
    services.register(
        ServiceDescription::new(PLATFORM_NUMBER, "set_value")
            .with_description("Set a Decora Wi-Fi switch setting")
            .with_target()
            .with_schema(json!({
                "type": "object",
                "properties": {"value": {"type": "number"}},
                "required": ["value"]
            })),
        move |call: ServiceCall| {
            let index = Arc::clone(&entities);
            async move {
                let value = call
                    .get::<f64>("value")
                    .ok_or_else(|| ServiceError::InvalidData("value is required".into()))?;
                for number in
                    resolve_targets(&index, &call, PLATFORM_NUMBER, PlatformEntity::as_number)?
                {
                    number.set_value(value).await?;
                }
                Ok(())
            }
        },
    )?;

    info!("Number services registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::switch;

    #[test]
    fn test_reports_only_present_fields() {
        let sw = switch(json!({"id": 1, "presetLevel": 80, "dimLED": null}));
        assert!(reports(&sw, "presetLevel"));
        assert!(!reports(&sw, "dimLED"));
        assert!(!reports(&sw, "fadeOnTime"));
    }

    #[test]
    fn test_value_state() {
        assert_eq!(value_state(Some(&json!(80))), "80");
        assert_eq!(value_state(Some(&json!("3"))), "3");
        assert_eq!(value_state(Some(&Value::Null)), "unknown");
        assert_eq!(value_state(None), "unknown");
    }

    #[test]
    fn test_descriptions() {
        let enabled: Vec<&str> = NUMBER_DESCRIPTIONS
            .iter()
            .filter(|d| d.enabled_by_default)
            .map(|d| d.key)
            .collect();
        assert_eq!(enabled, vec!["presetLevel", "dimLED"]);
        assert_eq!(NUMBER_DESCRIPTIONS[1].mode, NumberMode::Slider);
    }
}
