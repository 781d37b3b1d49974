//! Light platform
//!
//! Dimmers and plain switches. myLeviton reports brightness in percent of
//! the switch's own range; the state store uses 0..=255.

use std::collections::HashMap;
use std::sync::Arc;

use decora_client::IotSwitch;
use decora_core::{ServiceCall, STATE_OFF, STATE_ON};
use decora_runtime::{ServiceDescription, ServiceError, ServiceRegistry, ServiceResult};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::classification::DecoraDevice;
use crate::constants::PLATFORM_LIGHT;
use crate::entity::{
    resolve_targets, CommandError, DecoraEntity, EntityBase, EntityIndex, EntityParams,
    PlatformContext, PlatformEntity,
};

pub const SUPPORT_TRANSITION: u32 = 32;

pub const COLOR_MODE_BRIGHTNESS: &str = "brightness";
pub const COLOR_MODE_ONOFF: &str = "onoff";

/// Switch level in percent to 0..=255
pub fn to_ha_brightness(level: i64) -> i64 {
    level * 255 / 100
}

/// 0..=255 to a switch level, never below the switch's minimum
pub fn to_level(brightness: u8, min_level: i64, max_level: i64) -> i64 {
    (i64::from(brightness) * max_level / 255).max(min_level)
}

/// Attributes sent to the switch for `turn_on`
pub fn turn_on_attributes(
    switch: &IotSwitch,
    brightness: Option<u8>,
    transition: Option<f64>,
) -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("power".into(), json!("ON"));

    if let Some(brightness) = brightness {
        let level = to_level(brightness, switch.min_level(), switch.max_level());
        attributes.insert("brightness".into(), json!(level));
    }

    if let Some(transition) = transition {
        let seconds = transition as i64;
        attributes.insert("fadeOnTime".into(), json!(seconds));
        attributes.insert("fadeOffTime".into(), json!(seconds));
    }

    attributes
}

fn power_attributes(power: &str) -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("power".into(), json!(power));
    attributes
}

pub struct LightEntity {
    base: EntityBase,
}

impl LightEntity {
    pub fn create(
        ctx: &PlatformContext<'_>,
        device: &DecoraDevice,
        device_id: &str,
    ) -> Option<Arc<Self>> {
        let base = ctx.register(
            device,
            device_id,
            EntityParams {
                platform: PLATFORM_LIGHT,
                unique_id: device.id.clone(),
                name: None,
                category: None,
                disabled_by_default: false,
            },
        )?;
        Some(Arc::new(Self { base }))
    }

    pub async fn turn_on(
        &self,
        brightness: Option<u8>,
        transition: Option<f64>,
    ) -> Result<(), CommandError> {
        let Some(switch) = self.base.switch().await else {
            return Ok(());
        };
        let attributes = turn_on_attributes(&switch, brightness, transition);
        debug!(entity_id = %self.base.entity_id, ?attributes, "Turning on light");
        self.base
            .coordinator
            .update_switch(&self.base.serial, attributes)
            .await?;
        Ok(())
    }

    pub async fn turn_off(&self) -> Result<(), CommandError> {
        debug!(entity_id = %self.base.entity_id, "Turning off light");
        self.base
            .coordinator
            .update_switch(&self.base.serial, power_attributes("OFF"))
            .await?;
        Ok(())
    }

    pub async fn toggle(&self) -> Result<(), CommandError> {
        match self.base.switch().await {
            Some(switch) if switch.is_on() => self.turn_off().await,
            Some(_) => self.turn_on(None, None).await,
            None => Ok(()),
        }
    }
}

impl DecoraEntity for LightEntity {
    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn state(&self, switch: &IotSwitch) -> (String, HashMap<String, Value>) {
        let dimmable = switch.can_set_level();
        let color_mode = if dimmable {
            COLOR_MODE_BRIGHTNESS
        } else {
            COLOR_MODE_ONOFF
        };
        let is_on = switch.is_on();

        let mut attributes = HashMap::new();
        attributes.insert("color_mode".into(), json!(color_mode));
        attributes.insert("supported_color_modes".into(), json!([color_mode]));
        attributes.insert(
            "supported_features".into(),
            json!(if dimmable { SUPPORT_TRANSITION } else { 0 }),
        );
        let brightness = switch.brightness().filter(|_| is_on).map(to_ha_brightness);
        attributes.insert("brightness".into(), json!(brightness));

        let state = if is_on { STATE_ON } else { STATE_OFF };
        (state.to_string(), attributes)
    }
}

fn light_targets(
    index: &EntityIndex,
    call: &ServiceCall,
) -> Result<Vec<Arc<LightEntity>>, ServiceError> {
    resolve_targets(index, call, PLATFORM_LIGHT, PlatformEntity::as_light)
}

/// `light.turn_on`, `light.turn_off` and `light.toggle`
pub fn register_services(services: &ServiceRegistry, index: &EntityIndex) -> ServiceResult {
    let entities = Arc::clone(index);
    services.register(
        ServiceDescription::new(PLATFORM_LIGHT, "turn_on")
            .with_description("Turn on a Decora Wi-Fi light")
            .with_target()
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "brightness": {"type": "integer", "minimum": 0, "maximum": 255},
                    "transition": {"type": "number", "minimum": 0}
                }
            })),
        move |call: ServiceCall| {
            let index = Arc::clone(&entities);
            async move {
                let brightness = call.get::<u8>("brightness");
                let transition = call.get::<f64>("transition");
                for light in light_targets(&index, &call)? {
                    light.turn_on(brightness, transition).await?;
                }
                Ok(())
            }
        },
    )?;

    let entities = Arc::clone(index);
    services.register(
        ServiceDescription::new(PLATFORM_LIGHT, "turn_off")
            .with_description("Turn off a Decora Wi-Fi light")
            .with_target(),
        move |call: ServiceCall| {
            let index = Arc::clone(&entities);
            async move {
                for light in light_targets(&index, &call)? {
                    light.turn_off().await?;
                }
                Ok(())
            }
        },
    )?;

    let entities = Arc::clone(index);
    services.register(
        ServiceDescription::new(PLATFORM_LIGHT, "toggle")
            .with_description("Toggle a Decora Wi-Fi light")
            .with_target(),
        move |call: ServiceCall| {
            let index = Arc::clone(&entities);
            async move {
                for light in light_targets(&index, &call)? {
                    light.toggle().await?;
                }
                Ok(())
            }
        },
    )?;

    info!("Light services registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::switch;

    #[test]
    fn test_brightness_scaling() {
        assert_eq!(to_ha_brightness(100), 255);
        assert_eq!(to_ha_brightness(50), 127);
        assert_eq!(to_ha_brightness(0), 0);

        assert_eq!(to_level(255, 0, 100), 100);
        assert_eq!(to_level(128, 0, 100), 50);
        assert_eq!(to_level(1, 10, 100), 10);
        assert_eq!(to_level(255, 5, 90), 90);
    }

    #[test]
    fn test_turn_on_attributes() {
        let dimmer = switch(json!({"id": 1, "minLevel": 10, "maxLevel": 100, "canSetLevel": true}));

        let plain = turn_on_attributes(&dimmer, None, None);
        assert_eq!(Value::Object(plain), json!({"power": "ON"}));

        let full = turn_on_attributes(&dimmer, Some(0), Some(2.7));
        assert_eq!(
            Value::Object(full),
            json!({"power": "ON", "brightness": 10, "fadeOnTime": 2, "fadeOffTime": 2})
        );
    }
}
