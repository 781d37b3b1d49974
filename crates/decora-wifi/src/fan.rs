//! Fan platform
//!
//! Fan controllers expose four speeds through the same `brightness` field
//! dimmers use; speeds are 25, 50, 75 and 100 percent.

use std::collections::HashMap;
use std::sync::Arc;

use decora_client::IotSwitch;
use decora_core::{ServiceCall, STATE_OFF, STATE_ON};
use decora_runtime::{ServiceDescription, ServiceError, ServiceRegistry, ServiceResult};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::classification::DecoraDevice;
use crate::constants::{
    percentage_to_preset, preset_to_percentage, FAN_DEFAULT_SPEED, FAN_MAX_SPEED, FAN_SPEED_COUNT,
    FAN_SPEED_STEP, ORDERED_FAN_SPEEDS, PLATFORM_FAN,
};
use crate::entity::{
    resolve_targets, CommandError, DecoraEntity, EntityBase, EntityIndex, EntityParams,
    PlatformContext, PlatformEntity,
};

pub const SUPPORT_SET_SPEED: u32 = 1;
pub const SUPPORT_PRESET_MODE: u32 = 8;
pub const SUPPORT_TURN_OFF: u32 = 16;
pub const SUPPORT_TURN_ON: u32 = 32;

pub const SUPPORTED_FEATURES: u32 =
    SUPPORT_SET_SPEED | SUPPORT_PRESET_MODE | SUPPORT_TURN_OFF | SUPPORT_TURN_ON;

/// Round a non-zero percentage up to the next supported speed
pub fn snap_percentage(percentage: u8) -> u8 {
    let steps = percentage.min(FAN_MAX_SPEED).div_ceil(FAN_SPEED_STEP).max(1);
    steps * FAN_SPEED_STEP
}

fn speed_attributes(speed: u8) -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("power".into(), json!("ON"));
    attributes.insert("brightness".into(), json!(speed));
    attributes
}

pub struct FanEntity {
    base: EntityBase,
}

impl FanEntity {
    pub fn create(
        ctx: &PlatformContext<'_>,
        device: &DecoraDevice,
        device_id: &str,
    ) -> Option<Arc<Self>> {
        let base = ctx.register(
            device,
            device_id,
            EntityParams {
                platform: PLATFORM_FAN,
                unique_id: format!("{}_fan", device.id),
                name: None,
                category: None,
                disabled_by_default: false,
            },
        )?;
        Some(Arc::new(Self { base }))
    }

    async fn set_speed(&self, speed: u8) -> Result<(), CommandError> {
        debug!(entity_id = %self.base.entity_id, speed, "Setting fan speed");
        self.base
            .coordinator
            .update_switch(&self.base.serial, speed_attributes(speed))
            .await?;
        Ok(())
    }

    /// Preset wins over percentage; with neither the fan starts at medium
    pub async fn turn_on(
        &self,
        percentage: Option<u8>,
        preset_mode: Option<&str>,
    ) -> Result<(), CommandError> {
        match (preset_mode, percentage) {
            (Some(preset), _) => self.set_preset_mode(preset).await,
            (None, Some(percentage)) => self.set_percentage(percentage).await,
            (None, None) => self.set_speed(FAN_DEFAULT_SPEED).await,
        }
    }

    pub async fn turn_off(&self) -> Result<(), CommandError> {
        let mut attributes = Map::new();
        attributes.insert("power".into(), json!("OFF"));
        self.base
            .coordinator
            .update_switch(&self.base.serial, attributes)
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

    /// Zero turns the fan off
    pub async fn set_percentage(&self, percentage: u8) -> Result<(), CommandError> {
        if percentage == 0 {
            return self.turn_off().await;
        }
        self.set_speed(snap_percentage(percentage)).await
    }

    pub async fn set_preset_mode(&self, preset_mode: &str) -> Result<(), CommandError> {
        self.set_speed(preset_to_percentage(preset_mode)).await
    }
}

impl DecoraEntity for FanEntity {
    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn state(&self, switch: &IotSwitch) -> (String, HashMap<String, Value>) {
        let is_on = switch.is_on();
        let (percentage, preset_mode) = if is_on {
            let brightness = switch.brightness();
            (json!(brightness), json!(brightness.map(percentage_to_preset)))
        } else {
            (json!(0), Value::Null)
        };

        let mut attributes = HashMap::new();
        attributes.insert("percentage".into(), percentage);
        attributes.insert("percentage_step".into(), json!(FAN_SPEED_STEP));
        attributes.insert("preset_mode".into(), preset_mode);
        attributes.insert("preset_modes".into(), json!(ORDERED_FAN_SPEEDS));
        attributes.insert("speed_count".into(), json!(FAN_SPEED_COUNT));
        attributes.insert("supported_features".into(), json!(SUPPORTED_FEATURES));

        let state = if is_on { STATE_ON } else { STATE_OFF };
        (state.to_string(), attributes)
    }
}

fn fan_targets(
    index: &EntityIndex,
    call: &ServiceCall,
) -> Result<Vec<Arc<FanEntity>>, ServiceError> {
    resolve_targets(index, call, PLATFORM_FAN, PlatformEntity::as_fan)
}

fn percentage_schema() -> Value {
    json!({"type": "integer", "minimum": 0, "maximum": 100})
}

/// Unknown presets are accepted and run at the default speed
fn preset_schema() -> Value {
    json!({"type": "string"})
}

/// `fan.turn_on`, `fan.turn_off`, `fan.toggle`, `fan.set_percentage` and
/// `fan.set_preset_mode`
pub fn register_services(services: &ServiceRegistry, index: &EntityIndex) -> ServiceResult {
    let entities = Arc::clone(index);
    services.register(
        ServiceDescription::new(PLATFORM_FAN, "turn_on")
            .with_description("Turn on a Decora Wi-Fi fan")
            .with_target()
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "percentage": percentage_schema(),
                    "preset_mode": preset_schema()
                }
            })),
        move |call: ServiceCall| {
            let index = Arc::clone(&entities);
            async move {
                let percentage = call.get::<u8>("percentage");
                let preset_mode = call.get::<String>("preset_mode");
                for fan in fan_targets(&index, &call)? {
                    fan.turn_on(percentage, preset_mode.as_deref()).await?;
                }
                Ok(())
            }
        },
    )?;

    let entities = Arc::clone(index);
    services.register(
        ServiceDescription::new(PLATFORM_FAN, "turn_off")
            .with_description("Turn off a Decora Wi-Fi fan")
            .with_target(),
        move |call: ServiceCall| {
            let index = Arc::clone(&entities);
            async move {
                for fan in fan_targets(&index, &call)? {
                    fan.turn_off().await?;
                }
                Ok(())
            }
        },
    )?;

    let entities = Arc::clone(index);
    services.register(
        ServiceDescription::new(PLATFORM_FAN, "toggle")
            .with_description("Toggle a Decora Wi-Fi fan")
            .with_target(),
        move |call: ServiceCall| {
            let index = Arc::clone(&entities);
            async move {
                for fan in fan_targets(&index, &call)? {
                    fan.toggle().await?;
                }
                Ok(())
            }
        },
    )?;

    let entities = Arc::clone(index);
    services.register(
        ServiceDescription::new(PLATFORM_FAN, "set_percentage")
            .with_description("Set the speed of a Decora Wi-Fi fan")
            .with_target()
            .with_schema(json!({
                "type": "object",
                "properties": {"percentage": percentage_schema()},
                "required": ["percentage"]
            })),
        move |call: ServiceCall| {
            let index = Arc::clone(&entities);
            async move {
                let percentage = call
                    .get::<u8>("percentage")
                    .ok_or_else(|| ServiceError::InvalidData("percentage is required".into()))?;
                for fan in fan_targets(&index, &call)? {
                    fan.set_percentage(percentage).await?;
                }
                Ok(())
            }
        },
    )?;

    let entities = Arc::clone(index);
    services.register(
        ServiceDescription::new(PLATFORM_FAN, "set_preset_mode")
            .with_description("Set the preset speed of a Decora Wi-Fi fan")
            .with_target()
            .with_schema(json!({
                "type": "object",
                "properties": {"preset_mode": preset_schema()},
                "required": ["preset_mode"]
            })),
        move |call: ServiceCall| {
            let index = Arc::clone(&entities);
            async move {
                let preset_mode = call
                    .get::<String>("preset_mode")
                    .ok_or_else(|| ServiceError::InvalidData("preset_mode is required".into()))?;
                for fan in fan_targets(&index, &call)? {
                    fan.set_preset_mode(&preset_mode).await?;
                }
                Ok(())
            }
        },
    )?;

    info!("Fan services registered");
    Ok(())
}
