//! Light/fan classification of switches
//!
//! A switch is a fan when the myLeviton app marks it as a ceiling fan or its
//! model is a known fan controller. Users can override the detection per
//! device through the options flow.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use decora_client::IotSwitch;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::constants::{CONF_DEVICE_OVERRIDES, CUSTOM_TYPE_CEILING_FAN, KNOWN_FAN_MODELS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Light,
    Fan,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Light => "light",
            DeviceType::Fan => "fan",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User choice stored in the entry options; `Auto` is never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTypeOverride {
    #[default]
    Auto,
    Light,
    Fan,
}

impl DeviceTypeOverride {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceTypeOverride::Auto => "auto",
            DeviceTypeOverride::Light => "light",
            DeviceTypeOverride::Fan => "fan",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(DeviceTypeOverride::Auto),
            "light" => Some(DeviceTypeOverride::Light),
            "fan" => Some(DeviceTypeOverride::Fan),
            _ => None,
        }
    }
}

pub fn detect_device_type(model: &str, custom_type: &str) -> DeviceType {
    if custom_type == CUSTOM_TYPE_CEILING_FAN || is_known_fan_model(model) {
        DeviceType::Fan
    } else {
        DeviceType::Light
    }
}

/// Detection from the model alone, as done during the config flow
pub fn is_known_fan_model(model: &str) -> bool {
    KNOWN_FAN_MODELS.iter().any(|fan| model.contains(fan))
}

pub fn resolve_device_type(detected: DeviceType, override_: DeviceTypeOverride) -> DeviceType {
    match override_ {
        DeviceTypeOverride::Auto => detected,
        DeviceTypeOverride::Light => DeviceType::Light,
        DeviceTypeOverride::Fan => DeviceType::Fan,
    }
}

/// `device_overrides` from config entry options; unknown values are ignored
pub fn parse_overrides(options: &Map<String, Value>) -> HashMap<String, DeviceTypeOverride> {
    let Some(raw) = options.get(CONF_DEVICE_OVERRIDES).and_then(Value::as_object) else {
        return HashMap::new();
    };

    raw.iter()
        .filter_map(|(serial, value)| {
            match value.as_str().and_then(DeviceTypeOverride::parse) {
                Some(override_) => Some((serial.clone(), override_)),
                None => {
                    warn!(%serial, %value, "Ignoring invalid device type override");
                    None
                }
            }
        })
        .collect()
}

/// A switch with its detected and effective type
#[derive(Debug, Clone, PartialEq)]
pub struct DecoraDevice {
    /// Serial number
    pub id: String,
    pub name: String,
    pub model: String,
    pub detected_type: DeviceType,
    pub device_type: DeviceType,
    pub switch: IotSwitch,
}

impl DecoraDevice {
    pub fn new(switch: IotSwitch, overrides: &HashMap<String, DeviceTypeOverride>) -> Self {
        let serial = switch.serial().to_string();
        let detected_type = detect_device_type(switch.model(), switch.custom_type());
        let override_ = overrides.get(&serial).copied().unwrap_or_default();
        let device_type = resolve_device_type(detected_type, override_);

        debug!(
            name = switch.name(),
            model = switch.model(),
            custom_type = switch.custom_type(),
            %detected_type,
            %device_type,
            "Classified device"
        );

        Self {
            id: serial,
            name: switch.name().to_string(),
            model: switch.model().to_string(),
            detected_type,
            device_type,
            switch,
        }
    }
}

/// Classify every switch, keyed by serial
pub fn build_devices(
    switches: &BTreeMap<String, IotSwitch>,
    overrides: &HashMap<String, DeviceTypeOverride>,
) -> Vec<DecoraDevice> {
    switches
        .values()
        .map(|switch| DecoraDevice::new(switch.clone(), overrides))
        .collect()
}
