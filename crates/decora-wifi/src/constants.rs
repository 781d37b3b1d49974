use std::time::Duration;

pub const DOMAIN: &str = "decora_wifi";

pub const CONF_USERNAME: &str = "username";
pub const CONF_PASSWORD: &str = "password";
pub const CONF_DEVICE_OVERRIDES: &str = "device_overrides";

pub const MANUFACTURER: &str = "Leviton";
/// Model reported for switches that do not name one
pub const DEFAULT_MODEL: &str = "Decora WiFi";

/// Models known to be fan controllers
pub const KNOWN_FAN_MODELS: &[&str] = &["DW4SF"];

/// customType the myLeviton app assigns to fan controllers
pub const CUSTOM_TYPE_CEILING_FAN: &str = "ceiling-fan";

pub const FAN_SPEED_COUNT: u8 = 4;
pub const FAN_SPEED_STEP: u8 = 25;
pub const FAN_MIN_SPEED: u8 = 25;
pub const FAN_MAX_SPEED: u8 = 100;
/// Speed used when a fan is turned on without a speed
pub const FAN_DEFAULT_SPEED: u8 = 50;

pub const PRESET_LOW: &str = "Low";
pub const PRESET_MEDIUM: &str = "Medium";
pub const PRESET_MEDIUM_HIGH: &str = "Medium High";
pub const PRESET_HIGH: &str = "High";

/// Presets as shown to the user, fastest first
pub const ORDERED_FAN_SPEEDS: [&str; 4] = [PRESET_HIGH, PRESET_MEDIUM_HIGH, PRESET_MEDIUM, PRESET_LOW];

/// Upper percentage bound of each preset
pub const PERCENTAGE_TO_SPEED: [(u8, &str); 4] = [
    (30, PRESET_LOW),
    (55, PRESET_MEDIUM),
    (85, PRESET_MEDIUM_HIGH),
    (100, PRESET_HIGH),
];

pub const UPDATE_INTERVAL: Duration = Duration::from_secs(30);

pub const PLATFORM_LIGHT: &str = "light";
pub const PLATFORM_FAN: &str = "fan";
pub const PLATFORM_SENSOR: &str = "sensor";
pub const PLATFORM_NUMBER: &str = "number";

pub const PLATFORMS: [&str; 4] = [PLATFORM_LIGHT, PLATFORM_FAN, PLATFORM_SENSOR, PLATFORM_NUMBER];

/// Percentage for a preset name; unknown presets get the default speed
pub fn preset_to_percentage(preset: &str) -> u8 {
    match preset {
        PRESET_LOW => 25,
        PRESET_MEDIUM => 50,
        PRESET_MEDIUM_HIGH => 75,
        PRESET_HIGH => 100,
        _ => FAN_DEFAULT_SPEED,
    }
}

/// Preset name covering a percentage
pub fn percentage_to_preset(percentage: i64) -> &'static str {
    PERCENTAGE_TO_SPEED
        .iter()
        .find(|(threshold, _)| percentage <= i64::from(*threshold))
        .map(|(_, preset)| *preset)
        .unwrap_or(PRESET_HIGH)
}
