//! Config and options flows
//!
//! The config flow asks for myLeviton credentials and checks them by logging
//! in and listing the account's switches. The options flow lets the user
//! force any switch to be treated as a light or a fan.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use decora_client::DecoraApi;
use decora_config_entries::{
    input_str, ConfigEntries, ConfigEntriesResult, ConfigEntry, ConfigEntrySource, FlowError,
    FlowFactory, FlowHandler, FlowStep, FormField, SelectOption, STEP_INIT, STEP_USER,
};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classification::{is_known_fan_model, parse_overrides, DeviceType, DeviceTypeOverride};
use crate::constants::{CONF_DEVICE_OVERRIDES, CONF_PASSWORD, CONF_USERNAME, DOMAIN};
use crate::setup::DecoraWifi;

pub const ERROR_INVALID_AUTH: &str = "invalid_auth";
pub const ERROR_CANNOT_CONNECT: &str = "cannot_connect";
pub const ABORT_NO_DEVICES: &str = "no_devices";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("myLeviton rejected the credentials")]
    InvalidAuth,
    #[error("cannot reach myLeviton: {0}")]
    CannotConnect(String),
}

impl CredentialsError {
    /// Form error key shown to the user
    pub fn form_error(&self) -> &'static str {
        match self {
            CredentialsError::InvalidAuth => ERROR_INVALID_AUTH,
            CredentialsError::CannotConnect(_) => ERROR_CANNOT_CONNECT,
        }
    }
}

/// A switch as listed by the options flow
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub model: String,
    pub detected_type: DeviceType,
}

impl DiscoveredDevice {
    /// Form field name for this device
    pub fn label(&self) -> String {
        let model = if self.model.is_empty() {
            "Unknown"
        } else {
            self.model.as_str()
        };
        format!("{} ({})", self.name, model)
    }
}

/// Log in, list the account's switches and log out again
///
/// Detection here only looks at the model; the coordinator also considers
/// customType once the entry is set up.
pub async fn validate_credentials(
    api: &dyn DecoraApi,
    username: &str,
    password: &str,
) -> Result<Vec<DiscoveredDevice>, CredentialsError> {
    if let Err(err) = api.login(username, password).await {
        return Err(if err.is_auth_error() {
            CredentialsError::InvalidAuth
        } else {
            CredentialsError::CannotConnect(err.to_string())
        });
    }

    let switches = api.discover_switches().await;
    if let Err(err) = api.logout().await {
        debug!(%err, "Logout after validation failed");
    }
    let switches = switches.map_err(|err| CredentialsError::CannotConnect(err.to_string()))?;

    let devices: Vec<DiscoveredDevice> = switches
        .iter()
        .map(|switch| DiscoveredDevice {
            id: switch.serial().to_string(),
            name: switch.name().to_string(),
            model: switch.model().to_string(),
            detected_type: if is_known_fan_model(switch.model()) {
                DeviceType::Fan
            } else {
                DeviceType::Light
            },
        })
        .collect();

    info!(
        count = devices.len(),
        names = ?devices.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        "Found Decora Wi-Fi devices"
    );
    Ok(devices)
}

async fn check_credentials(
    integration: &DecoraWifi,
    username: &str,
    password: &str,
) -> Result<Vec<DiscoveredDevice>, CredentialsError> {
    let api = integration
        .new_api()
        .map_err(|err| CredentialsError::CannotConnect(err.to_string()))?;
    validate_credentials(api.as_ref(), username, password).await
}

fn entry_title(username: &str) -> String {
    format!("Decora WiFi ({})", username)
}

fn entry_contents(username: &str, password: &str) -> (Map<String, Value>, Map<String, Value>) {
    let mut data = Map::new();
    data.insert(CONF_USERNAME.into(), json!(username));
    data.insert(CONF_PASSWORD.into(), json!(password));
    let mut options = Map::new();
    options.insert(CONF_DEVICE_OVERRIDES.into(), json!({}));
    (data, options)
}

fn user_form() -> FlowStep {
    FlowStep::form(
        STEP_USER,
        vec![
            FormField::string(CONF_USERNAME).required(),
            FormField::password(CONF_PASSWORD).required(),
        ],
    )
}

/// Credential entry
pub struct UserFlow {
    integration: Arc<DecoraWifi>,
}

#[async_trait]
impl FlowHandler for UserFlow {
    async fn step(&mut self, step_id: &str, user_input: Option<Value>) -> Result<FlowStep, FlowError> {
        if step_id != STEP_USER {
            return Err(FlowError::UnknownStep(step_id.to_string()));
        }
        let Some(input) = user_input else {
            return Ok(user_form());
        };

        let username = input_str(&input, CONF_USERNAME)?;
        let password = input_str(&input, CONF_PASSWORD)?;

        if let Err(err) = check_credentials(&self.integration, username, password).await {
            warn!(%err, "Credential check failed");
            return Ok(user_form().with_error("base", err.form_error()));
        }

        let (data, options) = entry_contents(username, password);
        Ok(FlowStep::CreateEntry {
            title: entry_title(username),
            data,
            options,
            unique_id: Some(username.to_lowercase()),
        })
    }
}

/// Per-device light/fan overrides
pub struct OptionsFlow {
    integration: Arc<DecoraWifi>,
    entry: ConfigEntry,
    devices: Vec<DiscoveredDevice>,
}

impl OptionsFlow {
    /// Devices from the running coordinator, else from a fresh login
    ///
    /// A loaded coordinator is trusted even when it found no devices.
    async fn load_devices(&self) -> Result<Vec<DiscoveredDevice>, CredentialsError> {
        if let Some(coordinator) = self.integration.coordinator(&self.entry.entry_id) {
            let data = coordinator.data().await;
            return Ok(data
                .devices
                .iter()
                .map(|device| DiscoveredDevice {
                    id: device.id.clone(),
                    name: device.name.clone(),
                    model: device.model.clone(),
                    detected_type: device.detected_type,
                })
                .collect());
        }

        let username = self.entry.data_str(CONF_USERNAME).unwrap_or_default();
        let password = self.entry.data_str(CONF_PASSWORD).unwrap_or_default();
        check_credentials(&self.integration, username, password).await
    }

    /// Field name per device; repeated labels get the serial appended
    fn labels(&self) -> Vec<(String, &DiscoveredDevice)> {
        let mut seen = HashMap::new();
        self.devices
            .iter()
            .map(|device| {
                let label = device.label();
                let count = seen.entry(label.clone()).or_insert(0usize);
                *count += 1;
                if *count > 1 {
                    (format!("{} [{}]", label, device.id), device)
                } else {
                    (label, device)
                }
            })
            .collect()
    }

    fn form(&self) -> FlowStep {
        let current = parse_overrides(&self.entry.options);
        let fields = self
            .labels()
            .into_iter()
            .map(|(label, device)| {
                let default = current.get(&device.id).copied().unwrap_or_default();
                FormField::select(
                    label,
                    vec![
                        SelectOption::new(
                            DeviceTypeOverride::Auto.as_str(),
                            format!("Auto ({})", device.detected_type),
                        ),
                        SelectOption::new(DeviceTypeOverride::Light.as_str(), "Light"),
                        SelectOption::new(DeviceTypeOverride::Fan.as_str(), "Fan"),
                    ],
                )
                .required()
                .default_value(default.as_str())
            })
            .collect();

        FlowStep::form(STEP_INIT, fields)
            .with_placeholder("devices", self.devices.len().to_string())
    }

    /// Serial -> override for every non-auto selection
    fn overrides_from_input(&self, input: &Value) -> Map<String, Value> {
        let mut overrides = Map::new();
        for (label, device) in self.labels() {
            let Some(selected) = input.get(&label).and_then(Value::as_str) else {
                continue;
            };
            match DeviceTypeOverride::parse(selected) {
                Some(DeviceTypeOverride::Auto) => {}
                Some(override_) => {
                    overrides.insert(device.id.clone(), json!(override_.as_str()));
                }
                None => warn!(%label, %selected, "Ignoring unknown device type"),
            }
        }
        overrides
    }
}

#[async_trait]
impl FlowHandler for OptionsFlow {
    async fn step(&mut self, step_id: &str, user_input: Option<Value>) -> Result<FlowStep, FlowError> {
        if step_id != STEP_INIT {
            return Err(FlowError::UnknownStep(step_id.to_string()));
        }

        if self.devices.is_empty() {
            match self.load_devices().await {
                Ok(devices) => self.devices = devices,
                Err(err) => {
                    warn!(%err, "Failed to fetch devices for options");
                    return Ok(FlowStep::abort(ERROR_CANNOT_CONNECT));
                }
            }
        }
        if self.devices.is_empty() {
            return Ok(FlowStep::abort(ABORT_NO_DEVICES));
        }

        let Some(input) = user_input else {
            return Ok(self.form());
        };

        let mut options = self.entry.options.clone();
        options.insert(
            CONF_DEVICE_OVERRIDES.into(),
            Value::Object(self.overrides_from_input(&input)),
        );
        Ok(FlowStep::CreateEntry {
            title: String::new(),
            data: options,
            options: Map::new(),
            unique_id: None,
        })
    }
}

/// Flow factory registered with the flow manager
pub struct DecoraFlowFactory {
    integration: Arc<DecoraWifi>,
}

impl DecoraFlowFactory {
    pub fn new(integration: Arc<DecoraWifi>) -> Self {
        Self { integration }
    }
}

impl FlowFactory for DecoraFlowFactory {
    fn config_flow(&self) -> Box<dyn FlowHandler> {
        Box::new(UserFlow {
            integration: Arc::clone(&self.integration),
        })
    }

    fn options_flow(&self, entry: &ConfigEntry) -> Option<Box<dyn FlowHandler>> {
        Some(Box::new(OptionsFlow {
            integration: Arc::clone(&self.integration),
            entry: entry.clone(),
            devices: Vec::new(),
        }))
    }
}

/// Create an `import` entry for credentials given in YAML
///
/// Returns None when the account already has an entry, whatever its source.
pub async fn import_credentials(
    entries: &ConfigEntries,
    username: &str,
    password: &str,
) -> ConfigEntriesResult<Option<ConfigEntry>> {
    let unique_id = username.to_lowercase();
    if entries.get_by_unique_id(DOMAIN, &unique_id).is_some() {
        debug!(%username, "Account already configured, skipping import");
        return Ok(None);
    }

    let (data, options) = entry_contents(username, password);
    let entry = ConfigEntry::new(DOMAIN, entry_title(username))
        .with_data(data)
        .with_options(options)
        .with_unique_id(unique_id)
        .with_source(ConfigEntrySource::Import);
    let entry = entries.add(entry).await?;
    info!(entry_id = %entry.entry_id, "Imported credentials from YAML");
    Ok(Some(entry))
}
