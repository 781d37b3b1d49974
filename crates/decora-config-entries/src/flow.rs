//! Data entry flows
//!
//! A flow is a short conversation with the user that ends in a new config
//! entry (config flow) or new options for an existing one (options flow).
//! Integrations implement [`FlowHandler`] for each step sequence and register
//! a [`FlowFactory`] that creates them; the [`FlowManager`] keeps flows in
//! progress keyed by a ULID and turns their final step into entries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::entry::{ConfigEntry, ConfigEntrySource, ConfigEntryUpdate};
use crate::manager::{ConfigEntries, ConfigEntriesError};

/// First step of every config flow
pub const STEP_USER: &str = "user";
/// First step of every options flow
pub const STEP_INIT: &str = "init";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Flow not found: {0}")]
    UnknownFlow(String),

    #[error("No flow handler for domain {0}")]
    UnknownHandler(String),

    #[error("Config entry not found: {0}")]
    UnknownEntry(String),

    #[error("Domain {0} has no options flow")]
    NoOptionsFlow(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Invalid user input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    ConfigEntries(#[from] ConfigEntriesError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
}

/// What the client sees after each step
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    /// Integration domain
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Always present, empty unless this is a form
    pub data_schema: Vec<FormField>,
    pub errors: Option<HashMap<String, String>>,
    pub description_placeholders: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Summary of the created or updated entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl FlowResult {
    fn new(flow_id: &str, handler: &str, result_type: FlowResultType) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            handler: handler.to_string(),
            result_type,
            step_id: None,
            data_schema: Vec::new(),
            errors: None,
            description_placeholders: None,
            title: None,
            reason: None,
            result: None,
        }
    }

    fn abort(flow_id: &str, handler: &str, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(flow_id, handler, FlowResultType::Abort)
        }
    }
}

/// One field of a form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<SelectOption>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

impl SelectOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

impl FormField {
    fn with_type(name: impl Into<String>, field_type: &str) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.to_string(),
            required: None,
            default: None,
            options: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::with_type(name, "string")
    }

    pub fn password(name: impl Into<String>) -> Self {
        Self::with_type(name, "password")
    }

    pub fn select(name: impl Into<String>, options: Vec<SelectOption>) -> Self {
        Self {
            options: Some(options),
            ..Self::with_type(name, "select")
        }
    }

    pub fn required(mut self) -> Self {
        self.required = Some(true);
        self
    }

    pub fn default_value(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Outcome of one flow step
#[derive(Debug, Clone)]
pub enum FlowStep {
    Form {
        step_id: String,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
        description_placeholders: HashMap<String, String>,
    },
    CreateEntry {
        title: String,
        /// Entry data for config flows, the new options for options flows
        data: Map<String, Value>,
        options: Map<String, Value>,
        unique_id: Option<String>,
    },
    Abort {
        reason: String,
    },
}

impl FlowStep {
    pub fn form(step_id: impl Into<String>, data_schema: Vec<FormField>) -> Self {
        FlowStep::Form {
            step_id: step_id.into(),
            data_schema,
            errors: HashMap::new(),
            description_placeholders: HashMap::new(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        FlowStep::Abort {
            reason: reason.into(),
        }
    }

    /// Attach a form error; `base` is the key for errors not tied to a field
    pub fn with_error(mut self, field: impl Into<String>, error: impl Into<String>) -> Self {
        if let FlowStep::Form { ref mut errors, .. } = self {
            errors.insert(field.into(), error.into());
        }
        self
    }

    pub fn with_placeholder(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let FlowStep::Form {
            ref mut description_placeholders,
            ..
        } = self
        {
            description_placeholders.insert(key.into(), value.into());
        }
        self
    }
}

/// Step logic of one flow
#[async_trait]
pub trait FlowHandler: Send {
    /// Run `step_id`; `user_input` is None when the step is first shown
    async fn step(&mut self, step_id: &str, user_input: Option<Value>) -> Result<FlowStep, FlowError>;
}

/// Creates flows for one integration domain
pub trait FlowFactory: Send + Sync {
    fn config_flow(&self) -> Box<dyn FlowHandler>;

    fn options_flow(&self, _entry: &ConfigEntry) -> Option<Box<dyn FlowHandler>> {
        None
    }
}

/// Required string field of a form submission
pub fn input_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, FlowError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| FlowError::InvalidInput(format!("{} is required", key)))
}

#[derive(Debug, Clone)]
enum FlowKind {
    Config,
    Options { entry_id: String },
}

struct ActiveFlow {
    domain: String,
    kind: FlowKind,
    step_id: String,
    handler: Box<dyn FlowHandler>,
    last: FlowResult,
}

pub struct FlowManager {
    entries: Arc<ConfigEntries>,
    factories: DashMap<String, Arc<dyn FlowFactory>>,
    flows: DashMap<String, Arc<Mutex<ActiveFlow>>>,
}

impl FlowManager {
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        Self {
            entries,
            factories: DashMap::new(),
            flows: DashMap::new(),
        }
    }

    pub fn register(&self, domain: impl Into<String>, factory: Arc<dyn FlowFactory>) {
        self.factories.insert(domain.into(), factory);
    }

    fn factory(&self, domain: &str) -> Result<Arc<dyn FlowFactory>, FlowError> {
        self.factories
            .get(domain)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| FlowError::UnknownHandler(domain.to_string()))
    }

    /// Whether the entry's integration offers an options flow
    pub fn supports_options(&self, entry: &ConfigEntry) -> bool {
        self.factory(&entry.domain)
            .map(|factory| factory.options_flow(entry).is_some())
            .unwrap_or(false)
    }

    /// Start a config flow for `domain` and show its first step
    pub async fn start_config_flow(&self, domain: &str) -> Result<FlowResult, FlowError> {
        let handler = self.factory(domain)?.config_flow();
        self.start(domain.to_string(), FlowKind::Config, STEP_USER, handler)
            .await
    }

    /// Start an options flow for an existing entry
    pub async fn start_options_flow(&self, entry_id: &str) -> Result<FlowResult, FlowError> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| FlowError::UnknownEntry(entry_id.to_string()))?;
        let handler = self
            .factory(&entry.domain)?
            .options_flow(&entry)
            .ok_or_else(|| FlowError::NoOptionsFlow(entry.domain.clone()))?;
        let kind = FlowKind::Options {
            entry_id: entry.entry_id.clone(),
        };
        self.start(entry.domain, kind, STEP_INIT, handler).await
    }

    async fn start(
        &self,
        domain: String,
        kind: FlowKind,
        step_id: &str,
        handler: Box<dyn FlowHandler>,
    ) -> Result<FlowResult, FlowError> {
        let flow_id = ulid::Ulid::new().to_string();
        debug!(%flow_id, %domain, ?kind, "Starting flow");

        let mut flow = ActiveFlow {
            last: FlowResult::new(&flow_id, &domain, FlowResultType::Form),
            domain,
            kind,
            step_id: step_id.to_string(),
            handler,
        };
        let step = flow.handler.step(step_id, None).await?;
        let result = self.apply_step(&flow_id, &mut flow, step).await?;
        if result.result_type == FlowResultType::Form {
            self.flows
                .insert(flow_id, Arc::new(Mutex::new(flow)));
        }
        Ok(result)
    }

    /// Submit `user_input` to the flow's current step
    pub async fn progress(&self, flow_id: &str, user_input: Value) -> Result<FlowResult, FlowError> {
        let flow = self
            .flows
            .get(flow_id)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
        let mut flow = flow.lock().await;

        let step_id = flow.step_id.clone();
        let step = flow.handler.step(&step_id, Some(user_input)).await?;
        let result = self.apply_step(flow_id, &mut flow, step).await?;
        if result.result_type != FlowResultType::Form {
            self.flows.remove(flow_id);
        }
        Ok(result)
    }

    async fn apply_step(
        &self,
        flow_id: &str,
        flow: &mut ActiveFlow,
        step: FlowStep,
    ) -> Result<FlowResult, FlowError> {
        let result = match step {
            FlowStep::Form {
                step_id,
                data_schema,
                errors,
                description_placeholders,
            } => {
                flow.step_id = step_id.clone();
                FlowResult {
                    step_id: Some(step_id),
                    data_schema,
                    errors: (!errors.is_empty()).then_some(errors),
                    description_placeholders: (!description_placeholders.is_empty())
                        .then_some(description_placeholders),
                    ..FlowResult::new(flow_id, &flow.domain, FlowResultType::Form)
                }
            }
            FlowStep::Abort { reason } => {
                info!(flow_id, %reason, "Flow aborted");
                FlowResult::abort(flow_id, &flow.domain, reason)
            }
            FlowStep::CreateEntry {
                title,
                data,
                options,
                unique_id,
            } => match flow.kind.clone() {
                FlowKind::Config => {
                    self.create_entry(flow_id, &flow.domain, title, data, options, unique_id)
                        .await?
                }
                FlowKind::Options { entry_id } => {
                    let entry = self
                        .entries
                        .update(&entry_id, ConfigEntryUpdate::new().options(data))
                        .await?;
                    FlowResult {
                        title: Some(title),
                        result: Some(entry_summary(&entry)),
                        ..FlowResult::new(flow_id, &flow.domain, FlowResultType::CreateEntry)
                    }
                }
            },
        };
        flow.last = result.clone();
        Ok(result)
    }

    async fn create_entry(
        &self,
        flow_id: &str,
        domain: &str,
        title: String,
        data: Map<String, Value>,
        options: Map<String, Value>,
        unique_id: Option<String>,
    ) -> Result<FlowResult, FlowError> {
        let mut entry = ConfigEntry::new(domain, title.clone())
            .with_data(data)
            .with_options(options)
            .with_source(ConfigEntrySource::User);
        if let Some(unique_id) = unique_id {
            entry = entry.with_unique_id(unique_id);
        }

        let entry = match self.entries.add(entry).await {
            Ok(entry) => entry,
            Err(ConfigEntriesError::AlreadyExists { .. }) => {
                return Ok(FlowResult::abort(flow_id, domain, "already_configured"));
            }
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = self.entries.setup(&entry.entry_id).await {
            warn!(entry_id = %entry.entry_id, %err, "New config entry failed to set up");
        }

        Ok(FlowResult {
            title: Some(title),
            result: Some(entry_summary(&entry)),
            ..FlowResult::new(flow_id, domain, FlowResultType::CreateEntry)
        })
    }

    /// Last result of a flow still in progress
    pub async fn get(&self, flow_id: &str) -> Option<FlowResult> {
        let flow = self.flows.get(flow_id).map(|f| Arc::clone(f.value()))?;
        let flow = flow.lock().await;
        Some(flow.last.clone())
    }

    pub fn abort(&self, flow_id: &str) -> Result<(), FlowError> {
        self.flows
            .remove(flow_id)
            .map(|_| debug!(flow_id, "Flow removed"))
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))
    }

    /// Flow ids of every flow waiting for input
    pub fn in_progress(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.flows.iter().map(|f| f.key().clone()).collect();
        ids.sort();
        ids
    }
}

fn entry_summary(entry: &ConfigEntry) -> Value {
    json!({
        "entry_id": entry.entry_id,
        "domain": entry.domain,
        "title": entry.title,
        "source": entry.source,
        "state": entry.state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{IntegrationHandler, SetupError};
    use decora_runtime::Hub;
    use tempfile::TempDir;

    /// Two-step config flow: ask for a name, create an entry keyed by it
    struct NameFlow;

    #[async_trait]
    impl FlowHandler for NameFlow {
        async fn step(
            &mut self,
            step_id: &str,
            user_input: Option<Value>,
        ) -> Result<FlowStep, FlowError> {
            let form = FlowStep::form(STEP_USER, vec![FormField::string("name").required()]);
            match (step_id, user_input) {
                (STEP_USER, None) => Ok(form),
                (STEP_USER, Some(input)) => {
                    let name = input_str(&input, "name")?;
                    if name == "bad" {
                        return Ok(form.with_error("base", "invalid_auth"));
                    }
                    let mut data = Map::new();
                    data.insert("name".into(), json!(name));
                    Ok(FlowStep::CreateEntry {
                        title: name.to_string(),
                        data,
                        options: Map::new(),
                        unique_id: Some(name.to_lowercase()),
                    })
                }
                (other, _) => Err(FlowError::UnknownStep(other.to_string())),
            }
        }
    }

    struct ColorOptions;

    #[async_trait]
    impl FlowHandler for ColorOptions {
        async fn step(
            &mut self,
            _step_id: &str,
            user_input: Option<Value>,
        ) -> Result<FlowStep, FlowError> {
            match user_input {
                None => Ok(FlowStep::form(
                    STEP_INIT,
                    vec![FormField::select(
                        "color",
                        vec![SelectOption::new("red", "Red"), SelectOption::new("blue", "Blue")],
                    )
                    .default_value("red")],
                )
                .with_placeholder("devices", "2")),
                Some(input) => {
                    let mut options = Map::new();
                    options.insert("color".into(), json!(input_str(&input, "color")?));
                    Ok(FlowStep::CreateEntry {
                        title: String::new(),
                        data: options,
                        options: Map::new(),
                        unique_id: None,
                    })
                }
            }
        }
    }

    struct TestFactory;

    impl FlowFactory for TestFactory {
        fn config_flow(&self) -> Box<dyn FlowHandler> {
            Box::new(NameFlow)
        }

        fn options_flow(&self, _entry: &ConfigEntry) -> Option<Box<dyn FlowHandler>> {
            Some(Box::new(ColorOptions))
        }
    }

    struct NoopIntegration;

    #[async_trait]
    impl IntegrationHandler for NoopIntegration {
        async fn setup_entry(
            &self,
            _entries: Arc<ConfigEntries>,
            _entry: &ConfigEntry,
        ) -> Result<(), SetupError> {
            Ok(())
        }

        async fn unload_entry(&self, _entry: &ConfigEntry) -> Result<(), String> {
            Ok(())
        }
    }

    fn flows() -> (TempDir, Arc<ConfigEntries>, FlowManager) {
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(Hub::new(dir.path())));
        entries.register_handler("test", Arc::new(NoopIntegration));
        let manager = FlowManager::new(Arc::clone(&entries));
        manager.register("test", Arc::new(TestFactory));
        (dir, entries, manager)
    }

    #[tokio::test]
    async fn test_config_flow_creates_and_sets_up_entry() {
        let (_dir, entries, manager) = flows();

        let form = manager.start_config_flow("test").await.unwrap();
        assert_eq!(form.result_type, FlowResultType::Form);
        assert_eq!(form.step_id.as_deref(), Some(STEP_USER));
        assert_eq!(form.data_schema[0].name, "name");
        assert_eq!(manager.in_progress(), vec![form.flow_id.clone()]);

        let done = manager
            .progress(&form.flow_id, json!({"name": "Kitchen"}))
            .await
            .unwrap();
        assert_eq!(done.result_type, FlowResultType::CreateEntry);
        assert_eq!(done.title.as_deref(), Some("Kitchen"));
        assert!(manager.in_progress().is_empty());

        let entry = entries.get_by_unique_id("test", "kitchen").unwrap();
        assert!(entry.is_loaded());
        assert_eq!(entry.data_str("name"), Some("Kitchen"));
    }

    #[tokio::test]
    async fn test_form_errors_keep_flow_open() {
        let (_dir, _entries, manager) = flows();
        let form = manager.start_config_flow("test").await.unwrap();

        let retry = manager
            .progress(&form.flow_id, json!({"name": "bad"}))
            .await
            .unwrap();
        assert_eq!(retry.result_type, FlowResultType::Form);
        assert_eq!(retry.errors.unwrap()["base"], "invalid_auth");

        let current = manager.get(&form.flow_id).await.unwrap();
        assert_eq!(current.result_type, FlowResultType::Form);
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_aborts() {
        let (_dir, _entries, manager) = flows();
        for expected in [FlowResultType::CreateEntry, FlowResultType::Abort] {
            let form = manager.start_config_flow("test").await.unwrap();
            let result = manager
                .progress(&form.flow_id, json!({"name": "Kitchen"}))
                .await
                .unwrap();
            assert_eq!(result.result_type, expected);
        }

        let form = manager.start_config_flow("test").await.unwrap();
        let result = manager
            .progress(&form.flow_id, json!({"name": "kitchen"}))
            .await
            .unwrap();
        assert_eq!(result.reason.as_deref(), Some("already_configured"));
    }

    #[tokio::test]
    async fn test_options_flow_updates_entry() {
        let (_dir, entries, manager) = flows();
        let entry = entries
            .add(ConfigEntry::new("test", "Test"))
            .await
            .unwrap();

        assert!(manager.supports_options(&entry));
        assert!(!manager.supports_options(&ConfigEntry::new("other", "Other")));

        let form = manager.start_options_flow(&entry.entry_id).await.unwrap();
        assert_eq!(form.step_id.as_deref(), Some(STEP_INIT));
        assert_eq!(form.data_schema[0].default, Some(json!("red")));
        assert_eq!(form.description_placeholders.unwrap()["devices"], "2");

        let done = manager
            .progress(&form.flow_id, json!({"color": "blue"}))
            .await
            .unwrap();
        assert_eq!(done.result_type, FlowResultType::CreateEntry);
        assert_eq!(entries.get(&entry.entry_id).unwrap().options["color"], "blue");
    }

    #[tokio::test]
    async fn test_abort_and_unknown_flows() {
        let (_dir, _entries, manager) = flows();
        let form = manager.start_config_flow("test").await.unwrap();

        manager.abort(&form.flow_id).unwrap();
        assert!(matches!(
            manager.abort(&form.flow_id),
            Err(FlowError::UnknownFlow(_))
        ));
        assert!(matches!(
            manager.progress(&form.flow_id, json!({})).await,
            Err(FlowError::UnknownFlow(_))
        ));
        assert!(matches!(
            manager.start_config_flow("nope").await,
            Err(FlowError::UnknownHandler(_))
        ));
        assert!(matches!(
            manager.start_options_flow("missing").await,
            Err(FlowError::UnknownEntry(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_field_is_invalid_input() {
        let (_dir, _entries, manager) = flows();
        let form = manager.start_config_flow("test").await.unwrap();
        assert!(matches!(
            manager.progress(&form.flow_id, json!({})).await,
            Err(FlowError::InvalidInput(_))
        ));
    }
}
