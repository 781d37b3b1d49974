//! Service registry with async handlers
//!
//! Services are keyed by `domain.service`. A service may carry a JSON schema;
//! call data is validated against it before the handler runs.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use decora_core::events::CallServiceData;
use decora_core::{Context, ServiceCall};
use jsonschema::JSONSchema;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::EventBus;

/// Outcome of a service handler
pub type ServiceResult = Result<(), ServiceError>;

pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceResult> + Send>>;

pub type ServiceHandler = Arc<dyn Fn(ServiceCall) -> ServiceFuture + Send + Sync>;

/// Why a service call did not run to completion
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Nothing is registered under `domain.service`
    #[error("service not found: {domain}.{service}")]
    NotFound { domain: String, service: String },

    /// The handler ran and reported an error
    #[error("service call failed: {0}")]
    CallFailed(String),

    /// Service data failed schema validation or could not be interpreted
    #[error("invalid service data: {0}")]
    InvalidData(String),

    /// A service was registered with a schema that does not compile
    #[error("invalid schema for {0}: {1}")]
    InvalidSchema(String, String),
}

/// Public description of a registered service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDescription {
    pub domain: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema the service data must satisfy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    /// Whether the service acts on `entity_id` targets
    pub target: bool,
}

impl ServiceDescription {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            name: None,
            description: None,
            schema: None,
            target: false,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_target(mut self) -> Self {
        self.target = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn key(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }
}

struct RegisteredService {
    handler: ServiceHandler,
    validator: Option<Arc<JSONSchema>>,
    description: ServiceDescription,
}

pub struct ServiceRegistry {
    services: DashMap<String, RegisteredService>,
    event_bus: Arc<EventBus>,
}

impl ServiceRegistry {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            services: DashMap::new(),
            event_bus,
        }
    }

    /// Register a service, replacing any previous handler for the same key
    #[instrument(skip(self, handler), fields(service = %description.key()))]
    pub fn register<F, Fut>(&self, description: ServiceDescription, handler: F) -> ServiceResult
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let key = description.key();

        let validator = match &description.schema {
            Some(schema) => {
                let compiled = JSONSchema::compile(schema)
                    .map_err(|e| ServiceError::InvalidSchema(key.clone(), e.to_string()))?;
                Some(Arc::new(compiled))
            }
            None => None,
        };

        debug!("Registering service");
        let handler: ServiceHandler = Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture);
        self.services.insert(
            key,
            RegisteredService {
                handler,
                validator,
                description,
            },
        );
        Ok(())
    }

    /// Validate `service_data`, fire `call_service` and run the handler
    #[instrument(skip(self, service_data, context))]
    pub async fn call(
        &self,
        domain: &str,
        service: &str,
        service_data: serde_json::Value,
        context: Context,
    ) -> ServiceResult {
        let key = format!("{}.{}", domain, service);

        let (handler, validator) = {
            let registered = self.services.get(&key).ok_or_else(|| {
                warn!("Service not found");
                ServiceError::NotFound {
                    domain: domain.to_string(),
                    service: service.to_string(),
                }
            })?;
            (registered.handler.clone(), registered.validator.clone())
        };

        if let Some(validator) = validator {
            if let Err(errors) = validator.validate(&service_data) {
                let message = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
                return Err(ServiceError::InvalidData(message));
            }
        }

        self.event_bus.fire_typed(
            CallServiceData {
                domain: domain.to_string(),
                service: service.to_string(),
                service_data: service_data.clone(),
            },
            context.clone(),
        );

        debug!("Calling service");
        handler(ServiceCall::new(domain, service, service_data, context)).await
    }

    pub fn has_service(&self, domain: &str, service: &str) -> bool {
        self.services.contains_key(&format!("{}.{}", domain, service))
    }

    pub fn get_service(&self, domain: &str, service: &str) -> Option<ServiceDescription> {
        self.services
            .get(&format!("{}.{}", domain, service))
            .map(|s| s.description.clone())
    }

    /// Descriptions grouped by domain, sorted by domain and service name
    pub fn all_services(&self) -> BTreeMap<String, Vec<ServiceDescription>> {
        let mut result: BTreeMap<String, Vec<ServiceDescription>> = BTreeMap::new();
        for entry in self.services.iter() {
            result
                .entry(entry.description.domain.clone())
                .or_default()
                .push(entry.description.clone());
        }
        for services in result.values_mut() {
            services.sort_by(|a, b| a.service.cmp(&b.service));
        }
        result
    }

    pub fn unregister(&self, domain: &str, service: &str) -> bool {
        self.services
            .remove(&format!("{}.{}", domain, service))
            .is_some()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decora_core::events::CALL_SERVICE;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry() -> (Arc<EventBus>, ServiceRegistry) {
        let bus = Arc::new(EventBus::new());
        (Arc::clone(&bus), ServiceRegistry::new(bus))
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let (bus, registry) = registry();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        registry
            .register(
                ServiceDescription::new("light", "turn_on").with_target(),
                move |call: ServiceCall| {
                    let counter = Arc::clone(&counter);
                    async move {
                        assert_eq!(call.entity_ids(), vec!["light.porch"]);
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .unwrap();

        let mut rx = bus.subscribe(CALL_SERVICE);
        registry
            .call(
                "light",
                "turn_on",
                json!({"entity_id": "light.porch"}),
                Context::new(),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.data["service"], "turn_on");
    }

    #[tokio::test]
    async fn test_not_found() {
        let (_bus, registry) = registry();
        let result = registry
            .call("fan", "oscillate", json!({}), Context::new())
            .await;
        assert!(matches!(result, Err(ServiceError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_schema_rejects_bad_data() {
        let (_bus, registry) = registry();
        registry
            .register(
                ServiceDescription::new("fan", "set_percentage").with_schema(json!({
                    "type": "object",
                    "properties": {
                        "percentage": {"type": "integer", "minimum": 0, "maximum": 100}
                    },
                    "required": ["percentage"]
                })),
                |_call: ServiceCall| async { Ok(()) },
            )
            .unwrap();

        let ok = registry
            .call("fan", "set_percentage", json!({"percentage": 50}), Context::new())
            .await;
        assert!(ok.is_ok());

        let too_high = registry
            .call("fan", "set_percentage", json!({"percentage": 150}), Context::new())
            .await;
        assert!(matches!(too_high, Err(ServiceError::InvalidData(_))));

        let missing = registry
            .call("fan", "set_percentage", json!({}), Context::new())
            .await;
        assert!(matches!(missing, Err(ServiceError::InvalidData(_))));
    }

    #[test]
    fn test_invalid_schema_is_rejected() {
        let (_bus, registry) = registry();
        let result = registry.register(
            ServiceDescription::new("fan", "broken").with_schema(json!({"type": 12})),
            |_call: ServiceCall| async { Ok(()) },
        );
        assert!(matches!(result, Err(ServiceError::InvalidSchema(..))));
        assert!(!registry.has_service("fan", "broken"));
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let (_bus, registry) = registry();
        registry
            .register(ServiceDescription::new("light", "turn_off"), |_call| async {
                Err(ServiceError::CallFailed("cloud unreachable".to_string()))
            })
            .unwrap();

        let result = registry
            .call("light", "turn_off", json!({}), Context::new())
            .await;
        assert!(matches!(result, Err(ServiceError::CallFailed(_))));
    }

    #[test]
    fn test_all_services_grouped() {
        let (_bus, registry) = registry();
        for (domain, service) in [("light", "turn_on"), ("light", "toggle"), ("fan", "turn_on")] {
            registry
                .register(ServiceDescription::new(domain, service), |_call| async {
                    Ok(())
                })
                .unwrap();
        }

        let all = registry.all_services();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["fan", "light"]);
        let light: Vec<&str> = all["light"].iter().map(|s| s.service.as_str()).collect();
        assert_eq!(light, vec!["toggle", "turn_on"]);

        assert!(registry.unregister("light", "toggle"));
        assert_eq!(registry.service_count(), 2);
    }
}
