//! Service call type

use crate::{Context, EntityId};
use serde::{Deserialize, Serialize};

/// A request for a domain to perform an action (`light.turn_on`, `fan.set_percentage`, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    /// Domain owning the service (`light`)
    pub domain: String,

    /// Service name within the domain (`turn_on`)
    pub service: String,

    /// Call arguments, including any `entity_id` target
    pub service_data: serde_json::Value,

    /// Context of the caller
    pub context: Context,
}

impl ServiceCall {
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: serde_json::Value,
        context: Context,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data,
            context,
        }
    }

    /// `domain.service`
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    /// Read a field of the service data as a concrete type
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.service_data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Raw `entity_id` targets, accepting a single string or an array
    pub fn entity_ids(&self) -> Vec<String> {
        match self.service_data.get("entity_id") {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => vec![],
        }
    }

    /// Parsed targets that belong to `domain`; malformed ids are skipped
    pub fn target_entities(&self, domain: &str) -> Vec<EntityId> {
        self.entity_ids()
            .iter()
            .filter_map(|id| id.parse::<EntityId>().ok())
            .filter(|id| id.domain() == domain)
            .collect()
    }
}
