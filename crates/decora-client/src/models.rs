//! myLeviton response models
//!
//! The cloud returns numeric ids in some places and strings in others, so
//! every id is normalized to a `String`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

fn opt_id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Body of `POST /Person/login`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    /// Access token, sent back as the `authorization` header
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub created: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResidentialPermission {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub residential_account_id: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub residence_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Residence {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A Decora Wi-Fi switch, dimmer or fan controller
///
/// Everything except `id` is kept verbatim in `data`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IotSwitch {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl IotSwitch {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    fn int_field(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
    }

    /// Serial number, falling back to the cloud id
    pub fn serial(&self) -> &str {
        self.str_field("serial").unwrap_or(&self.id)
    }

    pub fn name(&self) -> &str {
        self.str_field("name").unwrap_or_default()
    }

    pub fn model(&self) -> &str {
        self.str_field("model").unwrap_or_default()
    }

    pub fn custom_type(&self) -> &str {
        self.str_field("customType").unwrap_or_default()
    }

    pub fn mac(&self) -> Option<&str> {
        self.str_field("mac").filter(|m| !m.is_empty())
    }

    pub fn version(&self) -> Option<&str> {
        self.str_field("version")
    }

    /// `"ON"` or `"OFF"`
    pub fn power(&self) -> Option<&str> {
        self.str_field("power")
    }

    pub fn is_on(&self) -> bool {
        self.power() == Some("ON")
    }

    /// Level in percent
    pub fn brightness(&self) -> Option<i64> {
        self.int_field("brightness")
    }

    pub fn min_level(&self) -> i64 {
        self.int_field("minLevel").unwrap_or(0)
    }

    pub fn max_level(&self) -> i64 {
        self.int_field("maxLevel").unwrap_or(100)
    }

    pub fn can_set_level(&self) -> bool {
        self.data
            .get("canSetLevel")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn connected(&self) -> bool {
        self.data
            .get("connected")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}
