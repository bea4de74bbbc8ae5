use std::fmt;
use chrono::Utc;
use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use thiserror::Error;
use crate::protocol::{FIELD_ADDR, FIELD_NAME, FIELD_TIMESTAMP, FIELD_TYPE};

/// Why a datagram could not be turned into a descriptor
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is JSON but not an object")]
    NotAnObject,
}

/// A service announcement as carried on the wire.
///
/// The document is opaque apart from `type`, `addr` and `name`; every other
/// field (`ip`, `port`, `timestamp`, ...) is passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceDescriptor(Map<String, Value>);

impl ServiceDescriptor {
    /// Start an announcement for a service of `service_type` reachable at `addr`
    pub fn announce(service_type: impl Into<String>, addr: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(FIELD_TYPE.to_string(), Value::String(service_type.into()));
        fields.insert(FIELD_ADDR.to_string(), Value::String(addr.into()));
        Self(fields)
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.with_field(FIELD_NAME, Value::String(name.into()))
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Stamp with the current wall-clock time in epoch seconds
    pub fn with_timestamp(self) -> Self {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        self.with_field(FIELD_TIMESTAMP, now)
    }

    /// Decode a received datagram: UTF-8, then a JSON object
    pub fn from_payload(data: &[u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(data)?;
        match serde_json::from_str::<Value>(text)? {
            Value::Object(fields) => Ok(Self(fields)),
            _ => Err(PayloadError::NotAnObject),
        }
    }

    /// Compact JSON text, ready to be sent
    pub fn to_payload(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    pub fn service_type(&self) -> Option<&str> {
        self.str_field(FIELD_TYPE)
    }

    pub fn addr(&self) -> Option<&str> {
        self.str_field(FIELD_ADDR)
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field(FIELD_NAME)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for ServiceDescriptor {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) at {}",
            self.name().unwrap_or("unknown"),
            self.service_type().unwrap_or("?"),
            self.addr().unwrap_or("?")
        )
    }
}
