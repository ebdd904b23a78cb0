use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Incoming key/value payload for telemetry and property updates.
pub type PropertyPatch = Map<String, Value>;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const UTF8_ENCODING: &str = "utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Enabled,
    Disabled,
}

/// Registry record of a device. Fields the service does not interpret are
/// kept in `extra` so a read-modify-write does not drop them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_updated_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            etag: None,
            status: DeviceStatus::default(),
            status_updated_time: None,
            connection_state: None,
            extra: Map::new(),
        }
    }
}

/// A desired or reported property bag.
///
/// Registry bookkeeping keys (`$metadata`, `$version`) are dropped on
/// deserialization so the bag only ever holds caller-visible properties.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct PropertyBag(Map<String, Value>);

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites every key present in `patch`; keys absent from the patch
    /// are left untouched.
    pub fn merge(&mut self, patch: &PropertyPatch) {
        for (key, value) in patch {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Drops keys whose value is `null`, the registry's marker for removal.
    pub fn prune_nulls(&mut self) {
        self.0.retain(|_, value| !value.is_null());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for PropertyBag {
    fn from(map: Map<String, Value>) -> Self {
        Self(map.into_iter().filter(|(k, _)| !k.starts_with('$')).collect())
    }
}

impl Serialize for PropertyBag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinProperties {
    #[serde(default)]
    pub desired: PropertyBag,
    #[serde(default)]
    pub reported: PropertyBag,
}

/// Per-device twin document with its optimistic-concurrency token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinDocument {
    pub device_id: String,
    #[serde(default)]
    pub etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceStatus>,
    #[serde(default)]
    pub properties: TwinProperties,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TwinDocument {
    pub fn empty(device_id: impl Into<String>, etag: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            etag: etag.into(),
            version: Some(1),
            status: Some(DeviceStatus::Enabled),
            properties: TwinProperties::default(),
            extra: Map::new(),
        }
    }
}

/// A single telemetry event as it goes out on the messaging channel.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
}

impl TelemetryMessage {
    pub fn json(payload: &PropertyPatch) -> serde_json::Result<Self> {
        Ok(Self {
            body: serde_json::to_vec(payload)?,
            content_type: JSON_CONTENT_TYPE,
            content_encoding: UTF8_ENCODING,
        })
    }
}

/// Optional body for `PUT /api/device/{deviceId}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDeviceRequest {
    #[serde(default)]
    pub status: Option<DeviceStatus>,
}
