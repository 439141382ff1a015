use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod catalog;

/// A single telemetry value after normalization.
///
/// Numeric sensor fields only ever hold `Integer` or `Float`. Metadata fields
/// keep whatever scalar the cloud returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Other(serde_json::Value),
}

impl TelemetryValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Integer(v) => Some(*v as f64),
            TelemetryValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, TelemetryValue::Integer(_) | TelemetryValue::Float(_))
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryValue::Integer(v) => write!(f, "{v}"),
            TelemetryValue::Float(v) => write!(f, "{v}"),
            TelemetryValue::Bool(v) => write!(f, "{v}"),
            TelemetryValue::Text(v) => f.write_str(v),
            TelemetryValue::Other(v) => write!(f, "{v}"),
        }
    }
}

/// Normalized telemetry for one device. An empty record means the device is
/// configured but its last fetch failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryRecord {
    fields: BTreeMap<String, Option<TelemetryValue>>,
}

impl TelemetryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<TelemetryValue>) {
        self.fields.insert(key.into(), value);
    }

    /// Returns the value for `key`, flattening absent keys and `None` values.
    pub fn get(&self, key: &str) -> Option<&TelemetryValue> {
        self.fields.get(key).and_then(Option::as_ref)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(TelemetryValue::as_f64)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<TelemetryValue>)> {
        self.fields.iter()
    }
}

impl FromIterator<(String, Option<TelemetryValue>)> for TelemetryRecord {
    fn from_iter<I: IntoIterator<Item = (String, Option<TelemetryValue>)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Complete result of one poll cycle keyed by normalized serial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub devices: BTreeMap<String, TelemetryRecord>,
    pub collected_at_ms: u64,
}

impl Snapshot {
    pub fn new(devices: BTreeMap<String, TelemetryRecord>, collected_at_ms: u64) -> Self {
        Self {
            devices,
            collected_at_ms,
        }
    }

    /// Looks up a device, normalizing the serial first.
    pub fn device(&self, serial: &str) -> Option<&TelemetryRecord> {
        self.devices.get(&normalize_serial(serial))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Identity of one inverter/battery system registered with the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub display_name: String,
    pub battery_capacity_kwh: f64,
}

impl Device {
    /// Builds a device with a normalized serial. A blank display name falls
    /// back to the serial.
    pub fn new(serial: &str, display_name: &str, battery_capacity_kwh: f64) -> Self {
        let serial = normalize_serial(serial);
        let display_name = match display_name.trim() {
            "" => serial.clone(),
            name => name.to_string(),
        };
        Self {
            serial,
            display_name,
            battery_capacity_kwh,
        }
    }
}

/// Serial numbers are compared trimmed and upper-cased.
pub fn normalize_serial(serial: &str) -> String {
    serial.trim().to_uppercase()
}
