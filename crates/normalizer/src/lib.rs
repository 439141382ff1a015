use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::debug;
use types::{TelemetryRecord, TelemetryValue};

/// Sensor fields that are always coerced to a number or `None`.
pub const NUMERIC_FIELDS: &[&str] = &[
    "acpower",
    "feedinpower",
    "batPower",
    "soc",
    "battemper",
    "batcycle",
];

/// Identity fields copied from the response envelope when the body lacks them.
pub const METADATA_FIELDS: &[&str] = &["inverterSn", "sn", "uploadTime"];

/// Raw values the cloud uses to say "no reading".
const EMPTY_MARKERS: &[&str] = &["", "NA", "N/A"];

/// Converts raw cloud payloads into typed records for a fixed set of fields.
#[derive(Debug, Clone)]
pub struct Normalizer {
    numeric: HashSet<String>,
    tracked: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::with_fields(
            NUMERIC_FIELDS.iter().copied(),
            METADATA_FIELDS.iter().copied(),
        )
    }
}

impl Normalizer {
    pub fn with_fields<'a>(
        numeric: impl IntoIterator<Item = &'a str>,
        passthrough: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let numeric: Vec<String> = numeric.into_iter().map(str::to_string).collect();
        let mut tracked = numeric.clone();
        for field in passthrough {
            if !tracked.iter().any(|existing| existing == field) {
                tracked.push(field.to_string());
            }
        }
        Self {
            numeric: numeric.into_iter().collect(),
            tracked,
        }
    }

    pub fn is_numeric(&self, field: &str) -> bool {
        self.numeric.contains(field)
    }

    pub fn tracked_fields(&self) -> &[String] {
        &self.tracked
    }

    pub fn normalize(&self, field: &str, raw: &Value) -> Option<TelemetryValue> {
        if is_empty_marker(raw) {
            return None;
        }
        if self.is_numeric(field) {
            coerce_numeric(field, raw)
        } else {
            Some(passthrough(raw))
        }
    }

    /// Builds a record holding every tracked field; fields missing from `body`
    /// are present as `None`.
    pub fn normalize_body(&self, body: &Map<String, Value>) -> TelemetryRecord {
        self.tracked
            .iter()
            .map(|field| {
                let value = body
                    .get(field)
                    .and_then(|raw| self.normalize(field, raw));
                (field.clone(), value)
            })
            .collect()
    }

    /// Fills metadata fields that the body left empty from the top-level
    /// response.
    pub fn merge_metadata(&self, record: &mut TelemetryRecord, envelope: &Map<String, Value>) {
        for field in METADATA_FIELDS {
            if record.get(field).is_some() {
                continue;
            }
            if let Some(value) = envelope.get(*field).and_then(|raw| self.normalize(field, raw)) {
                record.insert(*field, Some(value));
            }
        }
    }
}

/// Normalizes one value against the default field set.
pub fn normalize(field: &str, raw: &Value) -> Option<TelemetryValue> {
    Normalizer::default().normalize(field, raw)
}

fn is_empty_marker(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::String(text) => EMPTY_MARKERS.contains(&text.as_str()),
        _ => false,
    }
}

fn coerce_numeric(field: &str, raw: &Value) -> Option<TelemetryValue> {
    match raw {
        Value::Number(number) => number_value(number),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<f64>() {
                Ok(parsed) if parsed.is_finite() => Some(collapse_float(parsed)),
                _ => {
                    debug!(field, raw = %trimmed, "unparseable numeric field");
                    None
                }
            }
        }
        other => {
            debug!(field, raw = %other, "unexpected type for numeric field");
            None
        }
    }
}

fn number_value(number: &serde_json::Number) -> Option<TelemetryValue> {
    if let Some(v) = number.as_i64() {
        return Some(TelemetryValue::Integer(v));
    }
    number.as_f64().map(TelemetryValue::Float)
}

fn collapse_float(value: f64) -> TelemetryValue {
    // Whole numbers outside the i64 range stay fractional.
    if value.fract() == 0.0 && value.abs() < 9.0e18 {
        TelemetryValue::Integer(value as i64)
    } else {
        TelemetryValue::Float(value)
    }
}

fn passthrough(raw: &Value) -> TelemetryValue {
    match raw {
        Value::String(text) => TelemetryValue::Text(text.clone()),
        Value::Bool(flag) => TelemetryValue::Bool(*flag),
        Value::Number(number) => {
            number_value(number).unwrap_or_else(|| TelemetryValue::Other(raw.clone()))
        }
        other => TelemetryValue::Other(other.clone()),
    }
}
