//! Secondary values computed from normalized telemetry: grid export/import
//! split and battery time-to-full / time-to-empty estimates.

use std::fmt;

use serde::Serialize;
use types::{TelemetryRecord, TelemetryValue};

pub const FEED_IN_FIELD: &str = "feedinpower";
pub const BATTERY_POWER_FIELD: &str = "batPower";
pub const SOC_FIELD: &str = "soc";
pub const EXPORT_POWER_FIELD: &str = "export_power";
pub const IMPORT_POWER_FIELD: &str = "import_power";

/// Battery power above this is treated as charging.
pub const CHARGE_THRESHOLD_W: f64 = 50.0;
/// Battery power below this is treated as discharging.
pub const DISCHARGE_THRESHOLD_W: f64 = -50.0;
/// State of charge that counts as empty for discharge estimates.
pub const RESERVE_SOC: f64 = 10.0;

/// Rendered when no estimate is available.
pub const PLACEHOLDER: &str = "\u{2014}";

/// Grid power split into non-negative export and import halves.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerSplit {
    pub export_power: Option<TelemetryValue>,
    pub import_power: Option<TelemetryValue>,
}

/// Splits signed feed-in power (positive exports, negative imports).
/// Non-numeric or missing input leaves both halves unavailable.
pub fn split_feed_in(feed_in: Option<&TelemetryValue>) -> PowerSplit {
    match feed_in {
        Some(TelemetryValue::Integer(v)) => PowerSplit {
            export_power: Some(TelemetryValue::Integer((*v).max(0))),
            import_power: Some(TelemetryValue::Integer(if *v < 0 {
                v.saturating_neg()
            } else {
                0
            })),
        },
        Some(TelemetryValue::Float(v)) => PowerSplit {
            export_power: Some(TelemetryValue::Float(if *v > 0.0 { *v } else { 0.0 })),
            import_power: Some(TelemetryValue::Float(if *v < 0.0 { -*v } else { 0.0 })),
        },
        _ => PowerSplit {
            export_power: None,
            import_power: None,
        },
    }
}

/// Adds `export_power` and `import_power` to a record.
pub fn attach_power_split(record: &mut TelemetryRecord) {
    let split = split_feed_in(record.get(FEED_IN_FIELD));
    record.insert(EXPORT_POWER_FIELD, split.export_power);
    record.insert(IMPORT_POWER_FIELD, split.import_power);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EtaDirection {
    ToFull,
    ToEmpty,
}

impl EtaDirection {
    pub fn label(self) -> &'static str {
        match self {
            EtaDirection::ToFull => "Time to full",
            EtaDirection::ToEmpty => "Time to empty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Eta {
    pub direction: EtaDirection,
    pub minutes: u64,
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.minutes / 60;
        let minutes = self.minutes % 60;
        write!(f, "{}: {hours}h {minutes:02}m", self.direction.label())
    }
}

/// Human-readable ETA; the placeholder dash when unavailable.
pub fn eta_text(eta: Option<&Eta>) -> String {
    match eta {
        Some(eta) => eta.to_string(),
        None => PLACEHOLDER.to_string(),
    }
}

/// Thresholds deciding when a battery counts as charging or discharging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtaPolicy {
    pub charge_threshold_w: f64,
    pub discharge_threshold_w: f64,
    pub reserve_soc: f64,
}

impl Default for EtaPolicy {
    fn default() -> Self {
        Self {
            charge_threshold_w: CHARGE_THRESHOLD_W,
            discharge_threshold_w: DISCHARGE_THRESHOLD_W,
            reserve_soc: RESERVE_SOC,
        }
    }
}

impl EtaPolicy {
    /// Estimates time to full while charging, or time to the reserve floor
    /// while discharging. Inside the dead band, at a SoC boundary, or without
    /// a positive capacity there is no estimate.
    pub fn estimate(
        &self,
        soc: Option<f64>,
        battery_power_w: Option<f64>,
        capacity_kwh: f64,
    ) -> Option<Eta> {
        if capacity_kwh.is_nan() || capacity_kwh <= 0.0 {
            return None;
        }
        let soc = soc?;
        let power_w = battery_power_w?;

        if power_w > self.charge_threshold_w && soc < 100.0 {
            let remaining_kwh = capacity_kwh * (100.0 - soc) / 100.0;
            return eta_from(EtaDirection::ToFull, remaining_kwh, power_w);
        }
        if power_w < self.discharge_threshold_w && soc > self.reserve_soc {
            let usable_kwh = capacity_kwh * (soc - self.reserve_soc) / 100.0;
            return eta_from(EtaDirection::ToEmpty, usable_kwh, power_w);
        }
        None
    }

    pub fn estimate_record(&self, record: &TelemetryRecord, capacity_kwh: f64) -> Option<Eta> {
        self.estimate(
            record.number(SOC_FIELD),
            record.number(BATTERY_POWER_FIELD),
            capacity_kwh,
        )
    }

    /// Minutes until full; `None` unless the battery is charging.
    pub fn minutes_to_full(&self, record: &TelemetryRecord, capacity_kwh: f64) -> Option<u64> {
        self.estimate_record(record, capacity_kwh)
            .filter(|eta| eta.direction == EtaDirection::ToFull)
            .map(|eta| eta.minutes)
    }
}

fn eta_from(direction: EtaDirection, energy_kwh: f64, power_w: f64) -> Option<Eta> {
    let power_kw = power_w.abs() / 1000.0;
    if power_kw == 0.0 || !energy_kwh.is_finite() {
        return None;
    }
    let minutes = (energy_kwh / power_kw * 60.0).round().max(0.0);
    Some(Eta {
        direction,
        minutes: minutes as u64,
    })
}
