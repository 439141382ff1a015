use serde::Serialize;

use crate::Device;

pub const MANUFACTURER: &str = "SolaX";
pub const MODEL: &str = "Cloud";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorClass {
    Power,
    Battery,
    Temperature,
    Duration,
}

/// Static description of a sensor exposed per device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorDescriptor {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub class: Option<SensorClass>,
}

const fn sensor(
    key: &'static str,
    name: &'static str,
    unit: Option<&'static str>,
    class: Option<SensorClass>,
) -> SensorDescriptor {
    SensorDescriptor {
        key,
        name,
        unit,
        class,
    }
}

pub const SENSORS: &[SensorDescriptor] = &[
    sensor("acpower", "AC Power", Some("W"), Some(SensorClass::Power)),
    sensor("feedinpower", "Feed-in Power", Some("W"), Some(SensorClass::Power)),
    sensor("batPower", "Battery Power", Some("W"), Some(SensorClass::Power)),
    sensor("soc", "Battery SoC", Some("%"), Some(SensorClass::Battery)),
    sensor(
        "battemper",
        "Battery Temperature",
        Some("°C"),
        Some(SensorClass::Temperature),
    ),
    sensor("batcycle", "Battery Cycles", None, None),
    sensor("export_power", "Export Power", Some("W"), Some(SensorClass::Power)),
    sensor("import_power", "Import Power", Some("W"), Some(SensorClass::Power)),
    sensor("eta_minutes", "Battery ETA (min)", Some("min"), None),
    sensor(
        "eta_to_full_minutes",
        "Battery ETA to Full (min)",
        Some("min"),
        Some(SensorClass::Duration),
    ),
    sensor("eta_text", "Battery ETA", None, None),
];

pub fn find(key: &str) -> Option<&'static SensorDescriptor> {
    SENSORS.iter().find(|sensor| sensor.key == key)
}

/// Name of the device as shown to the host.
pub fn device_title(device: &Device) -> String {
    format!("{MANUFACTURER} {}", device.display_name)
}

/// Sensor name, optionally prefixed with the device's display name.
pub fn sensor_display_name(device: &Device, sensor: &SensorDescriptor, use_prefix: bool) -> String {
    if use_prefix {
        format!("{} {}", device.display_name, sensor.name)
    } else {
        sensor.name.to_string()
    }
}

/// Stable identifier for a device sensor.
pub fn sensor_unique_id(device: &Device, sensor: &SensorDescriptor) -> String {
    format!("{}_{}", device.serial, sensor.key)
}
