use std::sync::{Arc, RwLock};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use derived_metrics::{EtaDirection, EtaPolicy};
use snapshot_cache::SnapshotReader;
use types::catalog::{self, SensorClass};
use types::{normalize_serial, Device};

/// Devices as configured for the current cycle; swapped by the poll loop.
pub type SharedDevices = Arc<RwLock<Vec<Device>>>;

#[derive(Clone)]
pub struct ApiState {
    reader: SnapshotReader,
    devices: SharedDevices,
    eta: EtaPolicy,
    use_name_prefix: bool,
}

impl ApiState {
    pub fn new(
        reader: SnapshotReader,
        devices: SharedDevices,
        eta: EtaPolicy,
        use_name_prefix: bool,
    ) -> Self {
        Self {
            reader,
            devices,
            eta,
            use_name_prefix,
        }
    }

    fn devices(&self) -> Vec<Device> {
        match self.devices.read() {
            Ok(devices) => devices.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn find_device(&self, serial: &str) -> Option<Device> {
        let serial = normalize_serial(serial);
        self.devices()
            .into_iter()
            .find(|device| device.serial == serial)
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/snapshot", get(snapshot))
        .route("/sensors", get(sensors))
        .route("/devices/:serial", get(device))
        .route("/devices/:serial/eta", get(device_eta))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn snapshot(State(state): State<ApiState>) -> Response {
    let snapshot = state.reader.latest();
    Json(snapshot.as_ref()).into_response()
}

async fn device(State(state): State<ApiState>, Path(serial): Path<String>) -> Response {
    match state.reader.device(&serial) {
        Some(record) => Json(record).into_response(),
        None => not_found(&serial),
    }
}

#[derive(Debug, Serialize)]
struct EtaBody {
    serial: String,
    direction: Option<EtaDirection>,
    eta_minutes: Option<u64>,
    eta_to_full_minutes: Option<u64>,
    eta_text: String,
}

async fn device_eta(State(state): State<ApiState>, Path(serial): Path<String>) -> Response {
    let Some(device) = state.find_device(&serial) else {
        return not_found(&serial);
    };
    let reading = state.reader.eta(&device, &state.eta);
    Json(EtaBody {
        serial: device.serial,
        direction: reading.eta.map(|eta| eta.direction),
        eta_minutes: reading.eta.map(|eta| eta.minutes),
        eta_to_full_minutes: reading.minutes_to_full,
        eta_text: reading.text,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
struct DeviceSensors {
    serial: String,
    title: String,
    manufacturer: &'static str,
    model: &'static str,
    sensors: Vec<SensorBody>,
}

#[derive(Debug, Serialize)]
struct SensorBody {
    key: &'static str,
    unique_id: String,
    name: String,
    unit: Option<&'static str>,
    class: Option<SensorClass>,
}

async fn sensors(State(state): State<ApiState>) -> Json<Vec<DeviceSensors>> {
    let body = state
        .devices()
        .iter()
        .map(|device| DeviceSensors {
            serial: device.serial.clone(),
            title: catalog::device_title(device),
            manufacturer: catalog::MANUFACTURER,
            model: catalog::MODEL,
            sensors: catalog::SENSORS
                .iter()
                .map(|sensor| SensorBody {
                    key: sensor.key,
                    unique_id: catalog::sensor_unique_id(device, sensor),
                    name: catalog::sensor_display_name(device, sensor, state.use_name_prefix),
                    unit: sensor.unit,
                    class: sensor.class,
                })
                .collect(),
        })
        .collect();
    Json(body)
}

fn not_found(serial: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("unknown device {serial}")})),
    )
        .into_response()
}
