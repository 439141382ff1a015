use std::collections::BTreeMap;

use derived_metrics::{EtaDirection, EtaPolicy, PLACEHOLDER};
use snapshot_cache::SnapshotCache;
use types::{Device, Snapshot, TelemetryRecord, TelemetryValue};

fn snapshot(serial: &str, soc: i64, battery_power: i64, collected_at_ms: u64) -> Snapshot {
    let mut record = TelemetryRecord::new();
    record.insert("soc", Some(TelemetryValue::Integer(soc)));
    record.insert("batPower", Some(TelemetryValue::Integer(battery_power)));
    let mut devices = BTreeMap::new();
    devices.insert(serial.to_string(), record);
    Snapshot::new(devices, collected_at_ms)
}

#[test]
fn starts_empty() {
    let cache = SnapshotCache::new();
    assert!(cache.latest().is_empty());
    assert!(cache.reader().latest().is_empty());
}

#[test]
fn readers_observe_whole_replacements() {
    let cache = SnapshotCache::new();
    let reader = cache.reader();

    cache.replace(snapshot("ABC123", 50, -2000, 1));
    let first = reader.latest();
    assert_eq!(first.collected_at_ms, 1);

    cache.replace(snapshot("XYZ", 20, 0, 2));
    assert_eq!(first.collected_at_ms, 1);
    assert!(first.device("ABC123").is_some());

    let second = reader.latest();
    assert_eq!(second.collected_at_ms, 2);
    assert!(second.device("ABC123").is_none());
    assert!(reader.device("xyz").is_some());
}

#[test]
fn eta_is_derived_from_latest_record() {
    let cache = SnapshotCache::new();
    let reader = cache.reader();
    let device = Device::new("abc123", "Garage", 10.0);
    let policy = EtaPolicy::default();

    let reading = reader.eta(&device, &policy);
    assert_eq!(reading.eta, None);
    assert_eq!(reading.text, PLACEHOLDER);

    cache.replace(snapshot("ABC123", 50, -2000, 1));
    let reading = reader.eta(&device, &policy);
    let eta = reading.eta.expect("eta");
    assert_eq!(eta.direction, EtaDirection::ToEmpty);
    assert_eq!(eta.minutes, 120);
    assert_eq!(reading.minutes_to_full, None);

    cache.replace(snapshot("ABC123", 80, 800, 2));
    let reading = reader.eta(&device, &policy);
    assert_eq!(reading.minutes_to_full, Some(150));
    assert_eq!(reading.text, "Time to full: 2h 30m");
}

#[test]
fn zero_capacity_renders_placeholder() {
    let cache = SnapshotCache::new();
    cache.replace(snapshot("ABC123", 50, -2000, 1));
    let device = Device::new("ABC123", "", 0.0);

    let reading = cache.reader().eta(&device, &EtaPolicy::default());
    assert_eq!(reading.eta, None);
    assert_eq!(reading.text, PLACEHOLDER);
}

#[tokio::test]
async fn changed_wakes_on_replace() {
    let cache = SnapshotCache::new();
    let mut reader = cache.reader();

    let waiter = tokio::spawn(async move {
        let changed = reader.changed().await;
        (changed, reader.latest().collected_at_ms)
    });
    tokio::task::yield_now().await;
    cache.replace(snapshot("A", 1, 0, 42));

    let (changed, collected_at_ms) = waiter.await.expect("join");
    assert!(changed);
    assert_eq!(collected_at_ms, 42);
}

#[tokio::test]
async fn changed_reports_dropped_cache() {
    let cache = SnapshotCache::new();
    let mut reader = cache.reader();
    drop(cache);
    assert!(!reader.changed().await);
}
