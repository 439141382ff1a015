use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

use cloud_client::{FetchError, Fetcher, RawTelemetry, Transport};
use normalizer::Normalizer;
use snapshot_cache::{SnapshotCache, SnapshotReader};
use types::{normalize_serial, Device, Snapshot, TelemetryRecord};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("all {failed} devices unreachable")]
    AllDevicesUnreachable { failed: usize },
}

/// Fans one poll cycle out over every configured device and publishes the
/// assembled snapshot.
pub struct Poller<T> {
    fetcher: Arc<Fetcher<T>>,
    normalizer: Normalizer,
    cache: SnapshotCache,
    device_timeout: Option<Duration>,
}

impl<T: Transport + 'static> Poller<T> {
    pub fn new(fetcher: Fetcher<T>, normalizer: Normalizer) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            normalizer,
            cache: SnapshotCache::new(),
            device_timeout: None,
        }
    }

    /// Caps how long a single device may take, across all endpoints and
    /// retries. A device over budget is recorded as a timeout and the cycle
    /// still publishes.
    pub fn with_device_timeout(mut self, budget: Duration) -> Self {
        self.device_timeout = Some(budget);
        self
    }

    pub fn reader(&self) -> SnapshotReader {
        self.cache.reader()
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        self.cache.latest()
    }

    /// Runs one cycle. Failed devices map to empty records; the cache is only
    /// replaced when the cycle completes, and is left alone when every device
    /// was unreachable.
    pub async fn poll(&self, devices: &[Device], token: &str) -> Result<Arc<Snapshot>, PollError> {
        let cycle_start = Instant::now();
        let devices = unique_devices(devices);
        metrics::gauge!("solax_devices_configured").set(devices.len() as f64);

        let mut records: BTreeMap<String, TelemetryRecord> = devices
            .iter()
            .map(|device| (device.serial.clone(), TelemetryRecord::new()))
            .collect();

        let token: Arc<str> = Arc::from(token);
        let mut join_set = JoinSet::new();
        for device in &devices {
            let fetcher = Arc::clone(&self.fetcher);
            let token = Arc::clone(&token);
            let serial = device.serial.clone();
            let budget = self.device_timeout;
            join_set.spawn(async move {
                let result = fetch_within(&fetcher, &token, &serial, budget).await;
                (serial, result)
            });
        }

        let mut ok_count = 0usize;
        let mut failed_count = 0usize;
        let mut network_failures = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((serial, Ok(raw))) => {
                    records.insert(serial, self.build_record(&raw));
                    ok_count += 1;
                }
                Ok((serial, Err(err))) => {
                    if err.is_network() {
                        network_failures += 1;
                    }
                    record_failure(&serial, &err);
                    failed_count += 1;
                }
                Err(err) => {
                    warn!(error = %err, "device fetch task failed");
                    failed_count += 1;
                }
            }
        }

        let elapsed = cycle_start.elapsed();
        metrics::histogram!("solax_poll_cycle_seconds").record(elapsed.as_secs_f64());

        if !devices.is_empty() && network_failures == devices.len() {
            metrics::counter!("solax_poll_cycles_total", "outcome" => "failed").increment(1);
            warn!(
                devices = devices.len(),
                elapsed_ms = elapsed.as_millis(),
                "poll cycle failed, every device unreachable"
            );
            return Err(PollError::AllDevicesUnreachable {
                failed: failed_count,
            });
        }

        let snapshot = self.cache.replace(Snapshot::new(records, unix_ms()));
        metrics::counter!("solax_poll_cycles_total", "outcome" => "ok").increment(1);
        info!(
            devices = devices.len(),
            ok = ok_count,
            failed = failed_count,
            elapsed_ms = elapsed.as_millis(),
            "poll cycle complete"
        );
        Ok(snapshot)
    }

    fn build_record(&self, raw: &RawTelemetry) -> TelemetryRecord {
        let mut record = self.normalizer.normalize_body(&raw.body);
        self.normalizer.merge_metadata(&mut record, &raw.envelope);
        derived_metrics::attach_power_split(&mut record);
        record
    }
}

async fn fetch_within<T: Transport>(
    fetcher: &Fetcher<T>,
    token: &str,
    serial: &str,
    budget: Option<Duration>,
) -> Result<RawTelemetry, FetchError> {
    let Some(budget) = budget else {
        return fetcher.fetch(token, serial).await;
    };
    match timeout(budget, fetcher.fetch(token, serial)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

fn record_failure(serial: &str, err: &FetchError) {
    metrics::counter!("solax_device_fetch_failures_total", "serial" => serial.to_string())
        .increment(1);
    warn!(serial, error = %err, "device fetch failed");
}

/// Normalizes serials and drops blanks and duplicates, keeping the first entry.
fn unique_devices(devices: &[Device]) -> Vec<Device> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(devices.len());
    for device in devices {
        let serial = normalize_serial(&device.serial);
        if serial.is_empty() {
            warn!(name = %device.display_name, "skipping device without serial");
            continue;
        }
        if !seen.insert(serial.clone()) {
            warn!(serial = %serial, "skipping duplicate device serial");
            continue;
        }
        unique.push(Device {
            serial,
            ..device.clone()
        });
    }
    unique
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
