use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use derived_metrics::{Eta, EtaPolicy};
use types::{Device, Snapshot, TelemetryRecord};

/// Holds the latest complete snapshot. There is exactly one writer; readers
/// obtained through [`SnapshotCache::reader`] always see a whole snapshot.
#[derive(Debug)]
pub struct SnapshotCache {
    tx: watch::Sender<Arc<Snapshot>>,
}

/// Cheap, cloneable read handle on a [`SnapshotCache`].
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Arc<Snapshot>>,
}

/// ETA values derived from the cached telemetry for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct EtaReading {
    pub eta: Option<Eta>,
    pub minutes_to_full: Option<u64>,
    pub text: String,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Snapshot::default()));
        Self { tx }
    }

    /// Swaps in a new snapshot wholesale and returns the stored handle.
    pub fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.tx.send_replace(snapshot.clone());
        debug!(devices = snapshot.len(), "snapshot replaced");
        snapshot
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl SnapshotReader {
    pub fn latest(&self) -> Arc<Snapshot> {
        self.rx.borrow().clone()
    }

    pub fn device(&self, serial: &str) -> Option<TelemetryRecord> {
        self.latest().device(serial).cloned()
    }

    /// Computes the ETA from the freshest record for `device`.
    pub fn eta(&self, device: &Device, policy: &EtaPolicy) -> EtaReading {
        let snapshot = self.latest();
        let record = snapshot.device(&device.serial);
        let eta = record.and_then(|record| policy.estimate_record(record, device.battery_capacity_kwh));
        let minutes_to_full =
            record.and_then(|record| policy.minutes_to_full(record, device.battery_capacity_kwh));
        EtaReading {
            eta,
            minutes_to_full,
            text: derived_metrics::eta_text(eta.as_ref()),
        }
    }

    /// Waits for the next replacement. Returns `false` once the cache is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
