use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use cloud_client::Transport;
use poller::{PollError, Poller};
use types::{Device, Snapshot};

use crate::api::SharedDevices;
use crate::CollectorConfig;

/// How one scheduled cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    Published(Arc<Snapshot>),
    Failed(PollError),
    TimedOut,
}

/// Runs one poll bounded by `budget`. Only a published cycle touches the cache.
pub async fn run_cycle<T: Transport + 'static>(
    poller: &Poller<T>,
    devices: &[Device],
    token: &str,
    budget: Duration,
) -> CycleOutcome {
    match timeout(budget, poller.poll(devices, token)).await {
        Ok(Ok(snapshot)) => {
            debug!(devices = snapshot.len(), "snapshot published");
            CycleOutcome::Published(snapshot)
        }
        Ok(Err(err)) => {
            warn!(error = %err, "poll cycle failed, keeping previous snapshot");
            CycleOutcome::Failed(err)
        }
        Err(_) => {
            warn!(
                budget_ms = budget.as_millis(),
                "poll cycle timed out, keeping previous snapshot"
            );
            CycleOutcome::TimedOut
        }
    }
}

/// Re-reads the device list so additions and removals apply from the next
/// cycle on. Keeps the previous list when the configuration cannot be used.
pub async fn refresh_devices(config: &CollectorConfig, shared: &SharedDevices) -> Vec<Device> {
    let previous = current_devices(shared);

    let source = config.clone();
    let reloaded = match tokio::task::spawn_blocking(move || source.reload()).await {
        Ok(reloaded) => reloaded,
        Err(err) => {
            warn!(error = %err, "config reload task failed, keeping device list");
            return previous;
        }
    };
    let fresh = match reloaded {
        Ok(fresh) => fresh,
        Err(err) => {
            warn!(error = %err, "config reload failed, keeping device list");
            return previous;
        }
    };
    if let Err(err) = fresh.validate_devices() {
        warn!(error = %err, "reloaded device list invalid, keeping previous");
        return previous;
    }

    if fresh.devices != previous {
        info!(
            before = previous.len(),
            after = fresh.devices.len(),
            "device list changed"
        );
        match shared.write() {
            Ok(mut devices) => *devices = fresh.devices.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.devices.clone(),
        }
    }
    fresh.devices
}

fn current_devices(shared: &SharedDevices) -> Vec<Device> {
    match shared.read() {
        Ok(devices) => devices.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}
