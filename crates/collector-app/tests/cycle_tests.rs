use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cloud_client::{
    ApiRequest, ApiResponse, ClientConfig, Fetcher, Params, Transport, TransportError,
};
use collector_app::api::SharedDevices;
use collector_app::cycle::{refresh_devices, run_cycle, CycleOutcome};
use collector_app::CollectorConfig;
use normalizer::Normalizer;
use poller::Poller;
use serde_json::{json, Value};
use types::Device;

/// Answers every serial except `SLOW`, which never returns. Setting
/// `stall_all` makes every request hang.
#[derive(Default)]
struct StallingCloud {
    stall_all: AtomicBool,
}

#[async_trait]
impl Transport for StallingCloud {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let serial = match &request.params {
            Params::Json(body) => body
                .get("wifiSn")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Params::Query(pairs) | Params::Form(pairs) => pairs
                .iter()
                .find(|(key, _)| key == "sn")
                .map(|(_, value)| value.clone())
                .unwrap_or_default(),
        };
        if serial == "SLOW" || self.stall_all.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let body = json!({"success": true, "result": {"soc": 40, "batPower": 1000}});
        Ok(ApiResponse {
            status: 200,
            body: serde_json::to_vec(&body).expect("encode"),
        })
    }
}

fn poller(cloud: Arc<StallingCloud>) -> Poller<Arc<StallingCloud>> {
    Poller::new(
        Fetcher::new(cloud, ClientConfig::default()),
        Normalizer::default(),
    )
}

fn serials(devices: &[Device]) -> Vec<&str> {
    devices.iter().map(|device| device.serial.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn stalled_device_does_not_block_publishing_with_default_settings() {
    let config = CollectorConfig::default();
    let poller = poller(Arc::new(StallingCloud::default()))
        .with_device_timeout(config.device_budget());
    let devices = vec![
        Device::new("FAST1", "", 10.0),
        Device::new("SLOW", "", 10.0),
        Device::new("FAST2", "", 10.0),
    ];

    for _ in 0..3 {
        let snapshot = match run_cycle(&poller, &devices, "token", config.scan_interval).await {
            CycleOutcome::Published(snapshot) => snapshot,
            other => panic!("cycle should publish, got {other:?}"),
        };
        assert_eq!(snapshot.device("FAST1").and_then(|r| r.number("soc")), Some(40.0));
        assert_eq!(snapshot.device("FAST2").and_then(|r| r.number("soc")), Some(40.0));
        assert!(snapshot.device("SLOW").is_some_and(|record| record.is_empty()));
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_cycle_leaves_cache_unchanged() {
    let cloud = Arc::new(StallingCloud::default());
    let poller = poller(cloud.clone());
    let devices = vec![Device::new("AAA", "", 10.0)];
    let budget = Duration::from_secs(15);

    let CycleOutcome::Published(first) = run_cycle(&poller, &devices, "token", budget).await
    else {
        panic!("first cycle should publish");
    };

    cloud.stall_all.store(true, Ordering::SeqCst);
    let outcome = run_cycle(&poller, &devices, "token", budget).await;
    assert!(matches!(outcome, CycleOutcome::TimedOut));
    assert!(Arc::ptr_eq(&poller.latest(), &first));
}

#[tokio::test]
async fn invalid_reload_keeps_previous_device_list() {
    let path = temp_config_path("invalid_reload");
    write_devices(&path, &["SXAAA", "SXBBB"]);
    let config = CollectorConfig::load_with_path(Some(path_str(&path))).expect("load");
    let shared: SharedDevices = Arc::new(RwLock::new(config.devices.clone()));

    write_devices(&path, &["SXAAA", "sxaaa"]);
    let devices = refresh_devices(&config, &shared).await;
    assert_eq!(serials(&devices), vec!["SXAAA", "SXBBB"]);

    fs::write(&path, "devices = [[[").expect("write config");
    let devices = refresh_devices(&config, &shared).await;
    assert_eq!(serials(&devices), vec!["SXAAA", "SXBBB"]);
    assert_eq!(serials(&shared.read().expect("devices")), vec!["SXAAA", "SXBBB"]);

    let _ = fs::remove_file(&path);
}

#[tokio::test]
async fn removed_device_disappears_next_cycle() {
    let path = temp_config_path("removed_device");
    write_devices(&path, &["SXAAA", "SXBBB"]);
    let config = CollectorConfig::load_with_path(Some(path_str(&path))).expect("load");
    let shared: SharedDevices = Arc::new(RwLock::new(config.devices.clone()));
    let poller = poller(Arc::new(StallingCloud::default()));
    let budget = Duration::from_secs(60);

    let devices = refresh_devices(&config, &shared).await;
    let CycleOutcome::Published(snapshot) = run_cycle(&poller, &devices, "token", budget).await
    else {
        panic!("cycle should publish");
    };
    assert_eq!(snapshot.len(), 2);

    write_devices(&path, &["SXBBB"]);
    let devices = refresh_devices(&config, &shared).await;
    assert_eq!(serials(&devices), vec!["SXBBB"]);
    assert_eq!(serials(&shared.read().expect("devices")), vec!["SXBBB"]);

    let CycleOutcome::Published(snapshot) = run_cycle(&poller, &devices, "token", budget).await
    else {
        panic!("cycle should publish");
    };
    assert!(snapshot.device("SXAAA").is_none());
    assert!(snapshot.device("SXBBB").is_some());

    let _ = fs::remove_file(&path);
}

fn write_devices(path: &Path, serials: &[&str]) {
    let mut content = String::from("token_id = \"token\"\n");
    for serial in serials {
        content.push_str(&format!("\n[[devices]]\nwifi_sn = \"{serial}\"\n"));
    }
    fs::write(path, content).expect("write config");
}

fn temp_config_path(prefix: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    path.push(format!("{prefix}_{pid}_{ts}.toml"));
    path
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
