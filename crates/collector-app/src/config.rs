use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use cloud_client::{ClientConfig, EndpointVariant, HttpMethod, ParamMode, TokenPlacement};
use derived_metrics::EtaPolicy;
use types::{normalize_serial, Device};

const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;
const MIN_SCAN_INTERVAL_SECS: u64 = 10;
const MAX_SCAN_INTERVAL_SECS: u64 = 300;
const DEFAULT_BATTERY_KWH: f64 = 10.0;
const DEFAULT_HTTP_LISTEN: &str = "127.0.0.1:8787";
const DEVICE_BUDGET_MARGIN: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub token: Option<String>,
    pub scan_interval: Duration,
    pub use_name_prefix: bool,
    pub client: ClientConfig,
    pub eta: EtaPolicy,
    pub devices: Vec<Device>,
    pub http_listen: Option<String>,
    pub metrics_listen: Option<String>,
    /// File the configuration was read from, re-read each cycle for devices.
    pub source_path: Option<String>,
}

impl CollectorConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        let path = config_path.or_else(|| env::var("SOLAX_CONFIG").ok());
        if let Some(path) = path {
            let file_config = load_file_config(&path)?;
            apply_file_config(&mut config, file_config)?;
            config.source_path = Some(path);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Loads the configuration again from the same sources.
    pub fn reload(&self) -> Result<Self> {
        Self::load_with_path(self.source_path.clone())
    }

    pub fn validate(&self) -> Result<()> {
        match self.token.as_deref() {
            Some(token) if !token.trim().is_empty() => {}
            _ => anyhow::bail!("token_id must be set"),
        }
        let interval = self.scan_interval.as_secs();
        if !(MIN_SCAN_INTERVAL_SECS..=MAX_SCAN_INTERVAL_SECS).contains(&interval)
            || self.scan_interval.subsec_nanos() != 0
        {
            anyhow::bail!(
                "scan_interval_secs must be between {MIN_SCAN_INTERVAL_SECS} and {MAX_SCAN_INTERVAL_SECS}"
            );
        }
        if self.client.timeout_ms == 0 {
            anyhow::bail!("client.timeout_ms must be >= 1");
        }
        if self.client.retry_backoff_ms == 0 {
            anyhow::bail!("client.retry_backoff_ms must be >= 1");
        }
        if self.client.retry_max_backoff_ms == 0 {
            anyhow::bail!("client.retry_max_backoff_ms must be >= 1");
        }
        if self.client.endpoints.is_empty() {
            anyhow::bail!("at least one endpoint must be configured");
        }
        for endpoint in &self.client.endpoints {
            validate_endpoint(endpoint)?;
        }
        let worst_case = self.client.worst_case_fetch();
        if worst_case > self.scan_interval {
            anyhow::bail!(
                "a device fetch may take up to {}ms (timeout x endpoints x attempts plus backoff), longer than scan_interval_secs {}",
                worst_case.as_millis(),
                self.scan_interval.as_secs()
            );
        }
        validate_eta(&self.eta)?;
        self.validate_devices()?;
        if let Some(ref addr) = self.http_listen {
            validate_listen("server.http_listen", addr)?;
        }
        if let Some(ref addr) = self.metrics_listen {
            validate_listen("server.metrics_listen", addr)?;
        }

        Ok(())
    }

    /// Time a single device may spend fetching before it is cut off, kept
    /// below the scan interval so a stalled device cannot stall the cycle.
    pub fn device_budget(&self) -> Duration {
        self.scan_interval
            .saturating_sub(DEVICE_BUDGET_MARGIN)
            .max(Duration::from_millis(1))
    }

    pub fn validate_devices(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            let serial = normalize_serial(&device.serial);
            if serial.is_empty() {
                anyhow::bail!("devices.wifi_sn must be non-empty");
            }
            if !seen.insert(serial.clone()) {
                anyhow::bail!("device {serial} is configured more than once");
            }
            if !device.battery_capacity_kwh.is_finite() || device.battery_capacity_kwh < 0.0 {
                anyhow::bail!("device {serial} battery_kwh must be >= 0");
            }
        }
        Ok(())
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            token: None,
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            use_name_prefix: false,
            client: ClientConfig::default(),
            eta: EtaPolicy::default(),
            devices: Vec::new(),
            http_listen: Some(DEFAULT_HTTP_LISTEN.to_string()),
            metrics_listen: None,
            source_path: None,
        }
    }
}

fn apply_env_overrides(config: &mut CollectorConfig) {
    if let Ok(value) = env::var("SOLAX_TOKEN_ID") {
        config.token = Some(value);
    }

    if let Some(secs) = parse_env_u64("SOLAX_SCAN_INTERVAL_SECS") {
        config.scan_interval = Duration::from_secs(secs);
    }

    if let Some(timeout_ms) = parse_env_u64("SOLAX_REQUEST_TIMEOUT_MS") {
        config.client.timeout_ms = timeout_ms;
    }

    if let Some(retry_count) = parse_env_usize("SOLAX_RETRY_COUNT") {
        config.client.retry_count = retry_count;
    }

    if let Some(backoff_ms) = parse_env_u64("SOLAX_RETRY_BACKOFF_MS") {
        config.client.retry_backoff_ms = backoff_ms;
    }

    if let Ok(value) = env::var("SOLAX_DEVICES") {
        config.devices = parse_static_devices(&value);
    }

    if let Some(flag) = parse_env_bool("SOLAX_USE_NAME_PREFIX") {
        config.use_name_prefix = flag;
    }

    config.http_listen = env::var("SOLAX_HTTP_LISTEN").ok().or(config.http_listen.take());
    config.metrics_listen = env::var("SOLAX_METRICS_LISTEN")
        .ok()
        .or(config.metrics_listen.take());
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    token_id: Option<String>,
    scan_interval_secs: Option<u64>,
    use_name_prefix: Option<bool>,
    client: Option<FileClientConfig>,
    endpoints: Option<Vec<FileEndpointConfig>>,
    eta: Option<FileEtaConfig>,
    devices: Option<Vec<FileDeviceConfig>>,
    server: Option<FileServerConfig>,
}

#[derive(Debug, Deserialize)]
struct FileClientConfig {
    timeout_ms: Option<u64>,
    retry_count: Option<usize>,
    retry_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    retryable_messages: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct FileEndpointConfig {
    name: String,
    method: String,
    url: String,
    params: String,
    serial_key: String,
    token_placement: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileEtaConfig {
    charge_threshold_w: Option<f64>,
    discharge_threshold_w: Option<f64>,
    reserve_soc: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FileDeviceConfig {
    wifi_sn: String,
    name: Option<String>,
    battery_kwh: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FileServerConfig {
    http_listen: Option<String>,
    metrics_listen: Option<String>,
}

fn load_file_config(path: &str) -> Result<FileConfig> {
    let content = fs::read_to_string(path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(config)
}

fn apply_file_config(config: &mut CollectorConfig, file: FileConfig) -> Result<()> {
    if let Some(token) = file.token_id {
        config.token = Some(token);
    }
    if let Some(secs) = file.scan_interval_secs {
        config.scan_interval = Duration::from_secs(secs);
    }
    if let Some(flag) = file.use_name_prefix {
        config.use_name_prefix = flag;
    }

    if let Some(client) = file.client {
        if let Some(timeout_ms) = client.timeout_ms {
            config.client.timeout_ms = timeout_ms;
        }
        if let Some(retry_count) = client.retry_count {
            config.client.retry_count = retry_count;
        }
        if let Some(backoff) = client.retry_backoff_ms {
            config.client.retry_backoff_ms = backoff;
        }
        if let Some(max_backoff) = client.retry_max_backoff_ms {
            config.client.retry_max_backoff_ms = max_backoff;
        }
        if let Some(messages) = client.retryable_messages {
            config.client.retryable_messages = messages;
        }
    }

    if let Some(endpoints) = file.endpoints {
        config.client.endpoints = endpoints
            .into_iter()
            .map(endpoint_from_file)
            .collect::<Result<Vec<_>>>()?;
    }

    if let Some(eta) = file.eta {
        if let Some(threshold) = eta.charge_threshold_w {
            config.eta.charge_threshold_w = threshold;
        }
        if let Some(threshold) = eta.discharge_threshold_w {
            config.eta.discharge_threshold_w = threshold;
        }
        if let Some(reserve) = eta.reserve_soc {
            config.eta.reserve_soc = reserve;
        }
    }

    if let Some(devices) = file.devices {
        config.devices = devices
            .into_iter()
            .map(|device| {
                Device::new(
                    &device.wifi_sn,
                    device.name.as_deref().unwrap_or_default(),
                    device.battery_kwh.unwrap_or(DEFAULT_BATTERY_KWH),
                )
            })
            .collect();
    }

    if let Some(server) = file.server {
        if let Some(addr) = server.http_listen {
            config.http_listen = Some(addr).filter(|value| !value.trim().is_empty());
        }
        if let Some(addr) = server.metrics_listen {
            config.metrics_listen = Some(addr).filter(|value| !value.trim().is_empty());
        }
    }

    Ok(())
}

fn endpoint_from_file(endpoint: FileEndpointConfig) -> Result<EndpointVariant> {
    let method = endpoint
        .method
        .parse::<HttpMethod>()
        .map_err(|err: String| anyhow::anyhow!("endpoint {}: {err}", endpoint.name))?;
    let params = endpoint
        .params
        .parse::<ParamMode>()
        .map_err(|err: String| anyhow::anyhow!("endpoint {}: {err}", endpoint.name))?;
    let token_placement = match endpoint.token_placement {
        Some(value) => value
            .parse::<TokenPlacement>()
            .map_err(|err: String| anyhow::anyhow!("endpoint {}: {err}", endpoint.name))?,
        None => TokenPlacement::Header,
    };

    Ok(EndpointVariant::new(
        endpoint.name,
        method,
        endpoint.url,
        params,
        endpoint.serial_key,
        token_placement,
    ))
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Parses `SN[:name[:kwh]]` entries separated by commas.
fn parse_static_devices(value: &str) -> Vec<Device> {
    value
        .split(',')
        .filter_map(|entry| {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                return None;
            }
            let mut parts = trimmed.splitn(3, ':');
            let serial = parts.next().unwrap_or_default();
            let name = parts.next().unwrap_or_default();
            let battery_kwh = parts
                .next()
                .and_then(|kwh| kwh.trim().parse::<f64>().ok())
                .unwrap_or(DEFAULT_BATTERY_KWH);
            Some(Device::new(serial, name, battery_kwh))
        })
        .collect()
}

fn validate_endpoint(endpoint: &EndpointVariant) -> Result<()> {
    if endpoint.name.trim().is_empty() {
        anyhow::bail!("endpoints.name must be non-empty");
    }
    if !(endpoint.url.starts_with("http://") || endpoint.url.starts_with("https://")) {
        anyhow::bail!("endpoint {} url must be http(s)", endpoint.name);
    }
    if endpoint.serial_key.trim().is_empty() {
        anyhow::bail!("endpoint {} serial_key must be non-empty", endpoint.name);
    }
    Ok(())
}

fn validate_eta(eta: &EtaPolicy) -> Result<()> {
    if !eta.charge_threshold_w.is_finite() || !eta.discharge_threshold_w.is_finite() {
        anyhow::bail!("eta thresholds must be finite");
    }
    if eta.discharge_threshold_w > eta.charge_threshold_w {
        anyhow::bail!("eta.discharge_threshold_w must be <= eta.charge_threshold_w");
    }
    if !(0.0..=100.0).contains(&eta.reserve_soc) {
        anyhow::bail!("eta.reserve_soc must be between 0 and 100");
    }
    Ok(())
}

fn validate_listen(key: &str, addr: &str) -> Result<()> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| anyhow::anyhow!("{key} must be a socket address (e.g. 127.0.0.1:8787)"))
}
