use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cloud_client::{Fetcher, HttpTransport};
use collector_app::api::{self, ApiState, SharedDevices};
use collector_app::cycle::{refresh_devices, run_cycle};
use collector_app::CollectorConfig;
use normalizer::Normalizer;
use poller::Poller;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = parse_config_arg();
    let config = CollectorConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    let token = config.token.clone().context("token_id missing")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(ref addr) = config.metrics_listen {
        let addr: SocketAddr = addr.parse().context("invalid metrics listen address")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("metrics exporter init failed")?;
        info!(addr = %addr, "metrics exporter listening");
    }

    if config.devices.is_empty() {
        warn!("no devices configured");
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.client.timeout_ms))
        .build()
        .context("http client init failed")?;
    let fetcher = Fetcher::new(HttpTransport::new(http), config.client.clone());
    let poller =
        Poller::new(fetcher, Normalizer::default()).with_device_timeout(config.device_budget());
    let devices: SharedDevices = Arc::new(RwLock::new(config.devices.clone()));

    let api_handle = match config.http_listen.clone() {
        Some(addr) => {
            let state = ApiState::new(
                poller.reader(),
                devices.clone(),
                config.eta,
                config.use_name_prefix,
            );
            Some(tokio::spawn(serve_api(addr, state, shutdown_rx.clone())))
        }
        None => None,
    };

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    let mut ticker = interval(config.scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
                break;
            }
            _ = ticker.tick() => {
                let current = refresh_devices(&config, &devices).await;
                run_cycle(&poller, &current, &token, config.scan_interval).await;
            }
        }
    }

    if let Some(handle) = api_handle {
        match handle.await {
            Ok(Err(err)) => warn!(error = %err, "http api exited with error"),
            Err(err) => warn!(error = %err, "http api task failed"),
            Ok(Ok(())) => {}
        }
    }
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

async fn serve_api(
    addr: String,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind http api on {addr}"))?;
    info!(addr = %addr, "http api listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .context("http api failed")
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
