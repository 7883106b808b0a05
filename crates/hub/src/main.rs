mod actuator;
mod alert;
mod channel;
mod config;
mod control;
mod hysteresis;
mod state;
mod telemetry;
mod web;

use anyhow::{Context, Result};
use std::env;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use actuator::ActuatorChannel;
use control::ControlLoop;
use telemetry::TelemetryClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "agrimon.toml".to_string());
    let mut cfg = config::load(&config_path)?;

    if let Ok(url) = env::var("SENSOR_URL") {
        cfg.sensor.url = url;
    }
    if let Ok(addr) = env::var("ACTUATOR_ADDR") {
        cfg.actuator.addr = addr;
    }
    cfg.validate().context("invalid configuration after env overrides")?;

    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Node clients ────────────────────────────────────────────────
    let telemetry = TelemetryClient::new(&cfg.sensor.url, cfg.sensor_timeout())
        .with_context(|| format!("bad sensor url: {}", cfg.sensor.url))?;
    let actuators = ActuatorChannel::new(cfg.actuator.addr.clone(), cfg.actuator_timeout());

    info!(
        sensor = %telemetry.uri(),
        actuator = actuators.addr(),
        tick_ms = cfg.control.tick_ms,
        "hub starting"
    );

    let control = ControlLoop::new(&cfg, telemetry, actuators);
    let handle = control.handle();

    // ── Shutdown fan-out ────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "failed to listen for ctrl-c");
                // Keep the sender alive so the loop keeps running.
                let _keep = shutdown_tx;
                std::future::pending::<()>().await;
            }
        }
    });

    // ── Web server ──────────────────────────────────────────────────
    let web_shutdown = shutdown_rx.clone();
    let web = tokio::spawn(async move {
        if let Err(e) = web::serve(handle, web_port, web_shutdown).await {
            error!(error = %format!("{e:#}"), "operator api stopped");
        }
    });

    // ── Control loop ────────────────────────────────────────────────
    control.run(shutdown_rx).await;

    let _ = web.await;
    info!("hub stopped");
    Ok(())
}
