#[cfg(feature = "adc")]
mod adc;
mod device;
mod sensor;
mod server;
#[cfg(feature = "sim")]
mod sim;

#[cfg(not(any(feature = "sim", feature = "adc")))]
compile_error!("enable at least one sensor source: feature `sim` or `adc`");

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use device::{DeviceRegistry, SharedRegistry};
use sensor::SharedSource;

fn env_port(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// Real ADC when built with `adc`, otherwise the simulator.
#[cfg(feature = "adc")]
fn sensor_source(_registry: &SharedRegistry) -> Result<SharedSource> {
    let chip = adc::Pcf8591::new(adc::DEFAULT_ADDR)?;
    Ok(Arc::new(Mutex::new(chip)))
}

#[cfg(not(feature = "adc"))]
fn sensor_source(registry: &SharedRegistry) -> Result<SharedSource> {
    let scenario = sim::Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let sim = sim::EnvironmentSim::new(scenario, registry.clone());
    tracing::info!(scenario = %sim.scenario(), "using simulated sensors");
    Ok(Arc::new(Mutex::new(sim)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let sensor_port = env_port("SENSOR_PORT", 5000);
    let actuator_port = env_port("ACTUATOR_PORT", 65432);
    // The stock wiring drives the relays active-high.
    let active_low = env_flag("RELAY_ACTIVE_LOW", false);

    // Outputs first, so every relay is off before anything else runs.
    let registry = DeviceRegistry::new(active_low)
        .context("failed to initialise outputs")?
        .shared();
    let source = sensor_source(&registry).context("failed to initialise sensors")?;

    // Actuator command server
    let actuator_addr = SocketAddr::from(([0, 0, 0, 0], actuator_port));
    let actuator_listener = TcpListener::bind(actuator_addr)
        .await
        .with_context(|| format!("failed to bind actuator port {actuator_port}"))?;
    tracing::info!(%actuator_addr, "actuator server listening");
    tokio::spawn(server::serve(actuator_listener, registry.clone()));

    // Sensor endpoint
    let sensor_addr = SocketAddr::from(([0, 0, 0, 0], sensor_port));
    let sensor_listener = TcpListener::bind(sensor_addr)
        .await
        .with_context(|| format!("failed to bind sensor port {sensor_port}"))?;
    tracing::info!(%sensor_addr, "sensor endpoint listening");

    axum::serve(sensor_listener, sensor::router(source))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("ctrl-c received, shutting down");
        })
        .await
        .context("sensor server error")?;

    // Leave every relay off on the way out.
    match registry.lock() {
        Ok(mut reg) => reg.all_off(),
        Err(poisoned) => poisoned.into_inner().all_off(),
    }
    tracing::info!("node stopped");
    Ok(())
}
