//! `GET /sensor`: the node's telemetry endpoint, backed by whichever
//! [`SensorSource`] the binary was built with.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};

/// One read of every sensor. The first three fields are always present;
/// the rest only when the hardware has them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorSample {
    pub temperature: f64,
    pub soil_moisture: f64,
    pub humidity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<f64>,
}

/// Something that can be read for a full sample. A read either yields all
/// three mandatory values or fails.
pub trait SensorSource {
    fn read(&mut self) -> anyhow::Result<SensorSample>;
}

pub type SharedSource = Arc<Mutex<dyn SensorSource + Send>>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(source: SharedSource) -> Router {
    Router::new()
        .route("/sensor", get(sensor_data))
        .with_state(source)
}

fn read_blocking(source: &SharedSource) -> anyhow::Result<SensorSample> {
    let mut guard = source
        .lock()
        .map_err(|_| anyhow::anyhow!("sensor source lock poisoned"))?;
    guard.read()
}

async fn sensor_data(State(source): State<SharedSource>) -> Response {
    // I2C transfers sleep between conversions; keep them off the runtime.
    let result = tokio::task::spawn_blocking(move || read_blocking(&source)).await;

    match result {
        Ok(Ok(sample)) => Json(sample).into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %format!("{e:#}"), "sensor read failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": format!("{e:#}") })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "sensor read task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
