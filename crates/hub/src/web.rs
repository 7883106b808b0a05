use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

use crate::channel::ChannelKind;
use crate::control::ControlHandle;
use crate::state::OperatorError;

const INDEX_HTML: &str = include_str!("ui/index.html");

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TargetBody {
    value: f64,
}

#[derive(Deserialize)]
struct ActuatorBody {
    on: bool,
}

#[derive(Deserialize)]
struct AutoBody {
    enabled: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<OperatorError> for ApiError {
    fn from(e: OperatorError) -> Self {
        match e {
            OperatorError::NotControllable(_) => ApiError::Conflict(e.to_string()),
            OperatorError::UnknownPreset { .. } => ApiError::NotFound(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

fn channel_kind(raw: &str) -> Result<ChannelKind, ApiError> {
    raw.parse().map_err(ApiError::NotFound)
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(handle: ControlHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/events", get(api_events))
        .route("/api/auto", put(api_global_auto))
        .route("/api/alert/dismiss", post(api_dismiss_alert))
        .route("/api/channels/{channel}", get(api_channel))
        .route("/api/channels/{channel}/history", get(api_history))
        .route("/api/channels/{channel}/target", put(api_set_target))
        .route("/api/channels/{channel}/preset/{name}", post(api_apply_preset))
        .route("/api/channels/{channel}/actuator", put(api_set_actuator))
        .route("/api/channels/{channel}/toggle", post(api_toggle_actuator))
        .route("/api/channels/{channel}/auto", put(api_set_auto))
        .with_state(handle)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(h): State<ControlHandle>) -> impl IntoResponse {
    Json(h.status().await)
}

/// Server-sent stream of control events. Ends when the control loop stops.
async fn api_events(State(h): State<ControlHandle>) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = h.subscribe();
    let events = stream::unfold((rx, h), |(mut rx, h)| async move {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(ev) => return Some((Event::default().json_data(&ev), (rx, h))),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagging");
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = h.stopped() => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn api_channel(
    State(h): State<ControlHandle>,
    Path(channel): Path<String>,
) -> Result<Response, ApiError> {
    let kind = channel_kind(&channel)?;
    Ok(Json(h.channel(kind).await).into_response())
}

async fn api_history(
    State(h): State<ControlHandle>,
    Path(channel): Path<String>,
) -> Result<Response, ApiError> {
    let kind = channel_kind(&channel)?;
    let history = h.history(kind).await;
    Ok(Json(json!({ "channel": kind, "history": history })).into_response())
}

async fn api_set_target(
    State(h): State<ControlHandle>,
    Path(channel): Path<String>,
    body: Result<Json<TargetBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let kind = channel_kind(&channel)?;
    let Json(body) = body?;
    h.set_target(kind, body.value).await;
    Ok(Json(h.channel(kind).await).into_response())
}

async fn api_apply_preset(
    State(h): State<ControlHandle>,
    Path((channel, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let kind = channel_kind(&channel)?;
    h.apply_preset(kind, &name).await?;
    Ok(Json(h.channel(kind).await).into_response())
}

async fn api_set_actuator(
    State(h): State<ControlHandle>,
    Path(channel): Path<String>,
    body: Result<Json<ActuatorBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let kind = channel_kind(&channel)?;
    let Json(body) = body?;
    h.set_actuator_on(kind, body.on).await?;
    Ok(Json(h.channel(kind).await).into_response())
}

async fn api_toggle_actuator(
    State(h): State<ControlHandle>,
    Path(channel): Path<String>,
) -> Result<Response, ApiError> {
    let kind = channel_kind(&channel)?;
    h.toggle_actuator(kind).await?;
    Ok(Json(h.channel(kind).await).into_response())
}

async fn api_set_auto(
    State(h): State<ControlHandle>,
    Path(channel): Path<String>,
    body: Result<Json<AutoBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let kind = channel_kind(&channel)?;
    let Json(body) = body?;
    h.set_auto_enabled(kind, body.enabled).await?;
    Ok(Json(h.channel(kind).await).into_response())
}

async fn api_global_auto(
    State(h): State<ControlHandle>,
    body: Result<Json<AutoBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    h.set_global_auto(body.enabled).await;
    Ok(Json(json!({ "global_auto": body.enabled })).into_response())
}

async fn api_dismiss_alert(State(h): State<ControlHandle>) -> impl IntoResponse {
    h.dismiss_alert().await;
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(handle: ControlHandle, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!(%addr, "operator api listening");

    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move {
            // Either a `true` or a dropped sender ends the server.
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ActuatorChannel;
    use crate::config::Config;
    use crate::control::ControlLoop;
    use crate::telemetry::TelemetryClient;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, ControlHandle) {
        let cfg = Config::default();
        let telemetry = TelemetryClient::new(&cfg.sensor.url, Duration::from_millis(10)).unwrap();
        let actuators = ActuatorChannel::new(cfg.actuator.addr.clone(), Duration::from_millis(10));
        let handle = ControlLoop::new(&cfg, telemetry, actuators).handle();
        (router(handle.clone()), handle)
    }

    async fn call(router: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(b) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(b.to_string())
            }
            None => Body::empty(),
        };
        let resp = router.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    // -- Read endpoints -----------------------------------------------------

    #[tokio::test]
    async fn index_serves_html() {
        let (router, _) = app();
        let resp = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
    }

    #[tokio::test]
    async fn status_lists_channels() {
        let (router, _) = app();
        let (status, json) = call(router, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["channels"].as_object().unwrap().len(), 6);
        assert_eq!(json["global_auto"], false);
        assert_eq!(json["sensor"]["available"], true);
    }

    #[tokio::test]
    async fn channel_snapshot_includes_history() {
        let (router, _) = app();
        let (status, json) = call(router, "GET", "/api/channels/soil_moisture", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["target"], 60.0);
        assert_eq!(json["history"].as_array().unwrap().len(), 24);
        assert_eq!(json["device"], "WATERING");
    }

    #[tokio::test]
    async fn history_lists_samples_oldest_first() {
        let (router, _) = app();
        let (status, json) = call(router, "GET", "/api/channels/humidity/history", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["channel"], "humidity");
        assert_eq!(json["history"].as_array().unwrap().len(), 24);
    }

    #[tokio::test]
    async fn unknown_channel_is_404() {
        let (router, _) = app();
        let (status, json) = call(router, "GET", "/api/channels/co2", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("co2"));
    }

    // -- Targets and presets ------------------------------------------------

    #[tokio::test]
    async fn target_is_clamped() {
        let (router, h) = app();
        let (status, json) =
            call(router, "PUT", "/api/channels/light/target", Some(r#"{"value":500}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["target"], 100.0);
        assert_eq!(h.target(ChannelKind::Light).await, 100.0);
    }

    #[tokio::test]
    async fn preset_sets_target() {
        let (router, h) = app();
        let (status, _) = call(router, "POST", "/api/channels/humidity/preset/humid", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.target(ChannelKind::Humidity).await, 80.0);
    }

    #[tokio::test]
    async fn unknown_preset_is_404() {
        let (router, _) = app();
        let (status, _) = call(router, "POST", "/api/channels/humidity/preset/tropical", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn preset_on_ph_is_409() {
        let (router, _) = app();
        let (status, _) = call(router, "POST", "/api/channels/ph/preset/normal", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    // -- Actuators and auto flags -------------------------------------------

    #[tokio::test]
    async fn manual_actuator_write() {
        let (router, h) = app();
        let (status, json) =
            call(router, "PUT", "/api/channels/humidity/actuator", Some(r#"{"on":true}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["actuator_on"], true);
        assert_eq!(json["last_write"], "operator");
        assert!(h.actuator_on(ChannelKind::Humidity).await);
    }

    #[tokio::test]
    async fn toggle_flips_once() {
        let (router, h) = app();
        let (status, _) = call(router.clone(), "POST", "/api/channels/light/toggle", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(h.actuator_on(ChannelKind::Light).await);

        call(router, "POST", "/api/channels/light/toggle", None).await;
        assert!(!h.actuator_on(ChannelKind::Light).await);
    }

    #[tokio::test]
    async fn actuator_on_ph_is_409() {
        let (router, _) = app();
        let (status, _) =
            call(router, "PUT", "/api/channels/ph/actuator", Some(r#"{"on":true}"#)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn channel_auto_flag() {
        let (router, h) = app();
        let (status, json) =
            call(router, "PUT", "/api/channels/temperature/auto", Some(r#"{"enabled":true}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["auto_enabled"], true);
        assert!(h.auto_enabled(ChannelKind::Temperature).await);
    }

    #[tokio::test]
    async fn global_auto_leaves_channel_flags() {
        let (router, h) = app();
        let (status, json) = call(router, "PUT", "/api/auto", Some(r#"{"enabled":true}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["global_auto"], true);
        assert!(h.global_auto().await);
        assert!(!h.auto_enabled(ChannelKind::Humidity).await);
    }

    #[tokio::test]
    async fn wrong_body_type_is_json_400() {
        let (router, h) = app();
        let (status, json) =
            call(router, "PUT", "/api/channels/light/target", Some(r#"{"value":"hot"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
        assert_eq!(h.target(ChannelKind::Light).await, 60.0);
    }

    #[tokio::test]
    async fn unparseable_body_is_json_400() {
        let (router, _) = app();
        let (status, json) = call(router, "PUT", "/api/auto", Some("{enabled")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn missing_content_type_is_json_400() {
        let (router, _) = app();
        let req = Request::put("/api/channels/humidity/actuator")
            .body(Body::from(r#"{"on":true}"#))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json["error"].is_string());
    }

    // -- Event stream -------------------------------------------------------

    #[tokio::test]
    async fn events_stream_ticks_and_ends_with_the_loop() {
        let cfg = Config::default();
        let telemetry = TelemetryClient::new(&cfg.sensor.url, Duration::from_millis(10)).unwrap();
        let actuators = ActuatorChannel::new(cfg.actuator.addr.clone(), Duration::from_millis(10));
        let control = ControlLoop::new(&cfg, telemetry, actuators);

        let resp = router(control.handle())
            .oneshot(Request::get("/api/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let mut body = resp.into_body();
        control.tick().await;
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("no event")
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.starts_with("data: "), "{text}");
        assert!(text.contains(r#""type":"tick""#), "{text}");
        assert!(text.contains(r#""seq":1"#), "{text}");

        drop(control);
        let rest = tokio::time::timeout(Duration::from_secs(2), body.collect())
            .await
            .expect("stream did not end");
        assert!(rest.is_ok());
    }

    // -- Alerts -------------------------------------------------------------

    #[tokio::test]
    async fn dismiss_without_alert_is_no_content() {
        let (router, h) = app();
        let (status, _) = call(router, "POST", "/api/alert/dismiss", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!h.status().await.alert_open);
    }
}
