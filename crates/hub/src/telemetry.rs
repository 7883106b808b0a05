//! HTTP client for the sensor node's `GET /sensor` endpoint.

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Wire + domain types
// ---------------------------------------------------------------------------

/// Body of a successful `GET /sensor`. The first three fields are mandatory;
/// the rest are reported only by nodes that have those sensors.
#[derive(Debug, Deserialize)]
struct SensorPayload {
    temperature: f64,
    soil_moisture: f64,
    humidity: f64,
    #[serde(default)]
    water_level: Option<f64>,
    #[serde(default)]
    ph: Option<f64>,
    #[serde(default)]
    light: Option<f64>,
}

/// One poll's worth of readings. `None` means "no value this poll", never
/// zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading {
    pub temperature: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub humidity: Option<f64>,
    pub water_level: Option<f64>,
    pub ph: Option<f64>,
    pub light: Option<f64>,
}

impl Reading {
    /// The reading a failed poll stands for: every field absent.
    pub fn unavailable() -> Self {
        Self::default()
    }
}

impl From<SensorPayload> for Reading {
    fn from(p: SensorPayload) -> Self {
        Self {
            temperature: Some(p.temperature),
            soil_moisture: Some(p.soil_moisture),
            humidity: Some(p.humidity),
            water_level: p.water_level,
            ph: p.ph,
            light: p.light,
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid sensor url: {0}")]
    Url(String),
    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("reading body failed: {0}")]
    Body(#[from] hyper::Error),
    #[error("sensor node timed out after {0:?}")]
    Timeout(Duration),
    #[error("sensor node returned HTTP {0}")]
    Status(StatusCode),
    #[error("malformed sensor payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Anything that can produce a sensor reading.
pub trait Telemetry {
    fn poll(&self) -> impl Future<Output = Result<Reading, TelemetryError>> + Send;
}

/// Decode a `/sensor` response body.
pub fn parse_reading(body: &[u8]) -> Result<Reading, TelemetryError> {
    let payload: SensorPayload = serde_json::from_slice(body)?;
    Ok(payload.into())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Polls the sensor node. Every call is one fresh request, no retries.
#[derive(Clone)]
pub struct TelemetryClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    uri: Uri,
    timeout: Duration,
}

impl TelemetryClient {
    /// `base_url` is the node root, e.g. `http://192.168.16.54:5000`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TelemetryError> {
        let uri = format!("{}/sensor", base_url.trim_end_matches('/'))
            .parse::<Uri>()
            .map_err(|e| TelemetryError::Url(e.to_string()))?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Ok(Self {
            client,
            uri,
            timeout,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    async fn fetch(&self) -> Result<Reading, TelemetryError> {
        let req = Request::get(self.uri.clone())
            .body(Empty::<Bytes>::new())
            .map_err(|e| TelemetryError::Url(e.to_string()))?;

        let resp = self.client.request(req).await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(TelemetryError::Status(status));
        }

        let body = resp.into_body().collect().await?.to_bytes();
        parse_reading(&body)
    }
}

impl Telemetry for TelemetryClient {
    async fn poll(&self) -> Result<Reading, TelemetryError> {
        match tokio::time::timeout(self.timeout, self.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::Timeout(self.timeout)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Serve `router` on an ephemeral loopback port.
    async fn spawn_node(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn client_for(addr: SocketAddr, timeout: Duration) -> TelemetryClient {
        TelemetryClient::new(&format!("http://{addr}"), timeout).unwrap()
    }

    // -- parse_reading ------------------------------------------------------

    #[test]
    fn parse_three_field_payload() {
        let r = parse_reading(br#"{"temperature":21.5,"soil_moisture":70,"humidity":55.0}"#)
            .unwrap();
        assert_eq!(r.temperature, Some(21.5));
        assert_eq!(r.soil_moisture, Some(70.0));
        assert_eq!(r.humidity, Some(55.0));
        assert_eq!(r.water_level, None);
        assert_eq!(r.light, None);
    }

    #[test]
    fn parse_payload_with_extras() {
        let r = parse_reading(
            br#"{"temperature":1,"soil_moisture":2,"humidity":3,"water_level":4,"ph":6.1,"light":50}"#,
        )
        .unwrap();
        assert_eq!(r.water_level, Some(4.0));
        assert_eq!(r.ph, Some(6.1));
        assert_eq!(r.light, Some(50.0));
    }

    #[test]
    fn parse_missing_field_fails() {
        assert!(matches!(
            parse_reading(br#"{"temperature":1,"humidity":3}"#),
            Err(TelemetryError::Decode(_))
        ));
    }

    #[test]
    fn parse_null_field_fails() {
        assert!(parse_reading(br#"{"temperature":null,"soil_moisture":2,"humidity":3}"#).is_err());
    }

    #[test]
    fn parse_non_numeric_field_fails() {
        assert!(parse_reading(br#"{"temperature":"hot","soil_moisture":2,"humidity":3}"#).is_err());
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(parse_reading(b"<html>").is_err());
    }

    #[test]
    fn unavailable_reading_has_no_values() {
        let r = Reading::unavailable();
        assert!(r.temperature.is_none() && r.soil_moisture.is_none() && r.humidity.is_none());
    }

    #[test]
    fn uri_gets_sensor_path() {
        let c = TelemetryClient::new("http://10.0.0.5:5000/", Duration::from_secs(1)).unwrap();
        assert_eq!(c.uri().to_string(), "http://10.0.0.5:5000/sensor");
    }

    #[test]
    fn invalid_url_rejected() {
        assert!(matches!(
            TelemetryClient::new("http://bad host", Duration::from_secs(1)),
            Err(TelemetryError::Url(_))
        ));
    }

    // -- poll against a live node -------------------------------------------

    #[tokio::test]
    async fn poll_returns_reading() {
        let router = Router::new().route(
            "/sensor",
            get(|| async { r#"{"temperature":12.0,"soil_moisture":64,"humidity":48}"# }),
        );
        let addr = spawn_node(router).await;

        let r = client_for(addr, Duration::from_secs(2)).poll().await.unwrap();
        assert_eq!(r.temperature, Some(12.0));
        assert_eq!(r.soil_moisture, Some(64.0));
        assert_eq!(r.humidity, Some(48.0));
    }

    #[tokio::test]
    async fn poll_non_200_is_failure() {
        let router = Router::new().route(
            "/sensor",
            get(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "adc fault") }),
        );
        let addr = spawn_node(router).await;

        let err = client_for(addr, Duration::from_secs(2)).poll().await.unwrap_err();
        assert!(matches!(err, TelemetryError::Status(s) if s.as_u16() == 500));
    }

    #[tokio::test]
    async fn poll_malformed_body_is_failure() {
        let router = Router::new().route("/sensor", get(|| async { "not json" }));
        let addr = spawn_node(router).await;

        let err = client_for(addr, Duration::from_secs(2)).poll().await.unwrap_err();
        assert!(matches!(err, TelemetryError::Decode(_)));
    }

    #[tokio::test]
    async fn poll_slow_node_times_out() {
        let router = Router::new().route(
            "/sensor",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "{}"
            }),
        );
        let addr = spawn_node(router).await;

        let err = client_for(addr, Duration::from_millis(100)).poll().await.unwrap_err();
        assert!(matches!(err, TelemetryError::Timeout(_)));
    }

    #[tokio::test]
    async fn poll_refused_connection_is_failure() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client_for(addr, Duration::from_secs(2)).poll().await.unwrap_err();
        assert!(matches!(err, TelemetryError::Request(_)));
    }
}
