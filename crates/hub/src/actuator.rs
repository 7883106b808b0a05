//! Command channel to the actuator node.
//!
//! Every send opens a fresh TCP connection, writes the full device map as
//! one JSON object, and closes. The map always carries every device, so
//! resending the same map is harmless.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::channel::Device;

/// Desired on/off state per device.
pub type DeviceStates = BTreeMap<Device, bool>;

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("actuator node timed out after {0:?}")]
    Timeout(Duration),
    #[error("encoding device states failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Anything that can push device states to the outputs.
pub trait Actuators {
    fn send(
        &self,
        states: &DeviceStates,
    ) -> impl Future<Output = Result<(), ActuatorError>> + Send;
}

/// Encode the wire message: `{"HEATING": true, ...}`.
pub fn encode(states: &DeviceStates) -> Result<Vec<u8>, ActuatorError> {
    Ok(serde_json::to_vec(states)?)
}

#[derive(Debug, Clone)]
pub struct ActuatorChannel {
    addr: String,
    timeout: Duration,
}

impl ActuatorChannel {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn transmit(&self, payload: &[u8]) -> Result<(), ActuatorError> {
        let mut stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|source| ActuatorError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

impl Actuators for ActuatorChannel {
    async fn send(&self, states: &DeviceStates) -> Result<(), ActuatorError> {
        let payload = encode(states)?;
        match tokio::time::timeout(self.timeout, self.transmit(&payload)).await {
            Ok(result) => result,
            Err(_) => Err(ActuatorError::Timeout(self.timeout)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
