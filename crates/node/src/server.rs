//! TCP command server: one JSON device map per connection.
//!
//! The hub connects, writes `{"HEATING": true, ...}`, and closes. The server
//! reads until EOF (or `MAX_MESSAGE` bytes), applies what it can, and drops
//! the connection. Nothing is written back.

use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::device::{ApplyReport, SharedRegistry};

/// Largest command accepted from one connection.
pub const MAX_MESSAGE: usize = 1024;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty payload")]
    Empty,
    #[error("malformed json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("payload is not a json object")]
    NotAnObject,
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
}

/// Decode one command message.
pub fn parse_command(buf: &[u8]) -> Result<Map<String, Value>, CommandError> {
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Err(CommandError::Empty);
    }
    match serde_json::from_slice::<Value>(buf)? {
        Value::Object(map) => Ok(map),
        _ => Err(CommandError::NotAnObject),
    }
}

async fn read_message(stream: &mut TcpStream) -> Result<Vec<u8>, CommandError> {
    let mut buf = Vec::with_capacity(MAX_MESSAGE);
    let mut limited = (&mut *stream).take(MAX_MESSAGE as u64);
    let read = limited.read_to_end(&mut buf);
    match tokio::time::timeout(READ_TIMEOUT, read).await {
        Ok(result) => {
            result?;
            Ok(buf)
        }
        Err(_) => Err(CommandError::Timeout(READ_TIMEOUT)),
    }
}

/// Read, decode and apply one connection's command.
pub async fn handle_connection(
    mut stream: TcpStream,
    registry: SharedRegistry,
) -> Result<ApplyReport, CommandError> {
    let buf = read_message(&mut stream).await?;
    let command = parse_command(&buf)?;

    // One lock acquisition per message: entries land together.
    let report = match registry.lock() {
        Ok(mut reg) => reg.apply(&command),
        Err(poisoned) => poisoned.into_inner().apply(&command),
    };
    Ok(report)
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, registry: SharedRegistry) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        tokio::spawn(run_connection(stream, peer, registry.clone()));
    }
}

async fn run_connection(stream: TcpStream, peer: SocketAddr, registry: SharedRegistry) {
    match handle_connection(stream, registry).await {
        Ok(report) => tracing::info!(
            %peer,
            applied = report.applied.len(),
            unknown = ?report.unknown,
            invalid = ?report.invalid,
            "command applied"
        ),
        Err(e) => tracing::warn!(%peer, error = %e, "command rejected"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
