//! Unix socket transport to the background service
//!
//! Frames are length-prefixed:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: JSON payload
//!
//! The client sends `{"type":"register",...}` and expects
//! `{"type":"registered"}` or `{"type":"rejected","reason":...}`. After that
//! the service pushes `{"type":"event","event":{"kind":...}}` frames. EOF or
//! an I/O error means the link is dead.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, trace, warn};

use super::service::{EventSender, ServiceConnector, ServiceEvent, ServiceHandle};
use crate::error::ServiceError;

/// Largest frame accepted from the service
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default timeout for connecting and for the registration handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Register for event delivery
    Register { client: String, version: String },
}

/// Frames sent by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceFrame {
    /// Registration accepted
    Registered,
    /// Registration refused
    Rejected { reason: String },
    /// Pushed event
    Event { event: ServiceEvent },
}

/// Encode a frame with its length prefix
///
/// # Errors
///
/// Returns `ServiceError::ProtocolError` if the value cannot be serialized
/// or is larger than [`MAX_FRAME_SIZE`].
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, ServiceError> {
    let json = serde_json::to_vec(msg).map_err(|e| ServiceError::protocol(e.to_string()))?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(ServiceError::protocol(format!(
            "frame too large: {} bytes",
            json.len()
        )));
    }
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Read one frame and decode it
///
/// # Errors
///
/// `Disconnected` on a clean EOF before the length prefix, `ProtocolError`
/// for oversized or undecodable frames, `IoError` otherwise.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T, ServiceError>
where
    T: for<'de> Deserialize<'de>,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ServiceError::Disconnected("service closed the socket".into()));
        }
        Err(e) => return Err(ServiceError::from(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ServiceError::protocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| ServiceError::protocol(e.to_string()))
}

/// Encode and write one frame
///
/// # Errors
///
/// Returns `ServiceError` on encoding or I/O failure.
pub async fn write_frame<T, W>(writer: &mut W, msg: &T) -> Result<(), ServiceError>
where
    T: Serialize + Sync,
    W: AsyncWrite + Unpin,
{
    let encoded = encode_frame(msg)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Connects to the background service over a Unix socket
#[derive(Debug, Clone)]
pub struct UnixServiceConnector {
    socket_path: PathBuf,
    connect_timeout: Duration,
}

impl UnixServiceConnector {
    /// Create a connector for the socket at `socket_path`
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the connect timeout, which also bounds the registration reply
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl ServiceConnector for UnixServiceConnector {
    async fn connect(&self) -> Result<Box<dyn ServiceHandle>, ServiceError> {
        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| ServiceError::ConnectionFailed("connect timed out".into()))?
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => ServiceError::IoError(e),
                _ => ServiceError::ConnectionFailed(format!("{}: {e}", self.socket_path.display())),
            })?;

        debug!(path = %self.socket_path.display(), "connected to background service");
        Ok(Box::new(UnixServiceHandle {
            stream,
            events: None,
            handshake_timeout: self.connect_timeout,
        }))
    }

    fn describe(&self) -> String {
        format!("unix:{}", self.socket_path.display())
    }
}

/// Live Unix socket link
#[derive(Debug)]
pub struct UnixServiceHandle {
    stream: UnixStream,
    events: Option<EventSender>,
    handshake_timeout: Duration,
}

impl UnixServiceHandle {
    async fn handshake(&mut self) -> Result<ServiceFrame, ServiceError> {
        let frame = ClientFrame::Register {
            client: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        write_frame(&mut self.stream, &frame).await?;
        read_frame(&mut self.stream).await
    }
}

#[async_trait]
impl ServiceHandle for UnixServiceHandle {
    async fn register(&mut self, events: EventSender) -> Result<(), ServiceError> {
        let timeout = self.handshake_timeout;
        let reply = tokio::time::timeout(timeout, self.handshake())
            .await
            .map_err(|_| {
                ServiceError::ConnectionFailed(format!("no registration reply within {timeout:?}"))
            })??;

        match reply {
            ServiceFrame::Registered => {
                self.events = Some(events);
                Ok(())
            }
            ServiceFrame::Rejected { reason } => Err(ServiceError::Rejected(reason)),
            ServiceFrame::Event { .. } => Err(ServiceError::protocol(
                "event received before registration was acknowledged",
            )),
        }
    }

    async fn closed(&mut self) -> ServiceError {
        loop {
            match read_frame::<ServiceFrame, _>(&mut self.stream).await {
                Ok(ServiceFrame::Event { event }) => {
                    trace!(?event, "service event");
                    if let Some(events) = &self.events {
                        if events.send(event).await.is_err() {
                            return ServiceError::Disconnected("event receiver dropped".into());
                        }
                    }
                }
                Ok(other) => {
                    warn!(?other, "unexpected frame from background service");
                }
                Err(e) => return e,
            }
        }
    }
}
