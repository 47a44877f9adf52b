//! Link to the privileged background service
//!
//! The coordinator never talks to a concrete transport. It asks a
//! [`ServiceConnector`] for a [`ServiceHandle`], registers its event channel
//! on the handle, and waits for the handle to report death.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ServiceError;

/// Event pushed by the background service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceEvent {
    /// Device switched networks
    NetworkChanged {
        #[serde(default)]
        network: Option<String>,
    },
    /// Service reloaded its configuration
    ConfigReloaded,
}

/// Sender half handed to the service for event delivery
pub type EventSender = mpsc::Sender<ServiceEvent>;

/// Opens links to the background service
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    /// Open a new link
    ///
    /// # Errors
    ///
    /// Returns `ServiceError`; non-recoverable errors stop the reconnect loop.
    async fn connect(&self) -> Result<Box<dyn ServiceHandle>, ServiceError>;

    /// Human-readable endpoint description for logs
    fn describe(&self) -> String;
}

/// One live link to the background service
#[async_trait]
pub trait ServiceHandle: Send {
    /// Register the event callback
    ///
    /// Called once per link, right after it is opened.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` if the service refuses the registration.
    async fn register(&mut self, events: EventSender) -> Result<(), ServiceError>;

    /// Resolve when the link dies, with the reason
    async fn closed(&mut self) -> ServiceError;
}
