//! Boundary to the push transport.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::{PushEnvelope, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed: {0}")]
    Closed(String),
    /// A frame could not be decoded. The connection itself is still usable.
    #[error("undecodable frame: {0}")]
    Protocol(String),
}

/// Opens push connections for a user.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    async fn connect(&self, user: &UserId) -> Result<Box<dyn PushConnection>, TransportError>;
}

/// One live push connection.
#[async_trait]
pub trait PushConnection: Send {
    /// Next inbound event.
    ///
    /// [`TransportError::Protocol`] reports a bad frame and may be followed
    /// by more events; any other error means the connection is gone.
    async fn recv(&mut self) -> Result<PushEnvelope, TransportError>;

    async fn emit(&mut self, event: &str, data: Value) -> Result<(), TransportError>;

    async fn disconnect(&mut self);
}
