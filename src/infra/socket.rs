//! WebSocket push transport.
//!
//! Frames are JSON text `{"event": ..., "data": ...}`. The user id travels
//! both as the `userId` query parameter and in the `join` handshake.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use url::Url;

use crate::channel::{PushConnection, PushTransport, TransportError};
use crate::config::ChannelSettings;
use crate::types::{PushEnvelope, UserId};

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(url: Url, connect_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
        }
    }

    pub fn from_settings(settings: &ChannelSettings) -> Self {
        Self::new(settings.url.clone(), settings.connect_timeout)
    }

    fn url_for(&self, user: &UserId) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("userId", user.as_str());
        url
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, user: &UserId) -> Result<Box<dyn PushConnection>, TransportError> {
        let url = self.url_for(user);
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "timed out after {} ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(
            url = %self.url,
            status = response.status().as_u16(),
            "WebSocket handshake complete"
        );
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for WebSocketConnection {
    async fn recv(&mut self) -> Result<PushEnvelope, TransportError> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Err(TransportError::Closed("stream ended".to_string()));
            };
            match message.map_err(|err| TransportError::Closed(err.to_string()))? {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|err| TransportError::Protocol(err.to_string()));
                }
                Message::Close(frame) => {
                    let reason = frame
                        .map(|frame| frame.reason.as_str().to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "closed by peer".to_string());
                    return Err(TransportError::Closed(reason));
                }
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn emit(&mut self, event: &str, data: Value) -> Result<(), TransportError> {
        let text = serde_json::to_string(&PushEnvelope::new(event, data))
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| TransportError::Closed(err.to_string()))
    }

    async fn disconnect(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            debug!(error = %err, "WebSocket close handshake failed");
        }
    }
}
