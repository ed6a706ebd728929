// =============================================================================
// Push-connection collaborator — connect / send / next event / close
// =============================================================================
//
// The controller only sees complete text payloads. Ping/Pong control frames
// are answered by tungstenite itself and never surface as events.
// =============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::FeedError;

/// One thing that happened on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Message(String),
    Error(String),
    Closed,
}

/// An open persistent connection.
#[async_trait]
pub trait PushConnection: Send {
    async fn send(&mut self, text: String) -> Result<(), FeedError>;

    /// Wait for the next event. Must be cancel safe: dropping the future
    /// loses no message.
    async fn next_event(&mut self) -> PushEvent;

    async fn close(&mut self);
}

/// Opens persistent connections.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushConnection>, FeedError>;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl PushTransport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushConnection>, FeedError> {
        info!(url = %url, "connecting to WebSocket");
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| FeedError::Transport(format!("failed to connect to {url}: {e}")))?;
        Ok(Box::new(TungsteniteConnection { stream }))
    }
}

pub struct TungsteniteConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for TungsteniteConnection {
    async fn send(&mut self, text: String) -> Result<(), FeedError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::Transport(format!("send failed: {e}")))
    }

    async fn next_event(&mut self) -> PushEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return PushEvent::Message(text),
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "close frame received");
                    return PushEvent::Closed;
                }
                // Ping / Pong / Binary / raw frames carry no candles.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return PushEvent::Error(e.to_string()),
                None => return PushEvent::Closed,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "error while closing WebSocket");
        }
    }
}
