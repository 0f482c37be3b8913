// =============================================================================
// Tick Source boundary: control/tick messages and the transport seam
// =============================================================================
//
// Outbound control message:
//   { "action": "subscribe" | "unsubscribe", "instruments": ["..."] }
//
// Inbound tick message:
//   { "instrumentKey": "...", "lastTradedPrice": 1.0, "volume": 2.0, "timestamp": 1700000000000 }
//
// Framing is owned by the feed; the manager only sees text payloads.
// =============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::types::Tick;

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// Subscribe/unsubscribe request sent to the tick source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: SubscriptionAction,
    pub instruments: Vec<String>,
}

impl ControlMessage {
    pub fn subscribe(instruments: Vec<String>) -> Self {
        Self {
            action: SubscriptionAction::Subscribe,
            instruments,
        }
    }

    pub fn unsubscribe(instruments: Vec<String>) -> Self {
        Self {
            action: SubscriptionAction::Unsubscribe,
            instruments,
        }
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string(self).map_err(|e| PipelineError::Connection(format!("failed to encode control message: {e}")))
    }
}

/// Decode and validate one inbound tick payload.
pub fn decode_tick(text: &str) -> Result<Tick, PipelineError> {
    let tick: Tick = serde_json::from_str(text)
        .map_err(|e| PipelineError::malformed(format!("failed to parse tick JSON: {e}")))?;
    tick.validate().map_err(PipelineError::malformed)?;
    Ok(tick)
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Opens connections to a tick source.
#[async_trait]
pub trait TickTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TickConnection>, PipelineError>;
}

/// One open connection to a tick source.
#[async_trait]
pub trait TickConnection: Send {
    async fn send(&mut self, message: &ControlMessage) -> Result<(), PipelineError>;

    /// Next text payload. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String, PipelineError>>;
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// Tick source reached over a WebSocket.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TickTransport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn TickConnection>, PipelineError> {
        info!(url = %self.url, "connecting to tick WebSocket");
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| PipelineError::Connection(format!("failed to connect to {}: {e}", self.url)))?;
        info!(url = %self.url, "tick WebSocket connected");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TickConnection for WsConnection {
    async fn send(&mut self, message: &ControlMessage) -> Result<(), PipelineError> {
        let json = message.to_json()?;
        self.stream.send(Message::Text(json)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, PipelineError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => return Some(Err(PipelineError::malformed("non-UTF-8 binary frame"))),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "tick WebSocket close frame received");
                    return None;
                }
                // tungstenite answers pings itself.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_wire_shape() {
        let msg = ControlMessage::subscribe(vec!["NSE_EQ|INE002A01018".into()]);
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"action":"subscribe","instruments":["NSE_EQ|INE002A01018"]}"#
        );
        let back: ControlMessage =
            serde_json::from_str(r#"{"action":"unsubscribe","instruments":["A","B"]}"#).unwrap();
        assert_eq!(back, ControlMessage::unsubscribe(vec!["A".into(), "B".into()]));
    }

    #[test]
    fn decode_valid_tick() {
        let tick = decode_tick(
            r#"{"instrumentKey":"NSE_INDEX|Nifty 50","lastTradedPrice":22150.35,"volume":12,"timestamp":1700000000123}"#,
        )
        .unwrap();
        assert_eq!(tick.instrument_key, "NSE_INDEX|Nifty 50");
        assert_eq!(tick.volume, Some(12.0));
        assert_eq!(tick.timestamp, 1_700_000_000_123);
    }

    #[test]
    fn decode_rejects_garbage() {
        for raw in [
            "not json",
            r#"{"instrumentKey":"A"}"#,
            r#"{"instrumentKey":"A","lastTradedPrice":"12","timestamp":1}"#,
            r#"{"instrumentKey":"A","lastTradedPrice":-3,"timestamp":1}"#,
        ] {
            assert!(
                matches!(decode_tick(raw), Err(PipelineError::MalformedMessage { .. })),
                "{raw} should be malformed"
            );
        }
    }

    #[test]
    fn decode_rejects_timestamp_at_i64_min() {
        let raw = r#"{"instrumentKey":"A","lastTradedPrice":10,"timestamp":-9223372036854775808}"#;
        match decode_tick(raw) {
            Err(PipelineError::MalformedMessage { reason }) => assert!(reason.contains("timestamp"), "{reason}"),
            other => panic!("expected malformed, got {other:?}"),
        }
    }
}
