//! WebSocket connection speaking OCPP-J frames over tokio-tungstenite

use crate::{
    error::{TransportError, TransportResult},
    TransportConfig,
};
use futures_util::{SinkExt, StreamExt};
use ocpp_messages::{codec, Message};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message as WsMessage,
};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Close frame received from the peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerClose {
    pub code: u16,
    pub reason: String,
}

/// WebSocket connection wrapper
pub struct WebSocketConnection<S> {
    stream: WebSocketStream<S>,
    /// Subprotocol agreed during the handshake
    subprotocol: Option<String>,
    config: TransportConfig,
}

impl<S> WebSocketConnection<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    pub fn new(
        stream: WebSocketStream<S>,
        subprotocol: Option<String>,
        config: TransportConfig,
    ) -> Self {
        Self {
            stream,
            subprotocol,
            config,
        }
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Send an OCPP-J message as one text frame
    pub async fn send_message(&mut self, message: &Message) -> TransportResult<()> {
        self.send_text(codec::serialize(message)).await
    }

    /// Send a raw text frame
    pub async fn send_text(&mut self, text: String) -> TransportResult<()> {
        debug!("Sending WebSocket message: {} bytes", text.len());

        if text.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: text.len(),
                limit: self.config.max_message_size,
            });
        }

        timeout(
            self.config.connection_timeout,
            self.stream.send(WsMessage::Text(text)),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            timeout_secs: self.config.connection_timeout.as_secs(),
        })?
        .map_err(TransportError::from)
    }

    /// Receive the next OCPP-J message, skipping control frames.
    ///
    /// A close frame from the peer ends the stream with
    /// [`TransportError::ConnectionClosed`]; use [`Self::receive_close`] to
    /// inspect its code.
    pub async fn receive_message(&mut self) -> TransportResult<Message> {
        let text = self.receive_text().await?;
        codec::parse(&text).map_err(TransportError::from)
    }

    /// Receive the next text frame, answering pings on the way
    pub async fn receive_text(&mut self) -> TransportResult<String> {
        loop {
            match self.next_frame().await? {
                WsMessage::Text(text) => return Ok(text),
                WsMessage::Close(frame) => {
                    info!("Received close frame: {:?}", frame);
                    return Err(TransportError::ConnectionClosed {
                        reason: frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "no close frame".to_string()),
                    });
                }
                WsMessage::Binary(data) => {
                    warn!("Received unexpected binary message: {} bytes", data.len());
                }
                WsMessage::Ping(data) => {
                    self.stream
                        .send(WsMessage::Pong(data))
                        .await
                        .map_err(TransportError::from)?;
                }
                WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
    }

    /// Wait until the peer closes the socket, discarding data frames
    pub async fn receive_close(&mut self) -> TransportResult<Option<PeerClose>> {
        loop {
            match self.next_frame().await {
                Ok(WsMessage::Close(frame)) => {
                    return Ok(frame.map(|f| PeerClose {
                        code: u16::from(f.code),
                        reason: f.reason.to_string(),
                    }))
                }
                Ok(other) => debug!("Discarding frame while waiting for close: {:?}", other),
                Err(TransportError::ConnectionClosed { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    async fn next_frame(&mut self) -> TransportResult<WsMessage> {
        let frame = timeout(self.config.connection_timeout, self.stream.next())
            .await
            .map_err(|_| TransportError::Timeout {
                timeout_secs: self.config.connection_timeout.as_secs(),
            })?;

        match frame {
            Some(Ok(WsMessage::Text(text))) if text.len() > self.config.max_message_size => {
                Err(TransportError::MessageTooLarge {
                    size: text.len(),
                    limit: self.config.max_message_size,
                })
            }
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(TransportError::from(e)),
            None => Err(TransportError::ConnectionClosed {
                reason: "Stream ended".to_string(),
            }),
        }
    }

    /// Close the connection with a normal close frame
    pub async fn close(&mut self) -> TransportResult<()> {
        info!("Closing WebSocket connection");
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await
            .map_err(TransportError::from)
    }
}

/// WebSocket client utilities
pub mod client {
    use super::*;
    use tokio_tungstenite::{
        connect_async_with_config,
        tungstenite::{client::IntoClientRequest, http::HeaderValue},
        MaybeTlsStream,
    };
    use url::Url;

    /// Connection type returned by [`connect`]
    pub type ClientConnection = WebSocketConnection<MaybeTlsStream<tokio::net::TcpStream>>;

    /// Connect to a central system, offering the configured subprotocols
    pub async fn connect(url: &str, config: &TransportConfig) -> TransportResult<ClientConnection> {
        info!("Connecting to WebSocket server: {}", url);

        let url = Url::parse(url).map_err(|e| TransportError::ConnectionError {
            message: format!("Invalid URL: {}", e),
        })?;

        let mut request = url.as_str().into_client_request()?;
        if !config.sub_protocols.is_empty() {
            let offered = HeaderValue::from_str(&config.sub_protocols.join(", ")).map_err(|e| {
                TransportError::HandshakeError {
                    message: format!("Invalid subprotocol list: {}", e),
                }
            })?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", offered);
        }

        let ws_config = tungstenite::protocol::WebSocketConfig {
            max_message_size: Some(config.max_message_size),
            max_frame_size: Some(config.max_message_size),
            ..Default::default()
        };

        let (ws_stream, response) = timeout(
            config.connection_timeout,
            connect_async_with_config(request, Some(ws_config), false),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            timeout_secs: config.connection_timeout.as_secs(),
        })?
        .map_err(TransportError::from)?;

        let subprotocol = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if !config.sub_protocols.is_empty() {
            match subprotocol.as_deref() {
                Some(agreed) if config.sub_protocols.iter().any(|p| p == agreed) => {}
                other => {
                    return Err(TransportError::InvalidSubprotocol {
                        protocol: other.unwrap_or("<none>").to_string(),
                    })
                }
            }
        }

        info!(subprotocol = ?subprotocol, "WebSocket connection established");
        Ok(WebSocketConnection::new(ws_stream, subprotocol, config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportConfig;

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = client::connect("not a url", &TransportConfig::default()).await;
        assert!(matches!(result, Err(TransportError::ConnectionError { .. })));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // port 9 (discard) is closed on test machines
        let config = TransportConfig {
            connection_timeout: std::time::Duration::from_secs(2),
            ..Default::default()
        };
        let result = client::connect("ws://127.0.0.1:9/CP001", &config).await;
        assert!(result.is_err());
    }
}
