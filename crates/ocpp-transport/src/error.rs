//! Transport layer error types

use thiserror::Error;

/// Transport layer errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// WebSocket connection error
    #[error("WebSocket connection error: {message}")]
    ConnectionError { message: String },

    /// WebSocket protocol error
    #[error("WebSocket protocol error: {message}")]
    ProtocolError { message: String },

    /// Frame could not be decoded as an OCPP-J message
    #[error("Message decoding error: {message}")]
    DecodeError { message: String },

    /// Message too large
    #[error("Message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// Connection timeout
    #[error("Connection timeout after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// Connection closed
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// Server did not agree on an OCPP subprotocol
    #[error("Invalid subprotocol: {protocol}")]
    InvalidSubprotocol { protocol: String },

    /// IO error
    #[error("IO error: {message}")]
    IoError { message: String },

    /// Handshake error
    #[error("WebSocket handshake error: {message}")]
    HandshakeError { message: String },

    /// Internal error
    #[error("Internal transport error: {message}")]
    Internal { message: String },
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed => TransportError::ConnectionClosed {
                reason: "WebSocket connection closed".to_string(),
            },
            tungstenite::Error::AlreadyClosed => TransportError::ConnectionClosed {
                reason: "WebSocket already closed".to_string(),
            },
            tungstenite::Error::Protocol(msg) => TransportError::ProtocolError {
                message: msg.to_string(),
            },
            tungstenite::Error::Io(io_err) => TransportError::IoError {
                message: io_err.to_string(),
            },
            tungstenite::Error::Http(response) => TransportError::HandshakeError {
                message: format!("server answered HTTP {}", response.status()),
            },
            _ => TransportError::Internal {
                message: err.to_string(),
            },
        }
    }
}

impl From<ocpp_types::OcppError> for TransportError {
    fn from(err: ocpp_types::OcppError) -> Self {
        TransportError::DecodeError {
            message: err.to_string(),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let error = TransportError::MessageTooLarge {
            size: 100000,
            limit: 65536,
        };
        let message = error.to_string();
        assert!(message.contains("100000"));
        assert!(message.contains("65536"));
    }

    #[test]
    fn test_error_conversion_from_io() {
        let io_error =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "Connection refused");

        match TransportError::from(io_error) {
            TransportError::IoError { message } => assert!(message.contains("Connection refused")),
            other => panic!("Expected IoError, got {other:?}"),
        }
    }

    #[test]
    fn test_error_conversion_from_tungstenite() {
        match TransportError::from(tungstenite::Error::ConnectionClosed) {
            TransportError::ConnectionClosed { reason } => assert!(reason.contains("closed")),
            other => panic!("Expected ConnectionClosed, got {other:?}"),
        }
    }

    #[test]
    fn test_error_conversion_from_ocpp() {
        let error = ocpp_types::OcppError::malformed(None, "not an array");
        assert!(matches!(
            TransportError::from(error),
            TransportError::DecodeError { .. }
        ));
    }
}
