//! # OCPP Transport
//!
//! Transport plumbing shared by the central system and its tooling:
//!
//! - [`ConnectionHandle`]: the sending half of one live WebSocket, owned by the
//!   connection registry while the socket task owns the receiving half
//! - WebSocket close codes used for forced closes
//! - path and subprotocol helpers for the upgrade handshake
//! - a tokio-tungstenite client connection speaking OCPP-J frames

pub mod error;
pub mod handle;
pub mod websocket;

pub use error::*;
pub use handle::{ConnectionHandle, Outbound};

use std::time::Duration;

/// WebSocket subprotocol of OCPP 1.6-J
pub const OCPP16_SUBPROTOCOL: &str = "ocpp1.6";

/// WebSocket close codes used by the central system
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Server going away (shutdown, liveness timeout)
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation (identity taken over, station not registered)
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Server-side failure while admitting the connection
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum message size in bytes
    pub max_message_size: usize,
    /// Connect / send / receive timeout
    pub connection_timeout: Duration,
    /// WebSocket sub-protocols offered by clients
    pub sub_protocols: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: 65536,
            connection_timeout: Duration::from_secs(30),
            sub_protocols: vec![OCPP16_SUBPROTOCOL.to_string()],
        }
    }
}

/// Utility functions
pub mod utils {
    /// Extract the charge point identity from a WebSocket path.
    ///
    /// The identity is the last non-empty path segment, so both `/CP001` and
    /// `/ocpp/CP001/` resolve to `CP001`.
    pub fn extract_charge_point_id(path: &str) -> Option<&str> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        path.rsplit('/').find(|segment| !segment.is_empty())
    }

    /// Pick the first subprotocol offered by the client that the server supports.
    /// `offered` is the raw `Sec-WebSocket-Protocol` header value.
    pub fn negotiate_subprotocol(offered: &str, supported: &[String]) -> Option<String> {
        offered
            .split(',')
            .map(str::trim)
            .find(|protocol| supported.iter().any(|s| s.eq_ignore_ascii_case(protocol)))
            .map(str::to_string)
    }

    /// Create WebSocket URL for charge point
    pub fn create_websocket_url(base_url: &str, charge_point_id: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), charge_point_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.max_message_size, 65536);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.sub_protocols, vec!["ocpp1.6".to_string()]);
    }

    #[test]
    fn test_extract_charge_point_id() {
        assert_eq!(utils::extract_charge_point_id("/CP001"), Some("CP001"));
        assert_eq!(utils::extract_charge_point_id("/ocpp/CP001"), Some("CP001"));
        assert_eq!(utils::extract_charge_point_id("/ocpp/CP001/"), Some("CP001"));
        assert_eq!(utils::extract_charge_point_id("/CP001?token=x"), Some("CP001"));
        assert_eq!(utils::extract_charge_point_id("/"), None);
        assert_eq!(utils::extract_charge_point_id(""), None);
    }

    #[test]
    fn test_negotiate_subprotocol() {
        let supported = vec![OCPP16_SUBPROTOCOL.to_string()];
        assert_eq!(
            utils::negotiate_subprotocol("ocpp2.0.1, ocpp1.6", &supported),
            Some("ocpp1.6".to_string())
        );
        assert_eq!(utils::negotiate_subprotocol("ocpp2.0.1", &supported), None);
        assert_eq!(utils::negotiate_subprotocol("", &supported), None);
    }

    #[test]
    fn test_create_websocket_url() {
        assert_eq!(
            utils::create_websocket_url("ws://localhost:9000/ocpp/", "CP001"),
            "ws://localhost:9000/ocpp/CP001"
        );
    }
}
