//! Error types for OCPP CSMS operations

use ocpp_messages::Message;
use ocpp_types::{CallErrorCode, OcppError};
use serde_json::json;
use thiserror::Error;

/// Main error type for CSMS operations
#[derive(Error, Debug, Clone)]
pub enum CsmsError {
    /// Frame is not a valid OCPP-J envelope
    #[error("Malformed message: {reason}")]
    MalformedMessage {
        unique_id: Option<String>,
        reason: String,
    },

    /// Message not allowed in the current session state
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// Business rule rejected the request in the current state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// No active transaction with this id for the sending charger
    #[error("Unknown transaction: {transaction_id}")]
    UnknownTransaction { transaction_id: i32 },

    /// No live connection for the charger
    #[error("Charger unavailable: {charger_id}")]
    ChargerUnavailable { charger_id: String },

    /// Payload does not deserialize into the action's request type
    #[error("Invalid {action} payload: {message}")]
    InvalidPayload { action: String, message: String },

    /// Payload deserialized but violates a field constraint
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Action is not handled by the central system
    #[error("Action not implemented: {action}")]
    NotImplemented { action: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Persistence backend error
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Transport error
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CsmsError {
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        CsmsError::ProtocolViolation {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        CsmsError::InvalidState {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CsmsError::Internal {
            message: message.into(),
        }
    }

    /// Short class name carried in `errorDetails.reason`
    pub fn class(&self) -> &'static str {
        match self {
            CsmsError::MalformedMessage { .. } => "MalformedMessage",
            CsmsError::ProtocolViolation { .. } => "ProtocolViolation",
            CsmsError::InvalidState { .. } => "InvalidState",
            CsmsError::UnknownTransaction { .. } => "UnknownTransaction",
            CsmsError::ChargerUnavailable { .. } => "ChargerUnavailable",
            CsmsError::InvalidPayload { .. } => "InvalidPayload",
            CsmsError::Validation { .. } => "Validation",
            CsmsError::NotImplemented { .. } => "NotImplemented",
            CsmsError::Configuration { .. } => "Configuration",
            CsmsError::Persistence { .. } => "Persistence",
            CsmsError::Transport { .. } => "Transport",
            CsmsError::Internal { .. } => "Internal",
        }
    }

    /// OCPP-J error code used when this error answers a Call
    pub fn call_error_code(&self) -> CallErrorCode {
        match self {
            CsmsError::MalformedMessage { .. } | CsmsError::InvalidPayload { .. } => {
                CallErrorCode::FormationViolation
            }
            CsmsError::ProtocolViolation { .. } => CallErrorCode::SecurityError,
            CsmsError::Validation { .. } => CallErrorCode::PropertyConstraintViolation,
            CsmsError::NotImplemented { .. } => CallErrorCode::NotImplemented,
            _ => CallErrorCode::GenericError,
        }
    }

    /// Build the CallError answering the Call with `unique_id`
    pub fn to_call_error(&self, unique_id: impl Into<String>) -> Message {
        Message::call_error(
            unique_id,
            self.call_error_code(),
            self.to_string(),
            Some(json!({ "reason": self.class() })),
        )
    }
}

impl From<OcppError> for CsmsError {
    fn from(err: OcppError) -> Self {
        match err {
            OcppError::MalformedMessage { unique_id, reason } => {
                CsmsError::MalformedMessage { unique_id, reason }
            }
            OcppError::InvalidMessageType(kind) => CsmsError::MalformedMessage {
                unique_id: None,
                reason: format!("unknown message type {}", kind),
            },
            OcppError::ValidationError { message } => CsmsError::Validation { message },
            OcppError::Json { message } => CsmsError::Internal { message },
        }
    }
}

impl From<ocpp_transport::TransportError> for CsmsError {
    fn from(err: ocpp_transport::TransportError) -> Self {
        CsmsError::Transport {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for CsmsError {
    fn from(err: sqlx::Error) -> Self {
        CsmsError::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<prometheus::Error> for CsmsError {
    fn from(err: prometheus::Error) -> Self {
        CsmsError::Internal {
            message: format!("metrics: {}", err),
        }
    }
}

/// Result type for CSMS operations
pub type CsmsResult<T> = Result<T, CsmsError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn error_parts(message: Message) -> (CallErrorCode, serde_json::Value) {
        match message {
            Message::CallError(err) => (err.error_code, err.error_details),
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn test_business_errors_are_generic_with_reason() {
        let (code, details) =
            error_parts(CsmsError::UnknownTransaction { transaction_id: 7 }.to_call_error("m1"));
        assert_eq!(code, CallErrorCode::GenericError);
        assert_eq!(details, json!({"reason": "UnknownTransaction"}));

        let (code, details) = error_parts(CsmsError::invalid_state("busy").to_call_error("m2"));
        assert_eq!(code, CallErrorCode::GenericError);
        assert_eq!(details, json!({"reason": "InvalidState"}));
    }

    #[test]
    fn test_protocol_errors_map_to_wire_codes() {
        assert_eq!(
            CsmsError::protocol_violation("not yet registered").call_error_code(),
            CallErrorCode::SecurityError
        );
        assert_eq!(
            CsmsError::NotImplemented {
                action: "Foo".into()
            }
            .call_error_code(),
            CallErrorCode::NotImplemented
        );
        assert_eq!(
            CsmsError::from(OcppError::validation("idTag too long")).call_error_code(),
            CallErrorCode::PropertyConstraintViolation
        );
        assert_eq!(
            CsmsError::from(OcppError::malformed(Some("x".into()), "bad")).call_error_code(),
            CallErrorCode::FormationViolation
        );
    }
}
