//! Error types for OCPP operations

use thiserror::Error;

/// Errors raised while decoding or validating OCPP data
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OcppError {
    /// Invalid message type identifier
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u64),

    /// Frame is not a well-formed OCPP-J envelope
    #[error("Malformed message: {reason}")]
    MalformedMessage {
        /// Correlation id, when it could be recovered from the frame
        unique_id: Option<String>,
        reason: String,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {message}")]
    Json { message: String },

    /// Payload field violates an OCPP constraint
    #[error("Message validation error: {message}")]
    ValidationError { message: String },
}

impl OcppError {
    /// Build a malformed-message error
    pub fn malformed(unique_id: Option<String>, reason: impl Into<String>) -> Self {
        OcppError::MalformedMessage {
            unique_id,
            reason: reason.into(),
        }
    }

    /// Build a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        OcppError::ValidationError {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for OcppError {
    fn from(err: serde_json::Error) -> Self {
        OcppError::Json {
            message: err.to_string(),
        }
    }
}

/// OCPP-J call error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CallErrorCode {
    /// Requested Action is not known by receiver
    NotImplemented,

    /// Requested Action is recognized but not supported by the receiver
    NotSupported,

    /// An internal error occurred and the receiver was not able to process the requested Action successfully
    InternalError,

    /// Payload for Action is incomplete
    ProtocolError,

    /// During the processing of Action a security issue occurred preventing receiver from completing the Action successfully
    SecurityError,

    /// Payload for Action is syntactically incorrect or not conform the PDU structure for Action
    FormationViolation,

    /// Payload is syntactically correct but at least one field contains an invalid value
    PropertyConstraintViolation,

    /// Payload for Action is syntactically correct but at least one of the fields violates occurrence constraints
    OccurrenceConstraintViolation,

    /// Payload for Action is syntactically correct but at least one of the fields violates data type constraints
    TypeConstraintViolation,

    /// Any other error not covered by the above
    GenericError,
}

impl std::fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CallErrorCode {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CallErrorCode::NotImplemented => "NotImplemented",
            CallErrorCode::NotSupported => "NotSupported",
            CallErrorCode::InternalError => "InternalError",
            CallErrorCode::ProtocolError => "ProtocolError",
            CallErrorCode::SecurityError => "SecurityError",
            CallErrorCode::FormationViolation => "FormationViolation",
            CallErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            CallErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            CallErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            CallErrorCode::GenericError => "GenericError",
        }
    }

    /// Parse a wire error code. Codes outside OCPP 1.6 are reported as `None`.
    pub fn from_wire(code: &str) -> Option<Self> {
        let code = match code {
            "NotImplemented" => CallErrorCode::NotImplemented,
            "NotSupported" => CallErrorCode::NotSupported,
            "InternalError" => CallErrorCode::InternalError,
            "ProtocolError" => CallErrorCode::ProtocolError,
            "SecurityError" => CallErrorCode::SecurityError,
            "FormationViolation" => CallErrorCode::FormationViolation,
            // spelling variants found in deployed firmwares
            "FormatViolation" => CallErrorCode::FormationViolation,
            "PropertyConstraintViolation" => CallErrorCode::PropertyConstraintViolation,
            "OccurenceConstraintViolation" | "OccurrenceConstraintViolation" => {
                CallErrorCode::OccurrenceConstraintViolation
            }
            "TypeConstraintViolation" => CallErrorCode::TypeConstraintViolation,
            "GenericError" => CallErrorCode::GenericError,
            _ => return None,
        };
        Some(code)
    }
}

/// Result type alias for OCPP operations
pub type OcppResult<T> = Result<T, OcppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_code_wire_names() {
        assert_eq!(CallErrorCode::NotImplemented.to_string(), "NotImplemented");
        assert_eq!(
            CallErrorCode::from_wire("SecurityError"),
            Some(CallErrorCode::SecurityError)
        );
        assert_eq!(
            CallErrorCode::from_wire("FormatViolation"),
            Some(CallErrorCode::FormationViolation)
        );
        assert_eq!(CallErrorCode::from_wire("Nonsense"), None);
    }

    #[test]
    fn test_call_error_code_serialization() {
        let json = serde_json::to_string(&CallErrorCode::PropertyConstraintViolation).unwrap();
        assert_eq!(json, "\"PropertyConstraintViolation\"");

        let deserialized: CallErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, CallErrorCode::PropertyConstraintViolation);
    }

    #[test]
    fn test_ocpp_error_from_serde_json() {
        let json_error = serde_json::from_str::<i32>("invalid json").unwrap_err();
        match OcppError::from(json_error) {
            OcppError::Json { message } => assert!(!message.is_empty()),
            other => panic!("Expected Json error, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_display() {
        let error = OcppError::malformed(Some("abc".to_string()), "wrong arity");
        assert_eq!(error.to_string(), "Malformed message: wrong arity");
    }
}
