//! Message envelope types for the OCPP-J protocol
//!
//! The wire form is a positional JSON array; the array codec lives in
//! `ocpp-messages`. These types are the parsed representation.

use crate::{CallErrorCode, MessageType, OcppResult};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Parsed OCPP-J frame
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Call message (request)
    Call(CallMessage),
    /// CallResult message (successful response)
    CallResult(CallResultMessage),
    /// CallError message (error response)
    CallError(CallErrorMessage),
}

impl Message {
    /// Get the message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Call(_) => MessageType::Call,
            Message::CallResult(_) => MessageType::CallResult,
            Message::CallError(_) => MessageType::CallError,
        }
    }

    /// Get the correlation id
    pub fn unique_id(&self) -> &str {
        match self {
            Message::Call(msg) => &msg.unique_id,
            Message::CallResult(msg) => &msg.unique_id,
            Message::CallError(msg) => &msg.unique_id,
        }
    }

    /// Action name for calls, the message kind otherwise
    pub fn label(&self) -> &str {
        match self {
            Message::Call(msg) => &msg.action,
            Message::CallResult(_) => "CallResult",
            Message::CallError(_) => "CallError",
        }
    }

    /// Create a CallResult message in response to a Call
    pub fn call_result<T>(unique_id: impl Into<String>, payload: T) -> OcppResult<Self>
    where
        T: Serialize,
    {
        Ok(Message::CallResult(CallResultMessage::new(unique_id, payload)?))
    }

    /// Create a CallError message in response to a Call
    pub fn call_error(
        unique_id: impl Into<String>,
        error_code: CallErrorCode,
        error_description: impl Into<String>,
        error_details: Option<Value>,
    ) -> Self {
        Message::CallError(CallErrorMessage::new(
            unique_id,
            error_code,
            error_description,
            error_details,
        ))
    }
}

/// OCPP Call message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct CallMessage {
    /// Correlation id chosen by the sender
    pub unique_id: String,
    /// Action name (e.g., "Authorize", "StartTransaction")
    pub action: String,
    /// Message payload
    pub payload: Value,
}

impl CallMessage {
    /// Create a Call with a freshly generated correlation id
    pub fn new<T>(action: impl Into<String>, payload: T) -> OcppResult<Self>
    where
        T: Serialize,
    {
        Self::with_id(Uuid::new_v4().to_string(), action, payload)
    }

    /// Create a Call with a caller supplied correlation id
    pub fn with_id<T>(
        unique_id: impl Into<String>,
        action: impl Into<String>,
        payload: T,
    ) -> OcppResult<Self>
    where
        T: Serialize,
    {
        Ok(CallMessage {
            unique_id: unique_id.into(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Extract the payload as a specific type
    pub fn payload_as<T>(&self) -> OcppResult<T>
    where
        T: DeserializeOwned,
    {
        Ok(T::deserialize(&self.payload)?)
    }
}

/// OCPP CallResult message (successful response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResultMessage {
    /// Correlation id of the answered Call
    pub unique_id: String,
    /// Response payload
    pub payload: Value,
}

impl CallResultMessage {
    pub fn new<T>(unique_id: impl Into<String>, payload: T) -> OcppResult<Self>
    where
        T: Serialize,
    {
        Ok(CallResultMessage {
            unique_id: unique_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Extract the payload as a specific type
    pub fn payload_as<T>(&self) -> OcppResult<T>
    where
        T: DeserializeOwned,
    {
        Ok(T::deserialize(&self.payload)?)
    }
}

/// OCPP CallError message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallErrorMessage {
    /// Correlation id of the answered Call
    pub unique_id: String,
    pub error_code: CallErrorCode,
    /// Human-readable error description
    pub error_description: String,
    /// Additional error details, `{}` when there are none
    pub error_details: Value,
}

impl CallErrorMessage {
    pub fn new(
        unique_id: impl Into<String>,
        error_code: CallErrorCode,
        error_description: impl Into<String>,
        error_details: Option<Value>,
    ) -> Self {
        CallErrorMessage {
            unique_id: unique_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: error_details.unwrap_or_else(|| Value::Object(Default::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_call_message_creation() {
        let payload = json!({"idTag": "12345"});
        let msg = CallMessage::new("Authorize", &payload).unwrap();

        assert_eq!(msg.action, "Authorize");
        assert!(!msg.unique_id.is_empty());
        assert_eq!(msg.payload, payload);
    }

    #[test]
    fn test_call_error_defaults_to_empty_details() {
        let msg = CallErrorMessage::new(
            "12345",
            CallErrorCode::NotImplemented,
            "Action not implemented",
            None,
        );

        assert_eq!(msg.unique_id, "12345");
        assert_eq!(msg.error_details, json!({}));
    }

    #[test]
    fn test_message_accessors() {
        let call = Message::Call(CallMessage::with_id("abc", "Heartbeat", json!({})).unwrap());
        assert_eq!(call.message_type(), MessageType::Call);
        assert_eq!(call.unique_id(), "abc");
        assert_eq!(call.label(), "Heartbeat");

        let result = Message::call_result("abc", json!({"status": "Accepted"})).unwrap();
        assert_eq!(result.message_type(), MessageType::CallResult);
        assert_eq!(result.label(), "CallResult");
    }

    #[test]
    fn test_payload_extraction() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct TestPayload {
            #[serde(rename = "idTag")]
            id_tag: String,
        }

        let payload = TestPayload {
            id_tag: "TEST123".to_string(),
        };

        let msg = CallMessage::new("Authorize", &payload).unwrap();
        let extracted: TestPayload = msg.payload_as().unwrap();
        assert_eq!(extracted, payload);

        let wrong = CallMessage::new("Authorize", json!({"other": 1})).unwrap();
        assert!(wrong.payload_as::<TestPayload>().is_err());
    }
}
