//! # OCPP Messages
//!
//! Typed OCPP 1.6J payloads, the positional-array envelope codec and the
//! field validation applied to inbound payloads.

pub mod codec;
pub mod v16j;
pub mod validation;

pub use codec::MessageCodec;
pub use ocpp_types::{CallErrorMessage, CallMessage, CallResultMessage, Message, MessageType};
pub use validation::Validate;

use serde::{de::DeserializeOwned, Serialize};

/// Binds a request payload to its OCPP action name and response payload
pub trait OcppRequest: Serialize + DeserializeOwned + Send + Sync {
    /// Action name as it appears on the wire
    const ACTION: &'static str;
    /// The corresponding response type
    type Response: Serialize + DeserializeOwned + Send + Sync;
}

/// Utility functions for working with OCPP messages
pub mod utils {
    use super::*;
    use ocpp_types::OcppResult;

    /// Generate a unique message ID
    pub fn generate_message_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Build a Call for a typed request with the given correlation id
    pub fn create_call<T: OcppRequest>(unique_id: impl Into<String>, request: &T) -> OcppResult<Message> {
        Ok(Message::Call(CallMessage::with_id(unique_id, T::ACTION, request)?))
    }

    /// Check whether an action name belongs to the messages a charge point initiates
    pub fn is_charge_point_action(action: &str) -> bool {
        matches!(
            action,
            "Authorize"
                | "BootNotification"
                | "DataTransfer"
                | "DiagnosticsStatusNotification"
                | "FirmwareStatusNotification"
                | "Heartbeat"
                | "MeterValues"
                | "StartTransaction"
                | "StatusNotification"
                | "StopTransaction"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v16j::{HeartbeatRequest, RemoteStopTransactionRequest};
    use serde_json::json;

    #[test]
    fn test_create_call_uses_action_name() {
        let request = RemoteStopTransactionRequest { transaction_id: 42 };
        let message = utils::create_call("corr-1", &request).unwrap();

        match message {
            Message::Call(call) => {
                assert_eq!(call.unique_id, "corr-1");
                assert_eq!(call.action, "RemoteStopTransaction");
                assert_eq!(call.payload, json!({"transactionId": 42}));
            }
            other => panic!("expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_generate_message_id_unique() {
        assert_ne!(utils::generate_message_id(), utils::generate_message_id());
    }

    #[test]
    fn test_charge_point_actions() {
        assert!(utils::is_charge_point_action(HeartbeatRequest::ACTION));
        assert!(!utils::is_charge_point_action("RemoteStartTransaction"));
        assert!(!utils::is_charge_point_action("SignCertificate"));
    }
}
