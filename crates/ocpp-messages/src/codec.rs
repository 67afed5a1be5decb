//! OCPP-J envelope codec
//!
//! Converts between raw WebSocket text frames and [`Message`] envelopes.
//! Only the positional-array structure is checked here; payload contents are
//! interpreted by the handlers of each action.

use ocpp_types::{
    CallErrorCode, CallErrorMessage, CallMessage, CallResultMessage, Message, MessageType,
    OcppError, OcppResult,
};
use serde_json::Value;

/// Default upper bound for an inbound frame
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65536;

/// Envelope codec with a frame size limit
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MessageCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Decode a text frame, enforcing the size limit first
    pub fn decode(&self, frame: &str) -> OcppResult<Message> {
        if frame.len() > self.max_message_size {
            return Err(OcppError::malformed(
                leading_unique_id(frame),
                format!(
                    "message size {} exceeds maximum allowed size {}",
                    frame.len(),
                    self.max_message_size
                ),
            ));
        }
        parse(frame)
    }

    /// Encode an envelope to its wire form
    pub fn encode(&self, message: &Message) -> String {
        serialize(message)
    }
}

/// Correlation id of a frame too large to parse, read from its prefix
/// `[<type>,"<id>"`. Escaped ids are not recovered.
fn leading_unique_id(frame: &str) -> Option<String> {
    let rest = frame.trim_start().strip_prefix('[')?.trim_start();
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    let rest = rest.trim_start().strip_prefix(',')?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find(|c| c == '"' || c == '\\')?;
    if !rest[end..].starts_with('"') || end > 36 {
        return None;
    }
    Some(rest[..end].to_string())
}

/// Parse a text frame into an envelope.
///
/// Fails with [`OcppError::MalformedMessage`]; the correlation id is attached
/// to the error whenever the second array element is a string.
pub fn parse(frame: &str) -> OcppResult<Message> {
    let value: Value = serde_json::from_str(frame)
        .map_err(|e| OcppError::malformed(None, format!("invalid JSON: {}", e)))?;

    let Value::Array(mut array) = value else {
        return Err(OcppError::malformed(None, "OCPP message must be a JSON array"));
    };

    let unique_id = array.get(1).and_then(Value::as_str).map(str::to_string);

    let message_type = array
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            OcppError::malformed(unique_id.clone(), "first element must be a message type number")
        })
        .and_then(|raw| {
            MessageType::try_from(raw).map_err(|e| OcppError::malformed(unique_id.clone(), e.to_string()))
        })?;

    let Some(unique_id) = unique_id else {
        return Err(OcppError::malformed(None, "second element must be a unique id string"));
    };

    if array.len() != message_type.arity() {
        return Err(OcppError::malformed(
            Some(unique_id),
            format!(
                "{:?} message must have exactly {} elements, got {}",
                message_type,
                message_type.arity(),
                array.len()
            ),
        ));
    }

    // array length is fixed from here on; drain the tail by value
    let mut tail = array.split_off(2).into_iter();
    let mut next = || tail.next().unwrap_or(Value::Null);

    match message_type {
        MessageType::Call => {
            let Value::String(action) = next() else {
                return Err(OcppError::malformed(Some(unique_id), "action must be a string"));
            };
            let payload = expect_object(next(), &unique_id, "payload")?;
            Ok(Message::Call(CallMessage {
                unique_id,
                action,
                payload,
            }))
        }
        MessageType::CallResult => {
            let payload = expect_object(next(), &unique_id, "payload")?;
            Ok(Message::CallResult(CallResultMessage { unique_id, payload }))
        }
        MessageType::CallError => {
            let Value::String(code) = next() else {
                return Err(OcppError::malformed(Some(unique_id), "error code must be a string"));
            };
            let Value::String(error_description) = next() else {
                return Err(OcppError::malformed(
                    Some(unique_id),
                    "error description must be a string",
                ));
            };
            let error_details = expect_object(next(), &unique_id, "error details")?;
            let error_code = CallErrorCode::from_wire(&code).unwrap_or_else(|| {
                tracing::debug!(code = %code, "Unknown call error code, treating as GenericError");
                CallErrorCode::GenericError
            });
            Ok(Message::CallError(CallErrorMessage {
                unique_id,
                error_code,
                error_description,
                error_details,
            }))
        }
    }
}

fn expect_object(value: Value, unique_id: &str, what: &str) -> OcppResult<Value> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(OcppError::malformed(
            Some(unique_id.to_string()),
            format!("{} must be a JSON object", what),
        ))
    }
}

/// Serialize an envelope into the positional-array wire form
pub fn serialize(message: &Message) -> String {
    to_value(message).to_string()
}

/// Positional-array JSON value of an envelope
pub fn to_value(message: &Message) -> Value {
    match message {
        Message::Call(call) => Value::Array(vec![
            Value::from(u8::from(MessageType::Call)),
            Value::String(call.unique_id.clone()),
            Value::String(call.action.clone()),
            call.payload.clone(),
        ]),
        Message::CallResult(result) => Value::Array(vec![
            Value::from(u8::from(MessageType::CallResult)),
            Value::String(result.unique_id.clone()),
            result.payload.clone(),
        ]),
        Message::CallError(error) => Value::Array(vec![
            Value::from(u8::from(MessageType::CallError)),
            Value::String(error.unique_id.clone()),
            Value::String(error.error_code.as_str().to_string()),
            Value::String(error.error_description.clone()),
            error.error_details.clone(),
        ]),
    }
}

/// One-line summary of an envelope for logs
pub fn format_message_summary(message: &Message) -> String {
    match message {
        Message::Call(call) => format!("Call[{}] {}", call.unique_id, call.action),
        Message::CallResult(result) => format!("CallResult[{}]", result.unique_id),
        Message::CallError(error) => format!(
            "CallError[{}] {}: {}",
            error.unique_id, error.error_code, error.error_description
        ),
    }
}
