//! Outbound frames with audit and metrics

use crate::{
    metrics::MetricsRegistry,
    persistence::{Direction, MessageRecord, PersistenceHandle},
    registry::ConnectionRegistry,
    CsmsError, CsmsResult,
};
use chrono::Utc;
use ocpp_messages::{codec, Message};
use ocpp_transport::ConnectionHandle;
use std::sync::Arc;
use tracing::debug;

/// Every frame the engine writes or reads passes through here once
#[derive(Clone)]
pub struct Outbox {
    registry: Arc<ConnectionRegistry>,
    persistence: PersistenceHandle,
    metrics: Arc<MetricsRegistry>,
}

impl Outbox {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        persistence: PersistenceHandle,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            persistence,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn persistence(&self) -> &PersistenceHandle {
        &self.persistence
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Send to whichever connection currently owns `charger_id`
    pub fn send(&self, charger_id: &str, message: &Message) -> CsmsResult<()> {
        let handle = self
            .registry
            .handle(charger_id)
            .ok_or_else(|| CsmsError::ChargerUnavailable {
                charger_id: charger_id.to_string(),
            })?;
        self.send_on(&handle, charger_id, message)
    }

    /// Send on a specific connection, e.g. the one a Call arrived on
    pub fn send_on(
        &self,
        handle: &ConnectionHandle,
        charger_id: &str,
        message: &Message,
    ) -> CsmsResult<()> {
        let frame = codec::serialize(message);
        debug!(charger_id, "-> {}", codec::format_message_summary(message));

        handle
            .send_text(frame.clone())
            .map_err(|_| CsmsError::ChargerUnavailable {
                charger_id: charger_id.to_string(),
            })?;

        self.metrics.record_message_sent(message.label());
        self.persistence.record_message(MessageRecord {
            charger_id: charger_id.to_string(),
            direction: Direction::Outbound,
            message_type: u8::from(message.message_type()),
            unique_id: Some(message.unique_id().to_string()),
            action: action_of(message),
            frame,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Audit an inbound frame; `parsed` is `None` when it failed to decode
    pub fn record_inbound(&self, charger_id: &str, frame: &str, parsed: Option<&Message>) {
        self.metrics
            .record_message_received(parsed.map(Message::label).unwrap_or("Malformed"));
        self.persistence.record_message(MessageRecord {
            charger_id: charger_id.to_string(),
            direction: Direction::Inbound,
            message_type: parsed.map(|m| u8::from(m.message_type())).unwrap_or(0),
            unique_id: parsed.map(|m| m.unique_id().to_string()),
            action: parsed.and_then(action_of),
            frame: frame.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn action_of(message: &Message) -> Option<String> {
    match message {
        Message::Call(call) => Some(call.action.clone()),
        _ => None,
    }
}
