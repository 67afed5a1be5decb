//! Central system calls awaiting an answer from a charger
//!
//! Each outstanding call is keyed by (charger identity, correlation id) and
//! owns a oneshot sender. Whoever removes the entry from the table first
//! decides the outcome: a matching CallResult/CallError, the caller's own
//! deadline, the supervisor's overdue sweep, or an explicit cancel. Removal
//! happens under the charger's shard lock, so exactly one of them wins.

use crate::{metrics::MetricsRegistry, outbox::Outbox, CsmsError, CsmsResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ocpp_messages::{CallMessage, Message};
use ocpp_types::CallErrorCode;
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::oneshot,
    time::{timeout_at, Instant},
};
use tracing::{debug, warn};
use uuid::Uuid;

/// How a central system call ended
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// CallResult payload
    Result(Value),
    /// CallError sent by the charger
    Error {
        code: CallErrorCode,
        description: String,
        details: Value,
    },
    /// No answer before the deadline
    Timeout,
    /// Withdrawn before an answer arrived
    Cancelled,
}

impl CallOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CallOutcome::Result(_) => "result",
            CallOutcome::Error { .. } => "error",
            CallOutcome::Timeout => "timeout",
            CallOutcome::Cancelled => "cancelled",
        }
    }
}

/// A call awaiting its answer
#[derive(Debug)]
pub struct PendingCall {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
    pub issued_at: DateTime<Utc>,
    pub deadline: Instant,
    responder: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    fn settle(self, outcome: CallOutcome) {
        // The caller may have given up already
        let _ = self.responder.send(outcome);
    }
}

/// Summary of a pending call for status queries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingCallInfo {
    pub unique_id: String,
    pub action: String,
    pub issued_at: DateTime<Utc>,
}

struct PendingTable {
    calls: DashMap<String, HashMap<String, PendingCall>>,
    metrics: Arc<MetricsRegistry>,
}

impl PendingTable {
    fn take(&self, charger_id: &str, unique_id: &str) -> Option<PendingCall> {
        let call = self
            .calls
            .get_mut(charger_id)
            .and_then(|mut calls| calls.remove(unique_id));
        if call.is_some() {
            self.calls.remove_if(charger_id, |_, calls| calls.is_empty());
            self.metrics.set_pending_calls(self.count());
        }
        call
    }

    fn count(&self) -> usize {
        self.calls.iter().map(|calls| calls.len()).sum()
    }
}

/// Tracks outstanding central system calls
pub struct CallCorrelator {
    table: Arc<PendingTable>,
    outbox: Outbox,
}

impl CallCorrelator {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            table: Arc::new(PendingTable {
                calls: DashMap::new(),
                metrics: outbox.metrics().clone(),
            }),
            outbox,
        }
    }

    /// Register and transmit a Call, returning a handle to await its outcome.
    ///
    /// Fails with [`CsmsError::ChargerUnavailable`] without sending anything
    /// when the charger has no live connection.
    pub fn begin(
        &self,
        charger_id: &str,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> CsmsResult<PendingCallHandle> {
        if !self.outbox.registry().is_connected(charger_id) {
            return Err(CsmsError::ChargerUnavailable {
                charger_id: charger_id.to_string(),
            });
        }

        let (responder, receiver) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let unique_id = {
            let mut calls = self.table.calls.entry(charger_id.to_string()).or_default();
            let mut unique_id = Uuid::new_v4().to_string();
            while calls.contains_key(&unique_id) {
                unique_id = Uuid::new_v4().to_string();
            }
            calls.insert(
                unique_id.clone(),
                PendingCall {
                    unique_id: unique_id.clone(),
                    action: action.to_string(),
                    payload: payload.clone(),
                    issued_at: Utc::now(),
                    deadline,
                    responder,
                },
            );
            unique_id
        };
        self.table.metrics.set_pending_calls(self.table.count());

        let handle = PendingCallHandle {
            charger_id: charger_id.to_string(),
            unique_id: unique_id.clone(),
            action: action.to_string(),
            deadline,
            receiver: Some(receiver),
            table: self.table.clone(),
        };

        let message = Message::Call(CallMessage {
            unique_id,
            action: action.to_string(),
            payload,
        });
        // On failure the handle's Drop removes the entry
        self.outbox.send(charger_id, &message)?;

        debug!(charger_id, unique_id = %handle.unique_id, action, "Call sent");
        Ok(handle)
    }

    /// Send a Call and wait for its outcome
    pub async fn send(
        &self,
        charger_id: &str,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> CsmsResult<CallOutcome> {
        Ok(self.begin(charger_id, action, payload, timeout)?.outcome().await)
    }

    /// Hand a CallResult or CallError to the call it answers.
    ///
    /// Returns false when nothing was waiting for it.
    pub fn resolve(&self, charger_id: &str, message: &Message) -> bool {
        let outcome = match message {
            Message::CallResult(result) => CallOutcome::Result(result.payload.clone()),
            Message::CallError(error) => CallOutcome::Error {
                code: error.error_code,
                description: error.error_description.clone(),
                details: error.error_details.clone(),
            },
            Message::Call(_) => return false,
        };

        match self.table.take(charger_id, message.unique_id()) {
            Some(call) => {
                debug!(
                    charger_id,
                    unique_id = %call.unique_id,
                    action = %call.action,
                    outcome = outcome.label(),
                    "Call resolved"
                );
                call.settle(outcome);
                true
            }
            None => {
                warn!(
                    charger_id,
                    unique_id = message.unique_id(),
                    "Discarding response with no pending call"
                );
                false
            }
        }
    }

    /// Withdraw a pending call; its waiter sees [`CallOutcome::Cancelled`]
    pub fn cancel(&self, charger_id: &str, unique_id: &str) -> bool {
        match self.table.take(charger_id, unique_id) {
            Some(call) => {
                debug!(charger_id, unique_id, "Call cancelled");
                call.settle(CallOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Time out every call whose deadline has passed
    pub fn expire_overdue(&self, now: Instant) -> Vec<(String, String)> {
        let overdue: Vec<(String, String)> = self
            .table
            .calls
            .iter()
            .flat_map(|entry| {
                let charger_id = entry.key().clone();
                entry
                    .value()
                    .values()
                    .filter(|call| call.deadline <= now)
                    .map(|call| (charger_id.clone(), call.unique_id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        overdue
            .into_iter()
            .filter(|(charger_id, unique_id)| match self.table.take(charger_id, unique_id) {
                Some(call) => {
                    warn!(charger_id = %charger_id, unique_id = %unique_id, action = %call.action, "Call overdue");
                    call.settle(CallOutcome::Timeout);
                    true
                }
                None => false,
            })
            .collect()
    }

    /// Cancel everything, used on shutdown
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<(String, String)> = self
            .table
            .calls
            .iter()
            .flat_map(|entry| {
                let charger_id = entry.key().clone();
                entry
                    .value()
                    .keys()
                    .map(|id| (charger_id.clone(), id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        keys.iter()
            .filter(|(charger_id, unique_id)| self.cancel(charger_id, unique_id))
            .count()
    }

    pub fn pending_for(&self, charger_id: &str) -> Vec<PendingCallInfo> {
        self.table
            .calls
            .get(charger_id)
            .map(|calls| {
                calls
                    .values()
                    .map(|call| PendingCallInfo {
                        unique_id: call.unique_id.clone(),
                        action: call.action.clone(),
                        issued_at: call.issued_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.table.count()
    }
}

/// Owned by whoever issued the call.
///
/// Dropping the handle before the outcome is known withdraws the call.
pub struct PendingCallHandle {
    charger_id: String,
    unique_id: String,
    action: String,
    deadline: Instant,
    receiver: Option<oneshot::Receiver<CallOutcome>>,
    table: Arc<PendingTable>,
}

impl PendingCallHandle {
    pub fn charger_id(&self) -> &str {
        &self.charger_id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the answer, the deadline, or a cancel
    pub async fn outcome(mut self) -> CallOutcome {
        let outcome = match self.receiver.as_mut() {
            Some(receiver) => match timeout_at(self.deadline, &mut *receiver).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => CallOutcome::Cancelled,
                Err(_) => match self.table.take(&self.charger_id, &self.unique_id) {
                    Some(_) => CallOutcome::Timeout,
                    // Whoever took the entry sends right after taking it
                    None => receiver.await.unwrap_or(CallOutcome::Cancelled),
                },
            },
            None => CallOutcome::Cancelled,
        };
        self.receiver = None;

        self.table.metrics.record_call_outcome(outcome.label());
        outcome
    }
}

impl Drop for PendingCallHandle {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            self.table.take(&self.charger_id, &self.unique_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MetricsConfig,
        persistence::{spawn_writer, MemoryPersistence},
        registry::{ChargerConnection, ConnectionRegistry},
    };
    use ocpp_messages::codec;
    use ocpp_transport::{ConnectionHandle, Outbound};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (CallCorrelator, UnboundedReceiver<Outbound>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, receiver) = ConnectionHandle::channel();
        registry.attach(ChargerConnection::new(
            "CP001",
            handle,
            None,
            Duration::from_secs(300),
        ));
        let (persistence, _task) = spawn_writer(Arc::new(MemoryPersistence::new()));
        let metrics = Arc::new(MetricsRegistry::new(&MetricsConfig::default()).unwrap());
        (
            CallCorrelator::new(Outbox::new(registry, persistence, metrics)),
            receiver,
        )
    }

    async fn sent_call(receiver: &mut UnboundedReceiver<Outbound>) -> CallMessage {
        match receiver.recv().await {
            Some(Outbound::Text(frame)) => match codec::parse(&frame).unwrap() {
                Message::Call(call) => call,
                other => panic!("expected Call, got {:?}", other),
            },
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_result_resolves_call() {
        let (correlator, mut rx) = setup();
        let handle = correlator
            .begin("CP001", "RemoteStopTransaction", json!({"transactionId": 1}), Duration::from_secs(30))
            .unwrap();
        let call = sent_call(&mut rx).await;
        assert_eq!(call.unique_id, handle.unique_id());
        assert_eq!(correlator.pending_count(), 1);

        let response = Message::call_result(call.unique_id.clone(), json!({"status": "Accepted"})).unwrap();
        assert!(correlator.resolve("CP001", &response));
        assert_eq!(handle.outcome().await, CallOutcome::Result(json!({"status": "Accepted"})));
        assert_eq!(correlator.pending_count(), 0);

        // A duplicate answer finds nothing
        assert!(!correlator.resolve("CP001", &response));
    }

    #[tokio::test]
    async fn test_call_error_resolves_call() {
        let (correlator, mut rx) = setup();
        let handle = correlator
            .begin("CP001", "ChangeConfiguration", json!({}), Duration::from_secs(30))
            .unwrap();
        let call = sent_call(&mut rx).await;

        let error = Message::call_error(call.unique_id, CallErrorCode::NotSupported, "nope", None);
        assert!(correlator.resolve("CP001", &error));
        match handle.outcome().await {
            CallOutcome::Error { code, description, .. } => {
                assert_eq!(code, CallErrorCode::NotSupported);
                assert_eq!(description, "nope");
            }
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_from_other_charger_ignored() {
        let (correlator, mut rx) = setup();
        let handle = correlator
            .begin("CP001", "RemoteStopTransaction", json!({}), Duration::from_secs(30))
            .unwrap();
        let call = sent_call(&mut rx).await;

        let response = Message::call_result(call.unique_id, json!({})).unwrap();
        assert!(!correlator.resolve("CP002", &response));
        assert_eq!(correlator.pending_count(), 1);
        drop(handle);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_taken_at_deadline_is_delivered() {
        let (correlator, mut rx) = setup();
        let handle = correlator
            .begin("CP001", "RemoteStopTransaction", json!({}), Duration::from_secs(30))
            .unwrap();
        let call = sent_call(&mut rx).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        // the answer won the table but has not been sent yet
        let taken = correlator.table.take("CP001", &call.unique_id).unwrap();
        let waiter = tokio::spawn(handle.outcome());
        tokio::task::yield_now().await;
        taken.settle(CallOutcome::Result(json!({"status": "Accepted"})));

        assert_eq!(
            waiter.await.unwrap(),
            CallOutcome::Result(json!({"status": "Accepted"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_times_out_and_late_answer_discarded() {
        let (correlator, mut rx) = setup();
        let handle = correlator
            .begin("CP001", "RemoteStartTransaction", json!({}), Duration::from_secs(30))
            .unwrap();
        let call = sent_call(&mut rx).await;

        assert_eq!(handle.outcome().await, CallOutcome::Timeout);
        assert_eq!(correlator.pending_count(), 0);

        let late = Message::call_result(call.unique_id, json!({"status": "Accepted"})).unwrap();
        assert!(!correlator.resolve("CP001", &late));
    }

    #[tokio::test]
    async fn test_cancel_signals_cancelled() {
        let (correlator, _rx) = setup();
        let handle = correlator
            .begin("CP001", "RemoteStartTransaction", json!({}), Duration::from_secs(30))
            .unwrap();
        let id = handle.unique_id().to_string();

        assert!(correlator.cancel("CP001", &id));
        assert!(!correlator.cancel("CP001", &id));
        assert_eq!(handle.outcome().await, CallOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_overdue() {
        let (correlator, _rx) = setup();
        let short = correlator
            .begin("CP001", "A", json!({}), Duration::from_secs(5))
            .unwrap();
        let long = correlator
            .begin("CP001", "B", json!({}), Duration::from_secs(60))
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let expired = correlator.expire_overdue(Instant::now());
        assert_eq!(expired, vec![("CP001".to_string(), short.unique_id().to_string())]);
        assert_eq!(short.outcome().await, CallOutcome::Timeout);
        assert_eq!(correlator.pending_count(), 1);
        drop(long);
    }

    #[tokio::test]
    async fn test_unknown_charger_unavailable() {
        let (correlator, _rx) = setup();
        let result = correlator.begin("CP404", "RemoteStartTransaction", json!({}), Duration::from_secs(30));
        assert!(matches!(result, Err(CsmsError::ChargerUnavailable { .. })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_socket_unavailable_and_not_tracked() {
        let (correlator, rx) = setup();
        drop(rx);
        let result = correlator.begin("CP001", "RemoteStartTransaction", json!({}), Duration::from_secs(30));
        assert!(matches!(result, Err(CsmsError::ChargerUnavailable { .. })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_unique_among_outstanding() {
        let (correlator, _rx) = setup();
        let handles: Vec<_> = (0..50)
            .map(|_| {
                correlator
                    .begin("CP001", "A", json!({}), Duration::from_secs(30))
                    .unwrap()
            })
            .collect();
        let ids: std::collections::HashSet<_> = handles.iter().map(|h| h.unique_id().to_string()).collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(correlator.pending_for("CP001").len(), 50);
    }
}
