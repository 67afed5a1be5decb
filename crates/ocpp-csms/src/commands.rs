//! Remote commands issued by operators to connected chargers

use crate::{
    correlator::{CallCorrelator, CallOutcome, PendingCallHandle},
    manager::ChargePointManager,
    registry::ConnectionRegistry,
    CsmsError, CsmsResult,
};
use ocpp_messages::{v16j::*, OcppRequest, Validate};
use ocpp_types::v16j::{ConfigurationStatus, RemoteStartStopStatus};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// Typed result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Accepted,
    /// Refused by the charger, or answered with a CallError
    Rejected { reason: String },
    Timeout,
    Cancelled,
}

/// Issues central system calls and interprets the answers
#[derive(Clone)]
pub struct CommandDispatcher {
    correlator: Arc<CallCorrelator>,
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(manager: &ChargePointManager) -> Self {
        Self {
            correlator: manager.correlator().clone(),
            registry: manager.registry().clone(),
            timeout: manager.config().call_deadline(),
        }
    }

    /// Override the deadline applied to every command
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a typed request without waiting, for callers that may cancel
    pub fn call<R: OcppRequest>(&self, charger_id: &str, request: &R) -> CsmsResult<PendingCallHandle> {
        let payload = serde_json::to_value(request).map_err(|e| CsmsError::internal(e.to_string()))?;
        self.correlator
            .begin(charger_id, R::ACTION, payload, self.timeout)
    }

    /// Withdraw a pending command by correlation id
    pub fn cancel(&self, charger_id: &str, unique_id: &str) -> bool {
        self.correlator.cancel(charger_id, unique_id)
    }

    pub async fn remote_start(
        &self,
        charger_id: &str,
        id_tag: &str,
        connector_id: Option<u32>,
    ) -> CsmsResult<CommandOutcome> {
        let request = RemoteStartTransactionRequest {
            connector_id,
            id_tag: id_tag.to_string(),
        };
        request.validate()?;

        let outcome = self.call(charger_id, &request)?.outcome().await;
        let result = interpret::<RemoteStartTransactionRequest, _>(outcome, |response| {
            start_stop_status(response.status)
        });
        info!(charger_id, id_tag, ?connector_id, outcome = ?result, "RemoteStartTransaction");
        Ok(result)
    }

    pub async fn remote_stop(&self, charger_id: &str, transaction_id: i32) -> CsmsResult<CommandOutcome> {
        let request = RemoteStopTransactionRequest { transaction_id };

        let outcome = self.call(charger_id, &request)?.outcome().await;
        let result = interpret::<RemoteStopTransactionRequest, _>(outcome, |response| {
            start_stop_status(response.status)
        });
        info!(charger_id, transaction_id, outcome = ?result, "RemoteStopTransaction");
        Ok(result)
    }

    /// Change a configuration key. An accepted `HeartbeatInterval` also
    /// updates the interval the supervisor holds the charger to.
    pub async fn change_configuration(
        &self,
        charger_id: &str,
        key: &str,
        value: &str,
    ) -> CsmsResult<CommandOutcome> {
        let request = ChangeConfigurationRequest {
            key: key.to_string(),
            value: value.to_string(),
        };
        request.validate()?;

        let outcome = self.call(charger_id, &request)?.outcome().await;
        let result = interpret::<ChangeConfigurationRequest, _>(outcome, |response| {
            match response.status {
                ConfigurationStatus::Accepted => CommandOutcome::Accepted,
                other => CommandOutcome::Rejected {
                    reason: format!("{:?}", other),
                },
            }
        });

        if result == CommandOutcome::Accepted && key.eq_ignore_ascii_case("HeartbeatInterval") {
            match value.trim().parse::<u64>() {
                Ok(seconds) if seconds > 0 => {
                    self.registry
                        .set_heartbeat_interval(charger_id, Duration::from_secs(seconds));
                }
                _ => warn!(charger_id, value, "Accepted HeartbeatInterval is not usable"),
            }
        }

        info!(charger_id, key, outcome = ?result, "ChangeConfiguration");
        Ok(result)
    }
}

fn start_stop_status(status: RemoteStartStopStatus) -> CommandOutcome {
    match status {
        RemoteStartStopStatus::Accepted => CommandOutcome::Accepted,
        RemoteStartStopStatus::Rejected => CommandOutcome::Rejected {
            reason: "Rejected".to_string(),
        },
    }
}

fn interpret<R, F>(outcome: CallOutcome, accept: F) -> CommandOutcome
where
    R: OcppRequest,
    F: FnOnce(R::Response) -> CommandOutcome,
{
    match outcome {
        CallOutcome::Result(payload) => match serde_json::from_value::<R::Response>(payload) {
            Ok(response) => accept(response),
            Err(e) => CommandOutcome::Rejected {
                reason: format!("invalid {} response: {}", R::ACTION, e),
            },
        },
        CallOutcome::Error {
            code, description, ..
        } => CommandOutcome::Rejected {
            reason: format!("{}: {}", code, description),
        },
        CallOutcome::Timeout => CommandOutcome::Timeout,
        CallOutcome::Cancelled => CommandOutcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::AllowAll,
        config::{MetricsConfig, OcppConfig},
        metrics::MetricsRegistry,
        persistence::{spawn_writer, MemoryPersistence},
    };
    use ocpp_messages::{codec, Message};
    use ocpp_transport::{ConnectionHandle, Outbound};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (Arc<ChargePointManager>, CommandDispatcher) {
        let (persistence, _task) = spawn_writer(Arc::new(MemoryPersistence::new()));
        let manager = Arc::new(ChargePointManager::new(
            &OcppConfig::default(),
            persistence,
            Arc::new(MetricsRegistry::new(&MetricsConfig::default()).unwrap()),
            Arc::new(AllowAll),
        ));
        let commands = CommandDispatcher::new(&manager);
        (manager, commands)
    }

    /// Plays the charger: answers the next Call with `payload`
    fn answer_next(
        manager: Arc<ChargePointManager>,
        mut rx: UnboundedReceiver<Outbound>,
        payload: serde_json::Value,
    ) -> tokio::task::JoinHandle<String> {
        tokio::spawn(async move {
            let Some(Outbound::Text(frame)) = rx.recv().await else {
                panic!("no call sent");
            };
            let Message::Call(call) = codec::parse(&frame).unwrap() else {
                panic!("not a call: {}", frame);
            };
            let response = Message::call_result(call.unique_id, payload).unwrap();
            manager.correlator().resolve("CP001", &response);
            call.action
        })
    }

    #[tokio::test]
    async fn test_remote_start_unavailable_without_connection() {
        let (manager, commands) = setup();
        let result = commands.remote_start("CHARGER_002", "USER_1", Some(1)).await;
        assert!(matches!(result, Err(CsmsError::ChargerUnavailable { .. })));
        assert_eq!(manager.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_start_accepted() {
        let (manager, commands) = setup();
        let (handle, rx) = ConnectionHandle::channel();
        manager.connect("CP001", handle, None);

        let charger = answer_next(manager.clone(), rx, json!({"status": "Accepted"}));
        let outcome = commands.remote_start("CP001", "USER_1", Some(1)).await.unwrap();
        assert_eq!(outcome, CommandOutcome::Accepted);
        assert_eq!(charger.await.unwrap(), "RemoteStartTransaction");
    }

    #[tokio::test]
    async fn test_remote_stop_rejected() {
        let (manager, commands) = setup();
        let (handle, rx) = ConnectionHandle::channel();
        manager.connect("CP001", handle, None);

        answer_next(manager.clone(), rx, json!({"status": "Rejected"}));
        let outcome = commands.remote_stop("CP001", 7).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_interval_renegotiated() {
        let (manager, commands) = setup();
        let (handle, rx) = ConnectionHandle::channel();
        manager.connect("CP001", handle, None);

        answer_next(manager.clone(), rx, json!({"status": "Accepted"}));
        let outcome = commands
            .change_configuration("CP001", "HeartbeatInterval", "60")
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Accepted);
        assert_eq!(manager.registry().get("CP001").unwrap().heartbeat_interval, 60);
    }

    #[tokio::test]
    async fn test_invalid_configuration_value_not_sent() {
        let (manager, commands) = setup();
        let (handle, mut rx) = ConnectionHandle::channel();
        manager.connect("CP001", handle, None);

        let result = commands
            .change_configuration("CP001", "HeartbeatInterval", "soon")
            .await;
        assert!(matches!(result, Err(CsmsError::Validation { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_outcome() {
        let (manager, commands) = setup();
        let (handle, _rx) = ConnectionHandle::channel();
        manager.connect("CP001", handle, None);

        let outcome = commands
            .with_timeout(Duration::from_secs(5))
            .remote_stop("CP001", 1)
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Timeout);
        assert_eq!(manager.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_pending_command() {
        let (manager, commands) = setup();
        let (handle, _rx) = ConnectionHandle::channel();
        manager.connect("CP001", handle, None);

        let pending = commands
            .call("CP001", &RemoteStopTransactionRequest { transaction_id: 1 })
            .unwrap();
        assert!(commands.cancel("CP001", pending.unique_id()));
        assert_eq!(pending.outcome().await, CallOutcome::Cancelled);
    }
}
