//! Charge point manager: owns the engine state and drives each connection

use crate::{
    auth::Authorizer,
    config::OcppConfig,
    correlator::{CallCorrelator, PendingCallInfo},
    metrics::MetricsRegistry,
    outbox::Outbox,
    persistence::{PersistenceHandle, StationAttributes},
    registry::{ChargerConnection, ConnectionInfo, ConnectionRegistry},
    session::{ChargerSession, SessionStore},
    transaction::{Transaction, TransactionLedger},
    CsmsError,
};
use ocpp_messages::{Message, MessageCodec};
use ocpp_transport::{close_code, ConnectionHandle};
use ocpp_types::OcppError;
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc, time::Instant as StdInstant};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why the central system closed a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Another connection claimed the identity
    Duplicate,
    /// No traffic for twice the heartbeat interval
    Stale,
    Shutdown,
}

impl EvictionReason {
    pub fn label(&self) -> &'static str {
        match self {
            EvictionReason::Duplicate => "duplicate",
            EvictionReason::Stale => "stale",
            EvictionReason::Shutdown => "shutdown",
        }
    }

    pub fn close_code(&self) -> u16 {
        match self {
            EvictionReason::Duplicate => close_code::POLICY_VIOLATION,
            EvictionReason::Stale | EvictionReason::Shutdown => close_code::GOING_AWAY,
        }
    }

    fn description(&self) -> &'static str {
        match self {
            EvictionReason::Duplicate => "replaced by a newer connection",
            EvictionReason::Stale => "heartbeat timeout",
            EvictionReason::Shutdown => "server shutting down",
        }
    }
}

/// Everything known about one charger
#[derive(Debug, Clone, Serialize)]
pub struct ChargerStatus {
    pub session: ChargerSession,
    pub connection: Option<ConnectionInfo>,
    pub active_transactions: Vec<Transaction>,
    pub pending_calls: Vec<PendingCallInfo>,
}

/// Charge point manager
pub struct ChargePointManager {
    pub(crate) config: OcppConfig,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) sessions: SessionStore,
    pub(crate) ledger: TransactionLedger,
    pub(crate) correlator: Arc<CallCorrelator>,
    pub(crate) outbox: Outbox,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    codec: MessageCodec,
}

impl ChargePointManager {
    pub fn new(
        config: &OcppConfig,
        persistence: PersistenceHandle,
        metrics: Arc<MetricsRegistry>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let outbox = Outbox::new(registry.clone(), persistence, metrics);

        Self {
            config: config.clone(),
            correlator: Arc::new(CallCorrelator::new(outbox.clone())),
            registry,
            sessions: SessionStore::new(),
            ledger: TransactionLedger::new(config.first_transaction_id),
            outbox,
            authorizer,
            codec: MessageCodec::new(config.max_message_size),
        }
    }

    pub fn config(&self) -> &OcppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    pub fn correlator(&self) -> &Arc<CallCorrelator> {
        &self.correlator
    }

    fn persistence(&self) -> &PersistenceHandle {
        self.outbox.persistence()
    }

    fn metrics(&self) -> &Arc<MetricsRegistry> {
        self.outbox.metrics()
    }

    /// Bind a freshly upgraded socket to `charger_id`.
    ///
    /// A connection already holding the identity is closed and removed
    /// before this one can be read from.
    pub fn connect(
        &self,
        charger_id: &str,
        handle: ConnectionHandle,
        remote_addr: Option<SocketAddr>,
    ) {
        let connection_id = handle.id();
        let connection = ChargerConnection::new(
            charger_id,
            handle,
            remote_addr,
            self.config.heartbeat_period(),
        );

        if let Some(previous) = self.registry.attach(connection) {
            let reason = EvictionReason::Duplicate;
            warn!(
                charger_id,
                old_connection = %previous.connection_id(),
                new_connection = %connection_id,
                "Evicting previous connection"
            );
            previous.handle.close(reason.close_code(), reason.description());
            self.metrics().record_eviction(reason.label());
        }

        self.sessions.attach(charger_id, connection_id);
        self.metrics().set_active_connections(self.registry.len());
        info!(charger_id, connection_id = %connection_id, remote_addr = ?remote_addr, "Charger connected");
    }

    /// The socket task is reading; the charger must now boot
    pub fn connection_ready(&self, charger_id: &str, connection_id: Uuid) {
        self.sessions.await_boot(charger_id, connection_id);
    }

    /// Process one inbound text frame from `handle`'s socket.
    ///
    /// Calls are answered on the same socket; responses are handed to the
    /// correlator. Nothing here closes the connection.
    pub async fn handle_frame(&self, charger_id: &str, handle: &ConnectionHandle, frame: &str) {
        let started = StdInstant::now();
        let connection_id = handle.id();
        self.registry.touch(charger_id, connection_id);

        let message = match self.codec.decode(frame) {
            Ok(message) => message,
            Err(err) => {
                self.outbox.record_inbound(charger_id, frame, None);
                self.reject_malformed(charger_id, handle, err);
                return;
            }
        };
        self.outbox.record_inbound(charger_id, frame, Some(&message));
        debug!(charger_id, "<- {}", ocpp_messages::codec::format_message_summary(&message));

        match &message {
            Message::Call(call) => {
                let response = self.handle_call(charger_id, connection_id, call).await;
                if let Err(e) = self.outbox.send_on(handle, charger_id, &response) {
                    debug!(charger_id, error = %e, "Response not delivered");
                }
            }
            Message::CallResult(_) | Message::CallError(_) => {
                self.correlator.resolve(charger_id, &message);
            }
        }

        self.metrics().record_message_processing_duration(
            message.label(),
            started.elapsed().as_secs_f64(),
        );
    }

    fn reject_malformed(&self, charger_id: &str, handle: &ConnectionHandle, err: OcppError) {
        let error = CsmsError::from(err);
        let unique_id = match &error {
            CsmsError::MalformedMessage {
                unique_id: Some(id),
                ..
            } => id.clone(),
            _ => {
                warn!(charger_id, error = %error, "Dropping malformed frame without correlation id");
                return;
            }
        };

        warn!(charger_id, unique_id = %unique_id, error = %error, "Malformed frame");
        if let Err(e) = self
            .outbox
            .send_on(handle, charger_id, &error.to_call_error(unique_id))
        {
            debug!(charger_id, error = %e, "CallError not delivered");
        }
    }

    /// Tear down after the socket closed. Returns false if the connection
    /// had already been replaced or evicted.
    pub fn disconnect(&self, charger_id: &str, connection_id: Uuid, reason: &str) -> bool {
        let removed = self.registry.detach(charger_id, connection_id).is_some();
        if removed {
            self.mark_offline(charger_id, connection_id);
            info!(charger_id, connection_id = %connection_id, reason, "Charger disconnected");
        } else {
            debug!(charger_id, connection_id = %connection_id, "Connection already detached");
        }
        removed
    }

    /// Force-close a connection if it still owns the identity
    pub fn evict(&self, charger_id: &str, connection_id: Uuid, reason: EvictionReason) -> bool {
        match self.registry.detach(charger_id, connection_id) {
            Some(connection) => {
                self.close_evicted(connection, reason);
                true
            }
            None => false,
        }
    }

    /// Evict a connection that is still silent at `now`. Activity since the
    /// stale check keeps it attached.
    pub fn evict_stale(&self, charger_id: &str, connection_id: Uuid, now: Instant) -> bool {
        match self.registry.detach_if_stale(charger_id, connection_id, now) {
            Some(connection) => {
                self.close_evicted(connection, EvictionReason::Stale);
                true
            }
            None => false,
        }
    }

    fn close_evicted(&self, connection: ChargerConnection, reason: EvictionReason) {
        let charger_id = connection.charger_id.as_str();
        let connection_id = connection.connection_id();
        warn!(charger_id, connection_id = %connection_id, reason = reason.label(), "Evicting charger");
        connection
            .handle
            .close(reason.close_code(), reason.description());
        self.metrics().record_eviction(reason.label());
        self.mark_offline(charger_id, connection_id);
    }

    fn mark_offline(&self, charger_id: &str, connection_id: Uuid) {
        self.sessions.detach(charger_id, connection_id);
        self.persistence().upsert_station(StationAttributes {
            online: Some(false),
            ..StationAttributes::new(charger_id)
        });
        self.metrics().set_active_connections(self.registry.len());
    }

    /// Close every live connection and cancel outstanding calls
    pub fn shutdown(&self) {
        let connections = self.registry.drain();
        let reason = EvictionReason::Shutdown;
        for connection in &connections {
            connection
                .handle
                .close(reason.close_code(), reason.description());
            self.metrics().record_eviction(reason.label());
            self.mark_offline(&connection.charger_id, connection.connection_id());
        }

        let cancelled = self.correlator.cancel_all();
        info!(
            connections = connections.len(),
            cancelled_calls = cancelled,
            "Charge point manager shut down"
        );
    }

    /// Live connections, by charger identity
    pub fn get_active_chargers(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }

    pub fn get_charger_status(&self, charger_id: &str) -> Option<ChargerStatus> {
        let session = self.sessions.get(charger_id)?;
        Some(ChargerStatus {
            session,
            connection: self.registry.get(charger_id),
            active_transactions: self.ledger.active_for(charger_id),
            pending_calls: self.correlator.pending_for(charger_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::AllowAll,
        config::MetricsConfig,
        persistence::{spawn_writer, MemoryPersistence},
        session::SessionState,
    };
    use ocpp_transport::Outbound;

    fn manager() -> ChargePointManager {
        let (persistence, _task) = spawn_writer(Arc::new(MemoryPersistence::new()));
        ChargePointManager::new(
            &OcppConfig::default(),
            persistence,
            Arc::new(MetricsRegistry::new(&MetricsConfig::default()).unwrap()),
            Arc::new(AllowAll),
        )
    }

    #[tokio::test]
    async fn test_duplicate_identity_closes_previous() {
        let manager = manager();
        let (first, mut first_rx) = ConnectionHandle::channel();
        let (second, _second_rx) = ConnectionHandle::channel();

        manager.connect("CP001", first.clone(), None);
        manager.connect("CP001", second.clone(), None);

        assert_eq!(
            first_rx.recv().await,
            Some(Outbound::Close {
                code: close_code::POLICY_VIOLATION,
                reason: "replaced by a newer connection".into()
            })
        );
        assert_eq!(manager.registry().len(), 1);
        assert!(manager.registry().owns("CP001", second.id()));

        // The old socket's cleanup leaves the new connection alone
        assert!(!manager.disconnect("CP001", first.id(), "closed"));
        assert_eq!(manager.sessions().state("CP001"), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_evict_and_shutdown() {
        let manager = manager();
        let (a, mut a_rx) = ConnectionHandle::channel();
        let (b, mut b_rx) = ConnectionHandle::channel();
        manager.connect("CP001", a.clone(), None);
        manager.connect("CP002", b, None);

        assert!(manager.evict("CP001", a.id(), EvictionReason::Stale));
        assert!(!manager.evict("CP001", a.id(), EvictionReason::Stale));
        assert!(matches!(
            a_rx.recv().await,
            Some(Outbound::Close { code: close_code::GOING_AWAY, .. })
        ));
        assert_eq!(manager.sessions().state("CP001"), SessionState::Disconnected);

        manager.shutdown();
        assert!(matches!(b_rx.recv().await, Some(Outbound::Close { .. })));
        assert!(manager.get_active_chargers().is_empty());
        assert_eq!(manager.sessions().state("CP002"), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_frames() {
        let manager = manager();
        let (handle, mut rx) = ConnectionHandle::channel();
        manager.connect("CP001", handle.clone(), None);

        // Recoverable id: answered with FormationViolation
        manager.handle_frame("CP001", &handle, r#"[2,"m1","Heartbeat"]"#).await;
        match rx.recv().await {
            Some(Outbound::Text(text)) => {
                assert!(text.starts_with(r#"[4,"m1","FormationViolation""#), "{}", text)
            }
            other => panic!("expected CallError, got {:?}", other),
        }

        // No id: dropped
        manager.handle_frame("CP001", &handle, "not json").await;
        assert!(rx.try_recv().is_err());
        assert!(manager.registry().is_connected("CP001"));
    }
}
