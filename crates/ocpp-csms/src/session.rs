//! Charger sessions: protocol state and lifecycle, kept across reconnects
//!
//! A session is looked up by charger identity and remembers which connection
//! currently drives it. Updates carrying a stale connection id are ignored,
//! so a replaced socket finishing late cannot overwrite its successor.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ocpp_types::v16j::{ChargePointErrorCode, ChargePointStatus, DiagnosticsStatus, FirmwareStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Protocol progress of the current connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    /// Socket upgraded, not yet reading
    Connecting,
    /// Reading, only BootNotification is accepted
    AwaitingBoot,
    Operational,
}

/// Charger lifecycle as seen by operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChargerLifecycle {
    /// Never booted
    Unregistered,
    /// Booted, no charger-wide status yet
    Registered,
    Available,
    Unavailable,
    Faulted,
    Disconnected,
}

/// Last StatusNotification of one connector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorStatus {
    pub status: ChargePointStatus,
    pub error_code: ChargePointErrorCode,
    pub info: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes reported in BootNotification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootInfo {
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub booted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargerSession {
    pub charger_id: String,
    pub state: SessionState,
    pub lifecycle: ChargerLifecycle,
    /// Connection currently driving this session
    pub connection_id: Option<Uuid>,
    pub connectors: BTreeMap<u32, ConnectorStatus>,
    pub boot: Option<BootInfo>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub diagnostics_status: Option<DiagnosticsStatus>,
    pub firmware_status: Option<FirmwareStatus>,
}

impl ChargerSession {
    fn new(charger_id: &str) -> Self {
        Self {
            charger_id: charger_id.to_string(),
            state: SessionState::Disconnected,
            lifecycle: ChargerLifecycle::Unregistered,
            connection_id: None,
            connectors: BTreeMap::new(),
            boot: None,
            last_heartbeat: None,
            diagnostics_status: None,
            firmware_status: None,
        }
    }

    /// Connector 0 speaks for the whole charger; other connectors only
    /// promote a freshly registered charger to Available.
    fn apply_status(&mut self, connector_id: u32, status: ConnectorStatus) {
        let charger_wide = match status.status {
            ChargePointStatus::Faulted if connector_id == 0 => Some(ChargerLifecycle::Faulted),
            ChargePointStatus::Unavailable if connector_id == 0 => {
                Some(ChargerLifecycle::Unavailable)
            }
            ChargePointStatus::Faulted | ChargePointStatus::Unavailable => None,
            _ if connector_id == 0 => Some(ChargerLifecycle::Available),
            _ if self.lifecycle == ChargerLifecycle::Registered => {
                Some(ChargerLifecycle::Available)
            }
            _ => None,
        };
        if let Some(lifecycle) = charger_wide {
            self.lifecycle = lifecycle;
        }
        self.connectors.insert(connector_id, status);
    }
}

/// Sessions by charger identity
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, ChargerSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new connection; the session restarts in Connecting
    pub fn attach(&self, charger_id: &str, connection_id: Uuid) {
        let mut session = self
            .sessions
            .entry(charger_id.to_string())
            .or_insert_with(|| ChargerSession::new(charger_id));
        session.connection_id = Some(connection_id);
        session.state = SessionState::Connecting;
    }

    /// Connecting -> AwaitingBoot once the socket is being read
    pub fn await_boot(&self, charger_id: &str, connection_id: Uuid) -> bool {
        self.update(charger_id, connection_id, |session| {
            if session.state == SessionState::Connecting {
                session.state = SessionState::AwaitingBoot;
            }
        })
    }

    /// Accept a BootNotification and enter Operational
    pub fn accept_boot(&self, charger_id: &str, connection_id: Uuid, boot: BootInfo) -> bool {
        self.update(charger_id, connection_id, |session| {
            session.state = SessionState::Operational;
            session.lifecycle = ChargerLifecycle::Registered;
            session.boot = Some(boot);
        })
    }

    pub fn apply_status(
        &self,
        charger_id: &str,
        connection_id: Uuid,
        connector_id: u32,
        status: ConnectorStatus,
    ) -> bool {
        self.update(charger_id, connection_id, |session| {
            session.apply_status(connector_id, status)
        })
    }

    pub fn record_heartbeat(&self, charger_id: &str, connection_id: Uuid, at: DateTime<Utc>) -> bool {
        self.update(charger_id, connection_id, |session| {
            session.last_heartbeat = Some(at)
        })
    }

    pub fn set_diagnostics_status(
        &self,
        charger_id: &str,
        connection_id: Uuid,
        status: DiagnosticsStatus,
    ) -> bool {
        self.update(charger_id, connection_id, |session| {
            session.diagnostics_status = Some(status)
        })
    }

    pub fn set_firmware_status(
        &self,
        charger_id: &str,
        connection_id: Uuid,
        status: FirmwareStatus,
    ) -> bool {
        self.update(charger_id, connection_id, |session| {
            session.firmware_status = Some(status)
        })
    }

    /// Mark the session Disconnected if `connection_id` still drives it
    pub fn detach(&self, charger_id: &str, connection_id: Uuid) -> bool {
        self.update(charger_id, connection_id, |session| {
            session.state = SessionState::Disconnected;
            session.lifecycle = ChargerLifecycle::Disconnected;
            session.connection_id = None;
        })
    }

    pub fn state(&self, charger_id: &str) -> SessionState {
        self.sessions
            .get(charger_id)
            .map(|s| s.state)
            .unwrap_or(SessionState::Disconnected)
    }

    /// True if `connection_id` drives an Operational session
    pub fn is_operational(&self, charger_id: &str, connection_id: Uuid) -> bool {
        self.sessions
            .get(charger_id)
            .map(|s| s.connection_id == Some(connection_id) && s.state == SessionState::Operational)
            .unwrap_or(false)
    }

    pub fn get(&self, charger_id: &str) -> Option<ChargerSession> {
        self.sessions.get(charger_id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn update<F>(&self, charger_id: &str, connection_id: Uuid, apply: F) -> bool
    where
        F: FnOnce(&mut ChargerSession),
    {
        match self.sessions.get_mut(charger_id) {
            Some(mut session) if session.connection_id == Some(connection_id) => {
                apply(&mut session);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot() -> BootInfo {
        BootInfo {
            vendor: "VendorX".into(),
            model: "ModelY".into(),
            serial_number: None,
            firmware_version: None,
            booted_at: Utc::now(),
        }
    }

    fn status(status: ChargePointStatus) -> ConnectorStatus {
        ConnectorStatus {
            status,
            error_code: ChargePointErrorCode::NoError,
            info: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_connect_boot_disconnect_cycle() {
        let store = SessionStore::new();
        let conn = Uuid::new_v4();

        assert_eq!(store.state("CP001"), SessionState::Disconnected);
        store.attach("CP001", conn);
        assert_eq!(store.state("CP001"), SessionState::Connecting);
        assert!(store.await_boot("CP001", conn));
        assert_eq!(store.state("CP001"), SessionState::AwaitingBoot);
        assert!(!store.is_operational("CP001", conn));

        assert!(store.accept_boot("CP001", conn, boot()));
        assert!(store.is_operational("CP001", conn));
        assert_eq!(store.get("CP001").unwrap().lifecycle, ChargerLifecycle::Registered);

        assert!(store.detach("CP001", conn));
        let session = store.get("CP001").unwrap();
        assert_eq!(session.state, SessionState::Disconnected);
        assert_eq!(session.lifecycle, ChargerLifecycle::Disconnected);
        assert!(session.boot.is_some());
    }

    #[test]
    fn test_replaced_connection_cannot_touch_session() {
        let store = SessionStore::new();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();

        store.attach("CP001", old);
        store.attach("CP001", new);
        assert!(!store.detach("CP001", old));
        assert!(!store.accept_boot("CP001", old, boot()));
        assert_eq!(store.state("CP001"), SessionState::Connecting);
    }

    #[test]
    fn test_status_drives_lifecycle() {
        let store = SessionStore::new();
        let conn = Uuid::new_v4();
        store.attach("CP001", conn);
        store.accept_boot("CP001", conn, boot());

        store.apply_status("CP001", conn, 1, status(ChargePointStatus::Preparing));
        assert_eq!(store.get("CP001").unwrap().lifecycle, ChargerLifecycle::Available);

        store.apply_status("CP001", conn, 0, status(ChargePointStatus::Faulted));
        assert_eq!(store.get("CP001").unwrap().lifecycle, ChargerLifecycle::Faulted);

        // A single connector fault does not speak for the charger
        store.apply_status("CP001", conn, 0, status(ChargePointStatus::Available));
        store.apply_status("CP001", conn, 2, status(ChargePointStatus::Faulted));
        let session = store.get("CP001").unwrap();
        assert_eq!(session.lifecycle, ChargerLifecycle::Available);
        assert_eq!(session.connectors[&2].status, ChargePointStatus::Faulted);
        assert_eq!(session.connectors.len(), 3);
    }
}
