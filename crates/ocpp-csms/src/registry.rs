//! Live connection table, one entry per charger identity

use crate::{CsmsError, CsmsResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ocpp_transport::ConnectionHandle;
use serde::Serialize;
use std::{net::SocketAddr, time::Duration};
use tokio::time::Instant;
use uuid::Uuid;

/// One live WebSocket bound to a charger identity
#[derive(Debug, Clone)]
pub struct ChargerConnection {
    pub charger_id: String,
    pub handle: ConnectionHandle,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    /// Interval the charger was told to heartbeat at
    pub heartbeat_interval: Duration,
}

impl ChargerConnection {
    pub fn new(
        charger_id: impl Into<String>,
        handle: ConnectionHandle,
        remote_addr: Option<SocketAddr>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            charger_id: charger_id.into(),
            handle,
            remote_addr,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            heartbeat_interval,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.handle.id()
    }

    /// Silent for longer than twice the heartbeat interval
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.heartbeat_interval * 2
    }
}

/// Read-only view of a connection for status queries
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub charger_id: String,
    pub connection_id: Uuid,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub idle_seconds: u64,
    pub heartbeat_interval: u64,
}

/// Charger identity to live connection.
///
/// DashMap shards give per-key locking; guards are never held across an
/// await point or a send.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ChargerConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `connection` to its identity, returning the connection it replaced
    pub fn attach(&self, connection: ChargerConnection) -> Option<ChargerConnection> {
        self.connections
            .insert(connection.charger_id.clone(), connection)
    }

    /// Remove the entry only if it still belongs to `connection_id`
    pub fn detach(&self, charger_id: &str, connection_id: Uuid) -> Option<ChargerConnection> {
        self.connections
            .remove_if(charger_id, |_, c| c.connection_id() == connection_id)
            .map(|(_, connection)| connection)
    }

    /// Remove the entry only if it still belongs to `connection_id` and is
    /// still stale at `now`
    pub fn detach_if_stale(
        &self,
        charger_id: &str,
        connection_id: Uuid,
        now: Instant,
    ) -> Option<ChargerConnection> {
        self.connections
            .remove_if(charger_id, |_, c| {
                c.connection_id() == connection_id && c.is_stale(now)
            })
            .map(|(_, connection)| connection)
    }

    /// Refresh last activity. Returns false if `connection_id` no longer owns the identity.
    pub fn touch(&self, charger_id: &str, connection_id: Uuid) -> bool {
        match self.connections.get_mut(charger_id) {
            Some(mut entry) if entry.connection_id() == connection_id => {
                entry.last_activity = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn set_heartbeat_interval(&self, charger_id: &str, interval: Duration) -> bool {
        match self.connections.get_mut(charger_id) {
            Some(mut entry) => {
                entry.heartbeat_interval = interval;
                true
            }
            None => false,
        }
    }

    pub fn handle(&self, charger_id: &str) -> Option<ConnectionHandle> {
        self.connections.get(charger_id).map(|c| c.handle.clone())
    }

    pub fn owns(&self, charger_id: &str, connection_id: Uuid) -> bool {
        self.connections
            .get(charger_id)
            .map(|c| c.connection_id() == connection_id)
            .unwrap_or(false)
    }

    pub fn is_connected(&self, charger_id: &str) -> bool {
        self.connections.contains_key(charger_id)
    }

    /// Queue a text frame on the charger's socket
    pub fn send_text(&self, charger_id: &str, text: String) -> CsmsResult<()> {
        let handle = self
            .handle(charger_id)
            .ok_or_else(|| CsmsError::ChargerUnavailable {
                charger_id: charger_id.to_string(),
            })?;

        handle
            .send_text(text)
            .map_err(|_| CsmsError::ChargerUnavailable {
                charger_id: charger_id.to_string(),
            })
    }

    /// Identities and connection ids of every stale connection
    pub fn stale(&self, now: Instant) -> Vec<(String, Uuid)> {
        self.connections
            .iter()
            .filter(|entry| entry.is_stale(now))
            .map(|entry| (entry.charger_id.clone(), entry.connection_id()))
            .collect()
    }

    pub fn get(&self, charger_id: &str) -> Option<ConnectionInfo> {
        let now = Instant::now();
        self.connections.get(charger_id).map(|c| info(&c, now))
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let mut all: Vec<_> = self.connections.iter().map(|c| info(&c, now)).collect();
        all.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));
        all
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove and return every connection
    pub fn drain(&self) -> Vec<ChargerConnection> {
        let ids: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.connections.remove(&id).map(|(_, c)| c))
            .collect()
    }
}

fn info(connection: &ChargerConnection, now: Instant) -> ConnectionInfo {
    ConnectionInfo {
        charger_id: connection.charger_id.clone(),
        connection_id: connection.connection_id(),
        remote_addr: connection.remote_addr,
        connected_at: connection.connected_at,
        idle_seconds: now
            .saturating_duration_since(connection.last_activity)
            .as_secs(),
        heartbeat_interval: connection.heartbeat_interval.as_secs(),
    }
}
