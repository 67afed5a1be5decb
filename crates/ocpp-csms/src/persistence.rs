//! Storage collaborator for audit logging, stations and transactions
//!
//! The engine never waits on storage. Records are pushed onto an unbounded
//! channel through [`PersistenceHandle`] and a single writer task hands them
//! to the configured [`Persistence`] backend, logging failures.

use crate::CsmsResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use tokio::{sync::mpsc, sync::oneshot, task::JoinHandle};
use tracing::{debug, warn};

/// Which way a frame travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Charger to central system
    Inbound,
    /// Central system to charger
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// One audited frame
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub charger_id: String,
    pub direction: Direction,
    /// 2, 3 or 4; 0 when the frame could not be parsed
    pub message_type: u8,
    pub unique_id: Option<String>,
    pub action: Option<String>,
    /// Raw frame text
    pub frame: String,
    pub timestamp: DateTime<Utc>,
}

/// Station attributes to merge into the stored row. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationAttributes {
    pub charger_id: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub online: Option<bool>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl StationAttributes {
    pub fn new(charger_id: impl Into<String>) -> Self {
        Self {
            charger_id: charger_id.into(),
            ..Default::default()
        }
    }

    fn merge_into(&self, stored: &mut StationAttributes) {
        fn keep<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        keep(&mut stored.vendor, &self.vendor);
        keep(&mut stored.model, &self.model);
        keep(&mut stored.serial_number, &self.serial_number);
        keep(&mut stored.firmware_version, &self.firmware_version);
        keep(&mut stored.online, &self.online);
        keep(&mut stored.last_heartbeat, &self.last_heartbeat);
    }
}

/// Transaction row as handed to storage
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub transaction_id: i32,
    pub charger_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i32,
    pub started_at: DateTime<Utc>,
    pub meter_stop: Option<i32>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
}

/// Storage backend contract
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn record_message(&self, record: &MessageRecord) -> CsmsResult<()>;

    async fn upsert_station(&self, station: &StationAttributes) -> CsmsResult<()>;

    async fn create_transaction(&self, transaction: &TransactionRecord) -> CsmsResult<()>;

    async fn complete_transaction(&self, transaction: &TransactionRecord) -> CsmsResult<()>;

    /// Whether the station has a stored row. Backends without a station
    /// registry admit everyone.
    async fn station_exists(&self, _charger_id: &str) -> CsmsResult<bool> {
        Ok(true)
    }

    /// Highest transaction id ever stored, used to seed the id allocator
    async fn last_transaction_id(&self) -> CsmsResult<Option<i32>> {
        Ok(None)
    }

    async fn health_check(&self) -> CsmsResult<()> {
        Ok(())
    }
}

/// Work item for the writer task
#[derive(Debug)]
pub enum PersistenceEvent {
    Message(MessageRecord),
    Station(StationAttributes),
    TransactionStarted(TransactionRecord),
    TransactionCompleted(TransactionRecord),
    /// Answered once every earlier event has been handed to the backend
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget sender used by the engine
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    sender: mpsc::UnboundedSender<PersistenceEvent>,
}

impl PersistenceHandle {
    pub fn record_message(&self, record: MessageRecord) {
        self.submit(PersistenceEvent::Message(record));
    }

    pub fn upsert_station(&self, station: StationAttributes) {
        self.submit(PersistenceEvent::Station(station));
    }

    pub fn create_transaction(&self, transaction: TransactionRecord) {
        self.submit(PersistenceEvent::TransactionStarted(transaction));
    }

    pub fn complete_transaction(&self, transaction: TransactionRecord) {
        self.submit(PersistenceEvent::TransactionCompleted(transaction));
    }

    /// Wait until everything queued so far has been written (or failed)
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.submit(PersistenceEvent::Flush(tx));
        let _ = rx.await;
    }

    fn submit(&self, event: PersistenceEvent) {
        if self.sender.send(event).is_err() {
            debug!("Persistence writer stopped, dropping record");
        }
    }
}

/// Start the writer task for `backend`.
///
/// The task ends once every [`PersistenceHandle`] clone has been dropped.
pub fn spawn_writer(backend: Arc<dyn Persistence>) -> (PersistenceHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let result = match &event {
                PersistenceEvent::Message(record) => backend.record_message(record).await,
                PersistenceEvent::Station(station) => backend.upsert_station(station).await,
                PersistenceEvent::TransactionStarted(tx) => backend.create_transaction(tx).await,
                PersistenceEvent::TransactionCompleted(tx) => {
                    backend.complete_transaction(tx).await
                }
                PersistenceEvent::Flush(_) => Ok(()),
            };

            if let Err(e) = result {
                warn!(error = %e, "Persistence write failed: {:?}", event_kind(&event));
            }

            if let PersistenceEvent::Flush(done) = event {
                let _ = done.send(());
            }
        }
        debug!("Persistence writer finished");
    });

    (PersistenceHandle { sender }, task)
}

fn event_kind(event: &PersistenceEvent) -> &'static str {
    match event {
        PersistenceEvent::Message(_) => "message",
        PersistenceEvent::Station(_) => "station",
        PersistenceEvent::TransactionStarted(_) => "transaction start",
        PersistenceEvent::TransactionCompleted(_) => "transaction completion",
        PersistenceEvent::Flush(_) => "flush",
    }
}

/// Records kept by [`MemoryPersistence::new`]
pub const DEFAULT_MEMORY_RETENTION: usize = 10_000;

#[derive(Debug, Default)]
struct MemoryState {
    messages: VecDeque<MessageRecord>,
    stations: HashMap<String, StationAttributes>,
    open_transactions: BTreeMap<i32, TransactionRecord>,
    completed_transactions: VecDeque<TransactionRecord>,
    last_transaction_id: Option<i32>,
}

/// In-process backend used when no database is configured.
///
/// The message audit and completed transactions are ring buffers of
/// `retention` entries; open transactions and stations are always kept.
#[derive(Debug)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
    retention: usize,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_MEMORY_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            retention: retention.max(1),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Retained audit records, oldest first
    pub fn messages(&self) -> Vec<MessageRecord> {
        self.state().messages.iter().cloned().collect()
    }

    pub fn station(&self, charger_id: &str) -> Option<StationAttributes> {
        self.state().stations.get(charger_id).cloned()
    }

    /// Add a station row ahead of its first connection
    pub fn register_station(&self, charger_id: &str) {
        self.state()
            .stations
            .entry(charger_id.to_string())
            .or_insert_with(|| StationAttributes::new(charger_id));
    }

    pub fn transaction(&self, transaction_id: i32) -> Option<TransactionRecord> {
        let state = self.state();
        state
            .open_transactions
            .get(&transaction_id)
            .or_else(|| {
                state
                    .completed_transactions
                    .iter()
                    .rev()
                    .find(|tx| tx.transaction_id == transaction_id)
            })
            .cloned()
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, retention: usize) {
    while ring.len() >= retention {
        ring.pop_front();
    }
    ring.push_back(item);
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn record_message(&self, record: &MessageRecord) -> CsmsResult<()> {
        push_bounded(&mut self.state().messages, record.clone(), self.retention);
        Ok(())
    }

    async fn upsert_station(&self, station: &StationAttributes) -> CsmsResult<()> {
        let mut state = self.state();
        let stored = state
            .stations
            .entry(station.charger_id.clone())
            .or_insert_with(|| StationAttributes::new(station.charger_id.clone()));
        station.merge_into(stored);
        Ok(())
    }

    async fn create_transaction(&self, transaction: &TransactionRecord) -> CsmsResult<()> {
        let mut state = self.state();
        state.last_transaction_id = state.last_transaction_id.max(Some(transaction.transaction_id));
        state
            .open_transactions
            .insert(transaction.transaction_id, transaction.clone());
        Ok(())
    }

    async fn complete_transaction(&self, transaction: &TransactionRecord) -> CsmsResult<()> {
        let mut state = self.state();
        state.last_transaction_id = state.last_transaction_id.max(Some(transaction.transaction_id));
        state.open_transactions.remove(&transaction.transaction_id);
        push_bounded(&mut state.completed_transactions, transaction.clone(), self.retention);
        Ok(())
    }

    async fn station_exists(&self, charger_id: &str) -> CsmsResult<bool> {
        Ok(self.state().stations.contains_key(charger_id))
    }

    async fn last_transaction_id(&self) -> CsmsResult<Option<i32>> {
        Ok(self.state().last_transaction_id)
    }
}
