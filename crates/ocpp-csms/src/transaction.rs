//! Charging transactions and their start/stop rules

use crate::{persistence::TransactionRecord, CsmsError, CsmsResult};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use ocpp_types::common::Reason;
use serde::Serialize;
use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionState {
    /// Id allocated, authorization in progress
    Pending,
    Active,
    /// Stop accepted, stop data being recorded
    Stopping,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub transaction_id: i32,
    pub charger_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i32,
    pub started_at: DateTime<Utc>,
    pub meter_stop: Option<i32>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<Reason>,
    /// Latest energy register reading from MeterValues, in Wh
    pub last_meter_wh: Option<f64>,
    pub state: TransactionState,
}

impl Transaction {
    pub fn to_record(&self) -> TransactionRecord {
        TransactionRecord {
            transaction_id: self.transaction_id,
            charger_id: self.charger_id.clone(),
            connector_id: self.connector_id,
            id_tag: self.id_tag.clone(),
            meter_start: self.meter_start,
            started_at: self.started_at,
            meter_stop: self.meter_stop,
            stopped_at: self.stopped_at,
            stop_reason: self.stop_reason.map(|r| r.to_string()),
        }
    }
}

/// Stop data from a StopTransaction request
#[derive(Debug, Clone)]
pub struct StopRequest {
    pub transaction_id: i32,
    pub meter_stop: i32,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<Reason>,
}

/// Open transactions and the id allocator.
///
/// Completed transactions are handed to persistence and dropped from memory,
/// so a repeated stop finds nothing and is rejected as unknown.
#[derive(Debug)]
pub struct TransactionLedger {
    next_id: AtomicI32,
    transactions: DashMap<i32, Transaction>,
    /// (charger, connector) -> transaction holding it
    occupied: DashMap<(String, u32), i32>,
}

impl TransactionLedger {
    pub fn new(first_id: i32) -> Self {
        Self {
            next_id: AtomicI32::new(first_id),
            transactions: DashMap::new(),
            occupied: DashMap::new(),
        }
    }

    /// Never hand out an id at or below `last_id`
    pub fn seed(&self, last_id: i32) {
        self.next_id
            .fetch_max(last_id.saturating_add(1), Ordering::SeqCst);
    }

    /// Reserve the connector and allocate an id; the transaction starts Pending.
    ///
    /// Fails with [`CsmsError::InvalidState`] if the connector already holds
    /// a Pending or Active transaction.
    pub fn open(
        &self,
        charger_id: &str,
        connector_id: u32,
        id_tag: &str,
        meter_start: i32,
        started_at: DateTime<Utc>,
    ) -> CsmsResult<i32> {
        match self.occupied.entry((charger_id.to_string(), connector_id)) {
            Entry::Occupied(existing) => Err(CsmsError::invalid_state(format!(
                "connector {} of {} already has transaction {}",
                connector_id,
                charger_id,
                existing.get()
            ))),
            Entry::Vacant(slot) => {
                let transaction_id = self.next_id.fetch_add(1, Ordering::SeqCst);
                self.transactions.insert(
                    transaction_id,
                    Transaction {
                        transaction_id,
                        charger_id: charger_id.to_string(),
                        connector_id,
                        id_tag: id_tag.to_string(),
                        meter_start,
                        started_at,
                        meter_stop: None,
                        stopped_at: None,
                        stop_reason: None,
                        last_meter_wh: None,
                        state: TransactionState::Pending,
                    },
                );
                slot.insert(transaction_id);
                Ok(transaction_id)
            }
        }
    }

    /// Pending -> Active
    pub fn activate(&self, transaction_id: i32) -> CsmsResult<Transaction> {
        let mut transaction = self
            .transactions
            .get_mut(&transaction_id)
            .ok_or(CsmsError::UnknownTransaction { transaction_id })?;
        if transaction.state != TransactionState::Pending {
            return Err(CsmsError::invalid_state(format!(
                "transaction {} is {:?}, not Pending",
                transaction_id, transaction.state
            )));
        }
        transaction.state = TransactionState::Active;
        Ok(transaction.clone())
    }

    /// Active -> Stopping -> Completed, returning the completed transaction.
    ///
    /// Unknown ids, transactions of another charger and transactions that
    /// are not Active are all [`CsmsError::UnknownTransaction`].
    pub fn stop(&self, charger_id: &str, stop: StopRequest) -> CsmsResult<Transaction> {
        let unknown = CsmsError::UnknownTransaction {
            transaction_id: stop.transaction_id,
        };

        let completed = {
            let mut transaction = match self.transactions.get_mut(&stop.transaction_id) {
                Some(t) if t.charger_id == charger_id && t.state == TransactionState::Active => t,
                _ => return Err(unknown),
            };

            if stop.timestamp < transaction.started_at {
                return Err(CsmsError::invalid_state(format!(
                    "stop time {} precedes start time {}",
                    stop.timestamp, transaction.started_at
                )));
            }

            transaction.state = TransactionState::Stopping;
            transaction.meter_stop = Some(stop.meter_stop);
            transaction.stopped_at = Some(stop.timestamp);
            transaction.stop_reason = stop.reason;
            transaction.state = TransactionState::Completed;
            transaction.clone()
        };

        self.transactions.remove(&completed.transaction_id);
        self.occupied
            .remove_if(&(completed.charger_id.clone(), completed.connector_id), |_, id| {
                *id == completed.transaction_id
            });
        Ok(completed)
    }

    /// Record an energy reading on an Active transaction of `charger_id`
    pub fn record_meter_sample(&self, charger_id: &str, transaction_id: i32, wh: f64) -> bool {
        match self.transactions.get_mut(&transaction_id) {
            Some(mut t) if t.charger_id == charger_id && t.state == TransactionState::Active => {
                t.last_meter_wh = Some(wh);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, transaction_id: i32) -> Option<Transaction> {
        self.transactions.get(&transaction_id).map(|t| t.clone())
    }

    /// Transaction currently holding a connector
    pub fn open_on(&self, charger_id: &str, connector_id: u32) -> Option<i32> {
        self.occupied
            .get(&(charger_id.to_string(), connector_id))
            .map(|id| *id)
    }

    /// Active transactions of a charger, by connector
    pub fn active_for(&self, charger_id: &str) -> Vec<Transaction> {
        let mut active: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| t.charger_id == charger_id && t.state == TransactionState::Active)
            .map(|t| t.clone())
            .collect();
        active.sort_by_key(|t| t.connector_id);
        active
    }

    pub fn active_count(&self) -> usize {
        self.transactions
            .iter()
            .filter(|t| t.state == TransactionState::Active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn started(ledger: &TransactionLedger, charger: &str, connector: u32) -> (i32, DateTime<Utc>) {
        let at = Utc::now();
        let id = ledger.open(charger, connector, "USER_123", 0, at).unwrap();
        ledger.activate(id).unwrap();
        (id, at)
    }

    fn stop_at(id: i32, at: DateTime<Utc>) -> StopRequest {
        StopRequest {
            transaction_id: id,
            meter_stop: 500,
            timestamp: at,
            reason: Some(Reason::Local),
        }
    }

    #[test]
    fn test_start_stop_cycle() {
        let ledger = TransactionLedger::new(1);
        let (id, at) = started(&ledger, "CP001", 1);
        assert_eq!(id, 1);
        assert_eq!(ledger.open_on("CP001", 1), Some(1));
        assert_eq!(ledger.active_for("CP001").len(), 1);

        let done = ledger.stop("CP001", stop_at(id, at + Duration::minutes(5))).unwrap();
        assert_eq!(done.state, TransactionState::Completed);
        assert_eq!(done.meter_stop, Some(500));
        assert_eq!(ledger.open_on("CP001", 1), None);

        // Repeated stop
        assert!(matches!(
            ledger.stop("CP001", stop_at(id, at + Duration::minutes(6))),
            Err(CsmsError::UnknownTransaction { transaction_id: 1 })
        ));

        // The connector is free again and ids keep increasing
        let (next, _) = started(&ledger, "CP001", 1);
        assert_eq!(next, 2);
    }

    #[test]
    fn test_second_start_on_connector_rejected() {
        let ledger = TransactionLedger::new(1);
        started(&ledger, "CP001", 1);
        assert!(matches!(
            ledger.open("CP001", 1, "OTHER", 0, Utc::now()),
            Err(CsmsError::InvalidState { .. })
        ));
        // Other connectors and chargers are independent
        assert!(ledger.open("CP001", 2, "OTHER", 0, Utc::now()).is_ok());
        assert!(ledger.open("CP002", 1, "OTHER", 0, Utc::now()).is_ok());
    }

    #[test]
    fn test_stop_before_start_rejected() {
        let ledger = TransactionLedger::new(1);
        let (id, at) = started(&ledger, "CP001", 1);
        assert!(matches!(
            ledger.stop("CP001", stop_at(id, at - Duration::seconds(1))),
            Err(CsmsError::InvalidState { .. })
        ));
        assert_eq!(ledger.get(id).unwrap().state, TransactionState::Active);
        assert!(ledger.stop("CP001", stop_at(id, at)).is_ok());
    }

    #[test]
    fn test_cross_charger_stop_unknown() {
        let ledger = TransactionLedger::new(1);
        let (id, at) = started(&ledger, "CP001", 1);
        assert!(matches!(
            ledger.stop("CP002", stop_at(id, at)),
            Err(CsmsError::UnknownTransaction { .. })
        ));
        assert!(!ledger.record_meter_sample("CP002", id, 10.0));
        assert!(ledger.record_meter_sample("CP001", id, 10.0));
        assert_eq!(ledger.get(id).unwrap().last_meter_wh, Some(10.0));
    }

    #[test]
    fn test_pending_not_stoppable() {
        let ledger = TransactionLedger::new(1);
        let id = ledger.open("CP001", 1, "USER_123", 0, Utc::now()).unwrap();
        assert!(matches!(
            ledger.stop("CP001", stop_at(id, Utc::now())),
            Err(CsmsError::UnknownTransaction { .. })
        ));
    }

    #[test]
    fn test_seed_only_moves_forward() {
        let ledger = TransactionLedger::new(1);
        ledger.seed(41);
        assert_eq!(ledger.open("CP001", 1, "T", 0, Utc::now()).unwrap(), 42);
        ledger.seed(10);
        assert_eq!(ledger.open("CP001", 2, "T", 0, Utc::now()).unwrap(), 43);
    }
}
