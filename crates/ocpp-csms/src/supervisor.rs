//! Heartbeat supervisor
//!
//! Periodically evicts connections that stayed silent for more than twice
//! their heartbeat interval, and times out calls past their deadline.

use crate::manager::ChargePointManager;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// What one sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<String>,
    pub expired_calls: usize,
}

pub struct HeartbeatSupervisor {
    manager: Arc<ChargePointManager>,
    period: Duration,
}

impl HeartbeatSupervisor {
    pub fn new(manager: Arc<ChargePointManager>) -> Self {
        let period = manager.config().supervisor_period();
        Self { manager, period }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Run one liveness and deadline pass at the current instant
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();

        let evicted = self
            .manager
            .registry()
            .stale(now)
            .into_iter()
            .filter(|(charger_id, connection_id)| {
                self.manager.evict_stale(charger_id, *connection_id, now)
            })
            .map(|(charger_id, _)| charger_id)
            .collect();

        let expired_calls = self.manager.correlator().expire_overdue(now).len();

        SweepReport {
            evicted,
            expired_calls,
        }
    }

    /// Sweep on a fixed period until the returned handle is stopped
    pub fn spawn(self) -> SupervisorHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            info!(period_secs = self.period.as_secs(), "Heartbeat supervisor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.sweep();
                        if report.evicted.is_empty() && report.expired_calls == 0 {
                            debug!("Supervisor sweep: nothing to do");
                        } else {
                            warn!(
                                evicted = ?report.evicted,
                                expired_calls = report.expired_calls,
                                "Supervisor sweep"
                            );
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }

            info!("Heartbeat supervisor stopped");
        });

        SupervisorHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Running supervisor task
pub struct SupervisorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!("Supervisor task failed: {}", e);
            }
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.task.abort();
        }
    }
}
