//! # OCPP Central System Management System (CSMS)
//!
//! OCPP 1.6-J central system protocol engine. Chargers connect over
//! WebSocket; the engine keeps one connection per charger identity,
//! drives each charger's session and transaction state machines, answers
//! charger-initiated calls and correlates the answers to remote commands.
//!
//! ## Components
//!
//! - **Connection registry**: live sockets keyed by charger identity, last writer wins
//! - **Call correlator**: outstanding central system calls with deadlines
//! - **Sessions and transactions**: BootNotification gating, connector occupancy
//! - **Heartbeat supervisor**: evicts silent chargers, expires overdue calls
//! - **Command dispatch**: RemoteStart/RemoteStop/ChangeConfiguration
//! - **Persistence**: message audit and station/transaction records, in memory or PostgreSQL
//! - **Metrics & health**: Prometheus text at `/metrics`, JSON at `/health`

pub mod auth;
pub mod commands;
pub mod config;
pub mod correlator;
pub mod database;
pub mod error;
pub mod handlers;
pub mod manager;
pub mod metrics;
pub mod outbox;
pub mod persistence;
pub mod registry;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod transaction;

pub use commands::{CommandDispatcher, CommandOutcome};
pub use config::Config;
pub use correlator::{CallOutcome, PendingCallHandle};
pub use error::*;
pub use manager::*;

use persistence::{MemoryPersistence, Persistence, PersistenceHandle};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc, time::Duration, time::Instant};
use supervisor::{HeartbeatSupervisor, SupervisorHandle};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{error, info, warn};

/// How long `stop` waits for the server task after closing connections
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Central System Management System
pub struct Csms {
    config: Config,
    manager: Arc<ChargePointManager>,
    commands: CommandDispatcher,
    persistence: PersistenceHandle,
    backend: Arc<dyn Persistence>,
    database: Option<Arc<database::DatabasePool>>,
    metrics: Arc<metrics::MetricsRegistry>,
    started_at: Instant,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    server: JoinHandle<()>,
    server_stop: oneshot::Sender<()>,
    supervisor: SupervisorHandle,
}

impl Csms {
    /// Create a CSMS with the backend chosen by `config.database`
    pub async fn new(config: Config) -> CsmsResult<Self> {
        info!("Initializing OCPP CSMS");

        if config.database.enabled {
            let database = Arc::new(database::DatabasePool::new(&config.database).await?);
            database.migrate().await?;
            let backend: Arc<dyn Persistence> = database.clone();
            let mut csms = Self::with_persistence(config, backend).await?;
            csms.database = Some(database);
            Ok(csms)
        } else {
            let backend = Arc::new(MemoryPersistence::with_retention(config.database.memory_retention));
            for charger_id in &config.server.registered_stations {
                backend.register_station(charger_id);
            }
            Self::with_persistence(config, backend).await
        }
    }

    /// Create a CSMS on top of an already constructed backend
    pub async fn with_persistence(config: Config, backend: Arc<dyn Persistence>) -> CsmsResult<Self> {
        let metrics = Arc::new(metrics::MetricsRegistry::new(&config.metrics)?);
        let (persistence, _writer) = persistence::spawn_writer(backend.clone());
        let authorizer = Arc::new(auth::ConfiguredAuthorizer::new(&config.auth));

        let manager = Arc::new(ChargePointManager::new(
            &config.ocpp,
            persistence.clone(),
            metrics.clone(),
            authorizer,
        ));

        match backend.last_transaction_id().await {
            Ok(Some(last)) => {
                info!(last_transaction_id = last, "Continuing transaction ids");
                manager.ledger().seed(last);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read the last transaction id"),
        }

        let commands = CommandDispatcher::new(&manager);

        Ok(Self {
            config,
            manager,
            commands,
            persistence,
            backend,
            database: None,
            metrics,
            started_at: Instant::now(),
            running: None,
        })
    }

    /// Start the server and the heartbeat supervisor. Returns the bound address.
    pub async fn start(&mut self) -> CsmsResult<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let state = server::ServerState {
            manager: self.manager.clone(),
            persistence: self.backend.clone(),
            metrics: self.metrics.clone(),
            config: self.config.server.clone(),
            started_at: self.started_at,
        };
        let server = server::CsmsServer::bind(&self.config.server, state).await?;
        let local_addr = server.local_addr();

        let (server_stop, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async {
                let _ = stop_rx.await;
            };
            if let Err(e) = server.run(shutdown).await {
                error!("CSMS server error: {}", e);
            }
        });

        let supervisor = HeartbeatSupervisor::new(self.manager.clone()).spawn();

        self.running = Some(Running {
            local_addr,
            server,
            server_stop,
            supervisor,
        });
        info!(%local_addr, "CSMS server started successfully");
        Ok(local_addr)
    }

    /// Close every connection, stop background tasks and flush persistence
    pub async fn stop(&mut self) -> CsmsResult<()> {
        info!("Stopping OCPP CSMS server");

        self.manager.shutdown();

        if let Some(running) = self.running.take() {
            running.supervisor.stop().await;

            let _ = running.server_stop.send(());
            let mut server = running.server;
            match tokio::time::timeout(SERVER_STOP_TIMEOUT, &mut server).await {
                Ok(Err(e)) if !e.is_cancelled() => warn!("Error stopping server: {}", e),
                Ok(_) => {}
                Err(_) => {
                    warn!("Server did not stop in time, aborting");
                    server.abort();
                }
            }
        }

        self.persistence.flush().await;

        if let Some(database) = &self.database {
            database.close().await;
        }

        info!("CSMS server stopped");
        Ok(())
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get charge point manager
    pub fn manager(&self) -> Arc<ChargePointManager> {
        self.manager.clone()
    }

    /// Remote commands to connected chargers
    pub fn commands(&self) -> &CommandDispatcher {
        &self.commands
    }

    /// Get metrics registry
    pub fn metrics(&self) -> Arc<metrics::MetricsRegistry> {
        self.metrics.clone()
    }

    /// Get server statistics
    pub fn stats(&self) -> CsmsStats {
        CsmsStats {
            connected_chargers: self.manager.registry().len(),
            known_chargers: self.manager.sessions().len(),
            active_transactions: self.manager.ledger().active_count(),
            pending_calls: self.manager.correlator().pending_count(),
            uptime: self.started_at.elapsed(),
        }
    }

    /// Health check
    pub async fn health_check(&self) -> HealthStatus {
        let mut status = HealthStatus {
            healthy: true,
            checks: Vec::new(),
        };

        match self.backend.health_check().await {
            Ok(()) => status.checks.push(HealthCheck {
                name: "persistence".to_string(),
                healthy: true,
                message: "Persistence backend healthy".to_string(),
            }),
            Err(e) => {
                status.healthy = false;
                status.checks.push(HealthCheck {
                    name: "persistence".to_string(),
                    healthy: false,
                    message: format!("Persistence backend failed: {}", e),
                });
            }
        }

        match &self.running {
            Some(running) if !running.server.is_finished() => status.checks.push(HealthCheck {
                name: "server".to_string(),
                healthy: true,
                message: format!("Listening on {}", running.local_addr),
            }),
            Some(_) => {
                status.healthy = false;
                status.checks.push(HealthCheck {
                    name: "server".to_string(),
                    healthy: false,
                    message: "Server task exited".to_string(),
                });
            }
            None => status.checks.push(HealthCheck {
                name: "server".to_string(),
                healthy: true,
                message: "Not started".to_string(),
            }),
        }

        status
    }
}

/// CSMS statistics
#[derive(Debug, Clone, Serialize)]
pub struct CsmsStats {
    /// Chargers with a live connection
    pub connected_chargers: usize,
    /// Chargers seen since startup
    pub known_chargers: usize,
    pub active_transactions: usize,
    pub pending_calls: usize,
    pub uptime: Duration,
}

/// Health status
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall health status
    pub healthy: bool,
    /// Individual health checks
    pub checks: Vec<HealthCheck>,
}

/// Individual health check result
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub healthy: bool,
    pub message: String,
}

/// Utility functions
pub mod utils {
    use super::*;

    /// Initialize tracing. `RUST_LOG` takes precedence over `level`.
    pub fn init_tracing(level: &str, format: &str) -> CsmsResult<()> {
        use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("ocpp_csms={},ocpp_transport={}", level, level).into()
        });
        let registry = tracing_subscriber::registry().with(filter);

        let result = match format {
            "json" => registry.with(fmt::layer().json()).try_init(),
            "compact" => registry.with(fmt::layer().compact()).try_init(),
            _ => registry.with(fmt::layer()).try_init(),
        };

        result.map_err(|e| CsmsError::Configuration {
            message: format!("Failed to initialize tracing: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config
    }

    #[tokio::test]
    async fn test_csms_creation_in_memory() {
        let csms = Csms::new(test_config()).await.unwrap();
        let stats = csms.stats();
        assert_eq!(stats.connected_chargers, 0);
        assert_eq!(stats.active_transactions, 0);
        assert!(csms.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_database_without_url_fails() {
        let mut config = test_config();
        config.database.enabled = true;
        let result = Csms::new(config).await;
        assert!(matches!(result, Err(CsmsError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_transaction_ids_continue_from_backend() {
        let backend = Arc::new(MemoryPersistence::new());
        backend
            .create_transaction(&persistence::TransactionRecord {
                transaction_id: 41,
                charger_id: "CP001".to_string(),
                connector_id: 1,
                id_tag: "TAG".to_string(),
                meter_start: 0,
                started_at: chrono::Utc::now(),
                meter_stop: None,
                stopped_at: None,
                stop_reason: None,
            })
            .await
            .unwrap();

        let csms = Csms::with_persistence(test_config(), backend).await.unwrap();
        let id = csms
            .manager()
            .ledger()
            .open("CP001", 1, "TAG", 0, chrono::Utc::now())
            .unwrap();
        assert_eq!(id, 42);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut csms = Csms::new(test_config()).await.unwrap();
        let addr = csms.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(csms.local_addr(), Some(addr));

        let health = csms.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.checks.len(), 2);

        csms.stop().await.unwrap();
        assert!(csms.local_addr().is_none());
    }
}
