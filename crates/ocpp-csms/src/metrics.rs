//! Metrics module for OCPP CSMS

use crate::{config::MetricsConfig, CsmsError, CsmsResult};
use ocpp_messages::utils::is_charge_point_action;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::info;

/// Metrics registry for OCPP CSMS
pub struct MetricsRegistry {
    /// Prometheus registry
    registry: Registry,
    /// Configuration
    config: MetricsConfig,
    /// OCPP metrics
    ocpp_metrics: OcppMetrics,
    /// System metrics
    system_metrics: SystemMetrics,
}

impl MetricsRegistry {
    /// Create new metrics registry
    pub fn new(config: &MetricsConfig) -> CsmsResult<Self> {
        if !config.enabled {
            info!("Metrics collection disabled");
        } else {
            info!("Initializing metrics with namespace: {}", config.namespace);
        }

        let registry = Registry::new();
        let ocpp_metrics = OcppMetrics::new(&config.namespace, &config.latency_buckets)?;
        let system_metrics = SystemMetrics::new(&config.namespace)?;

        if config.enabled {
            registry.register(Box::new(ocpp_metrics.messages_received.clone()))?;
            registry.register(Box::new(ocpp_metrics.messages_sent.clone()))?;
            registry.register(Box::new(ocpp_metrics.active_connections.clone()))?;
            registry.register(Box::new(ocpp_metrics.pending_calls.clone()))?;
            registry.register(Box::new(ocpp_metrics.evictions.clone()))?;
            registry.register(Box::new(ocpp_metrics.call_outcomes.clone()))?;
            registry.register(Box::new(ocpp_metrics.message_processing_duration.clone()))?;
            registry.register(Box::new(system_metrics.uptime_seconds.clone()))?;
        }

        Ok(Self {
            registry,
            config: config.clone(),
            ocpp_metrics,
            system_metrics,
        })
    }

    /// Record message received
    pub fn record_message_received(&self, action: &str) {
        if self.config.enabled {
            self.ocpp_metrics
                .messages_received
                .with_label_values(&[action_label(action)])
                .inc();
        }
    }

    /// Record message sent
    pub fn record_message_sent(&self, action: &str) {
        if self.config.enabled {
            self.ocpp_metrics
                .messages_sent
                .with_label_values(&[action_label(action)])
                .inc();
        }
    }

    pub fn set_active_connections(&self, count: usize) {
        if self.config.enabled {
            self.ocpp_metrics.active_connections.set(count as i64);
        }
    }

    pub fn set_pending_calls(&self, count: usize) {
        if self.config.enabled {
            self.ocpp_metrics.pending_calls.set(count as i64);
        }
    }

    /// Record a forced close (`duplicate`, `stale`, `shutdown`)
    pub fn record_eviction(&self, reason: &str) {
        if self.config.enabled {
            self.ocpp_metrics.evictions.with_label_values(&[reason]).inc();
        }
    }

    /// Record how a central system call ended
    pub fn record_call_outcome(&self, outcome: &str) {
        if self.config.enabled {
            self.ocpp_metrics
                .call_outcomes
                .with_label_values(&[outcome])
                .inc();
        }
    }

    /// Record message processing duration
    pub fn record_message_processing_duration(&self, action: &str, duration_seconds: f64) {
        if self.config.enabled {
            self.ocpp_metrics
                .message_processing_duration
                .with_label_values(&[action_label(action)])
                .observe(duration_seconds);
        }
    }

    pub fn update_uptime(&self, uptime_seconds: f64) {
        if self.config.enabled {
            self.system_metrics.uptime_seconds.set(uptime_seconds);
        }
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> CsmsResult<String> {
        if !self.config.enabled {
            return Ok(String::new());
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| CsmsError::internal(e.to_string()))
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

/// Charger-chosen action names would otherwise grow label cardinality without bound
fn action_label(action: &str) -> &str {
    match action {
        "CallResult" | "CallError" => action,
        _ if is_charge_point_action(action) => action,
        "ChangeConfiguration" | "RemoteStartTransaction" | "RemoteStopTransaction" => action,
        _ => "Other",
    }
}

/// OCPP-specific metrics
struct OcppMetrics {
    messages_received: IntCounterVec,
    messages_sent: IntCounterVec,
    active_connections: IntGauge,
    pending_calls: IntGauge,
    evictions: IntCounterVec,
    call_outcomes: IntCounterVec,
    message_processing_duration: HistogramVec,
}

impl OcppMetrics {
    fn new(namespace: &str, latency_buckets: &[f64]) -> CsmsResult<Self> {
        Ok(Self {
            messages_received: IntCounterVec::new(
                Opts::new(
                    format!("{}_messages_received_total", namespace),
                    "Total number of OCPP messages received",
                ),
                &["action"],
            )?,
            messages_sent: IntCounterVec::new(
                Opts::new(
                    format!("{}_messages_sent_total", namespace),
                    "Total number of OCPP messages sent",
                ),
                &["action"],
            )?,
            active_connections: IntGauge::new(
                format!("{}_active_connections", namespace),
                "Number of live charger connections",
            )?,
            pending_calls: IntGauge::new(
                format!("{}_pending_calls", namespace),
                "Central system calls awaiting an answer",
            )?,
            evictions: IntCounterVec::new(
                Opts::new(
                    format!("{}_evictions_total", namespace),
                    "Connections closed by the central system",
                ),
                &["reason"],
            )?,
            call_outcomes: IntCounterVec::new(
                Opts::new(
                    format!("{}_call_outcomes_total", namespace),
                    "Central system calls by outcome",
                ),
                &["outcome"],
            )?,
            message_processing_duration: HistogramVec::new(
                HistogramOpts::new(
                    format!("{}_message_processing_duration_seconds", namespace),
                    "Time spent processing inbound OCPP messages",
                )
                .buckets(latency_buckets.to_vec()),
                &["action"],
            )?,
        })
    }
}

/// System-level metrics
struct SystemMetrics {
    uptime_seconds: Gauge,
}

impl SystemMetrics {
    fn new(namespace: &str) -> CsmsResult<Self> {
        Ok(Self {
            uptime_seconds: Gauge::new(
                format!("{}_uptime_seconds", namespace),
                "System uptime in seconds",
            )?,
        })
    }
}
