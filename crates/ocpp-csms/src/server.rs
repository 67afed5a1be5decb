//! Server module for OCPP CSMS
//!
//! One axum listener serves the charger WebSocket endpoint (`/{charger_id}`,
//! any prefix), `GET /health` and `GET /metrics`.

use crate::{
    config::ServerConfig, manager::ChargePointManager, metrics::MetricsRegistry,
    persistence::Persistence, CsmsError, CsmsResult,
};
use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use ocpp_transport::{close_code, utils, ConnectionHandle, Outbound};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{net::TcpListener, sync::mpsc::UnboundedReceiver};
use tracing::{debug, info, info_span, warn, Instrument};

/// CSMS server state
#[derive(Clone)]
pub struct ServerState {
    pub manager: Arc<ChargePointManager>,
    /// Backend queried by the health endpoint
    pub persistence: Arc<dyn Persistence>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: ServerConfig,
    pub started_at: Instant,
}

/// CSMS server implementation
pub struct CsmsServer {
    listener: TcpListener,
    router: Router,
    local_addr: SocketAddr,
}

impl CsmsServer {
    /// Bind the listener without serving yet
    pub async fn bind(config: &ServerConfig, state: ServerState) -> CsmsResult<Self> {
        let addr = config.socket_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| CsmsError::Internal {
                message: format!("Failed to bind {}: {}", addr, e),
            })?;
        let local_addr = listener.local_addr().map_err(|e| CsmsError::Internal {
            message: format!("Failed to read local address: {}", e),
        })?;

        Ok(Self {
            listener,
            router: router(state),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> CsmsResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting OCPP CSMS server on {}", self.local_addr);

        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| CsmsError::Internal {
            message: format!("Server error: {}", e),
        })
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(missing_identity))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/*path", get(ws_handler))
        .with_state(state)
}

async fn missing_identity() -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "Missing charge point identity")
}

/// WebSocket handler for OCPP connections
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    Path(path): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let charger_id = match utils::extract_charge_point_id(&path) {
        Some(id) if id.chars().count() <= state.config.max_charger_id_length => id.to_string(),
        _ => {
            warn!(remote_addr = %addr, path, "Rejecting upgrade: invalid charge point identity");
            return (StatusCode::BAD_REQUEST, "Invalid charge point identity").into_response();
        }
    };

    let supported = &state.manager.config().supported_protocols;
    let protocol = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|offered| utils::negotiate_subprotocol(offered, supported));
    let Some(protocol) = protocol else {
        warn!(remote_addr = %addr, charger_id, "Rejecting upgrade: no supported subprotocol offered");
        return (StatusCode::BAD_REQUEST, "Unsupported WebSocket subprotocol").into_response();
    };

    // a reconnecting charger replaces its own entry and does not count twice
    let registry = state.manager.registry();
    if !registry.is_connected(&charger_id) && registry.len() >= state.config.max_connections {
        warn!(remote_addr = %addr, charger_id, "Connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    }

    debug!(remote_addr = %addr, charger_id, protocol, "Upgrading connection");
    let max_frame_size = state.config.max_ws_message_size;
    ws.protocols([protocol])
        .max_message_size(max_frame_size)
        .max_frame_size(max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, charger_id, addr))
}

/// Handle WebSocket connection
async fn handle_websocket(mut socket: WebSocket, state: ServerState, charger_id: String, addr: SocketAddr) {
    if state.config.require_known_station {
        let refusal = match state.persistence.station_exists(&charger_id).await {
            Ok(true) => None,
            Ok(false) => {
                warn!(remote_addr = %addr, charger_id, "Charge point not registered");
                Some((close_code::POLICY_VIOLATION, "Charge point not registered"))
            }
            Err(e) => {
                warn!(remote_addr = %addr, charger_id, error = %e, "Station lookup failed");
                Some((close_code::INTERNAL_ERROR, "Station lookup failed"))
            }
        };
        if let Some((code, reason)) = refusal {
            let frame = CloseFrame {
                code,
                reason: reason.into(),
            };
            if let Err(e) = socket.send(WsMessage::Close(Some(frame))).await {
                debug!(charger_id, error = %e, "Close frame not delivered");
            }
            return;
        }
    }

    let (handle, outbound) = ConnectionHandle::channel();
    let span = info_span!("charger", charger_id = %charger_id, connection_id = %handle.id());
    serve_connection(socket, state.manager, charger_id, addr, handle, outbound)
        .instrument(span)
        .await
}

async fn serve_connection(
    socket: WebSocket,
    manager: Arc<ChargePointManager>,
    charger_id: String,
    addr: SocketAddr,
    handle: ConnectionHandle,
    outbound: UnboundedReceiver<Outbound>,
) {
    let connection_id = handle.id();
    manager.connect(&charger_id, handle.clone(), Some(addr));

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_frames(sink, outbound).in_current_span());

    // Runs however the read loop ends
    let cleanup = scopeguard::guard(
        (manager.clone(), charger_id.clone()),
        move |(manager, charger_id)| {
            manager.disconnect(&charger_id, connection_id, "socket closed");
        },
    );

    manager.connection_ready(&charger_id, connection_id);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    manager.handle_frame(&charger_id, &handle, &text).await;
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    warn!(bytes = data.len(), "Ignoring binary frame");
                }
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                    manager.registry().touch(&charger_id, connection_id);
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "Charger closed the socket");
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                None => break,
            },
            _ = &mut writer => {
                debug!("Writer finished");
                break;
            }
        }
    }

    writer.abort();
    drop(cleanup);
}

/// Drain queued frames into the socket. A close request ends the writer.
async fn write_frames(mut sink: SplitSink<WebSocket, WsMessage>, mut outbound: UnboundedReceiver<Outbound>) {
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    warn!(error = %e, "Failed to write frame");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                debug!(code, reason, "Closing socket");
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                    debug!(error = %e, "Close frame not delivered");
                }
                break;
            }
        }
    }
}

/// Health check endpoint
async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let persistence = state.persistence.health_check().await;
    let healthy = persistence.is_ok();

    let health = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "checks": {
            "persistence": match &persistence {
                Ok(()) => "healthy".to_string(),
                Err(e) => e.to_string(),
            },
        },
        "connections": state.manager.registry().len(),
        "active_transactions": state.manager.ledger().active_count(),
        "pending_calls": state.manager.correlator().pending_count(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Prometheus text exposition
async fn metrics_handler(State(state): State<ServerState>) -> Response {
    state
        .metrics
        .update_uptime(state.started_at.elapsed().as_secs_f64());

    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
