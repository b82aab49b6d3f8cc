//! Streaming server.
//!
//! Axum router with a `/ws` endpoint carrying binary wire frames both ways,
//! plus `/health` and `/sync` JSON endpoints. Telemetry is encoded once per
//! broadcast into a shared `Bytes` buffer and fanned out through per-client
//! bounded queues; a client that cannot keep up is dropped rather than ever
//! slowing a producer. Socket writes happen in each client's own select loop,
//! never under the client-set lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use imu_codec::wire::{
    self, decode_envelope, decode_frame, encode_envelope, encode_frame, CommandResult,
    ConnectRequestEnvelope, DeviceStatusEntry, DeviceStatusPayload, DisconnectRequestEnvelope,
    DiscoveredDeviceEnvelope, ErrorEnvelope, MessageType, MotionDataPayload,
    RecordStartRequestEnvelope, RecordStartResponseEnvelope, RecordStopResponseEnvelope,
    ScanResponseEnvelope, SyncResponseEnvelope,
};
use imu_types::device::{name_hash32, DeviceEvent};
use imu_types::error::{CodedError, ErrorCode};

use crate::clock::MasterClock;
use crate::coordinator::Coordinator;
use crate::pipeline::ui::UiSnapshot;

/// Source label stamped into consolidated motion frames.
const MOTION_SOURCE: &str = "tropx_hub";

// ── Client bookkeeping ────────────────────────────────────────────────────────

struct ClientHandle {
    tx: mpsc::Sender<Bytes>,
    overruns: AtomicU32,
}

#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub clients_connected: AtomicU64,
    pub clients_dropped: AtomicU64,
    pub frames_broadcast: AtomicU64,
}

impl ServerMetrics {
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "clientsConnected": self.clients_connected.load(Ordering::Relaxed),
            "clientsDropped": self.clients_dropped.load(Ordering::Relaxed),
            "framesBroadcast": self.frames_broadcast.load(Ordering::Relaxed),
        })
    }
}

pub struct StreamingServer {
    clients: RwLock<HashMap<u64, Arc<ClientHandle>>>,
    next_client: AtomicU64,
    queue_depth: usize,
    overrun_limit: u32,
    pub metrics: ServerMetrics,
    clock: MasterClock,
}

impl StreamingServer {
    pub fn new(queue_depth: usize, overrun_limit: u32, clock: MasterClock) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            queue_depth,
            overrun_limit,
            metrics: ServerMetrics::default(),
            clock,
        }
    }

    pub fn timestamp_lo(&self) -> u32 {
        self.clock.now_ms() as u32
    }

    pub async fn register_client(&self) -> (u64, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        self.clients
            .write()
            .await
            .insert(id, Arc::new(ClientHandle { tx, overruns: AtomicU32::new(0) }));
        self.metrics.clients_connected.fetch_add(1, Ordering::Relaxed);
        info!("server: client {id} connected");
        (id, rx)
    }

    pub async fn remove_client(&self, id: u64) {
        if self.clients.write().await.remove(&id).is_some() {
            debug!("server: client {id} removed");
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Queue a frame to one client. Blocks only on that client's queue.
    pub async fn send_to(&self, id: u64, frame: Bytes) {
        let handle = self.clients.read().await.get(&id).cloned();
        if let Some(handle) = handle {
            if handle.tx.send(frame).await.is_err() {
                self.remove_client(id).await;
            }
        }
    }

    /// Fire-and-forget fan-out. The frame is encoded once by the caller;
    /// clones here are reference-counted. Clients whose queue is full accrue
    /// overruns and are dropped past the limit — loss over lag.
    pub async fn broadcast(&self, frame: Bytes) {
        self.metrics.frames_broadcast.fetch_add(1, Ordering::Relaxed);
        let mut to_drop: Vec<u64> = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, handle) in clients.iter() {
                match handle.tx.try_send(frame.clone()) {
                    Ok(()) => {
                        handle.overruns.store(0, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let n = handle.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                        if n >= self.overrun_limit {
                            to_drop.push(*id);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => to_drop.push(*id),
                }
            }
        }
        for id in to_drop {
            warn!("server: dropping slow client {id}");
            self.metrics.clients_dropped.fetch_add(1, Ordering::Relaxed);
            self.remove_client(id).await;
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub server: Arc<StreamingServer>,
    pub command_timeout: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .route("/sync", get(time_sync))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

async fn health_check(State(state): State<AppState>) -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": state.server.clock.now_ms(),
        "clients": state.server.client_count().await,
    }))
}

async fn time_sync(State(state): State<AppState>) -> axum::Json<serde_json::Value> {
    axum::Json(json!({ "serverTime": state.server.clock.unix_ms() }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let (client_id, mut outgoing) = state.server.register_client().await;

    // Snapshot of current service state, first thing on the wire
    let status = state.coordinator.status_envelope().await;
    if let Ok(frame) =
        encode_envelope(MessageType::Status, 0, state.server.timestamp_lo(), &status)
    {
        let _ = socket.send(Message::Binary(frame.to_vec())).await;
    }

    // Per-client command worker keeps request handling FIFO without ever
    // stalling telemetry delivery.
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Vec<u8>>(32);
    let worker_state = state.clone();
    let worker = tokio::spawn(async move {
        while let Some(frame) = cmd_rx.recv().await {
            if let Some(response) = handle_command_frame(&worker_state, &frame).await {
                worker_state.server.send_to(client_id, response).await;
            }
        }
    });

    loop {
        tokio::select! {
            maybe_frame = outgoing.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        if socket.send(Message::Binary(frame.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    // Dropped by the backpressure policy
                    None => break,
                }
            }
            maybe_msg = socket.recv() => {
                match maybe_msg {
                    Some(Ok(Message::Binary(data))) => {
                        if cmd_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // text/ping/pong handled by axum
                    Some(Err(e)) => {
                        debug!("server: client {client_id} socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    worker.abort();
    state.server.remove_client(client_id).await;
    info!("server: client {client_id} disconnected");
}

// ── Command dispatch ──────────────────────────────────────────────────────────

fn error_frame(state: &AppState, request_id: u32, code: ErrorCode, message: String) -> Option<Bytes> {
    encode_envelope(
        MessageType::Error,
        request_id,
        state.server.timestamp_lo(),
        &ErrorEnvelope { code, message },
    )
    .ok()
}

/// Decode one inbound frame, run the matching coordinator command under the
/// response deadline, and build the response frame. `None` for fire-and-forget
/// messages.
async fn handle_command_frame(state: &AppState, frame: &[u8]) -> Option<Bytes> {
    let (header, payload) = match decode_frame(frame) {
        Ok(parts) => parts,
        Err(e) => {
            warn!("server: bad frame: {e}");
            return error_frame(state, 0, ErrorCode::WireProtocolError, e.to_string());
        }
    };
    let request_id = header.request_id;

    let work = dispatch_command(state, header.msg_type, payload);
    let result = match tokio::time::timeout(state.command_timeout, work).await {
        Ok(result) => result,
        Err(_) => {
            return error_frame(
                state,
                request_id,
                ErrorCode::ServiceUnavailable,
                format!("command {:?} timed out", header.msg_type),
            );
        }
    };

    if request_id == 0 {
        return None; // fire-and-forget
    }
    match result {
        Ok(Some((msg_type, body))) => {
            encode_frame(msg_type, request_id, state.server.timestamp_lo(), &body).ok()
        }
        Ok(None) => None,
        Err(e) => error_frame(state, request_id, e.code, e.message),
    }
}

async fn dispatch_command(
    state: &AppState,
    msg_type: MessageType,
    payload: &[u8],
) -> Result<Option<(MessageType, Vec<u8>)>, CodedError> {
    let coordinator = &state.coordinator;
    let wire_err = |e: wire::WireError| CodedError::new(ErrorCode::WireProtocolError, e.to_string());

    match msg_type {
        MessageType::Ping => Ok(Some((MessageType::Pong, Vec::new()))),
        MessageType::Heartbeat => Ok(None),

        MessageType::BleScanRequest | MessageType::ScanRequest => {
            let devices = coordinator.scan_devices().await?;
            let body = serde_json::to_vec(&ScanResponseEnvelope {
                devices: devices
                    .into_iter()
                    .map(|d| DiscoveredDeviceEnvelope { id: d.id, name: d.name, rssi: d.rssi })
                    .collect(),
            })
            .map_err(|e| CodedError::new(ErrorCode::Unknown, e.to_string()))?;
            Ok(Some((MessageType::BleScanResponse, body)))
        }

        MessageType::BleConnectRequest => {
            let req: ConnectRequestEnvelope = decode_envelope(payload).map_err(wire_err)?;
            coordinator.connect_device(&req.device_id, req.name.as_deref()).await?;
            let body = serde_json::to_vec(&CommandResult::ok(format!(
                "{} connected",
                req.device_id
            )))
            .map_err(|e| CodedError::new(ErrorCode::Unknown, e.to_string()))?;
            Ok(Some((MessageType::BleConnectResponse, body)))
        }

        MessageType::BleDisconnectRequest => {
            let req: DisconnectRequestEnvelope = decode_envelope(payload).map_err(wire_err)?;
            coordinator.disconnect_device(&req.device_id).await?;
            let body = serde_json::to_vec(&CommandResult::ok(format!(
                "{} disconnected",
                req.device_id
            )))
            .map_err(|e| CodedError::new(ErrorCode::Unknown, e.to_string()))?;
            Ok(Some((MessageType::BleDisconnectResponse, body)))
        }

        MessageType::BleSyncRequest => {
            let results = coordinator.sync_devices().await?;
            let body = serde_json::to_vec(&SyncResponseEnvelope { results })
                .map_err(|e| CodedError::new(ErrorCode::Unknown, e.to_string()))?;
            Ok(Some((MessageType::BleSyncResponse, body)))
        }

        MessageType::RecordStartRequest => {
            let req: RecordStartRequestEnvelope = decode_envelope(payload).map_err(wire_err)?;
            let session = coordinator.start_recording(req).await?;
            let body = serde_json::to_vec(&RecordStartResponseEnvelope { session })
                .map_err(|e| CodedError::new(ErrorCode::Unknown, e.to_string()))?;
            Ok(Some((MessageType::RecordStartResponse, body)))
        }

        MessageType::RecordStopRequest => {
            let summary = coordinator.stop_recording().await?;
            let body = serde_json::to_vec(&RecordStopResponseEnvelope {
                session_id: summary.session_id,
                chunk_count: summary.chunk_count,
                duration_ms: summary.duration_ms,
            })
            .map_err(|e| CodedError::new(ErrorCode::Unknown, e.to_string()))?;
            Ok(Some((MessageType::RecordStopResponse, body)))
        }

        MessageType::Status => {
            let status = coordinator.status_envelope().await;
            let body = serde_json::to_vec(&status)
                .map_err(|e| CodedError::new(ErrorCode::Unknown, e.to_string()))?;
            Ok(Some((MessageType::Status, body)))
        }

        other => Err(CodedError::new(
            ErrorCode::WireProtocolError,
            format!("{other:?} is not a request"),
        )),
    }
}

// ── Broadcast loops ───────────────────────────────────────────────────────────

/// Re-emit the pipeline's coalesced snapshot at no more than the UI rate.
pub fn spawn_motion_broadcast(
    server: Arc<StreamingServer>,
    mut ui_rx: tokio::sync::watch::Receiver<UiSnapshot>,
    ui_rate_hz: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let min_gap = Duration::from_micros(1_000_000 / ui_rate_hz.max(1) as u64);
        loop {
            if ui_rx.changed().await.is_err() {
                break;
            }
            let snapshot = *ui_rx.borrow_and_update();
            let payload = MotionDataPayload {
                device_name: MOTION_SOURCE.to_string(),
                left_current: snapshot.left.current as f32,
                left_max: snapshot.left.max_angle as f32,
                left_min: snapshot.left.min_angle as f32,
                right_current: snapshot.right.current as f32,
                right_max: snapshot.right.max_angle as f32,
                right_min: snapshot.right.min_angle as f32,
            };
            let Ok(body) = payload.encode() else { continue };
            let Ok(frame) = encode_frame(
                MessageType::MotionData,
                0,
                snapshot.timestamp_ms as u32,
                &body,
            ) else {
                continue;
            };
            server.broadcast(frame).await;
            // Coalescing throttle: anything arriving during this nap wins
            tokio::time::sleep(min_gap).await;
        }
    })
}

/// Periodic subscriber heartbeat.
pub fn spawn_heartbeat(
    server: Arc<StreamingServer>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // immediate first tick is not a heartbeat
        loop {
            ticker.tick().await;
            if let Ok(frame) =
                encode_frame(MessageType::Heartbeat, 0, server.timestamp_lo(), &[])
            {
                server.broadcast(frame).await;
            }
        }
    })
}

/// Relay registry events as DEVICE_STATUS / BATTERY_UPDATE telemetry.
pub fn spawn_device_status_broadcast(
    server: Arc<StreamingServer>,
    registry: Arc<crate::registry::DeviceRegistry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = registry.subscribe();
        loop {
            match events.recv().await {
                Ok(DeviceEvent::DeviceChanged { .. }) => {
                    let snapshot = registry.snapshot().await;
                    let payload = DeviceStatusPayload {
                        timestamp: server.timestamp_lo(),
                        entries: snapshot
                            .iter()
                            .map(|r| DeviceStatusEntry {
                                name_hash: name_hash32(&r.name),
                                connected: r.is_connected(),
                                battery: r.battery_pct.unwrap_or(0.0),
                            })
                            .collect(),
                    };
                    if let Ok(frame) = encode_frame(
                        MessageType::DeviceStatus,
                        0,
                        server.timestamp_lo(),
                        &payload.encode(),
                    ) {
                        server.broadcast(frame).await;
                    }
                }
                Ok(DeviceEvent::Battery { id, pct }) => {
                    let body = json!({ "deviceId": id, "pct": pct });
                    if let Ok(frame) = encode_envelope(
                        MessageType::BatteryUpdate,
                        0,
                        server.timestamp_lo(),
                        &body,
                    ) {
                        server.broadcast(frame).await;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("server: status relay lagged {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(queue: usize, limit: u32) -> Arc<StreamingServer> {
        Arc::new(StreamingServer::new(queue, limit, MasterClock::new()))
    }

    #[tokio::test]
    async fn broadcast_reaches_registered_clients() {
        let s = server(8, 4);
        let (_id, mut rx) = s.register_client().await;
        let frame = encode_frame(MessageType::Heartbeat, 0, 0, &[]).unwrap();
        s.broadcast(frame.clone()).await;
        assert_eq!(rx.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn slow_client_is_dropped_after_overrun_limit() {
        let s = server(2, 3);
        let (_fast, mut fast_rx) = s.register_client().await;
        let (_slow, slow_rx) = s.register_client().await;
        // The slow client never drains its queue
        std::mem::forget(slow_rx);

        let frame = encode_frame(MessageType::MotionData, 0, 0, &[0u8; 8]).unwrap();
        // 2 fills + 3 overruns ≥ limit → dropped
        for _ in 0..6 {
            s.broadcast(frame.clone()).await;
            // Fast client keeps draining
            while fast_rx.try_recv().is_ok() {}
        }
        assert_eq!(s.client_count().await, 1);
        assert_eq!(s.metrics.clients_dropped.load(Ordering::Relaxed), 1);

        // Fast client still receives after the drop
        s.broadcast(frame.clone()).await;
        assert!(fast_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn closed_client_is_pruned_on_broadcast() {
        let s = server(4, 4);
        let (_id, rx) = s.register_client().await;
        drop(rx);
        let frame = encode_frame(MessageType::Heartbeat, 0, 0, &[]).unwrap();
        s.broadcast(frame).await;
        assert_eq!(s.client_count().await, 0);
    }
}
