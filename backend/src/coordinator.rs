//! Coordinator — the command surface.
//!
//! Owns every other component and enforces the process-wide invariants: one
//! active recording, scan cooldown, streaming prerequisites for recording,
//! and a clean return of the fleet to a usable state on stop or shutdown.
//! External callers (the WebSocket command dispatch, the binary) only ever
//! talk to this type.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use imu_codec::wire::{DeviceSyncStatsEnvelope, StatusUpdateEnvelope};
use imu_types::device::DeviceState;
use imu_types::error::{CodedError, ErrorCode};
use imu_types::joint::{Session, SessionRequest};
use imu_types::transport::{
    DeviceTransport, DiscoveredDevice, ScanFilter, CHAR_BATTERY, CHAR_IMU_DATA,
};

use crate::clock::MasterClock;
use crate::config::HubConfig;
use crate::persistence;
use crate::pipeline::MotionPipeline;
use crate::recorder::{ActiveRecording, Recorder, RecordingSummary};
use crate::registry::DeviceRegistry;
use crate::server::StreamingServer;
use crate::timesync::TimeSyncManager;

const SUPPORTED_RATES: [u32; 3] = [100, 200, 400];

struct CoordState {
    last_scan_ms: Option<u64>,
    recording: Option<(Session, ActiveRecording)>,
}

pub struct Coordinator {
    cfg: HubConfig,
    clock: MasterClock,
    transport: Arc<dyn DeviceTransport>,
    pub registry: Arc<DeviceRegistry>,
    pub pipeline: Arc<MotionPipeline>,
    recorder: Recorder,
    timesync: TimeSyncManager,
    pub server: Arc<StreamingServer>,
    state: Mutex<CoordState>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: HubConfig,
        clock: MasterClock,
        transport: Arc<dyn DeviceTransport>,
        registry: Arc<DeviceRegistry>,
        pipeline: Arc<MotionPipeline>,
        recorder: Recorder,
        timesync: TimeSyncManager,
        server: Arc<StreamingServer>,
    ) -> Self {
        Self {
            cfg,
            clock,
            transport,
            registry,
            pipeline,
            recorder,
            timesync,
            server,
            state: Mutex::new(CoordState { last_scan_ms: None, recording: None }),
        }
    }

    /// Restore persisted registry state. Run once before serving commands.
    pub async fn initialize(&self) -> Result<(), CodedError> {
        let records = persistence::load_devices(&self.cfg.data_dir).await;
        self.registry.restore(records).await;
        Ok(())
    }

    // ── Scanning ─────────────────────────────────────────────────────────────

    /// Scan for devices, registering everything found. Throttled by the
    /// cooldown and bounded by the hard scan timeout.
    pub async fn scan_devices(&self) -> Result<Vec<DiscoveredDevice>, CodedError> {
        {
            let mut state = self.state.lock().await;
            let now = self.clock.now_ms();
            if let Some(last) = state.last_scan_ms {
                if now.saturating_sub(last) < self.cfg.scan_cooldown_ms {
                    return Err(CodedError::new(
                        ErrorCode::ServiceUnavailable,
                        "scan cooldown active",
                    ));
                }
            }
            state.last_scan_ms = Some(now);
        }

        let mut rx = self
            .transport
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| CodedError::new(ErrorCode::BluetoothUnavailable, e.to_string()))?;

        let mut found = Vec::new();
        let deadline = tokio::time::sleep(Duration::from_millis(self.cfg.scan_timeout_ms));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                device = rx.recv() => match device {
                    Some(device) => {
                        self.registry.upsert_discovered(&device.id, &device.name).await;
                        found.push(device);
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    self.transport.stop_scan().await;
                    break;
                }
            }
        }
        info!("coordinator: scan found {} devices", found.len());
        Ok(found)
    }

    pub async fn cancel_scan(&self) {
        self.transport.stop_scan().await;
    }

    // ── Connection ───────────────────────────────────────────────────────────

    /// Connect one device and begin streaming its IMU data. Two retry tiers:
    /// a fast immediate retry, then a full disconnect/connect reset.
    pub async fn connect_device(
        &self,
        device_id: &str,
        name: Option<&str>,
    ) -> Result<(), CodedError> {
        if self.registry.get(device_id).await.is_none() {
            let name = name.unwrap_or(device_id);
            self.registry.upsert_discovered(device_id, name).await;
        }
        self.registry.set_state(device_id, DeviceState::Connecting).await?;

        let connected = match self.transport.connect(device_id).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("coordinator: connect {device_id} failed ({first}), fast retry");
                match self.transport.connect(device_id).await {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        warn!("coordinator: fast retry failed, full reset for {device_id}");
                        let _ = self.transport.disconnect(device_id).await;
                        self.transport.connect(device_id).await
                    }
                }
            }
        };
        if let Err(e) = connected {
            self.registry
                .mark_failed(device_id, ErrorCode::DeviceConnectFailed, &e.to_string())
                .await;
            return Err(CodedError::new(ErrorCode::DeviceConnectFailed, e.to_string()));
        }
        let record = self.registry.set_state(device_id, DeviceState::Connected).await?;

        // Battery telemetry
        match self.transport.subscribe_notifications(device_id, CHAR_BATTERY).await {
            Ok(mut rx) => {
                let registry = self.registry.clone();
                let id = device_id.to_string();
                tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        if let Some(&pct) = frame.first() {
                            registry.update_battery(&id, pct as f32).await;
                        }
                    }
                });
            }
            Err(e) => warn!("coordinator: battery subscription failed for {device_id}: {e}"),
        }

        // IMU stream into the pipeline
        let notifications = self
            .transport
            .subscribe_notifications(device_id, CHAR_IMU_DATA)
            .await
            .map_err(|e| CodedError::new(ErrorCode::DeviceConnectFailed, e.to_string()))?;
        let offset = record.clock_offset_ms.unwrap_or(0);
        self.pipeline.attach_device(device_id, &record.name, offset, notifications);
        self.registry.set_state(device_id, DeviceState::Streaming).await?;
        Ok(())
    }

    /// Connect every known device that is currently reachable, in parallel.
    pub async fn connect_all(self: &Arc<Self>) -> Result<Vec<String>, CodedError> {
        let mut targets = self.registry.ids_in_state(DeviceState::Discovered).await;
        targets.extend(self.registry.ids_in_state(DeviceState::Disconnected).await);
        let mut set = JoinSet::new();
        for id in targets {
            let this = Arc::clone(self);
            set.spawn(async move {
                let result = this.connect_device(&id, None).await;
                (id, result)
            });
        }
        let mut connected = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(()))) => connected.push(id),
                Ok((id, Err(e))) => warn!("coordinator: connect_all {id}: {e}"),
                Err(e) => warn!("coordinator: connect_all join error: {e}"),
            }
        }
        connected.sort();
        Ok(connected)
    }

    pub async fn disconnect_device(&self, device_id: &str) -> Result<(), CodedError> {
        self.pipeline.detach_device(device_id);
        if let Err(e) = self.transport.disconnect(device_id).await {
            warn!("coordinator: disconnect {device_id}: {e}");
        }
        self.registry.set_state(device_id, DeviceState::Disconnected).await?;
        Ok(())
    }

    // ── Time sync ────────────────────────────────────────────────────────────

    /// Sync every connected device, refresh pipeline offsets, persist the
    /// ladder.
    pub async fn sync_devices(&self) -> Result<Vec<DeviceSyncStatsEnvelope>, CodedError> {
        let ids = self.registry.connected_ids().await;
        let outcome = self.timesync.sync_devices(&ids).await?;
        for id in &outcome.suspected_resets {
            warn!("coordinator: suspected clock reset on {id}");
        }

        let mut results = Vec::with_capacity(outcome.stats.len());
        for stats in &outcome.stats {
            self.pipeline.set_device_offset(&stats.device_id, stats.offset_ms);
            let sync_state = self.registry.sync_state(&stats.device_id).await;
            results.push(DeviceSyncStatsEnvelope {
                device_id: stats.device_id.clone(),
                offset_ms: stats.offset_ms,
                rtt_avg_ms: stats.rtt_avg_ms,
                rtt_min_ms: stats.rtt_min_ms,
                rtt_max_ms: stats.rtt_max_ms,
                samples_used: stats.samples_used,
                sync_state,
            });
        }

        let snapshot = self.registry.snapshot().await;
        if let Err(e) = persistence::save_devices(&self.cfg.data_dir, &snapshot).await {
            warn!("coordinator: failed to persist registry: {e}");
        }
        if !outcome.suspected_resets.is_empty() {
            return Err(CodedError::new(
                ErrorCode::SyncSuspectedReset,
                format!("suspected clock reset on {}", outcome.suspected_resets.join(", ")),
            )
            .with_details(serde_json::json!({ "stats": results.len() })));
        }
        Ok(results)
    }

    // ── Recording ────────────────────────────────────────────────────────────

    pub async fn start_recording(&self, req: SessionRequest) -> Result<Session, CodedError> {
        let mut state = self.state.lock().await;
        if state.recording.is_some() {
            return Err(CodedError::new(
                ErrorCode::ServiceUnavailable,
                "a recording is already active",
            ));
        }
        let streaming = self.registry.ids_in_state(DeviceState::Streaming).await;
        if streaming.is_empty() {
            return Err(CodedError::new(
                ErrorCode::ServiceUnavailable,
                "no device is streaming",
            ));
        }
        let active_joints = self.pipeline.active_joint_names();
        if active_joints.is_empty() {
            return Err(CodedError::new(
                ErrorCode::ServiceUnavailable,
                "no joint has both sensors streaming",
            ));
        }
        if !SUPPORTED_RATES.contains(&req.sample_rate_hz) {
            return Err(CodedError::new(
                ErrorCode::Unknown,
                format!("unsupported sample rate {}", req.sample_rate_hz),
            ));
        }
        if req.sample_rate_hz != self.cfg.target_hz {
            warn!(
                "coordinator: requested {}Hz, pipeline runs at {}Hz",
                req.sample_rate_hz, self.cfg.target_hz
            );
        }

        let session = Session {
            session_id: req
                .session_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            exercise_id: req.exercise_id,
            set_number: req.set_number,
            start_master_ms: self.clock.now_ms(),
            sample_rate_hz: self.cfg.target_hz,
            active_joints,
        };

        self.pipeline.reset_windows();
        let active = self.recorder.start(session.clone());
        self.pipeline.set_recording(session.active_joints.clone(), active.tx.clone());
        info!(
            "coordinator: recording {} started ({} joints)",
            session.session_id,
            session.active_joints.len()
        );
        state.recording = Some((session.clone(), active));
        Ok(session)
    }

    pub async fn stop_recording(&self) -> Result<RecordingSummary, CodedError> {
        let (session, active) = {
            let mut state = self.state.lock().await;
            state.recording.take().ok_or_else(|| {
                CodedError::new(ErrorCode::ServiceUnavailable, "no recording is active")
            })?
        };
        // Detach the route, then close the channel so the recorder flushes
        self.pipeline.clear_recording();
        drop(active.tx);
        let summary = active.handle.await.map_err(|e| {
            CodedError::new(ErrorCode::MotionProcessingFailed, e.to_string())
        })?;
        if summary.failed_uploads > 0 {
            warn!(
                "coordinator: session {} stopped with {} spilled chunks",
                session.session_id, summary.failed_uploads
            );
        }
        info!(
            "coordinator: recording {} stopped ({} chunks)",
            session.session_id, summary.chunk_count
        );
        Ok(summary)
    }

    // ── Status & shutdown ────────────────────────────────────────────────────

    pub async fn status_envelope(&self) -> StatusUpdateEnvelope {
        let devices = self.registry.snapshot().await;
        let recording = self.state.lock().await.recording.as_ref().map(|(s, _)| s.clone());
        StatusUpdateEnvelope {
            devices,
            recording,
            diagnostics: serde_json::json!({
                "pipeline": self.pipeline.metrics.snapshot(),
                "server": self.server.metrics.snapshot(),
            }),
        }
    }

    pub async fn shutdown(&self) -> Result<(), CodedError> {
        if self.state.lock().await.recording.is_some() {
            let _ = self.stop_recording().await;
        }
        for id in self.registry.connected_ids().await {
            let _ = self.disconnect_device(&id).await;
        }
        let snapshot = self.registry.snapshot().await;
        if let Err(e) = persistence::save_devices(&self.cfg.data_dir, &snapshot).await {
            warn!("coordinator: failed to persist registry on shutdown: {e}");
        }
        info!("coordinator: shutdown complete");
        Ok(())
    }
}
