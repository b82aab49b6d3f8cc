//! Motion pipeline.
//!
//! Ingests raw orientation samples per device into fixed-capacity ring
//! buffers, pairs devices into joints, and on every target tick interpolates
//! both sensors to the tick instant, computes the joint angle, and feeds two
//! outputs: the coalescing UI snapshot and (while a session is active) the
//! lossless recording channel.
//!
//! Locking discipline: ring buffers and joint state use short synchronous
//! critical sections and are never held across an await; the only suspension
//! point in the tick body is the recording send, which happens after all
//! locks are released.

pub mod ring;
pub mod ui;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use imu_types::joint::{JointConfig, JointWindow, TickQuality};
use imu_types::quat::{joint_angle_from_pair, relative_rotation, Quaternion};
use imu_types::sample::ImuSample;

use crate::clock::MasterClock;

use ring::RingBuffer;
use ui::{UiSnapshot, UiThrottle};

/// Upper bound on simultaneously active joints; fixed so tick batches stay
/// allocation-free.
pub const MAX_JOINTS: usize = 8;

const RING_CAPACITY: usize = 32;

// ── Tick output ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct JointTick {
    pub angle_deg: f64,
    pub rotation: Quaternion,
    pub quality: TickQuality,
}

/// One pipeline tick for every recorded joint. `ticks[i]` corresponds to the
/// i-th joint of the active session's joint list.
#[derive(Debug, Clone, Copy)]
pub struct TickBatch {
    pub timestamp_ms: u64,
    pub ticks: [Option<JointTick>; MAX_JOINTS],
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub out_of_order_drops: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub missing_joint_ticks: AtomicU64,
    pub interpolated_joint_ticks: AtomicU64,
    pub degraded_angles: AtomicU64,
    pub late_ticks: AtomicU64,
    pub recording_overruns: AtomicU64,
    pub ticks_total: AtomicU64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "outOfOrderDrops": self.out_of_order_drops.load(Ordering::Relaxed),
            "malformedFrames": self.malformed_frames.load(Ordering::Relaxed),
            "missingJointTicks": self.missing_joint_ticks.load(Ordering::Relaxed),
            "interpolatedJointTicks": self.interpolated_joint_ticks.load(Ordering::Relaxed),
            "degradedAngles": self.degraded_angles.load(Ordering::Relaxed),
            "lateTicks": self.late_ticks.load(Ordering::Relaxed),
            "recordingOverruns": self.recording_overruns.load(Ordering::Relaxed),
            "ticksTotal": self.ticks_total.load(Ordering::Relaxed),
        })
    }
}

// ── Internal state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct TimedSample {
    master_ms: u64,
    orientation: Quaternion,
}

struct DeviceChannel {
    name: String,
    ring: Mutex<RingBuffer<TimedSample>>,
    /// `master − device` from the last sync; 0 until synced.
    offset_ms: AtomicI64,
    last_counter: AtomicU64,
}

struct JointRuntime {
    config: JointConfig,
    top: Option<String>,
    bottom: Option<String>,
    window: JointWindow,
    last_rotation: Quaternion,
}

impl JointRuntime {
    fn is_active(&self) -> bool {
        self.top.is_some() && self.bottom.is_some()
    }
}

struct RecordingRoute {
    tx: mpsc::Sender<TickBatch>,
    /// Session joint names, index-aligned with `TickBatch::ticks`.
    joints: Vec<String>,
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct MotionPipeline {
    target_hz: u32,
    clock: MasterClock,
    pub metrics: Arc<PipelineMetrics>,
    devices: RwLock<HashMap<String, Arc<DeviceChannel>>>,
    joints: Mutex<Vec<JointRuntime>>,
    ui: UiThrottle,
    recording: Mutex<Option<RecordingRoute>>,
}

impl MotionPipeline {
    pub fn new(target_hz: u32, joints: Vec<JointConfig>, clock: MasterClock) -> Self {
        let joints = joints
            .into_iter()
            .map(|config| JointRuntime {
                config,
                top: None,
                bottom: None,
                window: JointWindow::default(),
                last_rotation: Quaternion::IDENTITY,
            })
            .collect();
        Self {
            target_hz,
            clock,
            metrics: Arc::new(PipelineMetrics::default()),
            devices: RwLock::new(HashMap::new()),
            joints: Mutex::new(joints),
            ui: UiThrottle::new(),
            recording: Mutex::new(None),
        }
    }

    pub fn period_ms(&self) -> u64 {
        (1000 / self.target_hz.max(1)) as u64
    }

    pub fn ui(&self) -> &UiThrottle {
        &self.ui
    }

    // ── Device attachment ────────────────────────────────────────────────────

    /// Register a device and pump its notification stream into the ring
    /// buffer. `offset_ms` is the registry's `master − device` offset.
    pub fn attach_device(
        self: &Arc<Self>,
        device_id: &str,
        device_name: &str,
        offset_ms: i64,
        mut notifications: mpsc::Receiver<Bytes>,
    ) {
        let channel = Arc::new(DeviceChannel {
            name: device_name.to_string(),
            ring: Mutex::new(RingBuffer::new(RING_CAPACITY)),
            offset_ms: AtomicI64::new(offset_ms),
            last_counter: AtomicU64::new(0),
        });
        self.devices
            .write()
            .expect("devices lock")
            .insert(device_id.to_string(), channel);
        self.rebind_joints();
        info!("pipeline: attached {device_name} (offset {offset_ms}ms)");

        let pipeline = Arc::clone(self);
        let id = device_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = notifications.recv().await {
                match ImuSample::decode(&frame) {
                    Some(sample) => pipeline.ingest_sample(&id, sample),
                    None => {
                        pipeline.metrics.malformed_frames.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            debug!("pipeline: stream ended for {id}");
            pipeline.detach_device(&id);
        });
    }

    pub fn detach_device(&self, device_id: &str) {
        let removed = self
            .devices
            .write()
            .expect("devices lock")
            .remove(device_id)
            .is_some();
        if removed {
            self.rebind_joints();
            info!("pipeline: detached {device_id}");
        }
    }

    pub fn set_device_offset(&self, device_id: &str, offset_ms: i64) {
        if let Some(ch) = self.devices.read().expect("devices lock").get(device_id) {
            ch.offset_ms.store(offset_ms, Ordering::Relaxed);
        }
    }

    /// Feed one sample. Out-of-order counters are dropped with a counter
    /// increment; errors never propagate to the stream.
    pub fn ingest_sample(&self, device_id: &str, sample: ImuSample) {
        let devices = self.devices.read().expect("devices lock");
        let Some(channel) = devices.get(device_id) else {
            return;
        };
        let prev = channel.last_counter.load(Ordering::Relaxed);
        if sample.device_counter_ms < prev {
            self.metrics.out_of_order_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        channel.last_counter.store(sample.device_counter_ms, Ordering::Relaxed);
        let offset = channel.offset_ms.load(Ordering::Relaxed);
        let master_ms = (sample.device_counter_ms as i64 + offset).max(0) as u64;
        channel
            .ring
            .lock()
            .expect("ring lock")
            .push(TimedSample { master_ms, orientation: sample.orientation.normalize() });
    }

    /// Re-resolve joint device bindings from the attached-device set.
    /// A joint is active only while both patterns match attached devices.
    fn rebind_joints(&self) {
        let devices = self.devices.read().expect("devices lock");
        let mut joints = self.joints.lock().expect("joints lock");
        for joint in joints.iter_mut() {
            joint.top = devices
                .iter()
                .find(|(_, ch)| joint.config.matches_top(&ch.name))
                .map(|(id, _)| id.clone());
            joint.bottom = devices
                .iter()
                .find(|(_, ch)| joint.config.matches_bottom(&ch.name))
                .map(|(id, _)| id.clone());
        }
    }

    pub fn active_joint_names(&self) -> Vec<String> {
        self.joints
            .lock()
            .expect("joints lock")
            .iter()
            .filter(|j| j.is_active())
            .map(|j| j.config.name.clone())
            .collect()
    }

    pub fn reset_windows(&self) {
        let mut joints = self.joints.lock().expect("joints lock");
        for joint in joints.iter_mut() {
            joint.window.reset();
        }
    }

    pub fn window_for(&self, joint_name: &str) -> Option<JointWindow> {
        self.joints
            .lock()
            .expect("joints lock")
            .iter()
            .find(|j| j.config.name == joint_name)
            .map(|j| j.window)
    }

    // ── Recording routing ────────────────────────────────────────────────────

    pub fn set_recording(&self, joints: Vec<String>, tx: mpsc::Sender<TickBatch>) {
        *self.recording.lock().expect("recording lock") = Some(RecordingRoute { tx, joints });
    }

    pub fn clear_recording(&self) {
        *self.recording.lock().expect("recording lock") = None;
    }

    // ── Tick loop ────────────────────────────────────────────────────────────

    /// Drive the pipeline forever at the target rate.
    pub fn spawn_tick_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_micros(1_000_000 / pipeline.target_hz as u64);
            let mut ticker = tokio::time::interval(period);
            let mut last_tick_ms = pipeline.clock.now_ms();
            loop {
                ticker.tick().await;
                let now = pipeline.clock.now_ms();
                if now.saturating_sub(last_tick_ms) > 2 * pipeline.period_ms() {
                    pipeline.metrics.late_ticks.fetch_add(1, Ordering::Relaxed);
                }
                last_tick_ms = now;
                pipeline.run_tick(now).await;
            }
        })
    }

    /// One tick: compute every active joint, publish the UI snapshot, feed
    /// the recording channel. Public for deterministic tests.
    pub async fn run_tick(&self, tick_ms: u64) {
        self.metrics.ticks_total.fetch_add(1, Ordering::Relaxed);
        let period = self.period_ms();

        // Phase 1: everything synchronous, locks released before any await
        let mut batch_entries: [Option<JointTick>; MAX_JOINTS] = [None; MAX_JOINTS];
        let mut snapshot = UiSnapshot::default();
        snapshot.timestamp_ms = tick_ms;
        let mut have_output = false;
        let recording_tx;

        {
            let devices = self.devices.read().expect("devices lock");
            let mut joints = self.joints.lock().expect("joints lock");
            let route = self.recording.lock().expect("recording lock");
            recording_tx = route.as_ref().map(|r| r.tx.clone());

            for joint in joints.iter_mut() {
                if !joint.is_active() {
                    continue;
                }
                let top = joint.top.as_deref().and_then(|id| devices.get(id));
                let bottom = joint.bottom.as_deref().and_then(|id| devices.get(id));
                let (Some(top), Some(bottom)) = (top, bottom) else {
                    continue;
                };

                let tick = Self::compute_joint_tick(
                    &self.metrics,
                    joint,
                    top,
                    bottom,
                    tick_ms,
                    period,
                );
                have_output = true;

                if joint.config.name.contains("left") {
                    snapshot.left = joint.window;
                } else if joint.config.name.contains("right") {
                    snapshot.right = joint.window;
                }

                if let Some(route) = route.as_ref() {
                    if let Some(slot) =
                        route.joints.iter().position(|n| *n == joint.config.name)
                    {
                        if slot < MAX_JOINTS {
                            batch_entries[slot] = Some(tick);
                        }
                    }
                }
            }
        }

        if have_output {
            self.ui.publish(snapshot);
        }

        // Phase 2: recording send, the tick's only suspension point. Every
        // tick of an active session is sent, even when a joint produced no
        // entry (the recorder marks those missing). The channel never drops:
        // a full queue backpressures the tick loop and is surfaced as an
        // overrun.
        if let Some(tx) = recording_tx {
            let batch = TickBatch { timestamp_ms: tick_ms, ticks: batch_entries };
            if let Err(mpsc::error::TrySendError::Full(batch)) = tx.try_send(batch) {
                self.metrics.recording_overruns.fetch_add(1, Ordering::Relaxed);
                warn!("pipeline: recording channel full, backpressuring tick loop");
                if tx.send(batch).await.is_err() {
                    self.clear_recording();
                }
            }
        }
    }

    fn compute_joint_tick(
        metrics: &PipelineMetrics,
        joint: &mut JointRuntime,
        top: &DeviceChannel,
        bottom: &DeviceChannel,
        tick_ms: u64,
        period_ms: u64,
    ) -> JointTick {
        let top_pair = Self::samples_around(top, tick_ms, period_ms);
        let bottom_pair = Self::samples_around(bottom, tick_ms, period_ms);

        let (Some((top_q, top_wide)), Some((bottom_q, bottom_wide))) = (top_pair, bottom_pair)
        else {
            // No usable input: repeat the previous value and stall the window
            metrics.missing_joint_ticks.fetch_add(1, Ordering::Relaxed);
            return JointTick {
                angle_deg: joint.window.current,
                rotation: joint.last_rotation,
                quality: TickQuality::Missing,
            };
        };

        let quality = if top_wide || bottom_wide {
            metrics.interpolated_joint_ticks.fetch_add(1, Ordering::Relaxed);
            TickQuality::Interpolated
        } else {
            TickQuality::Valid
        };

        let angle = joint_angle_from_pair(&top_q, &bottom_q, &joint.config.calibration);
        if angle.degraded {
            metrics.degraded_angles.fetch_add(1, Ordering::Relaxed);
        }
        let rotation = relative_rotation(&top_q, &bottom_q);
        joint.last_rotation = rotation;
        joint.window.update(angle.degrees, tick_ms);

        JointTick { angle_deg: angle.degrees, rotation, quality }
    }

    /// Interpolated orientation of one device at the tick instant, plus a
    /// flag when the interpolation had to span more than one input period.
    /// `None` when the newest sample is older than one target period.
    fn samples_around(
        channel: &DeviceChannel,
        tick_ms: u64,
        period_ms: u64,
    ) -> Option<(Quaternion, bool)> {
        let ring = channel.ring.lock().expect("ring lock");
        let (older, newer) = match ring.latest_two() {
            Some((a, b)) => (*a, *b),
            None => {
                let only = *ring.latest()?;
                if only.master_ms + period_ms < tick_ms {
                    return None;
                }
                return Some((only.orientation, false));
            }
        };
        drop(ring);

        if newer.master_ms + period_ms < tick_ms {
            return None;
        }
        let span = newer.master_ms.saturating_sub(older.master_ms);
        if span == 0 {
            return Some((newer.orientation, false));
        }
        let t = (tick_ms.saturating_sub(older.master_ms)) as f64 / span as f64;
        let q = older.orientation.interpolate(&newer.orientation, t.clamp(0.0, 1.0));
        let wide = span > 2 * period_ms;
        Some((q, wide))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imu_types::mapping::default_joints;

    fn pipeline() -> Arc<MotionPipeline> {
        Arc::new(MotionPipeline::new(100, default_joints(), MasterClock::new()))
    }

    fn attach_pair(p: &Arc<MotionPipeline>) -> (mpsc::Sender<Bytes>, mpsc::Sender<Bytes>) {
        let (tx_top, rx_top) = mpsc::channel(8);
        let (tx_bot, rx_bot) = mpsc::channel(8);
        p.attach_device("t", "tropx_ln_top", 0, rx_top);
        p.attach_device("b", "tropx_ln_bottom", 0, rx_bot);
        (tx_top, tx_bot)
    }

    fn sample(counter: u64, angle_deg: f64) -> ImuSample {
        ImuSample::new(counter, Quaternion::from_euler(angle_deg.to_radians(), 0.0, 0.0))
    }

    #[tokio::test]
    async fn joint_activates_when_both_devices_attach() {
        let p = pipeline();
        let (_a, _b) = attach_pair(&p);
        assert_eq!(p.active_joint_names(), vec!["left_knee".to_string()]);
        p.detach_device("b");
        assert!(p.active_joint_names().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_samples_are_dropped() {
        let p = pipeline();
        let (_a, _b) = attach_pair(&p);
        p.ingest_sample("t", sample(100, 0.0));
        p.ingest_sample("t", sample(90, 0.0));
        assert_eq!(p.metrics.out_of_order_drops.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn tick_interpolates_to_the_tick_instant() {
        let p = pipeline();
        let (_a, _b) = attach_pair(&p);
        // Top stays level; bottom sweeps 10° → 20° between t=100 and t=120
        p.ingest_sample("t", sample(100, 0.0));
        p.ingest_sample("t", sample(120, 0.0));
        p.ingest_sample("b", sample(100, 10.0));
        p.ingest_sample("b", sample(120, 20.0));

        p.run_tick(110).await;
        let w = p.window_for("left_knee").unwrap();
        assert!((w.current - 15.0).abs() < 0.5, "current {}", w.current);
    }

    #[tokio::test]
    async fn stale_input_is_missing_and_stalls_the_window() {
        let p = pipeline();
        let (_a, _b) = attach_pair(&p);
        p.ingest_sample("t", sample(100, 0.0));
        p.ingest_sample("t", sample(110, 0.0));
        p.ingest_sample("b", sample(100, 30.0));
        p.ingest_sample("b", sample(110, 30.0));
        p.run_tick(115).await;
        let before = p.window_for("left_knee").unwrap();

        // 200ms later with no new samples: missing tick, rom unchanged
        p.run_tick(315).await;
        let after = p.window_for("left_knee").unwrap();
        assert_eq!(p.metrics.missing_joint_ticks.load(Ordering::Relaxed), 1);
        assert_eq!(after.range_of_motion(), before.range_of_motion());
        assert_eq!(after.current, before.current);
    }

    #[tokio::test]
    async fn recording_receives_index_aligned_batches() {
        let p = pipeline();
        let (_a, _b) = attach_pair(&p);
        p.ingest_sample("t", sample(100, 0.0));
        p.ingest_sample("t", sample(110, 0.0));
        p.ingest_sample("b", sample(100, 45.0));
        p.ingest_sample("b", sample(110, 45.0));

        let (tx, mut rx) = mpsc::channel(4);
        p.set_recording(vec!["left_knee".to_string()], tx);
        p.run_tick(110).await;

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.timestamp_ms, 110);
        let tick = batch.ticks[0].expect("left knee tick");
        assert!((tick.angle_deg - 45.0).abs() < 0.5);
        assert_eq!(tick.quality, TickQuality::Valid);
    }

    #[tokio::test]
    async fn ui_snapshot_tracks_both_sides() {
        let p = pipeline();
        let (_a, _b) = attach_pair(&p);
        let (_tx_rt, rx_rt) = mpsc::channel::<Bytes>(8);
        let (_tx_rb, rx_rb) = mpsc::channel::<Bytes>(8);
        p.attach_device("rt", "tropx_rn_top", 0, rx_rt);
        p.attach_device("rb", "tropx_rn_bottom", 0, rx_rb);

        p.ingest_sample("t", sample(100, 0.0));
        p.ingest_sample("t", sample(110, 0.0));
        p.ingest_sample("b", sample(100, 30.0));
        p.ingest_sample("b", sample(110, 30.0));
        p.ingest_sample("rt", sample(100, 0.0));
        p.ingest_sample("rt", sample(110, 0.0));
        p.ingest_sample("rb", sample(100, 60.0));
        p.ingest_sample("rb", sample(110, 60.0));

        p.run_tick(110).await;
        let snap = p.ui().get_snapshot();
        assert!((snap.left.current - 30.0).abs() < 0.5);
        assert!((snap.right.current - 60.0).abs() < 0.5);
        assert_eq!(snap.timestamp_ms, 110);
    }
}
