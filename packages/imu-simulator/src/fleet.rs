//! Simulated sensor fleet implementing the transport capability.
//!
//! Every transport operation sleeps a configurable latency (plus jitter)
//! before touching firmware state, so round-trip timing — and therefore the
//! time-sync RTT filter — behaves like a real short-range link. Operations
//! are serialized per device by the per-device firmware lock and run in
//! parallel across devices, matching the capability contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use imu_types::mapping::placement_for_name;
use imu_types::sample::ImuSample;
use imu_types::transport::{
    DeviceTransport, DiscoveredDevice, ScanFilter, TransportError, CHAR_BATTERY, CHAR_COMMAND,
    CHAR_IMU_DATA, CHAR_REPLY, CHAR_SYSTEM_STATUS,
};

use crate::firmware::VirtualSensor;
use crate::motion::{KneeMotionModel, MotionConfig};

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// IMU notification rate per device.
    pub sample_rate_hz: u32,
    /// Base latency for each transport operation.
    pub command_latency_ms: u64,
    /// Uniform jitter added on top of the base latency.
    pub latency_jitter_ms: u64,
    /// Largest initial counter skew drawn per device, ms.
    pub max_initial_skew_ms: u64,
    /// Crystal error spread, ppm.
    pub max_drift_ppm: f64,
    pub motion: MotionConfig,
    pub seed: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 100,
            command_latency_ms: 3,
            latency_jitter_ms: 2,
            max_initial_skew_ms: 86_400_000, // a day of free-running drift
            max_drift_ppm: 20.0,
            motion: MotionConfig::default(),
            seed: 7,
        }
    }
}

/// Standard dual-knee fleet names.
pub const DEFAULT_FLEET: [&str; 4] =
    ["tropx_ln_top", "tropx_ln_bottom", "tropx_rn_top", "tropx_rn_bottom"];

// ── Fleet ─────────────────────────────────────────────────────────────────────

struct Inner {
    cfg: FleetConfig,
    devices: RwLock<HashMap<String, Arc<Mutex<VirtualSensor>>>>,
    /// Fleet-wide motion time origin.
    started: Instant,
    /// Bumped by `stop_scan`; running scan tasks exit when it moves.
    scan_generation: AtomicU64,
    /// Pending notification drops per device (gap injection for tests).
    stream_gaps: Mutex<HashMap<String, u32>>,
}

#[derive(Clone)]
pub struct SimFleet {
    inner: Arc<Inner>,
}

impl SimFleet {
    pub fn new(cfg: FleetConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                devices: RwLock::new(HashMap::new()),
                started: Instant::now(),
                scan_generation: AtomicU64::new(0),
                stream_gaps: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Fleet with the four standard dual-knee sensors.
    pub async fn with_default_fleet(cfg: FleetConfig) -> Self {
        let fleet = Self::new(cfg);
        for name in DEFAULT_FLEET {
            fleet.add_device(name).await;
        }
        fleet
    }

    /// Register a new virtual sensor; returns its stable id.
    pub async fn add_device(&self, name: &str) -> String {
        let id = format!("sim-{name}");
        let mut rng = StdRng::seed_from_u64(
            self.inner.cfg.seed ^ imu_types::device::name_hash32(name) as u64,
        );
        let skew = rng.gen_range(0..self.inner.cfg.max_initial_skew_ms.max(1));
        let phase = rng.gen_range(0..1000);
        let drift = rng.gen_range(-self.inner.cfg.max_drift_ppm..=self.inner.cfg.max_drift_ppm);
        let sensor = VirtualSensor::new(&id, name, skew, phase, drift);
        info!("sim: registered {name} (skew {skew}ms, phase {phase}ms, drift {drift:.1}ppm)");
        self.inner
            .devices
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(sensor)));
        id
    }

    async fn device(&self, device_id: &str) -> Result<Arc<Mutex<VirtualSensor>>, TransportError> {
        self.inner
            .devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(device_id.to_string()))
    }

    async fn connected_device(
        &self,
        device_id: &str,
    ) -> Result<Arc<Mutex<VirtualSensor>>, TransportError> {
        let dev = self.device(device_id).await?;
        if !dev.lock().await.connected {
            return Err(TransportError::NotConnected(device_id.to_string()));
        }
        Ok(dev)
    }

    async fn link_latency(&self) {
        let jitter = if self.inner.cfg.latency_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.inner.cfg.latency_jitter_ms)
        } else {
            0
        };
        tokio::time::sleep(Duration::from_millis(self.inner.cfg.command_latency_ms + jitter)).await;
    }

    /// Drop the next `n` IMU notifications from a device (test hook for
    /// missing-sample handling).
    pub async fn inject_stream_gap(&self, device_id: &str, n: u32) {
        self.inner
            .stream_gaps
            .lock()
            .await
            .insert(device_id.to_string(), n);
    }

    /// Writes a device has seen for one opcode.
    pub async fn write_count(&self, device_id: &str, op: u8) -> u32 {
        match self.device(device_id).await {
            Ok(dev) => dev.lock().await.write_count(op),
            Err(_) => 0,
        }
    }

    /// Current device counter (test observability).
    pub async fn counter_ms(&self, device_id: &str) -> Option<u64> {
        Some(self.device(device_id).await.ok()?.lock().await.counter_ms())
    }

    /// Fault injection: make a device silently lose `SET_DATETIME` writes.
    pub async fn set_datetime_fault(&self, device_id: &str, faulted: bool) {
        if let Ok(dev) = self.device(device_id).await {
            dev.lock().await.datetime_fault = faulted;
        }
    }

    /// Shift a device's counter, as a hardware reset or glitch would.
    pub async fn shift_counter(&self, device_id: &str, delta_ms: i64) {
        if let Ok(dev) = self.device(device_id).await {
            dev.lock().await.shift_counter(delta_ms);
        }
    }
}

// ── Transport implementation ──────────────────────────────────────────────────

#[async_trait]
impl DeviceTransport for SimFleet {
    async fn start_scan(
        &self,
        filter: ScanFilter,
    ) -> Result<mpsc::Receiver<DiscoveredDevice>, TransportError> {
        let (tx, rx) = mpsc::channel(16);
        let inner = self.inner.clone();
        let generation = inner.scan_generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let devices = inner.devices.read().await;
            let mut found: Vec<DiscoveredDevice> = devices
                .values()
                .map(|d| d.try_lock().map(|dev| DiscoveredDevice {
                    id: dev.id.clone(),
                    name: dev.name.clone(),
                    rssi: Some(-60),
                }))
                .filter_map(Result::ok)
                .collect();
            drop(devices);
            found.sort_by(|a, b| a.id.cmp(&b.id));

            for dev in found {
                if inner.scan_generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                if let Some(f) = &filter.name_contains {
                    if !dev.name.contains(f.as_str()) {
                        continue;
                    }
                }
                // Advertisements trickle in, they do not arrive as a batch
                tokio::time::sleep(Duration::from_millis(15)).await;
                if tx.send(dev).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn stop_scan(&self) {
        self.inner.scan_generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn connect(&self, device_id: &str) -> Result<(), TransportError> {
        self.link_latency().await;
        let dev = self.device(device_id).await?;
        let mut dev = dev.lock().await;
        dev.connected = true;
        debug!("sim: {} connected", dev.name);
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError> {
        self.link_latency().await;
        let dev = self.device(device_id).await?;
        let mut dev = dev.lock().await;
        dev.connected = false;
        dev.in_timesync_mode = false;
        debug!("sim: {} disconnected", dev.name);
        Ok(())
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.link_latency().await;
        let dev = self.connected_device(device_id).await?;
        let mut dev = dev.lock().await;
        if characteristic == CHAR_COMMAND {
            dev.handle_command(payload);
            Ok(())
        } else if characteristic == CHAR_SYSTEM_STATUS {
            match payload.first() {
                Some(&status) => {
                    dev.system_status = status;
                    Ok(())
                }
                None => Err(TransportError::WriteFailed("empty status write".into())),
            }
        } else {
            Err(TransportError::UnknownCharacteristic(characteristic))
        }
    }

    async fn read_characteristic(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<Bytes, TransportError> {
        self.link_latency().await;
        let dev = self.connected_device(device_id).await?;
        let dev = dev.lock().await;
        if characteristic == CHAR_REPLY {
            Ok(Bytes::from(dev.latched_reply()))
        } else if characteristic == CHAR_SYSTEM_STATUS {
            Ok(Bytes::copy_from_slice(&[dev.system_status]))
        } else if characteristic == CHAR_BATTERY {
            Ok(Bytes::copy_from_slice(&[dev.battery_pct as u8]))
        } else {
            Err(TransportError::UnknownCharacteristic(characteristic))
        }
    }

    async fn subscribe_notifications(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Bytes>, TransportError> {
        let dev = self.connected_device(device_id).await?;
        if characteristic == CHAR_IMU_DATA {
            {
                let (tx, rx) = mpsc::channel(64);
                let inner = self.inner.clone();
                let device_key = device_id.to_string();
                let (name, placement) = {
                    let d = dev.lock().await;
                    (d.name.clone(), placement_for_name(&d.name))
                };
                let Some(placement) = placement else {
                    return Err(TransportError::ReadFailed(format!(
                        "{name} has no joint placement"
                    )));
                };
                let mut model = KneeMotionModel::new(placement.joint, inner.cfg.motion.clone());
                let period = Duration::from_micros(1_000_000 / inner.cfg.sample_rate_hz as u64);

                tokio::spawn(async move {
                    dev.lock().await.system_status =
                        imu_types::transport::SYSTEM_STATUS_STREAMING;
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        ticker.tick().await;
                        let d = dev.lock().await;
                        if !d.connected {
                            break;
                        }
                        let counter = d.counter_ms();
                        drop(d);

                        // Gap injection: swallow frames while any remain
                        {
                            let mut gaps = inner.stream_gaps.lock().await;
                            if let Some(left) = gaps.get_mut(&device_key) {
                                if *left > 0 {
                                    *left -= 1;
                                    continue;
                                }
                            }
                        }

                        let t_s = inner.started.elapsed().as_secs_f64();
                        let q = model.orientation(placement.position, t_s);
                        let frame = ImuSample::new(counter, q).encode();
                        match tx.try_send(Bytes::from(frame)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // Radio has no buffer to speak of; frame is lost
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    debug!("sim: {name} IMU stream ended");
                });
                Ok(rx)
            }
        } else if characteristic == CHAR_BATTERY {
            {
                let (tx, rx) = mpsc::channel(4);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(5));
                    loop {
                        ticker.tick().await;
                        let mut d = dev.lock().await;
                        if !d.connected {
                            break;
                        }
                        d.battery_pct = (d.battery_pct - 0.01).max(0.0);
                        let pct = d.battery_pct as u8;
                        drop(d);
                        if tx.send(Bytes::copy_from_slice(&[pct])).await.is_err() {
                            break;
                        }
                    }
                });
                Ok(rx)
            }
        } else {
            warn!("sim: subscribe on unsupported characteristic {characteristic}");
            Err(TransportError::UnknownCharacteristic(characteristic))
        }
    }
}
