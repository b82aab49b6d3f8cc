//! Time-sync engine.
//!
//! Aligns every sensor's free-running counter to a single timeline in two
//! layers:
//!
//! 1. **Coordinator pass** (`TimeSyncManager::sync_devices`): forces the
//!    fleet to IDLE, broadcasts one shared `SET_DATETIME`, reads every
//!    counter against a common reference instant, elects the device with the
//!    lowest adjusted counter as reference, and writes the per-device
//!    `SET_CLOCK_OFFSET` corrections into firmware — each device at most once
//!    in its lifetime.
//! 2. **Per-device session** (`run_session`): an NTP-style three-way exchange
//!    repeated `N` times with RTT-trimmed median filtering, used both for the
//!    reported statistics and to verify the hardware alignment. Sessions
//!    never write offsets.
//!
//! The one-shot guard lives in the registry's sync ladder: a device at
//! `OffsetComputed` or beyond is never written again, and a wildly different
//! counter on such a device is reported as a suspected clock reset instead of
//! being corrected.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use imu_types::device::SyncState;
use imu_types::error::{CodedError, ErrorCode};
use imu_types::transport::{
    opcode, parse_timestamp_reply, set_clock_offset_payload, set_datetime_payload,
    DeviceTransport, CHAR_COMMAND, CHAR_REPLY, CHAR_SYSTEM_STATUS, SYSTEM_STATUS_IDLE,
};

use crate::clock::MasterClock;
use crate::registry::DeviceRegistry;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TimeSyncConfig {
    /// Exchanges per session.
    pub samples_per_session: usize,
    /// Pause between exchanges.
    pub sample_gap: Duration,
    /// Whole-session attempts (linear backoff between them).
    pub session_attempts: u32,
    /// Fraction of samples trimmed from each RTT extreme.
    pub rtt_trim_fraction: f64,
    /// Corrections at or below this are considered already aligned, ms.
    pub min_correction_ms: i64,
    /// A correction beyond this on a fully-synced device means its clock was
    /// reset, ms.
    pub suspected_reset_ms: i64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            samples_per_session: 20,
            sample_gap: Duration::from_millis(10),
            session_attempts: 3,
            rtt_trim_fraction: 0.2,
            min_correction_ms: 1,
            suspected_reset_ms: 1000,
        }
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Statistics from one per-device session.
#[derive(Debug, Clone)]
pub struct DeviceSyncStats {
    pub device_id: String,
    /// `master − device` in ms; adding it to a device counter yields master
    /// time.
    pub offset_ms: i64,
    pub rtt_avg_ms: f64,
    pub rtt_min_ms: f64,
    pub rtt_max_ms: f64,
    pub samples_used: u32,
}

/// Outcome of a fleet-wide sync pass.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub stats: Vec<DeviceSyncStats>,
    /// Devices that failed their verification session this pass.
    pub failed: Vec<String>,
    /// Fully-synced devices whose counter moved by more than the reset
    /// threshold; their offsets were deliberately not rewritten.
    pub suspected_resets: Vec<String>,
}

// ── Per-device session ────────────────────────────────────────────────────────

struct Exchange {
    rtt_ms: u64,
    /// `device_counter − master_midpoint`; note the sign.
    raw_offset_ms: i64,
}

async fn ensure_idle(
    transport: &Arc<dyn DeviceTransport>,
    device_id: &str,
) -> Result<(), CodedError> {
    let status = transport
        .read_characteristic(device_id, CHAR_SYSTEM_STATUS)
        .await
        .map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))?;
    if status.first() == Some(&SYSTEM_STATUS_IDLE) {
        return Ok(());
    }
    transport
        .write_characteristic(device_id, CHAR_SYSTEM_STATUS, &[SYSTEM_STATUS_IDLE])
        .await
        .map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))?;
    let status = transport
        .read_characteristic(device_id, CHAR_SYSTEM_STATUS)
        .await
        .map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))?;
    if status.first() == Some(&SYSTEM_STATUS_IDLE) {
        Ok(())
    } else {
        Err(CodedError::new(
            ErrorCode::TimeSyncFailed,
            format!("{device_id} refused to enter IDLE"),
        ))
    }
}

async fn read_counter(
    transport: &Arc<dyn DeviceTransport>,
    clock: &MasterClock,
    device_id: &str,
) -> Result<(u64, u64, u64), CodedError> {
    let t1 = clock.now_ms();
    transport
        .write_characteristic(device_id, CHAR_COMMAND, &[opcode::GET_TIMESTAMP])
        .await
        .map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))?;
    let reply = transport
        .read_characteristic(device_id, CHAR_REPLY)
        .await
        .map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))?;
    let t4 = clock.now_ms();
    let counter = parse_timestamp_reply(&reply).ok_or_else(|| {
        CodedError::new(ErrorCode::TimeSyncFailed, format!("{device_id}: short timestamp reply"))
    })?;
    Ok((t1, counter, t4))
}

async fn collect_exchanges(
    transport: &Arc<dyn DeviceTransport>,
    clock: &MasterClock,
    cfg: &TimeSyncConfig,
    device_id: &str,
    out: &mut Vec<Exchange>,
) -> Result<(), CodedError> {
    for _ in 0..cfg.samples_per_session {
        let (t1, counter, t4) = read_counter(transport, clock, device_id).await?;
        let rtt = t4 - t1;
        let midpoint = t1 + rtt / 2;
        out.push(Exchange { rtt_ms: rtt, raw_offset_ms: counter as i64 - midpoint as i64 });
        tokio::time::sleep(cfg.sample_gap).await;
    }
    Ok(())
}

async fn session_once(
    transport: &Arc<dyn DeviceTransport>,
    clock: &MasterClock,
    cfg: &TimeSyncConfig,
    device_id: &str,
    send_datetime: bool,
) -> Result<DeviceSyncStats, CodedError> {
    ensure_idle(transport, device_id).await?;

    if send_datetime {
        let payload = set_datetime_payload(clock.unix_seconds() as u32);
        transport
            .write_characteristic(device_id, CHAR_COMMAND, &payload)
            .await
            .map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))?;
    }

    transport
        .write_characteristic(device_id, CHAR_COMMAND, &[opcode::ENTER_TIMESYNC])
        .await
        .map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))?;

    let mut exchanges = Vec::with_capacity(cfg.samples_per_session);
    let collected = collect_exchanges(transport, clock, cfg, device_id, &mut exchanges).await;

    // Leave time-sync mode even when sampling failed
    let exit = transport
        .write_characteristic(device_id, CHAR_COMMAND, &[opcode::EXIT_TIMESYNC])
        .await;
    collected?;
    exit.map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))?;

    // Discard the RTT extremes, then take the median offset of the rest
    exchanges.sort_by_key(|e| e.rtt_ms);
    let n = exchanges.len();
    let trim = ((n as f64 * cfg.rtt_trim_fraction).floor() as usize).min(n.saturating_sub(1) / 2);
    let kept = &mut exchanges[trim..n - trim];
    if kept.is_empty() {
        return Err(CodedError::new(
            ErrorCode::TimeSyncFailed,
            format!("{device_id}: no usable exchanges"),
        ));
    }

    let rtt_min = kept.iter().map(|e| e.rtt_ms).min().unwrap_or(0) as f64;
    let rtt_max = kept.iter().map(|e| e.rtt_ms).max().unwrap_or(0) as f64;
    let rtt_avg = kept.iter().map(|e| e.rtt_ms as f64).sum::<f64>() / kept.len() as f64;

    kept.sort_by_key(|e| e.raw_offset_ms);
    let median_raw = kept[kept.len() / 2].raw_offset_ms;

    Ok(DeviceSyncStats {
        device_id: device_id.to_string(),
        // Reported as master − device so master = counter + offset
        offset_ms: -median_raw,
        rtt_avg_ms: rtt_avg,
        rtt_min_ms: rtt_min,
        rtt_max_ms: rtt_max,
        samples_used: kept.len() as u32,
    })
}

/// Run one device's sync session with retries and linear backoff.
pub async fn run_session(
    transport: Arc<dyn DeviceTransport>,
    clock: MasterClock,
    cfg: TimeSyncConfig,
    device_id: String,
    send_datetime: bool,
) -> Result<DeviceSyncStats, CodedError> {
    let mut last_err = CodedError::new(ErrorCode::TimeSyncFailed, "no attempts made");
    for attempt in 1..=cfg.session_attempts {
        match session_once(&transport, &clock, &cfg, &device_id, send_datetime).await {
            Ok(stats) => {
                debug!(
                    "timesync: {device_id} offset {}ms (rtt avg {:.1}ms over {} samples)",
                    stats.offset_ms, stats.rtt_avg_ms, stats.samples_used
                );
                return Ok(stats);
            }
            Err(e) => {
                warn!("timesync: {device_id} attempt {attempt} failed: {e}");
                last_err = e;
                if attempt < cfg.session_attempts {
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
            }
        }
    }
    Err(last_err)
}

// ── Multi-device coordinator ──────────────────────────────────────────────────

pub struct TimeSyncManager {
    transport: Arc<dyn DeviceTransport>,
    registry: Arc<DeviceRegistry>,
    clock: MasterClock,
    cfg: TimeSyncConfig,
}

impl TimeSyncManager {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        registry: Arc<DeviceRegistry>,
        clock: MasterClock,
        cfg: TimeSyncConfig,
    ) -> Self {
        Self { transport, registry, clock, cfg }
    }

    /// Synchronize a set of connected devices.
    pub async fn sync_devices(&self, device_ids: &[String]) -> Result<SyncOutcome, CodedError> {
        if device_ids.is_empty() {
            return Err(CodedError::new(ErrorCode::TimeSyncFailed, "no devices to sync"));
        }
        let mut ids: Vec<String> = device_ids.to_vec();
        ids.sort();
        info!("timesync: syncing {} devices", ids.len());

        // 1. Everyone to IDLE, in parallel
        self.for_each_device(&ids, |transport, _clock, id| async move {
            ensure_idle(&transport, &id).await
        })
        .await?;

        // 2. One shared RTC broadcast
        let common_unix = self.clock.unix_seconds() as u32;
        self.for_each_device(&ids, move |transport, _clock, id| async move {
            transport
                .write_characteristic(&id, CHAR_COMMAND, &set_datetime_payload(common_unix))
                .await
                .map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))
        })
        .await?;
        for id in &ids {
            self.registry.advance_sync_state(id, SyncState::RtcInitialized).await;
        }

        // 3. Read every counter against one reference instant
        let reference_wall = self.clock.now_ms();
        let mut readings: Vec<(String, i64)> = Vec::with_capacity(ids.len());
        {
            let mut set = JoinSet::new();
            for id in ids.clone() {
                let transport = self.transport.clone();
                let clock = self.clock;
                set.spawn(async move {
                    let (t1, counter, t4) = read_counter(&transport, &clock, &id).await?;
                    let rtt = t4 - t1;
                    let sample_time = t4 - rtt / 2;
                    let counter_at_ref =
                        counter as i64 - (sample_time as i64 - reference_wall as i64);
                    Ok::<(String, i64), CodedError>((id, counter_at_ref))
                });
            }
            while let Some(joined) = set.join_next().await {
                let (id, counter_at_ref) = joined
                    .map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))??;
                readings.push((id, counter_at_ref));
            }
        }
        // Sorted id order makes the min election deterministic under ties
        readings.sort_by(|a, b| a.0.cmp(&b.0));
        let (reference_id, min_counter) = readings
            .iter()
            .min_by_key(|(id, c)| (*c, id.clone()))
            .map(|(id, c)| (id.clone(), *c))
            .expect("non-empty readings");
        info!("timesync: reference device {reference_id} (counter {min_counter}ms)");

        // 4. Write corrections, honoring the one-shot guard
        let mut outcome = SyncOutcome::default();
        for (id, counter_at_ref) in &readings {
            let correction = counter_at_ref - min_counter;
            let already_offset =
                self.registry.sync_state(id).await >= SyncState::OffsetComputed;
            if correction > self.cfg.min_correction_ms {
                if already_offset {
                    if correction > self.cfg.suspected_reset_ms {
                        warn!(
                            "timesync: {id} is fully synced but drifted {correction}ms — \
                             suspected clock reset, not rewriting offset"
                        );
                        outcome.suspected_resets.push(id.clone());
                    }
                    continue;
                }
                debug!("timesync: {id} correction {correction}ms");
                self.transport
                    .write_characteristic(
                        id,
                        CHAR_COMMAND,
                        &set_clock_offset_payload(correction.unsigned_abs() as u32),
                    )
                    .await
                    .map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))?;
            }
            self.registry.advance_sync_state(id, SyncState::OffsetComputed).await;
        }

        // 5. Verification sessions in parallel; these never write offsets
        let mut set = JoinSet::new();
        for id in ids.clone() {
            let transport = self.transport.clone();
            let clock = self.clock;
            let cfg = self.cfg.clone();
            set.spawn(run_session(transport, clock, cfg, id, false));
        }
        while let Some(joined) = set.join_next().await {
            match joined.map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))? {
                Ok(stats) => {
                    self.registry
                        .advance_sync_state(&stats.device_id, SyncState::FullySynced)
                        .await;
                    self.registry.set_clock_offset(&stats.device_id, stats.offset_ms).await;
                    outcome.stats.push(stats);
                }
                Err(e) => {
                    warn!("timesync: verification session failed: {e}");
                    outcome.failed.push(e.message);
                }
            }
        }
        if outcome.stats.is_empty() {
            return Err(CodedError::new(
                ErrorCode::TimeSyncFailed,
                "every verification session failed",
            ));
        }
        outcome.stats.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(outcome)
    }

    async fn for_each_device<F, Fut>(&self, ids: &[String], op: F) -> Result<(), CodedError>
    where
        F: Fn(Arc<dyn DeviceTransport>, MasterClock, String) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = Result<(), CodedError>> + Send,
    {
        let mut set = JoinSet::new();
        for id in ids {
            let transport = self.transport.clone();
            let clock = self.clock;
            let id = id.clone();
            let op = op.clone();
            set.spawn(async move { op(transport, clock, id).await });
        }
        while let Some(joined) = set.join_next().await {
            joined.map_err(|e| CodedError::new(ErrorCode::TimeSyncFailed, e.to_string()))??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imu_simulator::{FleetConfig, SimFleet};

    async fn synced_fixture() -> (SimFleet, Arc<DeviceRegistry>, TimeSyncManager, Vec<String>) {
        let fleet = SimFleet::with_default_fleet(FleetConfig {
            command_latency_ms: 1,
            latency_jitter_ms: 1,
            ..FleetConfig::default()
        })
        .await;
        let clock = MasterClock::new();
        let registry = Arc::new(DeviceRegistry::new(clock));
        let ids: Vec<String> = imu_simulator::fleet::DEFAULT_FLEET
            .iter()
            .map(|n| format!("sim-{n}"))
            .collect();
        for id in &ids {
            let name = id.strip_prefix("sim-").unwrap();
            registry.upsert_discovered(id, name).await;
            fleet.connect(id).await.unwrap();
        }
        let transport: Arc<dyn DeviceTransport> = Arc::new(fleet.clone());
        let cfg = TimeSyncConfig {
            samples_per_session: 8,
            sample_gap: Duration::from_millis(2),
            ..TimeSyncConfig::default()
        };
        let manager = TimeSyncManager::new(transport, registry.clone(), clock, cfg);
        (fleet, registry, manager, ids)
    }

    #[tokio::test]
    async fn fleet_counters_align_after_sync() {
        let (fleet, registry, manager, ids) = synced_fixture().await;
        let outcome = manager.sync_devices(&ids).await.unwrap();
        assert_eq!(outcome.stats.len(), 4);
        assert!(outcome.suspected_resets.is_empty());

        for id in &ids {
            assert_eq!(registry.sync_state(id).await, SyncState::FullySynced);
        }

        // Counters should now agree within a handful of milliseconds
        let mut counters = Vec::new();
        for id in &ids {
            counters.push(fleet.counter_ms(id).await.unwrap() as i64);
        }
        let spread = counters.iter().max().unwrap() - counters.iter().min().unwrap();
        assert!(spread <= 20, "counter spread {spread}ms");

        // Reported offsets agree pairwise as well
        let offsets: Vec<i64> = outcome.stats.iter().map(|s| s.offset_ms).collect();
        let spread = offsets.iter().max().unwrap() - offsets.iter().min().unwrap();
        assert!(spread <= 20, "offset spread {spread}ms");
    }

    #[tokio::test]
    async fn second_sync_writes_no_offsets() {
        let (fleet, _registry, manager, ids) = synced_fixture().await;
        manager.sync_devices(&ids).await.unwrap();

        let mut first_counts = Vec::new();
        for id in &ids {
            first_counts.push(fleet.write_count(id, opcode::SET_CLOCK_OFFSET).await);
        }
        assert!(first_counts.iter().all(|&c| c <= 1));

        // Reconnect one device, then sync again: still no further writes
        let victim = &ids[3];
        fleet.disconnect(victim).await.unwrap();
        fleet.connect(victim).await.unwrap();
        let outcome = manager.sync_devices(&ids).await.unwrap();
        assert_eq!(outcome.stats.len(), 4, "stats still collected for everyone");

        for (id, first) in ids.iter().zip(first_counts) {
            let now = fleet.write_count(id, opcode::SET_CLOCK_OFFSET).await;
            assert_eq!(now, first, "{id} received an extra SET_CLOCK_OFFSET");
        }
    }

    #[tokio::test]
    async fn reset_counter_is_reported_not_rewritten() {
        let (fleet, _registry, manager, ids) = synced_fixture().await;
        manager.sync_devices(&ids).await.unwrap();

        // Knock one device's clock 5 s forward with its RTC wedged, as a
        // hardware reset would
        let victim = ids[0].clone();
        let before = fleet.write_count(&victim, opcode::SET_CLOCK_OFFSET).await;
        fleet.set_datetime_fault(&victim, true).await;
        fleet.shift_counter(&victim, 5_000).await;

        let outcome = manager.sync_devices(&ids).await.unwrap();
        assert!(outcome.suspected_resets.contains(&victim));
        let after = fleet.write_count(&victim, opcode::SET_CLOCK_OFFSET).await;
        assert_eq!(after, before, "offset must not be rewritten on suspected reset");
    }

    #[tokio::test]
    async fn empty_fleet_is_an_error() {
        let (_fleet, _registry, manager, _ids) = synced_fixture().await;
        let err = manager.sync_devices(&[]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::TimeSyncFailed);
    }
}
