//! Device registry & lifecycle.
//!
//! Single authoritative holder of device state. Mutations validate the
//! lifecycle transition table and fan out [`DeviceEvent`]s on a bounded
//! broadcast channel; subscribers that lag simply miss events and re-read the
//! snapshot. Nothing else in the process mutates device records.

use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use imu_types::device::{DeviceEvent, DeviceRecord, DeviceState, SyncState};
use imu_types::error::{CodedError, ErrorCode};

use crate::clock::MasterClock;

const EVENT_CHANNEL_DEPTH: usize = 256;

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    events: broadcast::Sender<DeviceEvent>,
    clock: MasterClock,
}

impl DeviceRegistry {
    pub fn new(clock: MasterClock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        Self { devices: RwLock::new(HashMap::new()), events, clock }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: DeviceEvent) {
        // No subscribers is fine; events are advisory
        let _ = self.events.send(event);
    }

    /// Record a discovery. Known devices keep their sync ladder (that is the
    /// point of persisting it); unknown devices get a fresh record.
    pub async fn upsert_discovered(&self, id: &str, name: &str) -> DeviceRecord {
        let now = self.clock.now_ms();
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(id.to_string())
            .and_modify(|r| {
                r.last_seen_ms = now;
                if r.state == DeviceState::Disconnected {
                    r.state = DeviceState::Discovered;
                    r.error_reason = None;
                }
            })
            .or_insert_with(|| DeviceRecord::new(id, name, now))
            .clone();
        drop(devices);
        self.publish(DeviceEvent::DeviceChanged { id: id.to_string(), snapshot: record.clone() });
        record
    }

    /// Restore records from persistence. Only identity and the sync ladder
    /// survive a restart; lifecycle state resets to disconnected.
    pub async fn restore(&self, records: Vec<DeviceRecord>) {
        let now = self.clock.now_ms();
        let mut devices = self.devices.write().await;
        for mut r in records {
            r.state = DeviceState::Disconnected;
            r.battery_pct = None;
            r.error_reason = None;
            r.last_seen_ms = now;
            debug!("registry: restored {} (sync {:?})", r.id, r.sync_state);
            devices.insert(r.id.clone(), r);
        }
    }

    /// Drive a lifecycle transition. Invalid edges are rejected so a bug in a
    /// caller cannot corrupt the machine.
    pub async fn set_state(&self, id: &str, next: DeviceState) -> Result<DeviceRecord, CodedError> {
        let now = self.clock.now_ms();
        let mut devices = self.devices.write().await;
        let record = devices
            .get_mut(id)
            .ok_or_else(|| CodedError::new(ErrorCode::Unknown, format!("unknown device {id}")))?;
        if !record.state.can_transition_to(next) {
            warn!(
                "registry: rejected transition {:?} → {next:?} for {id}",
                record.state
            );
            return Err(CodedError::new(
                ErrorCode::Unknown,
                format!("illegal transition {:?} → {next:?}", record.state),
            ));
        }
        record.state = next;
        record.last_seen_ms = now;
        if next != DeviceState::Error {
            record.error_reason = None;
        }
        let snapshot = record.clone();
        drop(devices);
        self.publish(DeviceEvent::DeviceChanged { id: id.to_string(), snapshot: snapshot.clone() });
        Ok(snapshot)
    }

    /// Recoverable failure: device goes to `error` with a reason, then
    /// `disconnected` (both events published).
    pub async fn mark_failed(&self, id: &str, code: ErrorCode, reason: &str) {
        let now = self.clock.now_ms();
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(id) else {
            return;
        };
        if record.state.can_transition_to(DeviceState::Error) {
            record.state = DeviceState::Error;
            record.error_reason = Some(format!("{code}: {reason}"));
            record.last_seen_ms = now;
            let snapshot = record.clone();
            drop(devices);
            self.publish(DeviceEvent::DeviceChanged {
                id: id.to_string(),
                snapshot,
            });
            let _ = self.set_state(id, DeviceState::Disconnected).await;
        }
    }

    pub async fn update_battery(&self, id: &str, pct: f32) {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(id) {
            record.battery_pct = Some(pct);
            record.last_seen_ms = self.clock.now_ms();
        } else {
            return;
        }
        drop(devices);
        self.publish(DeviceEvent::Battery { id: id.to_string(), pct });
    }

    /// Advance the sync ladder. The ladder never moves backward.
    pub async fn advance_sync_state(&self, id: &str, state: SyncState) {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(id) else {
            return;
        };
        if state > record.sync_state {
            record.sync_state = state;
            let snapshot = record.clone();
            drop(devices);
            self.publish(DeviceEvent::DeviceChanged { id: id.to_string(), snapshot });
        }
    }

    pub async fn set_clock_offset(&self, id: &str, offset_ms: i64) {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(id) {
            record.clock_offset_ms = Some(offset_ms);
        }
    }

    pub async fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.read().await.get(id).cloned()
    }

    pub async fn sync_state(&self, id: &str) -> SyncState {
        self.devices
            .read()
            .await
            .get(id)
            .map(|r| r.sync_state)
            .unwrap_or(SyncState::NotSynced)
    }

    /// Sorted snapshot of every known device.
    pub async fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> =
            self.devices.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn ids_in_state(&self, state: DeviceState) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .read()
            .await
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .read()
            .await
            .values()
            .filter(|r| r.is_connected())
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(MasterClock::new())
    }

    #[tokio::test]
    async fn discovery_then_connect_then_stream() {
        let reg = registry();
        reg.upsert_discovered("d1", "tropx_ln_top").await;
        reg.set_state("d1", DeviceState::Connecting).await.unwrap();
        reg.set_state("d1", DeviceState::Connected).await.unwrap();
        let r = reg.set_state("d1", DeviceState::Streaming).await.unwrap();
        assert!(r.is_streaming());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let reg = registry();
        reg.upsert_discovered("d1", "tropx_ln_top").await;
        assert!(reg.set_state("d1", DeviceState::Streaming).await.is_err());
        // State unchanged
        assert_eq!(reg.get("d1").await.unwrap().state, DeviceState::Discovered);
    }

    #[tokio::test]
    async fn failure_path_lands_in_disconnected_with_reason_cleared_later() {
        let reg = registry();
        reg.upsert_discovered("d1", "tropx_ln_top").await;
        reg.set_state("d1", DeviceState::Connecting).await.unwrap();
        reg.mark_failed("d1", ErrorCode::DeviceConnectFailed, "gatt timeout").await;
        assert_eq!(reg.get("d1").await.unwrap().state, DeviceState::Disconnected);
    }

    #[tokio::test]
    async fn sync_ladder_survives_reconnect() {
        let reg = registry();
        reg.upsert_discovered("d1", "tropx_rn_top").await;
        reg.advance_sync_state("d1", SyncState::FullySynced).await;
        reg.set_state("d1", DeviceState::Disconnected).await.unwrap();
        let r = reg.upsert_discovered("d1", "tropx_rn_top").await;
        assert_eq!(r.sync_state, SyncState::FullySynced);
    }

    #[tokio::test]
    async fn sync_ladder_never_regresses() {
        let reg = registry();
        reg.upsert_discovered("d1", "tropx_rn_top").await;
        reg.advance_sync_state("d1", SyncState::OffsetComputed).await;
        reg.advance_sync_state("d1", SyncState::RtcInitialized).await;
        assert_eq!(reg.sync_state("d1").await, SyncState::OffsetComputed);
    }

    #[tokio::test]
    async fn events_fan_out_in_order() {
        let reg = registry();
        let mut rx = reg.subscribe();
        reg.upsert_discovered("d1", "tropx_ln_top").await;
        reg.update_battery("d1", 88.0).await;

        match rx.recv().await.unwrap() {
            DeviceEvent::DeviceChanged { id, .. } => assert_eq!(id, "d1"),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            DeviceEvent::Battery { pct, .. } => assert!((pct - 88.0).abs() < f32::EPSILON),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn restore_resets_lifecycle_but_keeps_ladder() {
        let reg = registry();
        let mut record = DeviceRecord::new("d9", "tropx_ln_bottom", 0);
        record.state = DeviceState::Streaming;
        record.sync_state = SyncState::FullySynced;
        record.battery_pct = Some(50.0);
        reg.restore(vec![record]).await;
        let r = reg.get("d9").await.unwrap();
        assert_eq!(r.state, DeviceState::Disconnected);
        assert_eq!(r.sync_state, SyncState::FullySynced);
        assert_eq!(r.battery_pct, None);
    }
}
