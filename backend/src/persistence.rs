//! Registry persistence.
//!
//! Only identity and the time-sync ladder need to survive a restart — a
//! backend crash must not cause a device to receive a second hardware clock
//! offset. Lifecycle state and battery are ephemeral and reset on load.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use imu_types::device::DeviceRecord;

pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    saved_at: chrono::DateTime<chrono::Utc>,
    devices: Vec<DeviceRecord>,
}

/// Load persisted device records. Returns empty on a missing or corrupt file.
pub async fn load_devices(dir: &Path) -> Vec<DeviceRecord> {
    let path = dir.join(STATE_FILE);
    if !path.exists() {
        info!("no {STATE_FILE} found, starting with an empty registry");
        return Vec::new();
    }
    match fs::read_to_string(&path).await {
        Ok(data) => match serde_json::from_str::<PersistedState>(&data) {
            Ok(state) => {
                info!("loaded {} persisted device records", state.devices.len());
                state.devices
            }
            Err(e) => {
                warn!("failed to parse {STATE_FILE}: {e}, ignoring it");
                Vec::new()
            }
        },
        Err(e) => {
            warn!("failed to read {STATE_FILE}: {e}, ignoring it");
            Vec::new()
        }
    }
}

/// Save the durable parts of the registry.
pub async fn save_devices(dir: &Path, devices: &[DeviceRecord]) -> Result<()> {
    fs::create_dir_all(dir).await?;
    let state = PersistedState { saved_at: chrono::Utc::now(), devices: devices.to_vec() };
    let json = serde_json::to_string_pretty(&state)?;
    fs::write(dir.join(STATE_FILE), json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use imu_types::device::SyncState;

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("tropx-persist-{}", uuid::Uuid::new_v4()));
        let mut record = DeviceRecord::new("d1", "tropx_ln_top", 0);
        record.sync_state = SyncState::FullySynced;
        record.clock_offset_ms = Some(-1234);

        save_devices(&dir, &[record]).await.unwrap();
        let loaded = load_devices(&dir).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].sync_state, SyncState::FullySynced);
        assert_eq!(loaded[0].clock_offset_ms, Some(-1234));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = std::env::temp_dir().join(format!("tropx-persist-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(STATE_FILE), b"not json").await.unwrap();
        assert!(load_devices(&dir).await.is_empty());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
