//! Backend configuration, env-overridable with sane defaults.

use std::path::PathBuf;

use imu_types::joint::JointConfig;
use imu_types::mapping::default_joints;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// HTTP/WebSocket listen port (default 4100, `PORT` env).
    pub port: u16,
    /// Pipeline target rate in Hz: 100, 200 or 400 (`TROPX_TARGET_HZ`).
    pub target_hz: u32,
    /// UI stream ceiling, Hz.
    pub ui_rate_hz: u32,
    /// Chunk storage root (`TROPX_DATA_DIR`).
    pub data_dir: PathBuf,
    /// Spill area for chunks whose upload failed (`TROPX_SPILL_DIR`).
    pub spill_dir: PathBuf,
    /// Subscriber heartbeat period, seconds.
    pub heartbeat_secs: u64,
    /// Hard scan timeout, ms.
    pub scan_timeout_ms: u64,
    /// Minimum spacing between scans, ms.
    pub scan_cooldown_ms: u64,
    /// Command response deadline, ms.
    pub command_timeout_ms: u64,
    /// Per-subscriber send queue depth.
    pub client_queue: usize,
    /// Consecutive overruns before a subscriber is dropped.
    pub client_overrun_limit: u32,
    /// Joint definitions resolved against device names.
    pub joints: Vec<JointConfig>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: env_parse("PORT", 4100),
            target_hz: env_parse("TROPX_TARGET_HZ", 100),
            ui_rate_hz: 60,
            data_dir: PathBuf::from(
                std::env::var("TROPX_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            spill_dir: PathBuf::from(
                std::env::var("TROPX_SPILL_DIR").unwrap_or_else(|_| "./data/spill".into()),
            ),
            heartbeat_secs: 30,
            scan_timeout_ms: 5000,
            scan_cooldown_ms: 3000,
            command_timeout_ms: env_parse("TROPX_COMMAND_TIMEOUT_MS", 5000),
            client_queue: 256,
            client_overrun_limit: 8,
            joints: default_joints(),
        }
    }
}

impl HubConfig {
    pub fn tick_period_ms(&self) -> u64 {
        (1000 / self.target_hz.max(1)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rate_is_100hz() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.target_hz, 100);
        assert_eq!(cfg.tick_period_ms(), 10);
        assert_eq!(cfg.joints.len(), 2);
    }
}
