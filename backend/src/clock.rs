//! Master clock.
//!
//! The master timeline is the host's monotonic millisecond clock, anchored at
//! process start. Wall time is only consulted for `SET_DATETIME` payloads and
//! session metadata; everything the pipeline orders by is monotonic.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct MasterClock {
    origin: Instant,
}

impl MasterClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Milliseconds since clock creation; the master timeline.
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Wall-clock unix seconds, for the RTC broadcast.
    pub fn unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Wall-clock unix milliseconds, for session metadata.
    pub fn unix_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

impl Default for MasterClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn master_time_is_monotonic() {
        let clock = MasterClock::new();
        let a = clock.now_ms();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = clock.now_ms();
        assert!(b >= a + 4, "a={a} b={b}");
    }
}
