//! UI output: a coalescing latest-wins snapshot.
//!
//! The pipeline overwrites one snapshot per tick; subscribers (the streaming
//! server's motion task) pull the most recent value on their own cadence and
//! cap themselves at the UI rate. Snapshots are `Copy`, so the steady state
//! allocates nothing.

use tokio::sync::watch;

use imu_types::joint::JointWindow;

/// Consolidated dual-joint view for subscribers.
#[derive(Debug, Clone, Copy, Default)]
pub struct UiSnapshot {
    pub left: JointWindow,
    pub right: JointWindow,
    pub timestamp_ms: u64,
}

pub struct UiThrottle {
    tx: watch::Sender<UiSnapshot>,
}

impl UiThrottle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(UiSnapshot::default());
        Self { tx }
    }

    /// Overwrite the current snapshot. Multiple ticks between subscriber
    /// reads coalesce to the latest value.
    pub fn publish(&self, snapshot: UiSnapshot) {
        self.tx.send_replace(snapshot);
    }

    /// Latest-wins subscription for the streaming server.
    pub fn subscribe(&self) -> watch::Receiver<UiSnapshot> {
        self.tx.subscribe()
    }

    /// Pull the current snapshot.
    pub fn get_snapshot(&self) -> UiSnapshot {
        *self.tx.borrow()
    }
}

impl Default for UiThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_only_the_latest() {
        let ui = UiThrottle::new();
        let mut rx = ui.subscribe();

        for i in 1..=100u64 {
            let mut snap = UiSnapshot::default();
            snap.timestamp_ms = i;
            snap.left.update(i as f64, i);
            ui.publish(snap);
        }

        rx.changed().await.unwrap();
        let seen = *rx.borrow_and_update();
        assert_eq!(seen.timestamp_ms, 100);
        assert_eq!(seen.left.current, 100.0);
        // Nothing else queued: the 99 intermediate values coalesced away
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn pull_reads_current_value() {
        let ui = UiThrottle::new();
        let mut snap = UiSnapshot::default();
        snap.timestamp_ms = 7;
        ui.publish(snap);
        assert_eq!(ui.get_snapshot().timestamp_ms, 7);
    }
}
