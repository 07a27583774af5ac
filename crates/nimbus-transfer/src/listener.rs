//! Transfer progress and outcome notifications.

use std::time::Duration;

use nimbus_core::types::Node;
use nimbus_core::NimbusError;
use tokio::time::Instant;

/// Single subscriber for one transfer's events.
///
/// A spawned transfer delivers exactly one of `on_finished`, `on_canceled`
/// or `on_failed`.
pub trait TransferListener: Send + Sync {
    fn on_started(&self, _id: &str) {}

    /// `bytes_total` is `None` while the size is unknown (uploads from a stream).
    fn on_running(&self, _id: &str, _bytes_done: u64, _bytes_total: Option<u64>) {}

    fn on_finished(&self, _id: &str, _node: Option<&Node>) {}

    fn on_canceled(&self, _id: &str) {}

    fn on_failed(&self, _id: &str, _error: &NimbusError) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl TransferListener for NoopListener {}

/// Rate limit for `on_running`.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
    canceled: bool,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            canceled: false,
        }
    }

    /// True if a progress event may fire now; records the emission.
    pub fn should_emit(&mut self) -> bool {
        if self.canceled {
            return false;
        }
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Suppress all further events.
    pub fn cancel(&mut self) {
        self.canceled = true;
    }
}
