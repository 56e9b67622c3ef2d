//! Bounded in-process telemetry queue.
//!
//! Engines record coarse counters (bytes posted, completions observed) for
//! the host runtime to drain; file writers live outside the core.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum number of queued events; further events are dropped.
pub const MAX_TELEMETRY_QUEUE_SIZE: usize = 1000;

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryEvent {
    /// Microseconds since the Unix epoch.
    pub timestamp_us: u64,
    pub name: &'static str,
    pub value: u64,
}

/// Queue attached to an engine when telemetry is enabled.
#[derive(Debug, Default)]
pub struct TelemetryQueue {
    enabled: bool,
    events: Mutex<Vec<TelemetryEvent>>,
}

impl TelemetryQueue {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, name: &'static str, value: u64) {
        if !self.enabled {
            return;
        }
        let mut events = self.events.lock().unwrap();
        if events.len() >= MAX_TELEMETRY_QUEUE_SIZE {
            return;
        }
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        events.push(TelemetryEvent {
            timestamp_us,
            name,
            value,
        });
    }

    pub fn drain(&self) -> Vec<TelemetryEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_queue_records_nothing() {
        let q = TelemetryQueue::new(false);
        q.record("post_bytes", 4096);
        assert!(q.drain().is_empty());
    }

    #[test]
    fn test_drain_empties_queue() {
        let q = TelemetryQueue::new(true);
        q.record("post_bytes", 1);
        q.record("post_bytes", 2);
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].value, 2);
        assert!(q.drain().is_empty());
    }

    #[test]
    fn test_queue_is_bounded() {
        let q = TelemetryQueue::new(true);
        for i in 0..(MAX_TELEMETRY_QUEUE_SIZE as u64 + 10) {
            q.record("evt", i);
        }
        assert_eq!(q.drain().len(), MAX_TELEMETRY_QUEUE_SIZE);
    }
}
