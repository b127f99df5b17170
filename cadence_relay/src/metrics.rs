// Server traffic counters.
//
// Atomics with relaxed ordering: reader threads bump receive counters
// while the session thread bumps send counters, and nobody needs the
// totals to be synchronized with anything else. `snapshot` copies them
// into a plain struct for logging or assertions.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RelayMetrics {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    turns_broadcast: AtomicU64,
    empty_turn_batches: AtomicU64,
    commands_rejected: AtomicU64,
    disconnects: AtomicU64,
}

impl RelayMetrics {
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_turn_broadcast(&self) {
        self.turns_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_batch(&self) {
        self.empty_turn_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            turns_broadcast: self.turns_broadcast.load(Ordering::Relaxed),
            empty_turn_batches: self.empty_turn_batches.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub turns_broadcast: u64,
    pub empty_turn_batches: u64,
    pub commands_rejected: u64,
    pub disconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = RelayMetrics::default();
        metrics.record_sent(10);
        metrics.record_sent(5);
        metrics.record_received(7);
        metrics.record_turn_broadcast();
        metrics.record_command_rejected();
        metrics.record_disconnect();

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.bytes_received, 7);
        assert_eq!(snap.turns_broadcast, 1);
        assert_eq!(snap.empty_turn_batches, 0);
        assert_eq!(snap.commands_rejected, 1);
        assert_eq!(snap.disconnects, 1);
    }
}
