// Link clock estimation.
//
// Both ends stamp ping traffic with their own wall clock. From the
// echoes each side keeps a smoothed round-trip estimate and an estimate
// of how far the peer's clock is offset from its own. The server uses
// the estimates to shift start timestamps into each client's clock
// domain; the client uses the one-way delay to refine the negotiated
// start when it arrives.

use std::time::{SystemTime, UNIX_EPOCH};

/// Weight of each new sample in the running estimates. Low enough that a
/// single delayed ping does not yank the clock around.
const RTT_SMOOTHING: f64 = 0.1;

/// Per-connection round-trip and clock-offset estimates.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinkClock {
    rtt_ms: Option<f64>,
    offset_ms: Option<f64>,
}

impl LinkClock {
    /// Fold in a round-trip sample from an echoed timestamp: `sent_ms` is
    /// our clock when the ping left, `now_ms` our clock when the echo
    /// arrived.
    pub fn observe_rtt(&mut self, sent_ms: i64, now_ms: i64) {
        #[expect(clippy::cast_precision_loss)]
        let sample = (now_ms - sent_ms).max(0) as f64;
        self.rtt_ms = Some(match self.rtt_ms {
            Some(rtt) => rtt * (1.0 - RTT_SMOOTHING) + sample * RTT_SMOOTHING,
            None => sample,
        });
    }

    /// Fold in a clock-offset sample from a peer timestamp: `peer_ms` is
    /// the peer's clock when it sent the message that just arrived at our
    /// `now_ms`. The peer's clock at our now is `peer_ms` plus the one-way
    /// delay.
    pub fn observe_peer_clock(&mut self, peer_ms: i64, now_ms: i64) {
        #[expect(clippy::cast_precision_loss)]
        let sample = (peer_ms + self.one_way_ms() - now_ms) as f64;
        self.offset_ms = Some(match self.offset_ms {
            Some(offset) => offset * (1.0 - RTT_SMOOTHING) + sample * RTT_SMOOTHING,
            None => sample,
        });
    }

    /// Smoothed round trip in ms, 0 before the first sample.
    pub fn rtt_ms(&self) -> i64 {
        #[expect(clippy::cast_possible_truncation)]
        let rtt = self.rtt_ms.unwrap_or(0.0).round() as i64;
        rtt
    }

    /// Estimated one-way delay, half the round trip.
    pub fn one_way_ms(&self) -> i64 {
        self.rtt_ms() / 2
    }

    /// Estimated peer clock minus our clock, 0 before the first sample.
    pub fn offset_ms(&self) -> i64 {
        #[expect(clippy::cast_possible_truncation)]
        let offset = self.offset_ms.unwrap_or(0.0).round() as i64;
        offset
    }
}

/// Milliseconds since the Unix epoch. The shared time base for start
/// negotiation on both ends.
pub fn wall_clock_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}
