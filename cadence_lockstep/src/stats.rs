// Turn-buffer statistics.
//
// Sampled by the client engine every time a confirmed turn is admitted:
// the depth of the confirmed-but-unconsumed queue at that moment. High
// sustained depth means the server is sealing faster than this client
// consumes; depth near zero with frequent tick stalls means the opposite.

/// Min/max/average depth of the confirmed-but-unconsumed turn queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TurnBufferStats {
    samples: u64,
    sum: u64,
    min: u32,
    max: u32,
}

impl TurnBufferStats {
    /// Record one queue-depth observation.
    pub fn sample(&mut self, depth: u32) {
        if self.samples == 0 {
            self.min = depth;
            self.max = depth;
        } else {
            self.min = self.min.min(depth);
            self.max = self.max.max(depth);
        }
        self.samples += 1;
        self.sum += u64::from(depth);
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Smallest observed depth. Zero before any sample.
    pub fn min(&self) -> u32 {
        self.min
    }

    /// Largest observed depth. Zero before any sample.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Mean observed depth. Zero before any sample.
    pub fn average(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        #[expect(clippy::cast_precision_loss)]
        let avg = self.sum as f64 / self.samples as f64;
        avg
    }
}
