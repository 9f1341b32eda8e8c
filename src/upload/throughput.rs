//! Sliding-window throughput meter
//!
//! Every finished transfer call records its byte count and duration. The
//! estimate is per stream: bytes over busy time, not over wall time, so it
//! stays meaningful while several workers run at once.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct Sample {
    bytes: u64,
    elapsed: Duration,
    recorded_at: Instant,
}

struct MeterInner {
    samples: VecDeque<Sample>,
    max_samples: usize,
    window: Duration,
}

pub struct ThroughputMeter {
    inner: Mutex<MeterInner>,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 64)
    }
}

impl ThroughputMeter {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                samples: VecDeque::new(),
                max_samples: max_samples.max(1),
                window,
            }),
        }
    }

    pub fn record(&self, bytes: u64, elapsed: Duration) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.samples.push_back(Sample {
            bytes,
            elapsed,
            recorded_at: now,
        });

        let window = inner.window;
        while inner
            .samples
            .front()
            .is_some_and(|s| now.duration_since(s.recorded_at) > window)
        {
            inner.samples.pop_front();
        }
        while inner.samples.len() > inner.max_samples {
            inner.samples.pop_front();
        }
    }

    /// Per-stream bytes per second; `None` until something was measured
    pub fn bytes_per_second(&self) -> Option<f64> {
        let inner = self.inner.lock();
        let busy: Duration = inner.samples.iter().map(|s| s.elapsed).sum();
        if busy.is_zero() {
            return None;
        }
        let bytes: u64 = inner.samples.iter().map(|s| s.bytes).sum();
        Some(bytes as f64 / busy.as_secs_f64())
    }

    /// Chunk size that takes about `target` at the measured rate, clamped
    pub fn chunk_size(&self, target: Duration, min: u64, max: u64, fallback: u64) -> u64 {
        let max = max.max(min);
        let raw = match self.bytes_per_second() {
            Some(rate) => (rate * target.as_secs_f64()) as u64,
            None => fallback,
        };
        raw.clamp(min, max)
    }
}
