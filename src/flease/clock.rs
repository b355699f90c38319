//! Synchronized clock abstraction.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Source of the synchronized ("global") time that lease timeouts, message
/// timestamps and timers are expressed in, in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Clock reading wall-clock time once at creation and advancing it with the
/// tokio monotonic clock afterwards, so that a paused tokio runtime also
/// pauses lease time. An additional offset can model a skewed node.
#[derive(Debug)]
pub struct TokioClock {
    base_instant: Instant,
    base_ms: i64,
    offset_ms: AtomicI64,
}

impl TokioClock {
    pub fn new() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        TokioClock {
            base_instant: Instant::now(),
            base_ms,
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Sets a constant skew added to every reading.
    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.base_ms
            + self.base_instant.elapsed().as_millis() as i64
            + self.offset_ms.load(Ordering::Relaxed)
    }
}
