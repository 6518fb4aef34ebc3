//! Millisecond clocks for chunk timing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Trait for time operations, allowing mock time in tests.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary origin, sub-millisecond resolution.
    fn now_ms(&self) -> f64;
}

/// Monotonic clock measured from its creation.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Manually driven clock for testing. Clones share the same time.
///
/// May be moved backwards to exercise clock skew handling.
#[derive(Debug, Clone)]
pub struct MockClock {
    current_ms: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new(start_ms: f64) -> Self {
        Self {
            current_ms: Arc::new(AtomicU64::new(start_ms.to_bits())),
        }
    }

    pub fn set(&self, ms: f64) {
        self.current_ms.store(ms.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, ms: f64) {
        self.set(self.now_ms() + ms);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> f64 {
        f64::from_bits(self.current_ms.load(Ordering::SeqCst))
    }
}
