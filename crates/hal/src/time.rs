//! Time sources and bounded busy-waiting.
//!
//! The pipeline never sleeps. Anything that has to wait does so with
//! [`spin_wait_us`], which gives up once its microsecond budget is spent.

use core::sync::atomic::{AtomicU64, Ordering};

/// A monotonic microsecond counter.
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary fixed origin.
    fn now_us(&self) -> u64;
}

/// Clock that only moves when told to.
///
/// `step_us` is added after every read so that spin loops against this
/// clock still terminate.
pub struct ManualClock {
    now: AtomicU64,
    step: AtomicU64,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            step: AtomicU64::new(0),
        }
    }

    /// Clock that advances by `step_us` on every read.
    pub const fn with_step(step_us: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            step: AtomicU64::new(step_us),
        }
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::Relaxed);
    }

    pub fn set(&self, us: u64) {
        self.now.store(us, Ordering::Relaxed);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        let step = self.step.load(Ordering::Relaxed);
        self.now.fetch_add(step, Ordering::Relaxed)
    }
}

/// Host clock backed by `std::time::Instant`.
#[cfg(feature = "std")]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Spin until `done` returns true or `budget_us` has elapsed.
///
/// `done` is always evaluated at least once, so a zero budget is a single
/// check. Returns the last value of `done`.
pub fn spin_wait_us(clock: &dyn Clock, budget_us: u64, mut done: impl FnMut() -> bool) -> bool {
    let start = clock.now_us();
    loop {
        if done() {
            return true;
        }
        if clock.now_us().saturating_sub(start) >= budget_us {
            return false;
        }
        core::hint::spin_loop();
    }
}
