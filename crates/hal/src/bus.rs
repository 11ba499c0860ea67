//! Exclusive access to the physical display bus.
//!
//! The flush path and the overlay path both drive the same serial bus. Each
//! holds the [`BusArbiter`] for exactly one transfer or draw, through a
//! [`BusGuard`] so the bus is released on every exit path.
//!
//! Locking is not reentrant: a holder that tries again simply times out.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::time::{spin_wait_us, Clock};

pub struct BusArbiter {
    locked: AtomicBool,
    contended: AtomicU32,
    clock: Arc<dyn Clock>,
}

impl BusArbiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            locked: AtomicBool::new(false),
            contended: AtomicU32::new(0),
            clock,
        }
    }

    /// Take the bus, spinning for at most `timeout_us`.
    ///
    /// A zero timeout is a single non-blocking attempt.
    pub fn lock(&self, timeout_us: u64) -> bool {
        if self.try_lock() {
            return true;
        }
        let acquired = timeout_us > 0 && spin_wait_us(&*self.clock, timeout_us, || self.try_lock());
        if !acquired {
            self.contended.fetch_add(1, Ordering::Relaxed);
            log::trace!("[BUS] lock not acquired within {}us", timeout_us);
        }
        acquired
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Number of `lock` calls that gave up.
    pub fn contention_count(&self) -> u32 {
        self.contended.load(Ordering::Relaxed)
    }

    /// Scoped acquisition. Check [`BusGuard::is_held`] before touching the bus.
    pub fn acquire(&self, timeout_us: u64) -> BusGuard<'_> {
        BusGuard {
            bus: self,
            held: self.lock(timeout_us),
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

/// Releases the bus on drop if the acquisition succeeded.
pub struct BusGuard<'a> {
    bus: &'a BusArbiter,
    held: bool,
}

impl BusGuard<'_> {
    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.bus.unlock();
        }
    }
}
