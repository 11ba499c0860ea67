#![cfg_attr(not(any(test, feature = "std")), no_std)]

// Hardware-facing building blocks shared by the panel drivers and the
// flush pipeline. Nothing in here knows about pixels.

extern crate alloc;

pub mod allocator;
pub mod bus;
pub mod memory;
pub mod time;

pub use allocator::{AllocError, CapabilityAllocator, PoolBuffer, BUFFER_ALIGN};
pub use bus::{BusArbiter, BusGuard};
pub use memory::{BudgetHeap, Pool, PoolCaps, PoolProvider};
pub use time::{spin_wait_us, Clock, ManualClock};

#[cfg(feature = "std")]
pub use time::MonotonicClock;
