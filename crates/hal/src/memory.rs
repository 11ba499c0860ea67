//! Capability-tagged memory pools.
//!
//! A board exposes three pools: fast internal RAM, internal RAM the
//! transfer engine can read, and a large but slow external RAM. Pools are
//! served by a [`PoolProvider`]; [`BudgetHeap`] is the provider used on the
//! host, carving every pool out of the global allocator under a byte budget.

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;

bitflags! {
    /// Hardware traits of a memory pool.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolCaps: u8 {
        /// Single-cycle access from the CPU.
        const FAST = 1 << 0;
        /// Readable by the display transfer engine.
        const DMA = 1 << 1;
        /// Large enough to hold full frames.
        const LARGE = 1 << 2;
    }
}

/// Logical memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    /// Fast internal RAM, not reachable by the transfer engine.
    Internal = 0,
    /// Internal RAM usable as a transfer source.
    Dma = 1,
    /// External PSRAM: big, slow, not a transfer source.
    External = 2,
}

impl Pool {
    pub const ALL: [Pool; 3] = [Pool::Internal, Pool::Dma, Pool::External];

    pub const fn caps(self) -> PoolCaps {
        match self {
            Pool::Internal => PoolCaps::FAST,
            Pool::Dma => PoolCaps::FAST.union(PoolCaps::DMA),
            Pool::External => PoolCaps::LARGE,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Pool::Internal => "internal",
            Pool::Dma => "dma",
            Pool::External => "external",
        }
    }

    pub fn is_dma_capable(self) -> bool {
        self.caps().contains(PoolCaps::DMA)
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Backend that hands out raw memory from a specific pool.
pub trait PoolProvider: Send {
    /// Allocate `layout` from `pool`, or `None` if the pool cannot serve it.
    fn alloc(&mut self, pool: Pool, layout: Layout) -> Option<NonNull<u8>>;

    /// Return memory to `pool`.
    ///
    /// # Safety
    /// `ptr` must come from `alloc` on this provider with the same `pool`
    /// and `layout`, and must not be used afterwards.
    unsafe fn dealloc(&mut self, pool: Pool, ptr: NonNull<u8>, layout: Layout);

    /// Bytes still available in `pool`.
    fn free_bytes(&self, pool: Pool) -> usize;

    /// Largest single allocation `pool` could satisfy right now.
    fn largest_free_block(&self, pool: Pool) -> usize {
        self.free_bytes(pool)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PoolBudget {
    capacity: usize,
    used: usize,
    max_block: Option<usize>,
}

impl PoolBudget {
    fn free(&self) -> usize {
        self.capacity.saturating_sub(self.used)
    }

    fn largest_block(&self) -> usize {
        match self.max_block {
            Some(max) => max.min(self.free()),
            None => self.free(),
        }
    }
}

/// Pool provider backed by the global allocator, with a byte budget per pool.
///
/// A pool with a zero budget never allocates. `max_block` caps single
/// allocations to mimic a fragmented heap.
#[derive(Debug, Default)]
pub struct BudgetHeap {
    budgets: [PoolBudget; 3],
}

impl BudgetHeap {
    /// Heap with every pool empty.
    pub const fn new() -> Self {
        Self {
            budgets: [PoolBudget {
                capacity: 0,
                used: 0,
                max_block: None,
            }; 3],
        }
    }

    #[must_use]
    pub fn with_budget(mut self, pool: Pool, bytes: usize) -> Self {
        self.budgets[pool.index()].capacity = bytes;
        self
    }

    #[must_use]
    pub fn with_max_block(mut self, pool: Pool, bytes: usize) -> Self {
        self.budgets[pool.index()].max_block = Some(bytes);
        self
    }

    pub fn used_bytes(&self, pool: Pool) -> usize {
        self.budgets[pool.index()].used
    }
}

impl PoolProvider for BudgetHeap {
    fn alloc(&mut self, pool: Pool, layout: Layout) -> Option<NonNull<u8>> {
        let budget = &mut self.budgets[pool.index()];
        if layout.size() == 0 || layout.size() > budget.largest_block() {
            return None;
        }
        // SAFETY: layout has a non-zero size, checked above.
        let ptr = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })?;
        budget.used += layout.size();
        Some(ptr)
    }

    unsafe fn dealloc(&mut self, pool: Pool, ptr: NonNull<u8>, layout: Layout) {
        let budget = &mut self.budgets[pool.index()];
        budget.used = budget.used.saturating_sub(layout.size());
        // SAFETY: caller guarantees ptr/layout came from alloc above.
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    fn free_bytes(&self, pool: Pool) -> usize {
        self.budgets[pool.index()].free()
    }

    fn largest_free_block(&self, pool: Pool) -> usize {
        self.budgets[pool.index()].largest_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, 4).unwrap()
    }

    #[test]
    fn caps_describe_pools() {
        assert!(Pool::Dma.is_dma_capable());
        assert!(!Pool::Internal.is_dma_capable());
        assert!(!Pool::External.is_dma_capable());
        assert!(Pool::External.caps().contains(PoolCaps::LARGE));
        assert_eq!(Pool::Dma.to_string(), "dma");
    }

    #[test]
    fn budget_limits_allocations() {
        let mut heap = BudgetHeap::new().with_budget(Pool::Dma, 1024);
        let a = heap.alloc(Pool::Dma, layout(600)).unwrap();
        assert_eq!(heap.free_bytes(Pool::Dma), 424);
        assert!(heap.alloc(Pool::Dma, layout(600)).is_none());
        unsafe { heap.dealloc(Pool::Dma, a, layout(600)) };
        assert_eq!(heap.used_bytes(Pool::Dma), 0);
        assert!(heap.alloc(Pool::Internal, layout(4)).is_none());
    }

    #[test]
    fn max_block_mimics_fragmentation() {
        let mut heap = BudgetHeap::new()
            .with_budget(Pool::External, 1 << 20)
            .with_max_block(Pool::External, 4096);
        assert_eq!(heap.free_bytes(Pool::External), 1 << 20);
        assert_eq!(heap.largest_free_block(Pool::External), 4096);
        assert!(heap.alloc(Pool::External, layout(8192)).is_none());
        let p = heap.alloc(Pool::External, layout(4096)).unwrap();
        unsafe { heap.dealloc(Pool::External, p, layout(4096)) };
    }
}
