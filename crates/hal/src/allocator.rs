//! Capability-aware allocation with fallback chains.
//!
//! Callers name the pools they can live with, best first. The allocator
//! walks that list and only reports exhaustion once every pool has refused.
//! Successful allocations come back as [`PoolBuffer`]s which return their
//! memory to the right pool when dropped.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use lcd_error::define_error;
use spin::Mutex;

use crate::memory::{Pool, PoolProvider};

/// Alignment of every pool buffer. Word alignment lets buffers be viewed
/// as `u16`/`u32` slices and satisfies the transfer engine.
pub const BUFFER_ALIGN: usize = 4;

define_error! {
    /// Allocation failures.
    pub enum AllocError(0x20) {
        /// Every pool in the preference order refused the request.
        Exhausted = 0x01 => "All preferred pools exhausted",
        /// The requested size does not form a valid layout.
        SizeOverflow = 0x02 => "Allocation size overflow",
    }
}

struct Inner {
    provider: Mutex<Box<dyn PoolProvider>>,
    failures: AtomicU32,
    fallbacks: AtomicU32,
    failures_by_tag: Mutex<HashMap<&'static str, u32>>,
}

/// Shared handle to the pool allocator.
///
/// Cloning is cheap; all clones feed the same counters.
#[derive(Clone)]
pub struct CapabilityAllocator {
    inner: Arc<Inner>,
}

impl CapabilityAllocator {
    pub fn new(provider: impl PoolProvider + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider: Mutex::new(Box::new(provider)),
                failures: AtomicU32::new(0),
                fallbacks: AtomicU32::new(0),
                failures_by_tag: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocate `size` bytes from the first pool in `order` that can serve it.
    ///
    /// A zero-sized request yields `Ok(None)` without touching any pool.
    /// `tag` only shows up in diagnostics.
    pub fn allocate(
        &self,
        order: &[Pool],
        size: usize,
        tag: &'static str,
    ) -> Result<Option<PoolBuffer>, AllocError> {
        if size == 0 {
            return Ok(None);
        }
        let layout =
            Layout::from_size_align(size, BUFFER_ALIGN).map_err(|_| AllocError::SizeOverflow)?;

        {
            let mut provider = self.inner.provider.lock();
            for (attempt, &pool) in order.iter().enumerate() {
                let Some(ptr) = provider.alloc(pool, layout) else {
                    continue;
                };
                if attempt > 0 {
                    self.inner.fallbacks.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "[ALLOC] fallback tag={} size={} pool={} after={}",
                        tag,
                        size,
                        pool,
                        PoolList(&order[..attempt])
                    );
                }
                return Ok(Some(PoolBuffer {
                    ptr,
                    layout,
                    pool,
                    owner: Arc::clone(&self.inner),
                }));
            }
        }

        self.inner.failures.fetch_add(1, Ordering::Relaxed);
        *self.inner.failures_by_tag.lock().entry(tag).or_insert(0) += 1;
        log::error!(
            "[ALLOC] failed tag={} size={} tried={}",
            tag,
            size,
            PoolList(order)
        );
        Err(AllocError::Exhausted)
    }

    /// Give a buffer back. `None` is accepted and ignored.
    pub fn release(&self, buffer: Option<PoolBuffer>) {
        drop(buffer);
    }

    /// Requests that exhausted every pool they named.
    pub fn failure_count(&self) -> u32 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    /// Requests served by a pool other than their first choice.
    pub fn fallback_count(&self) -> u32 {
        self.inner.fallbacks.load(Ordering::Relaxed)
    }

    pub fn failures_for(&self, tag: &str) -> u32 {
        self.inner
            .failures_by_tag
            .lock()
            .get(tag)
            .copied()
            .unwrap_or(0)
    }

    pub fn free_bytes(&self, pool: Pool) -> usize {
        self.inner.provider.lock().free_bytes(pool)
    }

    pub fn largest_free_block(&self, pool: Pool) -> usize {
        self.inner.provider.lock().largest_free_block(pool)
    }
}

/// Owned allocation from one pool. Freed on drop.
pub struct PoolBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    pool: Pool,
    owner: Arc<Inner>,
}

// SAFETY: PoolBuffer exclusively owns its allocation; the provider behind
// `owner` is only touched under its mutex.
unsafe impl Send for PoolBuffer {}

impl PoolBuffer {
    pub fn pool(&self) -> Pool {
        self.pool
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() bytes and zero-initialised
        // by the provider; we hold the only handle.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// View as 16-bit pixels. A trailing odd byte is not included.
    pub fn as_u16(&self) -> &[u16] {
        let even = self.len() & !1;
        bytemuck::cast_slice(&self.as_bytes()[..even])
    }

    /// Mutable view as 16-bit pixels. A trailing odd byte is not included.
    pub fn as_u16_mut(&mut self) -> &mut [u16] {
        let even = self.len() & !1;
        bytemuck::cast_slice_mut(&mut self.as_bytes_mut()[..even])
    }
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("pool", &self.pool)
            .field("len", &self.layout.size())
            .finish()
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/layout/pool are exactly what the provider handed out.
        unsafe {
            self.owner
                .provider
                .lock()
                .dealloc(self.pool, self.ptr, self.layout);
        }
    }
}

/// `dma+external` style rendering of a preference order.
struct PoolList<'a>(&'a [Pool]);

impl fmt::Display for PoolList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("-");
        }
        for (i, pool) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            f.write_str(pool.name())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BudgetHeap;

    fn allocator(dma: usize, internal: usize, external: usize) -> CapabilityAllocator {
        CapabilityAllocator::new(
            BudgetHeap::new()
                .with_budget(Pool::Dma, dma)
                .with_budget(Pool::Internal, internal)
                .with_budget(Pool::External, external),
        )
    }

    #[test]
    fn first_pool_wins_when_it_can() {
        let alloc = allocator(4096, 4096, 4096);
        let buf = alloc
            .allocate(&[Pool::Dma, Pool::Internal], 1024, "test")
            .unwrap()
            .unwrap();
        assert_eq!(buf.pool(), Pool::Dma);
        assert_eq!(buf.len(), 1024);
        assert_eq!(alloc.fallback_count(), 0);
        assert_eq!(alloc.failure_count(), 0);
    }

    #[test]
    fn later_pool_counts_as_fallback_not_failure() {
        let alloc = allocator(0, 4096, 4096);
        let buf = alloc
            .allocate(&[Pool::Dma, Pool::Internal], 1024, "draw")
            .unwrap()
            .unwrap();
        assert_eq!(buf.pool(), Pool::Internal);
        assert_eq!(alloc.fallback_count(), 1);
        assert_eq!(alloc.failure_count(), 0);
    }

    #[test]
    fn never_serves_from_outside_the_order() {
        // External has room but was not asked for.
        let alloc = allocator(0, 0, 1 << 20);
        for size in [1usize, 2, 3, 64, 4096] {
            let result = alloc.allocate(&[Pool::Dma, Pool::Internal], size, "probe");
            assert_eq!(result.unwrap_err(), AllocError::Exhausted);
        }
        let alloc = allocator(1 << 16, 1 << 16, 1 << 16);
        for size in [1usize, 2, 3, 64, 4096] {
            let buf = alloc
                .allocate(&[Pool::Internal, Pool::External], size, "probe")
                .unwrap()
                .unwrap();
            assert!(matches!(buf.pool(), Pool::Internal | Pool::External));
        }
    }

    #[test]
    fn zero_size_touches_nothing() {
        let alloc = allocator(0, 0, 0);
        assert!(alloc.allocate(&[Pool::Dma], 0, "zero").unwrap().is_none());
        assert!(alloc.allocate(&[], 0, "zero").unwrap().is_none());
        assert_eq!(alloc.failure_count(), 0);
        assert_eq!(alloc.failures_for("zero"), 0);
    }

    #[test]
    fn release_none_is_noop() {
        let alloc = allocator(64, 0, 0);
        alloc.release(None);
        assert_eq!(alloc.free_bytes(Pool::Dma), 64);
    }

    #[test]
    fn exhaustion_counts_once_per_request() {
        let alloc = allocator(16, 16, 0);
        let err = alloc
            .allocate(&[Pool::Dma, Pool::Internal], 1024, "big")
            .unwrap_err();
        assert_eq!(err, AllocError::Exhausted);
        assert_eq!(alloc.failure_count(), 1);
        assert_eq!(alloc.failures_for("big"), 1);
        assert_eq!(alloc.failures_for("other"), 0);
    }

    #[test]
    fn empty_order_is_exhausted() {
        let alloc = allocator(4096, 4096, 4096);
        assert_eq!(
            alloc.allocate(&[], 16, "none").unwrap_err(),
            AllocError::Exhausted
        );
        assert_eq!(alloc.failure_count(), 1);
    }

    #[test]
    fn oversized_layout_is_rejected() {
        let alloc = allocator(4096, 0, 0);
        assert_eq!(
            alloc.allocate(&[Pool::Dma], usize::MAX, "huge").unwrap_err(),
            AllocError::SizeOverflow
        );
        assert_eq!(alloc.failure_count(), 0);
    }

    #[test]
    fn dropping_buffer_returns_memory() {
        let alloc = allocator(2048, 0, 0);
        let buf = alloc.allocate(&[Pool::Dma], 2048, "t").unwrap();
        assert_eq!(alloc.free_bytes(Pool::Dma), 0);
        alloc.release(buf);
        assert_eq!(alloc.free_bytes(Pool::Dma), 2048);
    }

    #[test]
    fn u16_view_covers_even_prefix() {
        let alloc = allocator(64, 0, 0);
        let mut buf = alloc.allocate(&[Pool::Dma], 7, "odd").unwrap().unwrap();
        assert_eq!(buf.as_u16_mut().len(), 3);
        buf.as_u16_mut()[2] = 0xABCD;
        assert_eq!(buf.as_u16()[2], 0xABCD);
    }
}
