//! The flush state machine.
//!
//! At most one rectangle is in flight on the transfer engine. Everything
//! submitted while it runs waits in a FIFO and is started by a later
//! [`FlushScheduler::poll`], so completions come out in submission order.
//! Completions are collected in an outbox the presentation layer drains
//! with [`FlushScheduler::pop_completion`].
//!
//! A transfer that stays busy past the stall timeout is abandoned: its
//! completion is synthesized, a full repaint is requested and the engine is
//! put on cooldown. The abandoned transfer's epoch is quarantined until the
//! engine reports idle again; while quarantined nothing is converted into
//! the bounce buffer and the busy flag no longer holds up synchronous
//! writes.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::ptr::NonNull;

use lcd_hal::{BusArbiter, Clock, PoolBuffer};
use lcd_panel::{to_wire, Panel, PanelLink, Rect};

use crate::color::{ColorConverter, ColorMode};
use crate::dma::DmaEngine;
use crate::error::PipelineError;
use crate::planner::{Staging, TransferBuffer};
use crate::stats::GraphicsStats;

/// Longest a synchronous flush waits for the engine to go idle.
pub const SYNC_WAIT_US: u64 = 500;

/// Borrowed pixels of one dirty rectangle, row-major, tightly packed.
pub struct PixelSpan {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the span is only read, and the creator promised the memory stays
// valid until the flush completes.
unsafe impl Send for PixelSpan {}

impl PixelSpan {
    /// # Safety
    /// `ptr` must be valid for reads of `len` bytes, and must not be written
    /// to, until the flush it is submitted with has completed.
    pub unsafe fn from_raw(ptr: *const u8, len: usize) -> Option<Self> {
        NonNull::new(ptr.cast_mut()).map(|ptr| Self { ptr, len })
    }

    /// # Safety
    /// Same contract as [`PixelSpan::from_raw`]; the borrow is not tracked.
    pub unsafe fn from_slice(bytes: &[u8]) -> Self {
        Self {
            ptr: NonNull::from(bytes).cast(),
            len: bytes.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by the constructor's contract.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    /// Rectangles are waiting to be started.
    Pending,
    InFlightDma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPath {
    Async,
    Sync,
    /// Abandoned after a stall; the pixels may not have reached the panel.
    Recovered,
}

/// Result of [`FlushScheduler::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed to the transfer engine; completes on a later poll.
    Issued,
    /// Written synchronously; the completion is already in the outbox.
    Completed,
    /// Queued behind earlier work.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Submission order, starting at 0.
    pub seq: u64,
    pub rect: Rect,
    pub path: FlushPath,
    /// Set for rectangles that went through the transfer engine.
    pub epoch: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub mode: ColorMode,
    /// RGB565 sources already hold big-endian wire order.
    pub source_wire_order: bool,
    pub stall_timeout_us: u64,
    pub bus_timeout_us: u64,
    pub sync_wait_us: u64,
}

/// How source bytes map onto wire pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceLayout {
    Indexed,
    Native,
    Wire,
}

impl SourceLayout {
    fn bytes_per_pixel(self) -> usize {
        match self {
            SourceLayout::Indexed => 1,
            SourceLayout::Native | SourceLayout::Wire => 2,
        }
    }
}

struct FlushContext {
    seq: u64,
    rect: Rect,
    source: PixelSpan,
    using_dma: bool,
    /// The bounce buffer already holds this rectangle.
    converted: bool,
    started_us: u64,
    epoch: Option<u32>,
}

enum Started {
    Issued,
    Completed,
    Busy(FlushContext),
}

enum DmaAttempt {
    Issued,
    Busy(FlushContext),
    Refused(FlushContext),
}

pub struct FlushScheduler {
    cfg: SchedulerConfig,
    bus: Arc<BusArbiter>,
    clock: Arc<dyn Clock>,
    converter: ColorConverter,
    dma: DmaEngine,
    transfer: Option<TransferBuffer>,
    scratch: Option<PoolBuffer>,
    active: Option<FlushContext>,
    deferred: VecDeque<FlushContext>,
    completed: VecDeque<Completion>,
    next_seq: u64,
    epoch: u32,
    quarantined: Option<u32>,
    full_repaint: bool,
    last_fault: Option<PipelineError>,
    stats: GraphicsStats,
}

impl FlushScheduler {
    pub fn new(
        cfg: SchedulerConfig,
        bus: Arc<BusArbiter>,
        clock: Arc<dyn Clock>,
        dma: DmaEngine,
        transfer: Option<TransferBuffer>,
        scratch: Option<PoolBuffer>,
    ) -> Self {
        Self {
            cfg,
            bus,
            clock,
            converter: ColorConverter::new(),
            dma,
            transfer,
            scratch: scratch.filter(|s| s.len() >= 2),
            active: None,
            deferred: VecDeque::new(),
            completed: VecDeque::new(),
            next_seq: 0,
            epoch: 0,
            quarantined: None,
            full_repaint: false,
            last_fault: None,
            stats: GraphicsStats::default(),
        }
    }

    /// Hand over one dirty rectangle. Never blocks beyond the bounded bus
    /// and engine waits.
    pub fn submit<L: PanelLink>(
        &mut self,
        panel: &mut Panel<L>,
        rect: Rect,
        source: PixelSpan,
    ) -> SubmitOutcome {
        let ctx = FlushContext {
            seq: self.next_seq,
            rect,
            source,
            using_dma: false,
            converted: false,
            started_us: 0,
            epoch: None,
        };
        self.next_seq += 1;

        if self.active.is_some() || !self.deferred.is_empty() || self.hardware_busy(panel) {
            self.defer(ctx, false);
            return SubmitOutcome::Deferred;
        }
        match self.start(panel, ctx) {
            Started::Issued => SubmitOutcome::Issued,
            Started::Completed => SubmitOutcome::Completed,
            Started::Busy(ctx) => {
                self.defer(ctx, false);
                SubmitOutcome::Deferred
            }
        }
    }

    /// Advance the state machine once. Call from the periodic tick.
    pub fn poll<L: PanelLink>(&mut self, panel: &mut Panel<L>) -> FlushState {
        if let Some(started_us) = self.active.as_ref().map(|ctx| ctx.started_us) {
            if panel.dma_busy() {
                self.stats.busy_poll_count += 1;
                let waited = self.clock.now_us().saturating_sub(started_us);
                if waited > self.cfg.stall_timeout_us {
                    self.recover(waited);
                }
                return self.state();
            }
            if let Some(ctx) = self.active.take() {
                let elapsed = self.clock.now_us().saturating_sub(ctx.started_us);
                self.finish(ctx, FlushPath::Async, elapsed);
            }
        }

        if let Some(ctx) = self.deferred.pop_front() {
            if let Started::Busy(ctx) = self.start(panel, ctx) {
                self.defer(ctx, true);
            }
        }
        self.state()
    }

    /// Drain everything within `budget_us`: the in-flight transfer, any
    /// quarantined one the engine may still be reading, and deferred
    /// rectangles. Only when this returns true may the staging buffers be
    /// released.
    pub fn quiesce<L: PanelLink>(&mut self, panel: &mut Panel<L>, budget_us: u64) -> bool {
        let clock = Arc::clone(&self.clock);
        let deadline = clock.now_us().saturating_add(budget_us);
        while self.active.is_some() || self.quarantined.is_some() || !self.deferred.is_empty() {
            let now = clock.now_us();
            if now >= deadline || !panel.dma_wait(&*clock, deadline - now) {
                return false;
            }
            self.release_quarantine();
            self.poll(panel);
        }
        true
    }

    /// Give the transfer and scratch buffers back. Only valid after a
    /// successful [`FlushScheduler::quiesce`]; later flushes run per pixel.
    pub fn release_staging(&mut self) {
        self.transfer = None;
        self.scratch = None;
    }

    pub fn state(&self) -> FlushState {
        if self.active.is_some() {
            FlushState::InFlightDma
        } else if !self.deferred.is_empty() {
            FlushState::Pending
        } else {
            FlushState::Idle
        }
    }

    pub fn pop_completion(&mut self) -> Option<Completion> {
        self.completed.pop_front()
    }

    /// Rectangles waiting to be started.
    pub fn pending_len(&self) -> usize {
        self.deferred.len()
    }

    /// Whether a stall recovery asked for a full repaint since the last call.
    pub fn take_full_repaint(&mut self) -> bool {
        core::mem::take(&mut self.full_repaint)
    }

    pub fn stats(&self) -> &GraphicsStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut GraphicsStats {
        &mut self.stats
    }

    pub fn dma(&self) -> &DmaEngine {
        &self.dma
    }

    pub fn transfer(&self) -> Option<&TransferBuffer> {
        self.transfer.as_ref()
    }

    /// Most recent recovered error, for diagnostics.
    pub fn last_fault(&self) -> Option<PipelineError> {
        self.last_fault
    }

    pub fn quarantined_epoch(&self) -> Option<u32> {
        self.quarantined
    }

    fn layout(&self) -> SourceLayout {
        match self.cfg.mode {
            ColorMode::Indexed8 => SourceLayout::Indexed,
            ColorMode::Rgb565 if self.cfg.source_wire_order => SourceLayout::Wire,
            ColorMode::Rgb565 => SourceLayout::Native,
        }
    }

    fn defer(&mut self, ctx: FlushContext, front: bool) {
        if front {
            self.deferred.push_front(ctx);
        } else {
            self.stats.deferred_count += 1;
            log::trace!("[FLUSH] deferred #{} {}", ctx.seq, ctx.rect);
            self.deferred.push_back(ctx);
        }
    }

    /// Busy in a way that should hold up new work. A quarantined engine's
    /// busy flag is not trusted.
    fn hardware_busy<L: PanelLink>(&mut self, panel: &mut Panel<L>) -> bool {
        let busy = panel.dma_busy();
        if !busy {
            self.release_quarantine();
        }
        busy && self.quarantined.is_none()
    }

    fn release_quarantine(&mut self) {
        if let Some(epoch) = self.quarantined.take() {
            log::info!("[FLUSH] engine idle, epoch {} released", epoch);
        }
    }

    fn start<L: PanelLink>(&mut self, panel: &mut Panel<L>, mut ctx: FlushContext) -> Started {
        let now = self.clock.now_us();
        if !ctx.rect.is_empty() && self.dma.is_eligible(now) {
            match self.try_dma(panel, ctx, now) {
                DmaAttempt::Issued => return Started::Issued,
                DmaAttempt::Busy(c) => return Started::Busy(c),
                DmaAttempt::Refused(c) => ctx = c,
            }
        }
        self.run_sync(panel, ctx)
    }

    fn try_dma<L: PanelLink>(
        &mut self,
        panel: &mut Panel<L>,
        mut ctx: FlushContext,
        now: u64,
    ) -> DmaAttempt {
        let layout = self.layout();
        let count = ctx.rect.pixel_count();
        let available = ctx.source.len() / layout.bytes_per_pixel();

        let data: NonNull<u16> = match self.transfer.as_mut().map(|t| &mut t.storage) {
            Some(Staging::Owned(buf)) => {
                let dst = buf.as_u16_mut();
                if self.quarantined.is_some() || count > dst.len() || available < count {
                    return DmaAttempt::Refused(ctx);
                }
                if !ctx.converted {
                    fill_wire(&self.converter, layout, ctx.source.bytes(), 0, &mut dst[..count]);
                    ctx.converted = true;
                }
                buf.as_ptr().cast()
            }
            Some(Staging::Direct) => {
                let aligned = ctx.source.ptr.as_ptr().align_offset(2) == 0;
                if layout != SourceLayout::Wire || available < count || !aligned {
                    return DmaAttempt::Refused(ctx);
                }
                ctx.source.ptr.cast()
            }
            None => return DmaAttempt::Refused(ctx),
        };

        let bus = Arc::clone(&self.bus);
        let guard = bus.acquire(self.cfg.bus_timeout_us);
        if !guard.is_held() {
            self.fault(PipelineError::AcquisitionTimeout);
            return DmaAttempt::Busy(ctx);
        }
        // SAFETY: `data` points either at the bounce buffer, which is not
        // touched again until this epoch completes or is quarantined, or at
        // the caller's span, valid until completion.
        let issued = unsafe { panel.push_image_dma(ctx.rect, data, count) };
        drop(guard);
        if !issued {
            return DmaAttempt::Refused(ctx);
        }

        self.epoch = self.epoch.wrapping_add(1);
        ctx.using_dma = true;
        ctx.started_us = now;
        ctx.epoch = Some(self.epoch);
        log::trace!("[FLUSH] issued #{} {} epoch={}", ctx.seq, ctx.rect, self.epoch);
        self.active = Some(ctx);
        DmaAttempt::Issued
    }

    fn run_sync<L: PanelLink>(&mut self, panel: &mut Panel<L>, ctx: FlushContext) -> Started {
        if !self.wait_engine(panel) {
            return Started::Busy(ctx);
        }
        let bus = Arc::clone(&self.bus);
        let guard = bus.acquire(self.cfg.bus_timeout_us);
        if !guard.is_held() {
            self.fault(PipelineError::AcquisitionTimeout);
            return Started::Busy(ctx);
        }
        let start = self.clock.now_us();
        self.write_sync(panel, &ctx);
        drop(guard);
        let elapsed = self.clock.now_us().saturating_sub(start);
        self.finish(ctx, FlushPath::Sync, elapsed);
        Started::Completed
    }

    /// Bounded wait for the engine. A quarantined engine is written past.
    fn wait_engine<L: PanelLink>(&mut self, panel: &mut Panel<L>) -> bool {
        let clock = Arc::clone(&self.clock);
        if panel.dma_wait(&*clock, self.cfg.sync_wait_us) {
            self.release_quarantine();
            true
        } else {
            self.quarantined.is_some()
        }
    }

    fn write_sync<L: PanelLink>(&mut self, panel: &mut Panel<L>, ctx: &FlushContext) {
        let layout = self.layout();
        let rect = ctx.rect;
        let src = ctx.source.bytes();
        let count = rect.pixel_count().min(src.len() / layout.bytes_per_pixel());
        if count < rect.pixel_count() {
            log::warn!(
                "[FLUSH] #{} {} source holds {} of {} pixels",
                ctx.seq,
                rect,
                count,
                rect.pixel_count()
            );
        }
        if count == 0 {
            return;
        }

        panel.set_addr_window(rect);
        if layout == SourceLayout::Wire {
            if let Ok(wire) = bytemuck::try_cast_slice::<u8, u16>(&src[..count * 2]) {
                panel.push_pixels(wire);
                return;
            }
        }

        if let Some(scratch) = self.scratch.as_mut() {
            let line = scratch.as_u16_mut();
            let mut done = 0;
            while done < count {
                let n = (count - done).min(line.len());
                fill_wire(&self.converter, layout, src, done, &mut line[..n]);
                panel.push_pixels(&line[..n]);
                done += n;
            }
        } else {
            let width = usize::from(rect.width);
            for i in 0..count {
                let x = u16::try_from(i % width).ok().and_then(|dx| rect.x.checked_add(dx));
                let y = u16::try_from(i / width).ok().and_then(|dy| rect.y.checked_add(dy));
                // Off the coordinate space entirely; nothing to draw.
                let (Some(x), Some(y)) = (x, y) else {
                    continue;
                };
                panel.push_pixel(x, y, native_pixel(&self.converter, layout, src, i));
            }
        }
    }

    fn recover(&mut self, waited_us: u64) {
        let Some(ctx) = self.active.take() else {
            return;
        };
        self.stats.stall_count += 1;
        self.stats.recovery_count += 1;
        if ctx.using_dma {
            self.dma.enter_cooldown(self.clock.now_us());
            self.stats.async_fallback_count += 1;
            self.quarantined = ctx.epoch;
        }
        self.full_repaint = true;
        self.fault(PipelineError::TransferStall);
        log::warn!(
            "[FLUSH] {} #{} {} epoch={} waited={}us",
            PipelineError::TransferStall,
            ctx.seq,
            ctx.rect,
            ctx.epoch.unwrap_or(0),
            waited_us
        );
        self.finish(ctx, FlushPath::Recovered, waited_us);
    }

    fn finish(&mut self, ctx: FlushContext, path: FlushPath, elapsed_us: u64) {
        self.stats.record_flush(path, elapsed_us);
        self.completed.push_back(Completion {
            seq: ctx.seq,
            rect: ctx.rect,
            path,
            epoch: ctx.epoch,
        });
    }

    fn fault(&mut self, err: PipelineError) {
        log::debug!("[FLUSH] {}", err);
        self.last_fault = Some(err);
    }
}

/// Write pixels `first..first + dst.len()` of `src` into `dst` in wire order.
fn fill_wire(
    conv: &ColorConverter,
    layout: SourceLayout,
    src: &[u8],
    first: usize,
    dst: &mut [u16],
) {
    let n = dst.len();
    match layout {
        SourceLayout::Indexed => conv.convert(dst, &src[first..first + n], n),
        SourceLayout::Native => {
            let bytes = &src[first * 2..(first + n) * 2];
            match bytemuck::try_cast_slice::<u8, u16>(bytes) {
                Ok(px) => conv.convert_rgb565(dst, px, n),
                Err(_) => {
                    for (d, pair) in dst.iter_mut().zip(bytes.chunks_exact(2)) {
                        *d = to_wire(u16::from_ne_bytes([pair[0], pair[1]]));
                    }
                }
            }
        }
        SourceLayout::Wire => {
            let bytes = &src[first * 2..(first + n) * 2];
            match bytemuck::try_cast_slice::<u8, u16>(bytes) {
                Ok(px) => dst.copy_from_slice(px),
                Err(_) => {
                    for (d, pair) in dst.iter_mut().zip(bytes.chunks_exact(2)) {
                        *d = u16::from_ne_bytes([pair[0], pair[1]]);
                    }
                }
            }
        }
    }
}

/// Native RGB565 value of pixel `i`.
fn native_pixel(conv: &ColorConverter, layout: SourceLayout, src: &[u8], i: usize) -> u16 {
    match layout {
        SourceLayout::Indexed => u16::from_be(conv.lookup(src[i])),
        SourceLayout::Native => u16::from_ne_bytes([src[2 * i], src[2 * i + 1]]),
        SourceLayout::Wire => u16::from_be_bytes([src[2 * i], src[2 * i + 1]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaInputs;
    use lcd_hal::{BudgetHeap, CapabilityAllocator, ManualClock, Pool};
    use lcd_panel::{BackendKind, SimHandle, SimLink};

    const W: u16 = 16;
    const H: u16 = 8;

    struct Rig {
        panel: Panel<SimLink>,
        sim: SimHandle,
        clock: Arc<ManualClock>,
        bus: Arc<BusArbiter>,
        sched: FlushScheduler,
    }

    fn cfg(mode: ColorMode, wire: bool) -> SchedulerConfig {
        SchedulerConfig {
            mode,
            source_wire_order: wire,
            stall_timeout_us: 1_000,
            bus_timeout_us: 10,
            sync_wait_us: 20,
        }
    }

    fn rig(
        cfg: SchedulerConfig,
        async_on: bool,
        transfer: Option<TransferBuffer>,
        scratch: Option<PoolBuffer>,
    ) -> Rig {
        let (link, sim) = SimLink::new(W, H, true);
        let mut panel = Panel::select(BackendKind::Engine, link, W, H);
        let clock = Arc::new(ManualClock::with_step(1));
        let bus = Arc::new(BusArbiter::new(clock.clone()));
        let mut dma = DmaEngine::new(10_000);
        dma.initialize(
            &mut panel,
            &DmaInputs {
                async_default: async_on,
                full_frame: false,
                indexed: cfg.mode == ColorMode::Indexed8,
                indexed_opt_in: true,
                transfer_required: !matches!(
                    transfer.as_ref().map(|t| &t.storage),
                    Some(Staging::Direct)
                ),
                has_transfer_buffer: transfer.is_some(),
            },
        );
        let sched = FlushScheduler::new(cfg, bus.clone(), clock.clone(), dma, transfer, scratch);
        Rig {
            panel,
            sim,
            clock,
            bus,
            sched,
        }
    }

    fn direct() -> Option<TransferBuffer> {
        Some(TransferBuffer {
            lines: H,
            pixel_capacity: usize::from(W) * usize::from(H),
            pool: Pool::Dma,
            storage: Staging::Direct,
        })
    }

    fn allocator() -> CapabilityAllocator {
        CapabilityAllocator::new(
            BudgetHeap::new()
                .with_budget(Pool::Dma, 1 << 16)
                .with_budget(Pool::Internal, 1 << 16),
        )
    }

    fn owned(alloc: &CapabilityAllocator) -> Option<TransferBuffer> {
        let buf = alloc
            .allocate(&[Pool::Dma], usize::from(W) * usize::from(H) * 2, "xfer")
            .unwrap()
            .unwrap();
        Some(TransferBuffer {
            lines: H,
            pixel_capacity: usize::from(W) * usize::from(H),
            pool: Pool::Dma,
            storage: Staging::Owned(buf),
        })
    }

    /// Wire-order RGB565 bytes, pixel `i` = `base + i`.
    fn wire_pixels(count: usize, base: u16) -> Vec<u16> {
        (0..count).map(|i| to_wire(base + i as u16)).collect()
    }

    fn span(px: &[u16]) -> PixelSpan {
        unsafe { PixelSpan::from_slice(bytemuck::cast_slice(px)) }
    }

    #[test]
    fn sync_flush_completes_immediately() {
        let mut r = rig(cfg(ColorMode::Rgb565, true), false, direct(), None);
        let px = wire_pixels(8, 100);
        let out = r.sched.submit(&mut r.panel, Rect::new(2, 1, 4, 2), span(&px));
        assert_eq!(out, SubmitOutcome::Completed);
        assert_eq!(r.sched.state(), FlushState::Idle);
        let done = r.sched.pop_completion().unwrap();
        assert_eq!(done.path, FlushPath::Sync);
        assert_eq!(done.epoch, None);
        assert!(r.sched.pop_completion().is_none());
        assert_eq!(r.sim.pixel(2, 1), 100);
        assert_eq!(r.sim.pixel(5, 2), 107);
        assert_eq!(r.sim.transfers_started(), 0);
        assert_eq!(r.sched.stats().sync_flush_count, 1);
    }

    #[test]
    fn async_flush_finalizes_on_next_poll() {
        let mut r = rig(cfg(ColorMode::Rgb565, true), true, direct(), None);
        let px = wire_pixels(32, 0);
        let out = r.sched.submit(&mut r.panel, Rect::new(0, 0, 16, 2), span(&px));
        assert_eq!(out, SubmitOutcome::Issued);
        assert_eq!(r.sched.state(), FlushState::InFlightDma);
        assert!(r.sched.pop_completion().is_none());

        assert_eq!(r.sched.poll(&mut r.panel), FlushState::Idle);
        let done = r.sched.pop_completion().unwrap();
        assert_eq!(done.path, FlushPath::Async);
        assert_eq!(done.epoch, Some(1));
        assert_eq!(r.sched.stats().flush_count, 1);
        assert_eq!(r.sched.stats().dma_flush_count, 1);
        assert_eq!(r.sim.pixel(15, 1), 31);
        assert_eq!(r.sim.transfers_started(), 1);
    }

    #[test]
    fn busy_engine_defers_in_order() {
        let mut r = rig(cfg(ColorMode::Rgb565, true), true, direct(), None);
        r.sim.set_busy_polls(3);
        let a = wire_pixels(16, 0);
        let b = wire_pixels(16, 100);
        let c = wire_pixels(16, 200);
        assert_eq!(
            r.sched.submit(&mut r.panel, Rect::new(0, 0, 16, 1), span(&a)),
            SubmitOutcome::Issued
        );
        assert_eq!(
            r.sched.submit(&mut r.panel, Rect::new(0, 1, 16, 1), span(&b)),
            SubmitOutcome::Deferred
        );
        assert_eq!(
            r.sched.submit(&mut r.panel, Rect::new(0, 2, 16, 1), span(&c)),
            SubmitOutcome::Deferred
        );
        assert_eq!(r.sched.state(), FlushState::InFlightDma);
        assert_eq!(r.sched.pending_len(), 2);

        let mut order = Vec::new();
        for _ in 0..50 {
            r.sched.poll(&mut r.panel);
            while let Some(done) = r.sched.pop_completion() {
                order.push(done.seq);
            }
            if r.sched.state() == FlushState::Idle {
                break;
            }
        }
        assert_eq!(order, [0, 1, 2]);
        assert_eq!(r.sched.stats().deferred_count, 2);
        assert_eq!(r.sched.stats().flush_count, 3);
        assert!(r.sched.stats().busy_poll_count > 0);
        assert_eq!(r.sim.pixel(0, 2), 200);
    }

    #[test]
    fn stall_recovers_once_and_falls_back() {
        let mut r = rig(cfg(ColorMode::Rgb565, true), true, direct(), None);
        let px = wire_pixels(16, 0);
        assert_eq!(
            r.sched.submit(&mut r.panel, Rect::new(0, 0, 16, 1), span(&px)),
            SubmitOutcome::Issued
        );
        r.sim.set_stalled(true);

        assert_eq!(r.sched.poll(&mut r.panel), FlushState::InFlightDma);
        r.clock.advance(5_000);
        assert_eq!(r.sched.poll(&mut r.panel), FlushState::Idle);
        assert_eq!(r.sched.poll(&mut r.panel), FlushState::Idle);

        let s = r.sched.stats();
        assert_eq!(s.stall_count, 1);
        assert_eq!(s.recovery_count, 1);
        assert_eq!(s.async_fallback_count, 1);
        assert_eq!(s.flush_count, 0);
        let done = r.sched.pop_completion().unwrap();
        assert_eq!(done.path, FlushPath::Recovered);
        assert!(r.sched.take_full_repaint());
        assert!(!r.sched.take_full_repaint());
        assert_eq!(r.sched.last_fault(), Some(PipelineError::TransferStall));
        assert_eq!(r.sched.quarantined_epoch(), Some(1));

        // Engine still wedged: the next flush is written synchronously.
        let writes = r.sim.blocking_writes();
        let px2 = wire_pixels(16, 500);
        assert_eq!(
            r.sched.submit(&mut r.panel, Rect::new(0, 1, 16, 1), span(&px2)),
            SubmitOutcome::Completed
        );
        assert!(r.sim.blocking_writes() > writes);
        assert_eq!(r.sim.pixel(3, 1), 503);
        assert_eq!(r.sim.transfers_started(), 1);

        // Engine recovers: quarantine lifts.
        r.sim.set_stalled(false);
        let px3 = wire_pixels(16, 900);
        r.sched.submit(&mut r.panel, Rect::new(0, 2, 16, 1), span(&px3));
        assert_eq!(r.sched.quarantined_epoch(), None);
    }

    #[test]
    fn cooldown_expiry_reenables_async() {
        let mut r = rig(cfg(ColorMode::Rgb565, true), true, direct(), None);
        let px = wire_pixels(16, 0);
        r.sched.submit(&mut r.panel, Rect::new(0, 0, 16, 1), span(&px));
        r.sim.set_stalled(true);
        r.clock.advance(5_000);
        r.sched.poll(&mut r.panel);
        r.sim.set_stalled(false);
        assert!(r.sched.dma().in_cooldown(r.clock.now_us()));

        r.clock.advance(20_000);
        let out = r.sched.submit(&mut r.panel, Rect::new(0, 0, 16, 1), span(&px));
        assert_eq!(out, SubmitOutcome::Issued);
    }

    #[test]
    fn indexed_pixels_are_converted_into_bounce_buffer() {
        let alloc = allocator();
        let mut r = rig(cfg(ColorMode::Indexed8, true), true, owned(&alloc), None);
        let src: Vec<u8> = vec![0b111_000_00, 0b000_111_00, 0b000_000_11, 0xFF];
        let s = unsafe { PixelSpan::from_slice(&src) };
        assert_eq!(r.sched.submit(&mut r.panel, Rect::new(0, 0, 2, 2), s), SubmitOutcome::Issued);
        r.sched.poll(&mut r.panel);
        assert_eq!(r.sim.pixel(0, 0), 0xF800);
        assert_eq!(r.sim.pixel(1, 0), 0x07E0);
        assert_eq!(r.sim.pixel(0, 1), 0x001F);
        assert_eq!(r.sim.pixel(1, 1), 0xFFFF);
    }

    #[test]
    fn oversized_rect_takes_sync_path() {
        let alloc = allocator();
        let small = alloc.allocate(&[Pool::Dma], 8, "xfer").unwrap().unwrap();
        let transfer = Some(TransferBuffer {
            lines: 1,
            pixel_capacity: 4,
            pool: Pool::Dma,
            storage: Staging::Owned(small),
        });
        let scratch = alloc.allocate(&[Pool::Internal], usize::from(W) * 2, "scratch").unwrap();
        let mut r = rig(cfg(ColorMode::Rgb565, false), true, transfer, scratch);
        let native: Vec<u16> = (0..32).map(|i| 0x0100 + i).collect();
        let out = r.sched.submit(&mut r.panel, Rect::new(0, 0, 16, 2), span(&native));
        assert_eq!(out, SubmitOutcome::Completed);
        assert_eq!(r.sim.pixel(0, 0), 0x0100);
        assert_eq!(r.sim.pixel(15, 1), 0x011F);
        assert_eq!(r.sim.transfers_started(), 0);
    }

    #[test]
    fn no_scratch_falls_back_to_per_pixel() {
        let mut r = rig(cfg(ColorMode::Rgb565, false), false, None, None);
        let native: Vec<u16> = vec![0xF800, 0x07E0, 0x001F];
        let out = r.sched.submit(&mut r.panel, Rect::new(5, 5, 3, 1), span(&native));
        assert_eq!(out, SubmitOutcome::Completed);
        assert_eq!(r.sim.pixel(5, 5), 0xF800);
        assert_eq!(r.sim.pixel(6, 5), 0x07E0);
        assert_eq!(r.sim.pixel(7, 5), 0x001F);
        assert_eq!(r.sim.blocking_writes(), 3);
    }

    #[test]
    fn held_bus_defers_until_released() {
        let mut r = rig(cfg(ColorMode::Rgb565, true), false, direct(), None);
        assert!(r.bus.lock(0));
        let px = wire_pixels(4, 7);
        let out = r.sched.submit(&mut r.panel, Rect::new(0, 0, 4, 1), span(&px));
        assert_eq!(out, SubmitOutcome::Deferred);
        assert_eq!(r.sched.state(), FlushState::Pending);
        assert_eq!(r.sched.last_fault(), Some(PipelineError::AcquisitionTimeout));
        assert_eq!(r.sched.poll(&mut r.panel), FlushState::Pending);

        r.bus.unlock();
        assert_eq!(r.sched.poll(&mut r.panel), FlushState::Idle);
        assert_eq!(r.sched.pop_completion().unwrap().path, FlushPath::Sync);
        assert_eq!(r.sim.pixel(3, 0), 10);
        assert!(!r.bus.is_locked());
    }

    #[test]
    fn empty_rect_still_completes() {
        let mut r = rig(cfg(ColorMode::Rgb565, true), true, direct(), None);
        let out = r.sched.submit(&mut r.panel, Rect::new(0, 0, 0, 4), span(&[]));
        assert_eq!(out, SubmitOutcome::Completed);
        assert_eq!(r.sched.pop_completion().unwrap().rect, Rect::new(0, 0, 0, 4));
        assert_eq!(r.sim.transfers_started(), 0);
    }

    #[test]
    fn quiesce_waits_for_in_flight() {
        let mut r = rig(cfg(ColorMode::Rgb565, true), true, direct(), None);
        r.sim.set_busy_polls(2);
        let px = wire_pixels(16, 0);
        r.sched.submit(&mut r.panel, Rect::new(0, 0, 16, 1), span(&px));
        assert!(r.sched.quiesce(&mut r.panel, 1_000));
        assert_eq!(r.sched.state(), FlushState::Idle);
        assert_eq!(r.sched.pop_completion().unwrap().path, FlushPath::Async);
    }

    #[test]
    fn quiesce_waits_out_quarantined_transfer() {
        let mut r = rig(cfg(ColorMode::Rgb565, true), true, direct(), None);
        let px = wire_pixels(16, 0);
        r.sched.submit(&mut r.panel, Rect::new(0, 0, 16, 1), span(&px));
        r.sim.set_stalled(true);
        r.clock.advance(5_000);
        assert_eq!(r.sched.poll(&mut r.panel), FlushState::Idle);
        assert_eq!(r.sched.quarantined_epoch(), Some(1));

        assert!(!r.sched.quiesce(&mut r.panel, 100));
        assert_eq!(r.sched.quarantined_epoch(), Some(1));

        r.sim.set_stalled(false);
        assert!(r.sched.quiesce(&mut r.panel, 100));
        assert_eq!(r.sched.quarantined_epoch(), None);
    }

    #[test]
    fn quiesce_drains_deferred_rects() {
        let mut r = rig(cfg(ColorMode::Rgb565, true), true, direct(), None);
        r.sim.set_busy_polls(2);
        let a = wire_pixels(16, 0);
        let b = wire_pixels(16, 50);
        r.sched.submit(&mut r.panel, Rect::new(0, 0, 16, 1), span(&a));
        assert_eq!(
            r.sched.submit(&mut r.panel, Rect::new(0, 1, 16, 1), span(&b)),
            SubmitOutcome::Deferred
        );
        assert!(r.sched.quiesce(&mut r.panel, 1_000));
        assert_eq!(r.sched.state(), FlushState::Idle);
        assert_eq!(r.sched.pop_completion().unwrap().seq, 0);
        assert_eq!(r.sched.pop_completion().unwrap().seq, 1);
        assert_eq!(r.sim.pixel(15, 1), 65);
    }

    #[test]
    fn per_pixel_path_clips_off_screen_rects() {
        let mut r = rig(cfg(ColorMode::Rgb565, false), false, None, None);
        let native = [0xF800u16; 8];
        let out = r.sched.submit(&mut r.panel, Rect::new(u16::MAX - 1, 0, 4, 1), span(&native));
        assert_eq!(out, SubmitOutcome::Completed);
        assert_eq!(r.sim.blocking_writes(), 0);

        let out = r.sched.submit(&mut r.panel, Rect::new(W - 2, H - 1, 4, 2), span(&native));
        assert_eq!(out, SubmitOutcome::Completed);
        assert_eq!(r.sim.pixel(W - 2, H - 1), 0xF800);
        assert_eq!(r.sim.pixel(W - 1, H - 1), 0xF800);
        assert_eq!(r.sim.blocking_writes(), 2);
    }
}
