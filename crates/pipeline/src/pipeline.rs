//! The pipeline context: everything the presentation layer talks to.

use alloc::sync::Arc;
use alloc::vec::Vec;

use lcd_hal::{BusArbiter, CapabilityAllocator, Clock, PoolBuffer};
use lcd_panel::{Panel, PanelLink, Rect};
use spin::Mutex;

use crate::config::PipelineConfig;
use crate::dma::{DmaEngine, DmaInputs};
use crate::error::PipelineError;
use crate::flush::{
    Completion, FlushScheduler, FlushState, PixelSpan, SchedulerConfig, SubmitOutcome, SYNC_WAIT_US,
};
use crate::overlay::OverlayPath;
use crate::planner::{BufferAllocationPlanner, BufferPlan, DrawBufferConfig};
use crate::stats::GraphicsStats;

pub struct Pipeline<L> {
    config: PipelineConfig,
    allocator: CapabilityAllocator,
    panel: Arc<Mutex<Panel<L>>>,
    bus: Arc<BusArbiter>,
    clock: Arc<dyn Clock>,
    draw: DrawBufferConfig,
    draw_buffers: Vec<PoolBuffer>,
    scheduler: FlushScheduler,
    overlay: OverlayPath,
    last_dump_us: u64,
}

/// What one round of planning produces.
struct Staged {
    draw: DrawBufferConfig,
    draw_buffers: Vec<PoolBuffer>,
    scheduler: FlushScheduler,
}

impl<L: PanelLink> Pipeline<L> {
    /// Plan buffers, decide on async flushing and get ready to flush.
    ///
    /// Fails only if the geometry is unusable or no draw buffer fits
    /// anywhere.
    pub fn new(
        config: PipelineConfig,
        allocator: CapabilityAllocator,
        panel: Arc<Mutex<Panel<L>>>,
        bus: Arc<BusArbiter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        check_geometry(&config, &panel.lock())?;
        let Staged {
            draw,
            draw_buffers,
            scheduler,
        } = stage(&config, &allocator, &panel, &bus, &clock)?;
        let overlay = OverlayPath::new(Arc::clone(&bus), Arc::clone(&clock));
        let last_dump_us = clock.now_us();

        let pipeline = Self {
            config,
            allocator,
            panel,
            bus,
            clock,
            draw,
            draw_buffers,
            scheduler,
            overlay,
            last_dump_us,
        };
        pipeline.announce();
        Ok(pipeline)
    }

    /// Tear down and rebuild with a new configuration. Statistics restart.
    ///
    /// Drains pending flushes for up to the stall timeout. If a transfer
    /// (including one abandoned by stall recovery) is still running, nothing
    /// is released and `TransferStall` is returned; the pipeline keeps
    /// working with the old configuration. If planning fails after the old
    /// buffers were freed, the pipeline is left without draw buffers and
    /// flushes synchronously until a later `reinit` succeeds.
    pub fn reinit(&mut self, config: PipelineConfig) -> Result<(), PipelineError> {
        check_geometry(&config, &self.panel.lock())?;
        let budget = self.config.stall_timeout_us;
        if !self.scheduler.quiesce(&mut *self.panel.lock(), budget) {
            log::warn!("[GFX] reinit refused: {}", PipelineError::TransferStall);
            return Err(PipelineError::TransferStall);
        }
        self.draw_buffers.clear();
        self.scheduler.release_staging();
        log::info!("[GFX] reinitializing");

        let staged = stage(&config, &self.allocator, &self.panel, &self.bus, &self.clock)?;
        self.config = config;
        self.draw = staged.draw;
        self.draw_buffers = staged.draw_buffers;
        self.scheduler = staged.scheduler;
        self.last_dump_us = self.clock.now_us();
        self.announce();
        Ok(())
    }

    fn announce(&self) {
        log::info!(
            "[GFX] ready {}x{} async={}",
            self.config.width,
            self.config.height,
            self.async_enabled()
        );
        self.dump_stats();
    }

    pub fn draw_buffer_count(&self) -> usize {
        self.draw_buffers.len()
    }

    /// The usable part of draw buffer `index`.
    pub fn draw_buffer_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let len = self.draw.buffer_bytes(self.config.width);
        self.draw_buffers
            .get_mut(index)
            .and_then(|buf| buf.as_bytes_mut().get_mut(..len))
    }

    /// Flush one dirty rectangle whose pixels are in `source`.
    pub fn flush(&mut self, rect: Rect, source: PixelSpan) -> SubmitOutcome {
        if !rect.fits(self.config.width, self.config.height) {
            log::warn!("[GFX] flush {} extends past the screen", rect);
        }
        let mut panel = self.panel.lock();
        self.scheduler.submit(&mut *panel, rect, source)
    }

    /// Periodic work: advance the flush state machine and emit statistics
    /// when due.
    pub fn tick(&mut self) -> FlushState {
        let state = {
            let mut panel = self.panel.lock();
            self.scheduler.poll(&mut *panel)
        };
        let interval = self.config.stats_interval_us;
        let now = self.clock.now_us();
        if interval > 0 && now.saturating_sub(self.last_dump_us) >= interval {
            self.last_dump_us = now;
            self.dump_stats();
        }
        state
    }

    pub fn pop_completion(&mut self) -> Option<Completion> {
        self.scheduler.pop_completion()
    }

    /// Whether the whole screen must be redrawn because a flush was lost.
    pub fn take_full_repaint(&mut self) -> bool {
        self.scheduler.take_full_repaint()
    }

    /// Draw directly on the panel, sharing the bus with the flush path.
    /// Returns false if the overlay was skipped this frame.
    pub fn overlay(&mut self, draw: impl FnOnce(&mut Panel<L>)) -> bool {
        let drawn = {
            let mut panel = self.panel.lock();
            self.overlay.draw(&mut *panel, draw)
        };
        if !drawn {
            self.scheduler.stats_mut().overlay_skipped += 1;
        }
        drawn
    }

    pub fn stats(&self) -> &GraphicsStats {
        self.scheduler.stats()
    }

    pub fn geometry(&self) -> &DrawBufferConfig {
        &self.draw
    }

    pub fn async_enabled(&self) -> bool {
        self.scheduler.dma().is_enabled()
    }

    pub fn state(&self) -> FlushState {
        self.scheduler.state()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn allocator(&self) -> &CapabilityAllocator {
        &self.allocator
    }

    pub fn bus(&self) -> &Arc<BusArbiter> {
        &self.bus
    }

    pub fn last_fault(&self) -> Option<PipelineError> {
        self.scheduler.last_fault()
    }

    pub fn dump_stats(&self) {
        log::info!(
            "{}",
            self.scheduler.stats().report(&self.draw, self.scheduler.transfer())
        );
    }
}

fn check_geometry<L: PanelLink>(
    config: &PipelineConfig,
    panel: &Panel<L>,
) -> Result<(), PipelineError> {
    if config.width == 0
        || config.height == 0
        || panel.width() != config.width
        || panel.height() != config.height
    {
        log::error!(
            "[GFX] {}: configured {}x{}, panel {}x{}",
            PipelineError::InvalidGeometry,
            config.width,
            config.height,
            panel.width(),
            panel.height()
        );
        return Err(PipelineError::InvalidGeometry);
    }
    Ok(())
}

/// Plan buffers and bring up the flush path for `config`.
fn stage<L: PanelLink>(
    config: &PipelineConfig,
    allocator: &CapabilityAllocator,
    panel: &Arc<Mutex<Panel<L>>>,
    bus: &Arc<BusArbiter>,
    clock: &Arc<dyn Clock>,
) -> Result<Staged, PipelineError> {
    let plan = BufferAllocationPlanner::new(allocator).plan(&config.plan_request())?;
    let transfer_required = plan.transfer_required();
    let BufferPlan {
        draw,
        draw_buffers,
        transfer,
        scratch,
    } = plan;

    let mut dma = DmaEngine::new(config.fallback_cooldown_us);
    dma.initialize(
        &mut *panel.lock(),
        &DmaInputs {
            async_default: config.async_default,
            full_frame: draw.full_frame,
            indexed: config.reduced_color_mode,
            indexed_opt_in: config.reduced_color_async_experimental,
            transfer_required,
            has_transfer_buffer: transfer.is_some(),
        },
    );

    let scheduler = FlushScheduler::new(
        SchedulerConfig {
            mode: config.color_mode(),
            source_wire_order: config.source_wire_order,
            stall_timeout_us: config.stall_timeout_us,
            bus_timeout_us: config.bus_timeout_us,
            sync_wait_us: SYNC_WAIT_US,
        },
        Arc::clone(bus),
        Arc::clone(clock),
        dma,
        transfer,
        scratch,
    );
    Ok(Staged {
        draw,
        draw_buffers,
        scheduler,
    })
}
