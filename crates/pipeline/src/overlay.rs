//! Drawing straight to the panel on top of the flushed image.
//!
//! Overlays share the bus with the flush path. They never wait long: a few
//! short attempts, then the overlay is skipped for this frame.

use alloc::sync::Arc;

use lcd_hal::{spin_wait_us, BusArbiter, Clock};
use lcd_panel::{Panel, PanelLink};

pub const OVERLAY_ATTEMPTS: u32 = 3;
pub const OVERLAY_BACKOFF_US: u64 = 100;

pub struct OverlayPath {
    bus: Arc<BusArbiter>,
    clock: Arc<dyn Clock>,
}

impl OverlayPath {
    pub fn new(bus: Arc<BusArbiter>, clock: Arc<dyn Clock>) -> Self {
        Self { bus, clock }
    }

    /// Run `draw` with the bus held and the transfer engine idle.
    ///
    /// Returns false, without calling `draw`, if that could not be arranged
    /// within the retry budget. Skips are counted by the caller.
    pub fn draw<L: PanelLink>(
        &self,
        panel: &mut Panel<L>,
        draw: impl FnOnce(&mut Panel<L>),
    ) -> bool {
        let mut backoff = OVERLAY_BACKOFF_US;
        for attempt in 1..=OVERLAY_ATTEMPTS {
            {
                let guard = self.bus.acquire(0);
                if guard.is_held() && panel.dma_wait(&*self.clock, backoff) {
                    draw(panel);
                    return true;
                }
            }
            log::trace!("[OVERLAY] attempt {} failed, backing off {}us", attempt, backoff);
            if attempt < OVERLAY_ATTEMPTS {
                spin_wait_us(&*self.clock, backoff, || false);
                backoff *= 2;
            }
        }
        log::debug!("[OVERLAY] skipped after {} attempts", OVERLAY_ATTEMPTS);
        false
    }
}
