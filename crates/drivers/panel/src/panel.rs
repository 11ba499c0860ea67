//! The two panel backends and the enum that dispatches between them.

use core::fmt;
use core::ptr::NonNull;

use embedded_graphics::pixelcolor::Rgb565;
use embedded_graphics::prelude::*;
use lcd_hal::{spin_wait_us, Clock};

use crate::link::{PanelLink, CMD_CASET, CMD_RAMWR, CMD_RASET};

/// Pixels buffered per link write when filling.
const FILL_CHUNK: usize = 64;

/// Convert a native RGB565 value to the controller's big-endian wire order.
///
/// The returned `u16`'s in-memory bytes are the bytes the controller expects.
#[inline]
pub const fn to_wire(native: u16) -> u16 {
    native.to_be()
}

/// Screen rectangle in panel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub const fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the rectangle lies fully inside a `width` x `height` screen.
    pub fn fits(&self, width: u16, height: u16) -> bool {
        u32::from(self.x) + u32::from(self.width) <= u32::from(width)
            && u32::from(self.y) + u32::from(self.height) <= u32::from(height)
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{},{}", self.width, self.height, self.x, self.y)
    }
}

/// Which backend a [`Panel`] is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Engine,
    Direct,
}

impl BackendKind {
    pub const fn name(self) -> &'static str {
        match self {
            BackendKind::Engine => "engine",
            BackendKind::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "engine" => Some(BackendKind::Engine),
            "direct" => Some(BackendKind::Direct),
            _ => None,
        }
    }
}

/// Command encoding shared by both backends.
struct Controller<L> {
    link: L,
    width: u16,
    height: u16,
}

impl<L: PanelLink> Controller<L> {
    fn set_window(&mut self, area: Rect) {
        if area.is_empty() {
            return;
        }
        let x1 = area.x.saturating_add(area.width - 1);
        let y1 = area.y.saturating_add(area.height - 1);
        let [xs_hi, xs_lo] = area.x.to_be_bytes();
        let [xe_hi, xe_lo] = x1.to_be_bytes();
        let [ys_hi, ys_lo] = area.y.to_be_bytes();
        let [ye_hi, ye_lo] = y1.to_be_bytes();
        self.link.write_command(CMD_CASET, &[xs_hi, xs_lo, xe_hi, xe_lo]);
        self.link.write_command(CMD_RASET, &[ys_hi, ys_lo, ye_hi, ye_lo]);
        self.link.write_command(CMD_RAMWR, &[]);
    }

    fn push_wire(&mut self, pixels: &[u16]) {
        self.link.write_pixels(bytemuck::cast_slice(pixels));
    }

    fn fill(&mut self, area: Rect, native: u16) {
        if area.is_empty() {
            return;
        }
        self.set_window(area);
        let chunk = [to_wire(native); FILL_CHUNK];
        let mut remaining = area.pixel_count();
        while remaining > 0 {
            let n = remaining.min(FILL_CHUNK);
            self.push_wire(&chunk[..n]);
            remaining -= n;
        }
    }

    fn push_pixel(&mut self, x: u16, y: u16, native: u16) {
        if x >= self.width || y >= self.height {
            return;
        }
        self.set_window(Rect::new(x, y, 1, 1));
        self.push_wire(&[to_wire(native)]);
    }
}

/// Backend that moves pixel blocks with the transfer engine.
pub struct EnginePanel<L> {
    ctl: Controller<L>,
    engine_ready: bool,
}

impl<L: PanelLink> EnginePanel<L> {
    pub fn new(link: L, width: u16, height: u16) -> Self {
        Self {
            ctl: Controller {
                link,
                width,
                height,
            },
            engine_ready: false,
        }
    }

    fn init_dma(&mut self) -> bool {
        self.engine_ready =
            self.ctl.link.has_transfer_engine() && self.ctl.link.init_transfer_engine();
        self.engine_ready
    }

    fn dma_busy(&mut self) -> bool {
        self.engine_ready && self.ctl.link.transfer_busy()
    }

    unsafe fn push_image_dma(&mut self, area: Rect, data: NonNull<u16>, pixels: usize) -> bool {
        if !self.engine_ready || self.ctl.link.transfer_busy() {
            return false;
        }
        self.ctl.set_window(area);
        // SAFETY: forwarded caller contract.
        unsafe { self.ctl.link.start_transfer(data.cast(), pixels * 2) }
    }
}

/// Backend without a transfer engine; everything is a blocking write.
pub struct DirectPanel<L> {
    ctl: Controller<L>,
}

impl<L: PanelLink> DirectPanel<L> {
    pub fn new(link: L, width: u16, height: u16) -> Self {
        Self {
            ctl: Controller {
                link,
                width,
                height,
            },
        }
    }

    /// Performs the push synchronously; the image is on screen when this returns.
    unsafe fn push_image_dma(&mut self, area: Rect, data: NonNull<u16>, pixels: usize) -> bool {
        // SAFETY: caller guarantees `data` is readable for `pixels` values.
        let slice = unsafe { core::slice::from_raw_parts(data.as_ptr(), pixels) };
        self.ctl.set_window(area);
        self.ctl.push_wire(slice);
        true
    }
}

/// A display controller behind one of the two backends.
pub enum Panel<L> {
    Engine(EnginePanel<L>),
    Direct(DirectPanel<L>),
}

impl<L: PanelLink> Panel<L> {
    /// Build the preferred backend, or the other one if the link cannot
    /// support it.
    pub fn select(preferred: BackendKind, link: L, width: u16, height: u16) -> Self {
        let kind = match preferred {
            BackendKind::Engine if !link.has_transfer_engine() => {
                log::warn!("[PANEL] engine backend unavailable, falling back to direct");
                BackendKind::Direct
            }
            kind => kind,
        };
        log::info!("[PANEL] using {} backend {}x{}", kind.name(), width, height);
        match kind {
            BackendKind::Engine => Panel::Engine(EnginePanel::new(link, width, height)),
            BackendKind::Direct => Panel::Direct(DirectPanel::new(link, width, height)),
        }
    }

    fn ctl(&mut self) -> &mut Controller<L> {
        match self {
            Panel::Engine(p) => &mut p.ctl,
            Panel::Direct(p) => &mut p.ctl,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Panel::Engine(_) => BackendKind::Engine,
            Panel::Direct(_) => BackendKind::Direct,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn width(&self) -> u16 {
        match self {
            Panel::Engine(p) => p.ctl.width,
            Panel::Direct(p) => p.ctl.width,
        }
    }

    pub fn height(&self) -> u16 {
        match self {
            Panel::Engine(p) => p.ctl.height,
            Panel::Direct(p) => p.ctl.height,
        }
    }

    /// Pack 8-bit components into native RGB565.
    pub fn color565(r: u8, g: u8, b: u8) -> u16 {
        Rgb565::new(r >> 3, g >> 2, b >> 3).into_storage()
    }

    pub fn fill_screen(&mut self, native: u16) {
        let area = Rect::new(0, 0, self.width(), self.height());
        self.ctl().fill(area, native);
    }

    pub fn fill_rect(&mut self, area: Rect, native: u16) {
        self.ctl().fill(area, native);
    }

    /// Open a write window; subsequent [`Panel::push_pixels`] fill it row by row.
    pub fn set_addr_window(&mut self, area: Rect) {
        self.ctl().set_window(area);
    }

    /// Blocking write of wire-order pixels into the current window.
    pub fn push_pixels(&mut self, wire: &[u16]) {
        self.ctl().push_wire(wire);
    }

    /// Blocking single-pixel write. Out-of-bounds coordinates are ignored.
    pub fn push_pixel(&mut self, x: u16, y: u16, native: u16) {
        self.ctl().push_pixel(x, y, native);
    }

    /// Bring up the transfer engine. Always false for the direct backend.
    pub fn init_dma(&mut self) -> bool {
        match self {
            Panel::Engine(p) => p.init_dma(),
            Panel::Direct(_) => false,
        }
    }

    /// Send `pixels` wire-order values to `area` through the transfer engine.
    ///
    /// Returns false if the engine is not ready or still busy; nothing was
    /// sent in that case. The direct backend writes synchronously instead.
    ///
    /// # Safety
    /// `data` must be valid for reads of `pixels` values until
    /// [`Panel::dma_busy`] returns false.
    pub unsafe fn push_image_dma(&mut self, area: Rect, data: NonNull<u16>, pixels: usize) -> bool {
        // SAFETY: forwarded caller contract.
        unsafe {
            match self {
                Panel::Engine(p) => p.push_image_dma(area, data, pixels),
                Panel::Direct(p) => p.push_image_dma(area, data, pixels),
            }
        }
    }

    pub fn dma_busy(&mut self) -> bool {
        match self {
            Panel::Engine(p) => p.dma_busy(),
            Panel::Direct(_) => false,
        }
    }

    /// Wait at most `timeout_us` for the transfer engine to go idle.
    pub fn dma_wait(&mut self, clock: &dyn Clock, timeout_us: u64) -> bool {
        spin_wait_us(clock, timeout_us, || !self.dma_busy())
    }
}
