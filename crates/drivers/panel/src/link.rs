//! Physical wiring between the MCU and the display controller.

use core::ptr::NonNull;

/// Column address set.
pub const CMD_CASET: u8 = 0x2A;
/// Row address set.
pub const CMD_RASET: u8 = 0x2B;
/// Memory write; pixel data follows.
pub const CMD_RAMWR: u8 = 0x2C;

/// A serial link to an MIPI-DCS style controller.
///
/// Pixel bytes are sent exactly as given; callers produce wire order.
pub trait PanelLink: Send {
    /// Send a command byte followed by its parameters.
    fn write_command(&mut self, cmd: u8, params: &[u8]);

    /// Blocking write of pixel data after `RAMWR`.
    fn write_pixels(&mut self, data: &[u8]);

    /// Whether this wiring has a transfer engine at all.
    fn has_transfer_engine(&self) -> bool;

    /// Bring up the transfer engine. Returns false if it cannot be used.
    fn init_transfer_engine(&mut self) -> bool;

    /// Start an asynchronous transfer of `len` bytes.
    ///
    /// Returns false if the engine refused the transfer.
    ///
    /// # Safety
    /// `data` must be valid for reads of `len` bytes until
    /// [`PanelLink::transfer_busy`] reports false.
    unsafe fn start_transfer(&mut self, data: NonNull<u8>, len: usize) -> bool;

    /// Whether an asynchronous transfer is still running.
    fn transfer_busy(&mut self) -> bool;
}
