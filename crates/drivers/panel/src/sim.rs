//! In-memory display controller.
//!
//! Decodes the window/memory-write command set into a framebuffer of native
//! RGB565 values. The transfer engine copies data when a transfer starts and
//! then reports busy for a configurable number of polls, or forever while
//! stalled. Used by the tests and the host simulator.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;

use spin::Mutex;

use crate::link::{PanelLink, CMD_CASET, CMD_RAMWR, CMD_RASET};

struct SimState {
    width: u16,
    height: u16,
    fb: Vec<u16>,
    window: (u16, u16, u16, u16),
    cursor: (u16, u16),
    engine_ready: bool,
    busy_polls: u32,
    busy_remaining: u32,
    stalled: bool,
    transfers_started: u32,
    blocking_writes: u32,
    busy_checks: u32,
}

impl SimState {
    fn ingest(&mut self, data: &[u8]) {
        let (x0, x1, _, y1) = self.window;
        for pair in data.chunks_exact(2) {
            let (x, y) = self.cursor;
            if y > y1 {
                break;
            }
            if x < self.width && y < self.height {
                self.fb[usize::from(y) * usize::from(self.width) + usize::from(x)] =
                    u16::from_be_bytes([pair[0], pair[1]]);
            }
            self.cursor = if x >= x1 { (x0, y + 1) } else { (x + 1, y) };
        }
    }
}

/// Simulated panel wiring. Create with [`SimLink::new`], keep the
/// [`SimHandle`] to inspect what reached the screen.
pub struct SimLink {
    state: Arc<Mutex<SimState>>,
    engine: bool,
}

/// Inspection and fault-injection handle for a [`SimLink`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimLink {
    /// `engine` selects whether the wiring offers a transfer engine.
    pub fn new(width: u16, height: u16, engine: bool) -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState {
            width,
            height,
            fb: vec![0; usize::from(width) * usize::from(height)],
            window: (0, 0, 0, 0),
            cursor: (0, 0),
            engine_ready: false,
            busy_polls: 0,
            busy_remaining: 0,
            stalled: false,
            transfers_started: 0,
            blocking_writes: 0,
            busy_checks: 0,
        }));
        (
            Self {
                state: Arc::clone(&state),
                engine,
            },
            SimHandle { state },
        )
    }
}

fn be_pair(params: &[u8]) -> Option<(u16, u16)> {
    match params {
        [a, b, c, d, ..] => Some((
            u16::from_be_bytes([*a, *b]),
            u16::from_be_bytes([*c, *d]),
        )),
        _ => None,
    }
}

impl PanelLink for SimLink {
    fn write_command(&mut self, cmd: u8, params: &[u8]) {
        let mut s = self.state.lock();
        match cmd {
            CMD_CASET => {
                if let Some((x0, x1)) = be_pair(params) {
                    s.window.0 = x0;
                    s.window.1 = x1;
                }
            }
            CMD_RASET => {
                if let Some((y0, y1)) = be_pair(params) {
                    s.window.2 = y0;
                    s.window.3 = y1;
                }
            }
            CMD_RAMWR => {
                s.cursor = (s.window.0, s.window.2);
            }
            _ => {}
        }
    }

    fn write_pixels(&mut self, data: &[u8]) {
        let mut s = self.state.lock();
        s.blocking_writes += 1;
        s.ingest(data);
    }

    fn has_transfer_engine(&self) -> bool {
        self.engine
    }

    fn init_transfer_engine(&mut self) -> bool {
        let mut s = self.state.lock();
        s.engine_ready = self.engine;
        s.engine_ready
    }

    unsafe fn start_transfer(&mut self, data: NonNull<u8>, len: usize) -> bool {
        let mut s = self.state.lock();
        if !s.engine_ready || s.stalled || s.busy_remaining > 0 {
            return false;
        }
        // SAFETY: caller guarantees `data` is readable for `len` bytes.
        let bytes = unsafe { core::slice::from_raw_parts(data.as_ptr(), len) };
        s.ingest(bytes);
        s.transfers_started += 1;
        s.busy_remaining = s.busy_polls;
        true
    }

    fn transfer_busy(&mut self) -> bool {
        let mut s = self.state.lock();
        s.busy_checks += 1;
        if s.stalled {
            return true;
        }
        if s.busy_remaining > 0 {
            s.busy_remaining -= 1;
            return true;
        }
        false
    }
}

impl SimHandle {
    /// Native RGB565 value at `(x, y)`; 0 outside the screen.
    pub fn pixel(&self, x: u16, y: u16) -> u16 {
        let s = self.state.lock();
        if x >= s.width || y >= s.height {
            return 0;
        }
        s.fb[usize::from(y) * usize::from(s.width) + usize::from(x)]
    }

    /// Each transfer reports busy for this many polls after it starts.
    pub fn set_busy_polls(&self, polls: u32) {
        self.state.lock().busy_polls = polls;
    }

    /// A stalled engine reports busy until un-stalled.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    pub fn transfers_started(&self) -> u32 {
        self.state.lock().transfers_started
    }

    pub fn blocking_writes(&self) -> u32 {
        self.state.lock().blocking_writes
    }

    pub fn busy_checks(&self) -> u32 {
        self.state.lock().busy_checks
    }
}
