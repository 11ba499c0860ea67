//! Moving test pattern rendered into draw buffers.

use lcd_panel::Rect;
use lcd_pipeline::{ColorConverter, ColorMode, PipelineConfig};

pub struct Scene {
    width: u16,
    mode: ColorMode,
    wire_order: bool,
    converter: ColorConverter,
}

impl Scene {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            width: cfg.width,
            mode: cfg.color_mode(),
            wire_order: cfg.source_wire_order,
            converter: ColorConverter::new(),
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.mode.bytes_per_pixel()
    }

    /// Render rows `y0..y0 + lines` of `frame` into `out`, in the draw
    /// buffer's pixel format. Returns the rectangle covered.
    pub fn render(&self, frame: u32, y0: u16, lines: u16, out: &mut [u8]) -> Rect {
        let width = usize::from(self.width);
        let count = width * usize::from(lines);
        let bpp = self.bytes_per_pixel();
        for (i, px) in out.chunks_exact_mut(bpp).take(count).enumerate() {
            let x = (i % width) as u16;
            let y = y0 + (i / width) as u16;
            let (r, g, b) = pattern(frame, x, y);
            match self.mode {
                ColorMode::Indexed8 => px[0] = rgb332(r, g, b),
                ColorMode::Rgb565 => {
                    let native = rgb565(r, g, b);
                    let bytes = if self.wire_order {
                        native.to_be_bytes()
                    } else {
                        native.to_ne_bytes()
                    };
                    px.copy_from_slice(&bytes);
                }
            }
        }
        Rect::new(0, y0, self.width, lines)
    }

    /// Native RGB565 value the panel should show at `(x, y)` after `frame`.
    pub fn expected(&self, frame: u32, x: u16, y: u16) -> u16 {
        let (r, g, b) = pattern(frame, x, y);
        match self.mode {
            ColorMode::Indexed8 => u16::from_be(self.converter.lookup(rgb332(r, g, b))),
            ColorMode::Rgb565 => rgb565(r, g, b),
        }
    }
}

/// Diagonal gradient drifting with the frame number.
fn pattern(frame: u32, x: u16, y: u16) -> (u8, u8, u8) {
    let t = frame.wrapping_mul(4);
    let (x, y) = (u32::from(x), u32::from(y));
    (
        (x * 2 + t) as u8,
        (y * 3 + t) as u8,
        (x + y + t * 2) as u8,
    )
}

fn rgb565(r: u8, g: u8, b: u8) -> u16 {
    (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3)
}

fn rgb332(r: u8, g: u8, b: u8) -> u8 {
    (r & 0xE0) | ((g >> 3) & 0x1C) | (b >> 6)
}
