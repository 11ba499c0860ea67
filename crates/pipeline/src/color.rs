//! Draw-buffer pixels to controller wire format.
//!
//! Indexed mode stores one RGB332 byte per pixel; those go through a
//! 256-entry table of wire-order RGB565 values built on first use.
//! Native RGB565 only needs its bytes put in wire order.

use lcd_panel::to_wire;
use spin::Once;

/// Pixel format of the draw buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb565,
    /// RGB332, one byte per pixel.
    Indexed8,
}

impl ColorMode {
    pub const fn bits_per_pixel(self) -> u8 {
        match self {
            ColorMode::Rgb565 => 16,
            ColorMode::Indexed8 => 8,
        }
    }

    pub const fn bytes_per_pixel(self) -> usize {
        self.bits_per_pixel() as usize / 8
    }
}

pub struct ColorConverter {
    lut: Once<[u16; 256]>,
}

impl ColorConverter {
    pub const fn new() -> Self {
        Self { lut: Once::new() }
    }

    fn lut(&self) -> &[u16; 256] {
        self.lut.call_once(build_lut)
    }

    /// Wire-order RGB565 for one RGB332 index.
    pub fn lookup(&self, index: u8) -> u16 {
        self.lut()[usize::from(index)]
    }

    /// Expand `count` indexed pixels from `src` into `dst`.
    ///
    /// `count` is clamped to both slice lengths.
    pub fn convert(&self, dst: &mut [u16], src: &[u8], count: usize) {
        let count = count.min(dst.len()).min(src.len());
        if count == 0 {
            return;
        }
        let lut = self.lut();
        write_pairs(&mut dst[..count], |i| lut[usize::from(src[i])]);
    }

    /// Put `count` native RGB565 pixels from `src` into `dst` in wire order.
    pub fn convert_rgb565(&self, dst: &mut [u16], src: &[u16], count: usize) {
        let count = count.min(dst.len()).min(src.len());
        if count == 0 {
            return;
        }
        write_pairs(&mut dst[..count], |i| to_wire(src[i]));
    }
}

impl Default for ColorConverter {
    fn default() -> Self {
        Self::new()
    }
}

fn build_lut() -> [u16; 256] {
    let mut lut = [0u16; 256];
    for (index, slot) in lut.iter_mut().enumerate() {
        let r3 = (index >> 5) & 0x7;
        let g3 = (index >> 2) & 0x7;
        let b2 = index & 0x3;
        let r5 = (r3 * 31 + 3) / 7;
        let g6 = (g3 * 63 + 3) / 7;
        let b5 = (b2 * 31 + 1) / 3;
        *slot = to_wire(((r5 << 11) | (g6 << 5) | b5) as u16);
    }
    lut
}

/// Fill `dst` with `pixel(i)`, two pixels per 32-bit store when `dst` is
/// word aligned. The odd tail is always a single store.
fn write_pairs(dst: &mut [u16], mut pixel: impl FnMut(usize) -> u16) {
    let count = dst.len();
    let even = count & !1;
    let paired = match bytemuck::try_cast_slice_mut::<u16, u32>(&mut dst[..even]) {
        Ok(words) => {
            for (i, word) in words.iter_mut().enumerate() {
                *word = pack(pixel(2 * i), pixel(2 * i + 1));
            }
            true
        }
        Err(_) => false,
    };
    if !paired {
        for (i, px) in dst[..even].iter_mut().enumerate() {
            *px = pixel(i);
        }
    }
    if count > even {
        dst[even] = pixel(even);
    }
}

/// Two `u16`s as one `u32` with `first` at the lower address.
#[inline]
fn pack(first: u16, second: u16) -> u32 {
    #[cfg(target_endian = "little")]
    {
        u32::from(first) | (u32::from(second) << 16)
    }
    #[cfg(target_endian = "big")]
    {
        (u32::from(first) << 16) | u32::from(second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 + 11) as u8).collect()
    }

    #[test]
    fn lut_endpoints() {
        let conv = ColorConverter::new();
        assert_eq!(conv.lookup(0x00), to_wire(0x0000));
        assert_eq!(conv.lookup(0xFF), to_wire(0xFFFF));
        // Pure red, green and blue.
        assert_eq!(conv.lookup(0b111_000_00), to_wire(0xF800));
        assert_eq!(conv.lookup(0b000_111_00), to_wire(0x07E0));
        assert_eq!(conv.lookup(0b000_000_11), to_wire(0x001F));
    }

    #[test]
    fn lut_rounds_midpoints() {
        let conv = ColorConverter::new();
        // r3 = 4 -> (4*31+3)/7 = 18, g3 = 2 -> (2*63+3)/7 = 18, b2 = 1 -> 32/3 = 10
        let native = (18 << 11) | (18 << 5) | 10;
        assert_eq!(conv.lookup(0b100_010_01), to_wire(native));
    }

    #[test]
    fn convert_matches_lookup_for_all_lengths() {
        let conv = ColorConverter::new();
        for len in [0usize, 1, 2, 3, 4097] {
            let src = indices(len);
            let mut dst = vec![0u16; len];
            conv.convert(&mut dst, &src, len);
            for i in 0..len {
                assert_eq!(dst[i], conv.lookup(src[i]), "len {len} index {i}");
            }
        }
    }

    #[test]
    fn convert_handles_misaligned_destination() {
        let conv = ColorConverter::new();
        let src = indices(9);
        let mut backing = vec![0u16; 10];
        // Offset by one u16 so the start is not word aligned.
        let dst = &mut backing[1..];
        conv.convert(dst, &src, 9);
        for i in 0..9 {
            assert_eq!(dst[i], conv.lookup(src[i]));
        }
        assert_eq!(backing[0], 0);
    }

    #[test]
    fn convert_clamps_and_leaves_rest() {
        let conv = ColorConverter::new();
        let src = indices(4);
        let mut dst = vec![0xAAAAu16; 8];
        conv.convert(&mut dst, &src, 100);
        assert_eq!(dst[3], conv.lookup(src[3]));
        assert_eq!(dst[4], 0xAAAA);
        conv.convert(&mut dst, &src, 0);
        assert_eq!(dst[0], conv.lookup(src[0]));
    }

    #[test]
    fn rgb565_goes_big_endian() {
        let conv = ColorConverter::new();
        let src = [0x1234u16, 0xF800, 0x001F];
        let mut dst = [0u16; 3];
        conv.convert_rgb565(&mut dst, &src, 3);
        let bytes: &[u8] = bytemuck::cast_slice(&dst);
        assert_eq!(bytes, &[0x12, 0x34, 0xF8, 0x00, 0x00, 0x1F]);
    }

    #[test]
    fn modes_report_depth() {
        assert_eq!(ColorMode::Rgb565.bits_per_pixel(), 16);
        assert_eq!(ColorMode::Indexed8.bytes_per_pixel(), 1);
    }
}
