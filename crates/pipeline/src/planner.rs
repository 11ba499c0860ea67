//! Draw and transfer buffer sizing.
//!
//! Memory is tight and fragmented, so the planner walks a descending list
//! of scanline counts and takes the first size a pool will give it. Only
//! failing to place any draw buffer at all is fatal.

use alloc::vec::Vec;

use lcd_hal::{AllocError, CapabilityAllocator, Pool, PoolBuffer};

use crate::error::PipelineError;

/// Free external memory that must remain after a full-frame buffer.
pub const FULL_FRAME_MARGIN: usize = 64 * 1024;

/// Sizes tried after the requested one, before the small steps.
const FALLBACK_LINES: [u16; 2] = [40, 30];
const SMALL_LINES: [u16; 8] = [20, 16, 12, 8, 6, 4, 2, 1];

/// What the planner is asked to provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanRequest {
    pub width: u16,
    pub height: u16,
    pub bits_per_pixel: u8,
    pub full_frame: bool,
    pub prefer_slow_memory: bool,
    pub preferred_lines: u16,
    /// 0 means "as tall as the draw buffer".
    pub transfer_chunk_lines: u16,
    /// Pixels must be rewritten before they reach the wire.
    pub needs_conversion: bool,
    pub async_desired: bool,
}

/// Shape of the draw buffers. Fixed until the pipeline is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawBufferConfig {
    pub lines: u16,
    pub bits_per_pixel: u8,
    pub double_buffered: bool,
    pub pool: Pool,
    pub full_frame: bool,
}

impl DrawBufferConfig {
    /// Bytes of one draw buffer the presentation layer may use.
    pub fn buffer_bytes(&self, width: u16) -> usize {
        usize::from(width) * usize::from(self.lines) * usize::from(self.bits_per_pixel) / 8
    }
}

/// Where the transfer engine reads pixels from.
#[derive(Debug)]
pub enum Staging {
    /// A bounce buffer the pipeline converts into.
    Owned(PoolBuffer),
    /// Straight from the presentation layer's own buffer.
    Direct,
}

#[derive(Debug)]
pub struct TransferBuffer {
    pub lines: u16,
    pub pixel_capacity: usize,
    pub pool: Pool,
    pub storage: Staging,
}

impl TransferBuffer {
    pub fn is_owned(&self) -> bool {
        matches!(self.storage, Staging::Owned(_))
    }
}

/// Everything the planner managed to allocate.
#[derive(Debug)]
pub struct BufferPlan {
    pub draw: DrawBufferConfig,
    pub draw_buffers: Vec<PoolBuffer>,
    /// `None` in full-frame mode, or when a bounce buffer was needed but
    /// none could be had; the pipeline then runs synchronously only.
    pub transfer: Option<TransferBuffer>,
    /// One converted scanline for the synchronous path.
    pub scratch: Option<PoolBuffer>,
}

impl BufferPlan {
    pub fn transfer_required(&self) -> bool {
        !matches!(
            self.transfer,
            Some(TransferBuffer {
                storage: Staging::Direct,
                ..
            })
        )
    }
}

/// Scanline counts to try, tallest first: the request, then the standard
/// fallbacks below it, clipped to the screen height.
pub fn candidate_lines(requested: u16, height: u16) -> Vec<u16> {
    let mut out: Vec<u16> = Vec::with_capacity(1 + FALLBACK_LINES.len() + SMALL_LINES.len());
    let first = requested.max(1);
    out.push(first);
    out.extend(
        FALLBACK_LINES
            .iter()
            .chain(SMALL_LINES.iter())
            .copied()
            .filter(|&l| l < first),
    );
    for l in &mut out {
        *l = (*l).min(height);
    }
    out.retain(|&l| l > 0);
    out.sort_unstable_by(|a, b| b.cmp(a));
    out.dedup();
    out
}

pub struct BufferAllocationPlanner<'a> {
    allocator: &'a CapabilityAllocator,
}

impl<'a> BufferAllocationPlanner<'a> {
    pub fn new(allocator: &'a CapabilityAllocator) -> Self {
        Self { allocator }
    }

    pub fn plan(&self, req: &PlanRequest) -> Result<BufferPlan, PipelineError> {
        if req.width == 0 || req.height == 0 || !matches!(req.bits_per_pixel, 8 | 16) {
            return Err(PipelineError::InvalidGeometry);
        }

        let (mut draw, draw_buffers) = match self.full_frame(req)? {
            Some(plan) => plan,
            None => self.chunked(req)?,
        };

        let transfer = if draw.full_frame {
            None
        } else if !req.needs_conversion && draw.pool.is_dma_capable() {
            Some(TransferBuffer {
                lines: draw.lines,
                pixel_capacity: usize::from(req.width) * usize::from(draw.lines),
                pool: draw.pool,
                storage: Staging::Direct,
            })
        } else {
            self.transfer(req, draw.lines)?
        };

        if let Some(t) = &transfer {
            if t.is_owned() && t.lines < draw.lines && req.async_desired {
                log::info!(
                    "[PLAN] draw lines {} -> {} to match transfer buffer",
                    draw.lines,
                    t.lines
                );
                draw.lines = t.lines;
            }
        } else if !draw.full_frame {
            log::warn!("[PLAN] no transfer buffer, flushes will be synchronous");
        }

        let scratch = self.scratch(req.width);

        log::info!(
            "[PLAN] draw {} lines x{} in {} ({} bpp{}) xfer={}",
            draw.lines,
            if draw.double_buffered { 2 } else { 1 },
            draw.pool,
            draw.bits_per_pixel,
            if draw.full_frame { ", full frame" } else { "" },
            transfer.as_ref().map_or(0, |t| t.lines)
        );

        Ok(BufferPlan {
            draw,
            draw_buffers,
            transfer,
            scratch,
        })
    }

    fn full_frame(
        &self,
        req: &PlanRequest,
    ) -> Result<Option<(DrawBufferConfig, Vec<PoolBuffer>)>, PipelineError> {
        if !req.full_frame {
            return Ok(None);
        }
        let size = buffer_size(req.width, req.height, req.bits_per_pixel)?;
        let free = self.allocator.free_bytes(Pool::External);
        if free <= size.saturating_add(FULL_FRAME_MARGIN) {
            log::warn!(
                "[PLAN] full frame needs {}+{} bytes, external has {}",
                size,
                FULL_FRAME_MARGIN,
                free
            );
            return Ok(None);
        }
        match self.allocator.allocate(&[Pool::External], size, "full_frame") {
            Ok(Some(buf)) => Ok(Some((
                DrawBufferConfig {
                    lines: req.height,
                    bits_per_pixel: req.bits_per_pixel,
                    double_buffered: false,
                    pool: Pool::External,
                    full_frame: true,
                },
                alloc::vec![buf],
            ))),
            Ok(None) | Err(AllocError::Exhausted) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn chunked(
        &self,
        req: &PlanRequest,
    ) -> Result<(DrawBufferConfig, Vec<PoolBuffer>), PipelineError> {
        let (first, second) = if req.prefer_slow_memory {
            (Pool::External, Pool::Dma)
        } else {
            (Pool::Dma, Pool::External)
        };
        let candidates = candidate_lines(req.preferred_lines, req.height);
        for pool in [first, second] {
            for &lines in &candidates {
                let size = buffer_size(req.width, lines, req.bits_per_pixel)?;
                let Some(buffers) = self.draw_pair(pool, size)? else {
                    continue;
                };
                let config = DrawBufferConfig {
                    lines,
                    bits_per_pixel: req.bits_per_pixel,
                    double_buffered: buffers.len() == 2,
                    pool,
                    full_frame: false,
                };
                return Ok((config, buffers));
            }
            log::warn!("[PLAN] no draw buffer fits in {}", pool);
        }
        Err(PipelineError::AllocationExhausted)
    }

    /// Two buffers of `size` if possible, otherwise one.
    fn draw_pair(&self, pool: Pool, size: usize) -> Result<Option<Vec<PoolBuffer>>, PipelineError> {
        let a = match self.allocator.allocate(&[pool], size, "draw_buf_a") {
            Ok(Some(a)) => a,
            Ok(None) | Err(AllocError::Exhausted) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut buffers = alloc::vec![a];
        if let Ok(Some(b)) = self.allocator.allocate(&[pool], size, "draw_buf_b") {
            buffers.push(b);
        }
        Ok(Some(buffers))
    }

    fn transfer(
        &self,
        req: &PlanRequest,
        draw_lines: u16,
    ) -> Result<Option<TransferBuffer>, PipelineError> {
        let requested = match req.transfer_chunk_lines {
            0 => draw_lines,
            n => n.min(draw_lines),
        };
        for lines in candidate_lines(requested, draw_lines) {
            let size = buffer_size(req.width, lines, 16)?;
            match self.allocator.allocate(&[Pool::Dma], size, "xfer_buf") {
                Ok(Some(buf)) => {
                    return Ok(Some(TransferBuffer {
                        lines,
                        pixel_capacity: usize::from(req.width) * usize::from(lines),
                        pool: buf.pool(),
                        storage: Staging::Owned(buf),
                    }));
                }
                Ok(None) | Err(AllocError::Exhausted) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn scratch(&self, width: u16) -> Option<PoolBuffer> {
        match self
            .allocator
            .allocate(&[Pool::Internal, Pool::Dma], usize::from(width) * 2, "sync_scratch")
        {
            Ok(buf) => buf,
            Err(e) => {
                log::warn!("[PLAN] no scanline scratch ({}), per-pixel sync writes", e);
                None
            }
        }
    }
}

fn buffer_size(width: u16, lines: u16, bits_per_pixel: u8) -> Result<usize, PipelineError> {
    usize::from(width)
        .checked_mul(usize::from(lines))
        .and_then(|px| px.checked_mul(usize::from(bits_per_pixel)))
        .map(|bits| bits / 8)
        .ok_or(PipelineError::SizeOverflow)
}
