//! Flush counters and the periodic `[GFX]` line.

use core::fmt;

use crate::flush::FlushPath;
use crate::planner::{DrawBufferConfig, TransferBuffer};

/// Counters since the last (re)initialisation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphicsStats {
    pub flush_count: u32,
    pub dma_flush_count: u32,
    pub sync_flush_count: u32,
    pub total_flush_us: u64,
    pub max_flush_us: u64,
    pub stall_count: u32,
    pub recovery_count: u32,
    pub async_fallback_count: u32,
    pub busy_poll_count: u32,
    pub deferred_count: u32,
    pub overlay_skipped: u32,
}

impl GraphicsStats {
    /// Count one finished flush. Recovered flushes are counted by the
    /// stall counters instead.
    pub fn record_flush(&mut self, path: FlushPath, elapsed_us: u64) {
        match path {
            FlushPath::Async => self.dma_flush_count += 1,
            FlushPath::Sync => self.sync_flush_count += 1,
            FlushPath::Recovered => return,
        }
        self.flush_count += 1;
        self.total_flush_us += elapsed_us;
        self.max_flush_us = self.max_flush_us.max(elapsed_us);
    }

    pub fn avg_flush_us(&self) -> u64 {
        if self.flush_count == 0 {
            0
        } else {
            self.total_flush_us / u64::from(self.flush_count)
        }
    }

    /// The statistics line together with the buffer geometry.
    pub fn report<'a>(
        &'a self,
        draw: &'a DrawBufferConfig,
        transfer: Option<&'a TransferBuffer>,
    ) -> StatsReport<'a> {
        StatsReport {
            stats: self,
            draw,
            transfer,
        }
    }
}

pub struct StatsReport<'a> {
    stats: &'a GraphicsStats,
    draw: &'a DrawBufferConfig,
    transfer: Option<&'a TransferBuffer>,
}

impl fmt::Display for StatsReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.stats;
        write!(
            f,
            "[GFX] flushes={} dma={} sync={} avg_us={} max_us={} stalls={} recoveries={} \
             fallbacks={} busy_polls={} deferred={} lines={} bpp={} double={} pool={} \
             full_frame={} xfer=",
            s.flush_count,
            s.dma_flush_count,
            s.sync_flush_count,
            s.avg_flush_us(),
            s.max_flush_us,
            s.stall_count,
            s.recovery_count,
            s.async_fallback_count,
            s.busy_poll_count,
            s.deferred_count,
            self.draw.lines,
            self.draw.bits_per_pixel,
            self.draw.double_buffered,
            self.draw.pool,
            self.draw.full_frame,
        )?;
        match self.transfer {
            Some(t) => write!(f, "{}", t.lines),
            None => f.write_str("none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcd_hal::Pool;

    #[test]
    fn paths_split_and_timing_tracks() {
        let mut s = GraphicsStats::default();
        s.record_flush(FlushPath::Async, 100);
        s.record_flush(FlushPath::Sync, 300);
        s.record_flush(FlushPath::Recovered, 9_999);
        assert_eq!(s.flush_count, 2);
        assert_eq!(s.dma_flush_count, 1);
        assert_eq!(s.sync_flush_count, 1);
        assert_eq!(s.avg_flush_us(), 200);
        assert_eq!(s.max_flush_us, 300);
    }

    #[test]
    fn empty_average_is_zero() {
        assert_eq!(GraphicsStats::default().avg_flush_us(), 0);
    }

    #[test]
    fn report_line_format() {
        let mut s = GraphicsStats::default();
        s.record_flush(FlushPath::Async, 50);
        s.busy_poll_count = 3;
        let draw = DrawBufferConfig {
            lines: 40,
            bits_per_pixel: 16,
            double_buffered: true,
            pool: Pool::Dma,
            full_frame: false,
        };
        assert_eq!(
            s.report(&draw, None).to_string(),
            "[GFX] flushes=1 dma=1 sync=0 avg_us=50 max_us=50 stalls=0 recoveries=0 \
             fallbacks=0 busy_polls=3 deferred=0 lines=40 bpp=16 double=true pool=dma \
             full_frame=false xfer=none"
        );
    }
}
