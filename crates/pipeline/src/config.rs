//! Startup configuration.
//!
//! Read once when the pipeline is built. Changing anything afterwards
//! requires [`crate::Pipeline::reinit`].

use lcd_error::define_error;
use lcd_panel::BackendKind;

use crate::color::ColorMode;
use crate::planner::PlanRequest;

define_error! {
    /// Configuration text errors.
    pub enum ConfigError(0x22) {
        UnknownKey = 0x01 => "Unknown configuration key",
        InvalidValue = 0x02 => "Invalid configuration value",
        /// A non-comment line without `=`.
        MissingEquals = 0x03 => "Expected key = value",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub width: u16,
    pub height: u16,
    /// Draw buffer height to try first, in scanlines.
    pub preferred_line_count: u16,
    /// 8-bit indexed (RGB332) draw buffers instead of RGB565.
    pub reduced_color_mode: bool,
    /// Put draw buffers in external memory first.
    pub slow_memory_for_buffers: bool,
    pub async_default: bool,
    /// Transfer buffer height to try first; 0 means "same as the draw buffer".
    pub transfer_chunk_lines: u16,
    /// One draw buffer covering the whole screen, sync flushes only.
    pub full_frame_bench: bool,
    /// Allow the transfer engine in reduced color mode.
    pub reduced_color_async_experimental: bool,
    /// RGB565 draw buffers already hold big-endian wire order.
    pub source_wire_order: bool,
    pub backend: BackendKind,
    pub stall_timeout_us: u64,
    pub bus_timeout_us: u64,
    pub fallback_cooldown_us: u64,
    /// 0 disables the periodic statistics line.
    pub stats_interval_us: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            preferred_line_count: 40,
            reduced_color_mode: false,
            slow_memory_for_buffers: false,
            async_default: true,
            transfer_chunk_lines: 20,
            full_frame_bench: false,
            reduced_color_async_experimental: false,
            source_wire_order: true,
            backend: BackendKind::Engine,
            stall_timeout_us: 250_000,
            bus_timeout_us: 2_000,
            fallback_cooldown_us: 5_000_000,
            stats_interval_us: 10_000_000,
        }
    }
}

impl PipelineConfig {
    pub fn color_mode(&self) -> ColorMode {
        if self.reduced_color_mode {
            ColorMode::Indexed8
        } else {
            ColorMode::Rgb565
        }
    }

    pub fn bits_per_pixel(&self) -> u8 {
        self.color_mode().bits_per_pixel()
    }

    /// Whether flushed pixels must be rewritten before they can go on the wire.
    pub fn needs_conversion(&self) -> bool {
        self.reduced_color_mode || !self.source_wire_order
    }

    /// What to ask the buffer planner for.
    pub fn plan_request(&self) -> PlanRequest {
        PlanRequest {
            width: self.width,
            height: self.height,
            bits_per_pixel: self.bits_per_pixel(),
            full_frame: self.full_frame_bench,
            prefer_slow_memory: self.slow_memory_for_buffers,
            preferred_lines: self.preferred_line_count,
            transfer_chunk_lines: self.transfer_chunk_lines,
            needs_conversion: self.needs_conversion(),
            async_desired: self.async_default,
        }
    }

    /// Defaults overridden by `key = value` lines. `#` starts a comment.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                log::warn!("[CONFIG] line {}: expected key = value", lineno + 1);
                return Err(ConfigError::MissingEquals);
            };
            if let Err(e) = config.set(key.trim(), value.trim()) {
                log::warn!("[CONFIG] line {}: {} ({})", lineno + 1, e, key.trim());
                return Err(e);
            }
        }
        Ok(config)
    }

    /// Apply one setting.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "width" => self.width = number(value)?,
            "height" => self.height = number(value)?,
            "preferred_line_count" => self.preferred_line_count = number(value)?,
            "reduced_color_mode" => self.reduced_color_mode = flag(value)?,
            "slow_memory_for_buffers" => self.slow_memory_for_buffers = flag(value)?,
            "async_default" => self.async_default = flag(value)?,
            "transfer_chunk_lines" => self.transfer_chunk_lines = number(value)?,
            "full_frame_bench" => self.full_frame_bench = flag(value)?,
            "reduced_color_async_experimental" => {
                self.reduced_color_async_experimental = flag(value)?;
            }
            "source_wire_order" => self.source_wire_order = flag(value)?,
            "backend" => {
                self.backend = BackendKind::parse(value).ok_or(ConfigError::InvalidValue)?;
            }
            "stall_timeout_us" => self.stall_timeout_us = number(value)?,
            "bus_timeout_us" => self.bus_timeout_us = number(value)?,
            "fallback_cooldown_us" => self.fallback_cooldown_us = number(value)?,
            "stats_interval_us" => self.stats_interval_us = number(value)?,
            _ => return Err(ConfigError::UnknownKey),
        }
        Ok(())
    }
}

fn flag(value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue),
    }
}

fn number<T: core::str::FromStr>(value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue)
}
