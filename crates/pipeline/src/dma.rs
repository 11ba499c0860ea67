//! Whether flushes may use the panel's transfer engine.
//!
//! Decided once at init from configuration and what the planner got, then
//! temporarily revoked by a cooldown whenever a transfer stalls.

use core::fmt;

use lcd_panel::{Panel, PanelLink};

/// Why the asynchronous path is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDisabled {
    ByConfig,
    FullFrame,
    /// Indexed mode without the experimental opt-in.
    IndexedNotOptedIn,
    NoTransferBuffer,
    EngineInitFailed,
}

impl fmt::Display for DmaDisabled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DmaDisabled::ByConfig => "disabled by configuration",
            DmaDisabled::FullFrame => "full-frame mode",
            DmaDisabled::IndexedNotOptedIn => "indexed mode without opt-in",
            DmaDisabled::NoTransferBuffer => "no transfer buffer",
            DmaDisabled::EngineInitFailed => "transfer engine did not initialize",
        })
    }
}

/// Facts the decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaInputs {
    pub async_default: bool,
    pub full_frame: bool,
    pub indexed: bool,
    pub indexed_opt_in: bool,
    pub transfer_required: bool,
    pub has_transfer_buffer: bool,
}

pub struct DmaEngine {
    disabled: Option<DmaDisabled>,
    cooldown_us: u64,
    cooldown_until: Option<u64>,
}

impl DmaEngine {
    /// Engine that starts out disabled by configuration.
    pub const fn new(cooldown_us: u64) -> Self {
        Self {
            disabled: Some(DmaDisabled::ByConfig),
            cooldown_us,
            cooldown_until: None,
        }
    }

    /// Decide whether async flushing is available and bring up the engine
    /// if so. The hardware is only touched once every other check passed.
    pub fn initialize<L: PanelLink>(&mut self, panel: &mut Panel<L>, inputs: &DmaInputs) -> bool {
        let verdict = if !inputs.async_default {
            Err(DmaDisabled::ByConfig)
        } else if inputs.full_frame {
            Err(DmaDisabled::FullFrame)
        } else if inputs.indexed && !inputs.indexed_opt_in {
            Err(DmaDisabled::IndexedNotOptedIn)
        } else if inputs.transfer_required && !inputs.has_transfer_buffer {
            Err(DmaDisabled::NoTransferBuffer)
        } else if !panel.init_dma() {
            Err(DmaDisabled::EngineInitFailed)
        } else {
            Ok(())
        };

        match verdict {
            Ok(()) => {
                self.disabled = None;
                self.cooldown_until = None;
                log::info!("[DMA] async flush enabled on {} backend", panel.name());
                true
            }
            Err(reason) => {
                self.disabled = Some(reason);
                log::info!("[DMA] async flush off: {}", reason);
                false
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled.is_none()
    }

    pub fn disabled_reason(&self) -> Option<DmaDisabled> {
        self.disabled
    }

    /// Enabled and not cooling down. Clears an expired cooldown.
    pub fn is_eligible(&mut self, now_us: u64) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.cooldown_until {
            Some(until) if now_us < until => false,
            Some(_) => {
                self.cooldown_until = None;
                log::info!("[DMA] cooldown over, async flush resumes");
                true
            }
            None => true,
        }
    }

    /// Refuse async flushes for the configured cooldown from `now_us`.
    pub fn enter_cooldown(&mut self, now_us: u64) {
        self.cooldown_until = Some(now_us.saturating_add(self.cooldown_us));
        log::warn!("[DMA] async flush paused for {}us", self.cooldown_us);
    }

    pub fn in_cooldown(&self, now_us: u64) -> bool {
        self.cooldown_until.is_some_and(|until| now_us < until)
    }
}
