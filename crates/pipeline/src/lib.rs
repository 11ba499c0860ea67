//! Buffer allocation and flush pipeline for serial-bus displays.
//!
//! The presentation layer renders into draw buffers handed out by the
//! [`Pipeline`], then calls [`Pipeline::flush`] with each dirty rectangle.
//! The pipeline converts pixels to wire format when needed and pushes them
//! either through the panel's transfer engine (completion reported on a
//! later [`Pipeline::tick`]) or synchronously.
//!
//! Module map:
//! - [`config`]: startup configuration record
//! - [`planner`]: draw/transfer buffer sizing under memory pressure
//! - [`dma`]: whether the asynchronous path may be used
//! - [`flush`]: the flush state machine
//! - [`color`]: indexed and RGB565 to wire-format conversion
//! - [`overlay`]: bus-sharing overlay drawing
//! - [`stats`]: counters and the periodic statistics line

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod color;
pub mod config;
pub mod dma;
pub mod error;
pub mod flush;
pub mod overlay;
pub mod pipeline;
pub mod planner;
pub mod stats;

pub use color::{ColorConverter, ColorMode};
pub use config::{ConfigError, PipelineConfig};
pub use dma::{DmaDisabled, DmaEngine, DmaInputs};
pub use error::PipelineError;
pub use flush::{Completion, FlushPath, FlushScheduler, FlushState, PixelSpan, SubmitOutcome};
pub use lcd_panel::Rect;
pub use overlay::OverlayPath;
pub use pipeline::Pipeline;
pub use planner::{
    BufferAllocationPlanner, BufferPlan, DrawBufferConfig, PlanRequest, TransferBuffer,
};
pub use stats::GraphicsStats;
