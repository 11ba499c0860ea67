//! Serial-bus display controller drivers.
//!
//! A panel sits behind a [`PanelLink`] (the physical wiring) and is driven
//! through one of exactly two backends:
//!
//! - [`EnginePanel`]: streams pixel blocks through the hardware transfer
//!   engine and reports busy while a block is in flight.
//! - [`DirectPanel`]: CPU-driven blocking writes only.
//!
//! [`Panel`] is the closed enum over both; [`PanelSlot`] picks one on first
//! use and hands out the same instance afterwards.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod draw;
pub mod link;
pub mod panel;
pub mod sim;
pub mod slot;

pub use link::PanelLink;
pub use panel::{to_wire, BackendKind, DirectPanel, EnginePanel, Panel, Rect};
pub use sim::{SimHandle, SimLink};
pub use slot::PanelSlot;
