//! Error handling infrastructure for the flush pipeline.
//!
//! Provides the `define_error!` macro so every subsystem declares its errors
//! the same way: a subsystem byte, a per-variant code, a human-readable
//! description and an optional `[fatal]` marker.
//!
//! ## Usage
//!
//! ### Simple errors (no inner data)
//! ```ignore
//! define_error! {
//!     pub enum BusError(0x11) {
//!         Timeout = 0x01 => "Bus lock not acquired in time",
//!         Wedged = 0x02 [fatal] => "Bus controller stopped responding",
//!     }
//! }
//! ```
//!
//! ### Nested errors (with inner error type)
//! ```ignore
//! define_error! {
//!     pub enum InitError(0x30) {
//!         Bus(BusError) = 0x01 => "Bus setup failed",
//!     }
//! }
//! ```
//!
//! Fatal errors leave the display unusable until the pipeline is rebuilt.
//! Everything else is recovered locally and only shows up in counters.

#![no_std]

/// Macro to define a pipeline error type with consistent handling.
///
/// Supports both simple variants and nested variants containing inner errors.
#[macro_export]
macro_rules! define_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal $([$severity:ident])? => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier for this error type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Numeric error code: subsystem in the high byte, variant in the low byte.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Short description for log lines.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_error!(@pattern $variant $(($inner))? _unused) => {
                            $desc
                        }
                    )*
                }
            }

            /// Whether this error leaves the pipeline unusable.
            pub const fn is_fatal(&self) -> bool {
                match self {
                    $(
                        $crate::define_error!(@pattern $variant $(($inner))? _unused) => {
                            $crate::define_error!(@fatal $($severity)?)
                        }
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_error!(@display_body self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}
    };

    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    (@fatal fatal) => { true };
    (@fatal) => { false };

    (@display_body $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@display_body $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::format;

    define_error! {
        /// Test error type
        pub enum ProbeError(0xFF) {
            /// Recoverable
            Busy = 0x01 => "Probe busy",
            /// Not recoverable
            Dead = 0x02 [fatal] => "Probe dead",
        }
    }

    define_error! {
        pub enum WrappedError(0xFE) {
            Probe(ProbeError) = 0x01 => "Probe step failed",
            Gone = 0x02 [fatal] => "Device gone",
        }
    }

    #[test]
    fn codes_combine_subsystem_and_variant() {
        assert_eq!(ProbeError::Busy.code(), 0xFF01);
        assert_eq!(ProbeError::Dead.code(), 0xFF02);
        assert_eq!(WrappedError::Probe(ProbeError::Busy).code(), 0xFE01);
        assert_eq!(ProbeError::SUBSYSTEM, 0xFF);
    }

    #[test]
    fn severity_marker_sets_is_fatal() {
        assert!(!ProbeError::Busy.is_fatal());
        assert!(ProbeError::Dead.is_fatal());
        // Nesting does not inherit the inner severity.
        assert!(!WrappedError::Probe(ProbeError::Dead).is_fatal());
        assert!(WrappedError::Gone.is_fatal());
    }

    #[test]
    fn display_includes_code_and_inner() {
        assert_eq!(format!("{}", ProbeError::Busy), "EFF01: Probe busy");
        assert_eq!(
            format!("{}", WrappedError::Probe(ProbeError::Dead)),
            "EFE01: Probe step failed (EFF02: Probe dead)"
        );
        assert_eq!(WrappedError::Gone.name(), "Device gone");
    }
}
