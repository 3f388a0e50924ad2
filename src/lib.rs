//! Graphics stack validation for Linux
//!
//! Checks that the machine's graphics stack is correctly configured by
//! exercising it for real: mode-setting against the live display, GEM
//! buffer-object round trips per vendor, and a GBM/EGL render-surface
//! binding, asserting success at each step.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  check runner (table)                   │
//! └─────────────────────────────────────────────────────────┘
//!      │             │                        │
//! ┌──────────┐ ┌───────────┐ ┌───────────────────────────────┐
//! │ gem      │ │environment│ │       DisplayContext          │
//! │ (per     │ │ (lspci,   │ │ device -> resolve -> snapshot │
//! │  vendor) │ │  X log)   │ │  -> GBM/EGL -> flip -> undo   │
//! └──────────┘ └───────────┘ └───────────────────────────────┘
//!      │                                      │
//! ┌─────────────────────────────────────────────────────────┐
//! │        DRM/KMS + GEM ioctls, libgbm, libEGL             │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The display lifecycle is the stateful core: resources must be released
//! in exact reverse acquisition order, and a pending page flip gates the
//! start of that unwind. Everything else is a single-shot check.

pub mod context;
pub mod device;
pub mod environment;
pub mod error;
pub mod flip;
pub mod gem;
pub mod gem_ffi;
pub mod kms;
pub mod runner;
pub mod surface;

pub use context::DisplayContext;
pub use device::Card;
pub use error::Error;
pub use gem::Vendor;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
