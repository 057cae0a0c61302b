//! # CM HAL Core
//!
//! Foundational types, errors and configuration for the C-for-Media
//! hardware abstraction layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        cm-core                              │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │   Config    │  │     Error           │  │
//! │  │ (TaskId,    │  │ (Device     │  │   Handling          │  │
//! │  │  Handles)   │  │  Options)   │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌─────────────────────────────┐  ┌─────────────────────┐  │
//! │  │  Platform capabilities      │  │  Limits/constants   │  │
//! │  └─────────────────────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod caps;
pub mod config;
pub mod consts;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use caps::{GtSystemInfo, Platform, PlatformInfo, SkuFlags, WaFlags};
pub use config::{DeviceOptions, L3Config, PowerOption, UserFeatures};
pub use error::{Error, Result};
pub use types::*;
