//! # CM HAL
//!
//! Task-execution engine of the C-for-Media hardware abstraction layer.
//! Turns a task (kernels, arguments, thread spaces, synchronization
//! bitmaps) into one GPU command buffer, submits it through the OS
//! collaborator and reports its progress from GPU-written timestamps.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      CmHal (device.rs)                           │
//! │   execute_* ─► composer ─────────────────► OsInterface::submit   │
//! │                  │                                               │
//! │  ┌─────────┐ ┌───┴──────┐ ┌──────────┐ ┌────────┐ ┌───────────┐  │
//! │  │ task    │ │ kernel   │ │ resource │ │ heap   │ │ sync      │  │
//! │  │ slots   │ │ cache    │ │ registry │ │ GSH/   │ │ timestamps│  │
//! │  │         │ │          │ │ + BT     │ │ DSH/SSH│ │ tags      │  │
//! │  └─────────┘ └──────────┘ └──────────┘ └────────┘ └───────────┘  │
//! │  ┌──────────────────────────┐ ┌────────────────────────────────┐ │
//! │  │ gen: per-generation      │ │ vebox: video-enhancement path  │ │
//! │  │ profiles                 │ │                                │ │
//! │  └──────────────────────────┘ └────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use cm_core::{DeviceOptions, Platform, PlatformInfo, TaskStatus, UserFeatures};
//! use cm_hal::params::{KernelId, KernelParam, TaskParam, ThreadSpace};
//! use cm_hal::{CmHal, CmHalState};
//! use cm_os::SimOs;
//!
//! let os = SimOs::new();
//! let gpu = os.gpu();
//! let mut hal = CmHalState::create(
//!     os,
//!     PlatformInfo::for_platform(Platform::Gen9),
//!     DeviceOptions::default(),
//!     UserFeatures::default(),
//! )
//! .unwrap();
//!
//! let task = TaskParam {
//!     thread_space: Some(ThreadSpace::new(8, 8)),
//!     ..TaskParam::new(vec![KernelParam::new(KernelId::new(1), vec![0; 128])])
//! };
//! let id = hal.execute_task(&task).unwrap();
//! gpu.run();
//! assert_eq!(hal.query_task(id).unwrap().status, TaskStatus::Finished);
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod composer;
pub mod device;
pub mod gen;
pub mod heap;
pub mod kernel_cache;
pub mod params;
pub mod resource;
pub mod sync;
pub mod task;
pub mod vebox;

// Re-exports for convenience
pub use device::{CapsParam, CmHal, CmHalState};
pub use gen::{profile_for, HardwareProfile, PreemptionMode};
pub use kernel_cache::KernelCache;
pub use params::{ArgValue, KernelId, KernelParam, TaskParam, ThreadGroupSpace, ThreadSpace};
pub use resource::{ResourceRegistry, SurfaceHandle};
pub use sync::StateBufferType;
pub use task::{TaskReport, TaskTable};
pub use vebox::{VeboxParam, VeboxSettings};
