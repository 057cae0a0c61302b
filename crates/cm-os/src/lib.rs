//! # CM HAL OS Interface
//!
//! The downstream collaborator the task-execution engine drives: memory
//! resources, command-buffer acquisition and submission, GPU contexts and
//! cross-engine barriers.
//!
//! [`SimOs`] is an in-memory implementation whose [`SimGpu`] handle executes
//! submitted command streams, writing timestamps and immediates into
//! resource memory the same way hardware would.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod scope;
pub mod sim;
pub mod traits;

pub use scope::CommandBufferScope;
pub use sim::{SimGpu, SimOs};
pub use traits::{LockFlags, OsInterface, ResourceDesc};
