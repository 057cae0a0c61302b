//! # CM HAL Commands
//!
//! GPU command buffer management and per-command encoding.
//!
//! Every command is a sequence of little-endian dwords. The header dword
//! carries the command type in bits 31:29:
//!
//! ```text
//! MI (type 0)       31:29 = 0 | 28:23 opcode    | 7:0 length
//! GFXPIPE (type 3)  31:29 = 3 | 28:27 pipeline  | 26:24 opcode | 23:16 sub-opcode | length
//! ```
//!
//! The length field holds the total dword count minus two. Single-dword
//! commands (MI opcodes below 0x10, PIPELINE_SELECT) carry no length.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod buffer;
pub mod decode;
pub mod media;
pub mod mi;
pub mod vebox;

pub use buffer::{Checkpoint, CommandBuffer, Dwords, Encode};
pub use decode::{decode, command_length, DecodedCommand, Opcode};
pub use media::{
    GpgpuWalker, GpuPipeline, MediaCurbeLoad, MediaInterfaceDescriptorLoad, MediaObject,
    MediaObjectWalker, MediaStateFlush, MediaVfeState, PipelineSelect, StateBaseAddress,
    StateSip, GpgpuCsrBaseAddress, WalkerPoint,
};
pub use mi::{
    CompareOp, MiBatchBufferEnd, MiBatchBufferStart, MiConditionalBatchBufferEnd, MiFlushDw,
    MiLoadRegisterImm, MiNoop, MiStoreDataImm, PipeControl, PipeControlFlags, PostSync,
};
pub use vebox::{VeboxDiIecp, VeboxState, VeboxStateFlags, VeboxSurfaceState};

// =============================================================================
// HEADER HELPERS
// =============================================================================

/// MI command header
pub(crate) const fn mi_header(opcode: u32, dwords: u32) -> u32 {
    (opcode << 23) | (dwords - 2)
}

/// GFXPIPE command header
pub(crate) const fn gfx_header(pipeline: u32, opcode: u32, sub_opcode: u32, dwords: u32) -> u32 {
    (3 << 29) | (pipeline << 27) | (opcode << 24) | (sub_opcode << 16) | (dwords - 2)
}
