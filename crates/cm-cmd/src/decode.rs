//! # Command Stream Decoder
//!
//! Splits an encoded stream back into commands. Used by the simulated GPU
//! and by tests that assert on composed sequences.

use alloc::vec::Vec;

use cm_core::{Error, Result};

use crate::media::PipelineSelect;
use crate::mi::{
    MI_BATCH_BUFFER_END, MI_BATCH_BUFFER_START, MI_CONDITIONAL_BATCH_BUFFER_END, MI_FLUSH_DW,
    MI_LOAD_REGISTER_IMM, MI_NOOP, MI_STORE_DATA_IMM,
};

// =============================================================================
// OPCODES
// =============================================================================

/// Decoded command identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// MI_NOOP
    Noop,
    /// MI_BATCH_BUFFER_END
    BatchBufferEnd,
    /// MI_BATCH_BUFFER_START
    BatchBufferStart,
    /// MI_CONDITIONAL_BATCH_BUFFER_END
    ConditionalBatchBufferEnd,
    /// MI_STORE_DATA_IMM
    StoreDataImm,
    /// MI_LOAD_REGISTER_IMM
    LoadRegisterImm,
    /// MI_FLUSH_DW
    FlushDw,
    /// PIPE_CONTROL
    PipeControl,
    /// PIPELINE_SELECT
    PipelineSelect,
    /// STATE_BASE_ADDRESS
    StateBaseAddress,
    /// STATE_SIP
    StateSip,
    /// GPGPU_CSR_BASE_ADDRESS
    CsrBaseAddress,
    /// MEDIA_VFE_STATE
    MediaVfeState,
    /// MEDIA_CURBE_LOAD
    MediaCurbeLoad,
    /// MEDIA_INTERFACE_DESCRIPTOR_LOAD
    MediaInterfaceDescriptorLoad,
    /// MEDIA_STATE_FLUSH
    MediaStateFlush,
    /// MEDIA_OBJECT
    MediaObject,
    /// MEDIA_OBJECT_WALKER
    MediaObjectWalker,
    /// GPGPU_WALKER
    GpgpuWalker,
    /// VEBOX_SURFACE_STATE
    VeboxSurfaceState,
    /// VEBOX_STATE
    VeboxState,
    /// VEBOX_DI_IECP
    VeboxDiIecp,
    /// Well-formed but not produced by this crate
    Other(u32),
}

impl Opcode {
    /// Identify the command a header dword starts
    pub fn of(header: u32) -> Opcode {
        match header >> 29 {
            0 => match (header >> 23) & 0x3F {
                MI_NOOP => Opcode::Noop,
                MI_BATCH_BUFFER_END => Opcode::BatchBufferEnd,
                MI_BATCH_BUFFER_START => Opcode::BatchBufferStart,
                MI_CONDITIONAL_BATCH_BUFFER_END => Opcode::ConditionalBatchBufferEnd,
                MI_STORE_DATA_IMM => Opcode::StoreDataImm,
                MI_LOAD_REGISTER_IMM => Opcode::LoadRegisterImm,
                MI_FLUSH_DW => Opcode::FlushDw,
                _ => Opcode::Other(header & 0xFFFF_0000),
            },
            3 => {
                let key = (header >> 16) & 0x1FFF;
                match (key >> 11, (key >> 8) & 0x7, key & 0xFF) {
                    (3, 2, 0) => Opcode::PipeControl,
                    (1, 1, 4) => Opcode::PipelineSelect,
                    (0, 1, 1) => Opcode::StateBaseAddress,
                    (0, 1, 2) => Opcode::StateSip,
                    (0, 1, 4) => Opcode::CsrBaseAddress,
                    (2, 0, 0) => Opcode::MediaVfeState,
                    (2, 0, 1) => Opcode::MediaCurbeLoad,
                    (2, 0, 2) => Opcode::MediaInterfaceDescriptorLoad,
                    (2, 0, 4) => Opcode::MediaStateFlush,
                    (2, 1, 0) => Opcode::MediaObject,
                    (2, 1, 3) => Opcode::MediaObjectWalker,
                    (2, 1, 5) => Opcode::GpgpuWalker,
                    (2, 4, 0) => Opcode::VeboxSurfaceState,
                    (2, 4, 2) => Opcode::VeboxState,
                    (2, 4, 3) => Opcode::VeboxDiIecp,
                    _ => Opcode::Other(header & 0xFFFF_0000),
                }
            }
            _ => Opcode::Other(header & 0xFFFF_0000),
        }
    }

    /// Whether this is a thread dispatch command
    pub const fn is_dispatch(self) -> bool {
        matches!(self, Self::MediaObject | Self::MediaObjectWalker | Self::GpgpuWalker)
    }
}

/// Dword count of the command starting with `header`
pub fn command_length(header: u32) -> Result<usize> {
    match header >> 29 {
        0 => {
            if (header >> 23) & 0x3F < 0x10 {
                Ok(1)
            } else {
                Ok((header & 0xFF) as usize + 2)
            }
        }
        3 => {
            if header & 0xFFFF_0000 == PipelineSelect::BASE & 0xFFFF_0000 {
                Ok(1)
            } else if (header >> 27) & 0x3 == 2 {
                Ok((header & 0xFFFF) as usize + 2)
            } else {
                Ok((header & 0xFF) as usize + 2)
            }
        }
        _ => Err(Error::InvalidParameter),
    }
}

// =============================================================================
// DECODED COMMAND
// =============================================================================

/// One command split out of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    /// Identity
    pub opcode: Opcode,
    /// Dword index of the header
    pub offset: usize,
    /// Every dword, header included
    pub dwords: Vec<u32>,
}

/// Decode a complete stream
pub fn decode(stream: &[u32]) -> Result<Vec<DecodedCommand>> {
    let mut commands = Vec::new();
    let mut pos = 0;
    while pos < stream.len() {
        let header = stream[pos];
        let len = command_length(header)?;
        let end = pos + len;
        if end > stream.len() {
            log::warn!("cm-cmd: truncated command 0x{:08x} at dword {}", header, pos);
            return Err(Error::InvalidParameter);
        }
        commands.push(DecodedCommand {
            opcode: Opcode::of(header),
            offset: pos,
            dwords: stream[pos..end].to_vec(),
        });
        pos = end;
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CommandBuffer;
    use crate::media::{GpuPipeline, MediaObjectWalker, MediaVfeState, StateBaseAddress};
    use crate::mi::{MiBatchBufferEnd, MiLoadRegisterImm, MiNoop, PipeControl};
    use crate::vebox::VeboxDiIecp;

    #[test]
    fn test_decode_mixed_stream() {
        let mut cb = CommandBuffer::new(4096);
        cb.add(&PipeControl::default()).unwrap();
        cb.add(&MiLoadRegisterImm::single(0x2580, 6)).unwrap();
        cb.add(&PipelineSelect {
            pipeline: GpuPipeline::Media,
        })
        .unwrap();
        cb.add(&StateBaseAddress::default()).unwrap();
        cb.add(&MediaVfeState::default()).unwrap();
        cb.add(&MediaObjectWalker::default()).unwrap();
        cb.add(&VeboxDiIecp::default()).unwrap();
        cb.add(&MiNoop).unwrap();
        cb.add(&MiBatchBufferEnd).unwrap();

        let ops: Vec<Opcode> = decode(cb.dwords()).unwrap().iter().map(|c| c.opcode).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::PipeControl,
                Opcode::LoadRegisterImm,
                Opcode::PipelineSelect,
                Opcode::StateBaseAddress,
                Opcode::MediaVfeState,
                Opcode::MediaObjectWalker,
                Opcode::VeboxDiIecp,
                Opcode::Noop,
                Opcode::BatchBufferEnd,
            ]
        );
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let mut cb = CommandBuffer::new(64);
        cb.add(&PipeControl::default()).unwrap();
        let dw = &cb.dwords()[..3];
        assert_eq!(decode(dw), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_offsets_are_dword_indices() {
        let mut cb = CommandBuffer::new(64);
        cb.add(&MiNoop).unwrap();
        cb.add(&PipeControl::default()).unwrap();
        cb.add(&MiBatchBufferEnd).unwrap();
        let cmds = decode(cb.dwords()).unwrap();
        assert_eq!(cmds[1].offset, 1);
        assert_eq!(cmds[2].offset, 7);
        assert!(!cmds[1].opcode.is_dispatch());
    }
}
