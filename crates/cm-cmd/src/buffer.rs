//! # Command Buffer
//!
//! Bounded dword stream with checkpoint/rewind.
//!
//! The buffer mirrors the OS command-buffer contract: a byte offset that
//! only grows while commands are appended, and a signed `remaining` count.
//! A command that does not fit is rejected whole, so the stream never holds
//! a truncated command. Rewinding to a [`Checkpoint`] restores the stream
//! byte-for-byte.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use cm_core::{Error, Result};

// =============================================================================
// ENCODING
// =============================================================================

/// Largest command the encoders produce, in dwords
pub const MAX_COMMAND_DWORDS: usize = 64;

/// Scratch storage a command encodes into
pub type Dwords = ArrayVec<u32, MAX_COMMAND_DWORDS>;

/// A hardware command that can be appended to a [`CommandBuffer`]
pub trait Encode {
    /// Append the command's dwords
    fn encode(&self, out: &mut Dwords);

    /// Command name for tracing
    fn name(&self) -> &'static str;
}

// =============================================================================
// CHECKPOINT
// =============================================================================

/// Saved offset and remaining capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Byte offset
    pub offset: u32,
    /// Remaining bytes
    pub remaining: i32,
}

// =============================================================================
// COMMAND BUFFER
// =============================================================================

/// GPU command buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuffer {
    /// Encoded dwords; `data.len() * 4` is the byte offset
    data: Vec<u32>,
    /// Capacity in bytes
    capacity: u32,
    /// Bytes left
    remaining: i32,
}

impl CommandBuffer {
    /// Create an empty buffer of `capacity` bytes
    pub fn new(capacity: u32) -> Self {
        Self {
            data: Vec::with_capacity(capacity as usize / 4),
            capacity,
            remaining: capacity as i32,
        }
    }

    /// Create a buffer that already holds `data`
    pub fn with_contents(capacity: u32, data: Vec<u32>) -> Self {
        let used = (data.len() * 4) as i32;
        Self {
            data,
            capacity,
            remaining: capacity as i32 - used,
        }
    }

    /// Byte offset of the next command
    #[inline]
    pub fn offset(&self) -> u32 {
        (self.data.len() * 4) as u32
    }

    /// Bytes left
    #[inline]
    pub fn remaining(&self) -> i32 {
        self.remaining
    }

    /// Capacity in bytes
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Encoded stream
    #[inline]
    pub fn dwords(&self) -> &[u32] {
        &self.data
    }

    /// Whether nothing has been written
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append raw dwords, all or nothing
    pub fn emit(&mut self, dwords: &[u32]) -> Result<()> {
        let needed = (dwords.len() * 4) as u32;
        if needed as i64 > self.remaining as i64 {
            return Err(Error::BufferOverflow {
                needed,
                available: self.remaining,
            });
        }
        self.data.extend_from_slice(dwords);
        self.remaining -= needed as i32;
        Ok(())
    }

    /// Encode and append one command
    pub fn add<C: Encode + ?Sized>(&mut self, cmd: &C) -> Result<()> {
        let mut dwords = Dwords::new();
        cmd.encode(&mut dwords);
        log::trace!("cm-cmd: {} ({} dwords) at 0x{:x}", cmd.name(), dwords.len(), self.offset());
        self.emit(&dwords)
    }

    /// Current position
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            offset: self.offset(),
            remaining: self.remaining,
        }
    }

    /// Drop everything written after `checkpoint`
    pub fn rewind(&mut self, checkpoint: Checkpoint) {
        self.data.truncate(checkpoint.offset as usize / 4);
        self.remaining = checkpoint.remaining;
    }

    /// Discard all content
    pub fn reset(&mut self) {
        self.data.clear();
        self.remaining = self.capacity as i32;
    }

    /// Little-endian byte image of the stream
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|dw| dw.to_le_bytes()).collect()
    }

    /// Take the stream
    pub fn into_dwords(self) -> Vec<u32> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::{MiBatchBufferEnd, MiNoop, PipeControl};

    #[test]
    fn test_emit_tracks_offset_and_remaining() {
        let mut cb = CommandBuffer::new(64);
        cb.add(&MiNoop).unwrap();
        cb.add(&MiBatchBufferEnd).unwrap();
        assert_eq!(cb.offset(), 8);
        assert_eq!(cb.remaining(), 56);
    }

    #[test]
    fn test_overflow_rejects_whole_command() {
        let mut cb = CommandBuffer::new(16);
        cb.add(&MiNoop).unwrap();
        let before = cb.clone();
        let err = cb.add(&PipeControl::default()).unwrap_err();
        assert_eq!(err, Error::BufferOverflow { needed: 24, available: 12 });
        assert_eq!(cb, before);
    }

    #[test]
    fn test_rewind_restores_exact_state() {
        let mut cb = CommandBuffer::with_contents(256, alloc::vec![0xAAAA_AAAA, 0xBBBB_BBBB]);
        let cp = cb.checkpoint();
        let before = cb.clone();
        cb.add(&PipeControl::default()).unwrap();
        cb.add(&MiBatchBufferEnd).unwrap();
        cb.rewind(cp);
        assert_eq!(cb, before);
        assert_eq!(cb.offset(), 8);
        assert_eq!(cb.remaining(), 248);
    }

    #[test]
    fn test_to_bytes_little_endian() {
        let cb = CommandBuffer::with_contents(16, alloc::vec![0x0500_0000]);
        assert_eq!(cb.to_bytes(), alloc::vec![0x00, 0x00, 0x00, 0x05]);
    }
}
