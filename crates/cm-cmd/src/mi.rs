//! # MI Commands
//!
//! Memory-interface commands shared by every engine, plus PIPE_CONTROL.

use arrayvec::ArrayVec;
use bitflags::bitflags;
use cm_core::GpuAddr;

use crate::buffer::{Dwords, Encode};
use crate::{gfx_header, mi_header};

// =============================================================================
// OPCODES
// =============================================================================

pub(crate) const MI_NOOP: u32 = 0x00;
pub(crate) const MI_BATCH_BUFFER_END: u32 = 0x0A;
pub(crate) const MI_STORE_DATA_IMM: u32 = 0x20;
pub(crate) const MI_LOAD_REGISTER_IMM: u32 = 0x22;
pub(crate) const MI_FLUSH_DW: u32 = 0x26;
pub(crate) const MI_BATCH_BUFFER_START: u32 = 0x31;
pub(crate) const MI_CONDITIONAL_BATCH_BUFFER_END: u32 = 0x36;

const STORE_QWORD: u32 = 1 << 21;
const BB_SECOND_LEVEL: u32 = 1 << 22;
const BB_PPGTT: u32 = 1 << 8;
const COND_END_MASK_MODE: u32 = 1 << 19;
const COND_END_CURRENT_LEVEL: u32 = 1 << 18;
const POST_SYNC_SHIFT: u32 = 14;

// =============================================================================
// POST-SYNC OPERATION
// =============================================================================

/// Write a flush performs when it completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostSync {
    /// No write
    #[default]
    None,
    /// Write an immediate qword
    WriteImmediate(u64),
    /// Write the GPU timestamp
    Timestamp,
}

impl PostSync {
    const fn op(self) -> u32 {
        match self {
            Self::None => 0,
            Self::WriteImmediate(_) => 1,
            Self::Timestamp => 3,
        }
    }

    const fn data(self) -> u64 {
        match self {
            Self::WriteImmediate(v) => v,
            _ => 0,
        }
    }

    /// Rebuild from the op field and data dwords
    pub(crate) const fn from_parts(op: u32, data: u64) -> Self {
        match op {
            1 => Self::WriteImmediate(data),
            3 => Self::Timestamp,
            _ => Self::None,
        }
    }
}

// =============================================================================
// SIMPLE COMMANDS
// =============================================================================

/// MI_NOOP
#[derive(Debug, Clone, Copy, Default)]
pub struct MiNoop;

impl MiNoop {
    /// Encoded dword
    pub const DWORD: u32 = MI_NOOP << 23;
}

impl Encode for MiNoop {
    fn encode(&self, out: &mut Dwords) {
        out.push(MI_NOOP << 23);
    }

    fn name(&self) -> &'static str {
        "MI_NOOP"
    }
}

/// MI_BATCH_BUFFER_END
#[derive(Debug, Clone, Copy, Default)]
pub struct MiBatchBufferEnd;

impl MiBatchBufferEnd {
    /// Encoded dword
    pub const DWORD: u32 = MI_BATCH_BUFFER_END << 23;
}

impl Encode for MiBatchBufferEnd {
    fn encode(&self, out: &mut Dwords) {
        out.push(Self::DWORD);
    }

    fn name(&self) -> &'static str {
        "MI_BATCH_BUFFER_END"
    }
}

/// MI_BATCH_BUFFER_START
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiBatchBufferStart {
    /// Batch address
    pub addr: GpuAddr,
    /// Return to this buffer when the batch ends
    pub second_level: bool,
}

impl Encode for MiBatchBufferStart {
    fn encode(&self, out: &mut Dwords) {
        let mut header = mi_header(MI_BATCH_BUFFER_START, 3) | BB_PPGTT;
        if self.second_level {
            header |= BB_SECOND_LEVEL;
        }
        out.push(header);
        out.push(self.addr.low());
        out.push(self.addr.high());
    }

    fn name(&self) -> &'static str {
        "MI_BATCH_BUFFER_START"
    }
}

impl MiBatchBufferStart {
    /// Parse from encoded dwords
    pub fn parse(dw: &[u32]) -> Option<Self> {
        if dw.len() < 3 {
            return None;
        }
        Some(Self {
            addr: GpuAddr::from_parts(dw[1], dw[2]),
            second_level: dw[0] & BB_SECOND_LEVEL != 0,
        })
    }
}

// =============================================================================
// CONDITIONAL BATCH BUFFER END
// =============================================================================

/// Comparison applied by MI_CONDITIONAL_BATCH_BUFFER_END
///
/// Execution continues while `memory <op> compare_value` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareOp {
    /// memory > compare
    #[default]
    GreaterThan,
    /// memory >= compare
    GreaterOrEqual,
    /// memory < compare
    LessThan,
    /// memory <= compare
    LessOrEqual,
    /// memory == compare
    Equal,
    /// memory != compare
    NotEqual,
}

impl CompareOp {
    const fn code(self) -> u32 {
        match self {
            Self::GreaterThan => 0,
            Self::GreaterOrEqual => 1,
            Self::LessThan => 2,
            Self::LessOrEqual => 3,
            Self::Equal => 4,
            Self::NotEqual => 5,
        }
    }

    const fn from_code(code: u32) -> Self {
        match code {
            1 => Self::GreaterOrEqual,
            2 => Self::LessThan,
            3 => Self::LessOrEqual,
            4 => Self::Equal,
            5 => Self::NotEqual,
            _ => Self::GreaterThan,
        }
    }

    /// Whether execution continues
    pub const fn holds(self, memory: u32, compare: u32) -> bool {
        match self {
            Self::GreaterThan => memory > compare,
            Self::GreaterOrEqual => memory >= compare,
            Self::LessThan => memory < compare,
            Self::LessOrEqual => memory <= compare,
            Self::Equal => memory == compare,
            Self::NotEqual => memory != compare,
        }
    }
}

/// MI_CONDITIONAL_BATCH_BUFFER_END
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiConditionalBatchBufferEnd {
    /// Address of the dword compared
    pub addr: GpuAddr,
    /// Value compared against
    pub compare_value: u32,
    /// AND the memory value with the dword following it
    pub mask_enabled: bool,
    /// End only the current batch level
    pub end_current_level: bool,
    /// Comparison
    pub op: CompareOp,
}

impl Encode for MiConditionalBatchBufferEnd {
    fn encode(&self, out: &mut Dwords) {
        let mut header = mi_header(MI_CONDITIONAL_BATCH_BUFFER_END, 4) | (self.op.code() << 12);
        if self.mask_enabled {
            header |= COND_END_MASK_MODE;
        }
        if self.end_current_level {
            header |= COND_END_CURRENT_LEVEL;
        }
        out.push(header);
        out.push(self.compare_value);
        out.push(self.addr.low());
        out.push(self.addr.high());
    }

    fn name(&self) -> &'static str {
        "MI_CONDITIONAL_BATCH_BUFFER_END"
    }
}

impl MiConditionalBatchBufferEnd {
    /// Parse from encoded dwords
    pub fn parse(dw: &[u32]) -> Option<Self> {
        if dw.len() < 4 {
            return None;
        }
        Some(Self {
            addr: GpuAddr::from_parts(dw[2], dw[3]),
            compare_value: dw[1],
            mask_enabled: dw[0] & COND_END_MASK_MODE != 0,
            end_current_level: dw[0] & COND_END_CURRENT_LEVEL != 0,
            op: CompareOp::from_code((dw[0] >> 12) & 0x7),
        })
    }
}

// =============================================================================
// STORE / LOAD
// =============================================================================

/// MI_STORE_DATA_IMM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiStoreDataImm {
    /// Destination
    pub addr: GpuAddr,
    /// Value written
    pub value: u64,
    /// Write all 64 bits
    pub qword: bool,
}

impl MiStoreDataImm {
    /// Store a dword
    pub const fn dword(addr: GpuAddr, value: u32) -> Self {
        Self {
            addr,
            value: value as u64,
            qword: false,
        }
    }

    /// Store a qword
    pub const fn qword(addr: GpuAddr, value: u64) -> Self {
        Self {
            addr,
            value,
            qword: true,
        }
    }

    /// Parse from encoded dwords
    pub fn parse(dw: &[u32]) -> Option<Self> {
        if dw.len() < 4 {
            return None;
        }
        let qword = dw[0] & STORE_QWORD != 0;
        let value = if qword {
            ((*dw.get(4)? as u64) << 32) | dw[3] as u64
        } else {
            dw[3] as u64
        };
        Some(Self {
            addr: GpuAddr::from_parts(dw[1], dw[2]),
            value,
            qword,
        })
    }
}

impl Encode for MiStoreDataImm {
    fn encode(&self, out: &mut Dwords) {
        if self.qword {
            out.push(mi_header(MI_STORE_DATA_IMM, 5) | STORE_QWORD);
        } else {
            out.push(mi_header(MI_STORE_DATA_IMM, 4));
        }
        out.push(self.addr.low());
        out.push(self.addr.high());
        out.push(self.value as u32);
        if self.qword {
            out.push((self.value >> 32) as u32);
        }
    }

    fn name(&self) -> &'static str {
        "MI_STORE_DATA_IMM"
    }
}

/// Register/value pairs one MI_LOAD_REGISTER_IMM can carry
pub const MAX_LRI_PAIRS: usize = 8;

/// MI_LOAD_REGISTER_IMM
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MiLoadRegisterImm {
    /// (register offset, value) pairs
    pub pairs: ArrayVec<(u32, u32), MAX_LRI_PAIRS>,
}

impl MiLoadRegisterImm {
    /// Load one register
    pub fn single(register: u32, value: u32) -> Self {
        let mut pairs = ArrayVec::new();
        pairs.push((register, value));
        Self { pairs }
    }

    /// Parse from encoded dwords
    pub fn parse(dw: &[u32]) -> Option<Self> {
        let mut pairs = ArrayVec::new();
        for pair in dw.get(1..)?.chunks_exact(2) {
            pairs.try_push((pair[0], pair[1])).ok()?;
        }
        Some(Self { pairs })
    }
}

impl Encode for MiLoadRegisterImm {
    fn encode(&self, out: &mut Dwords) {
        let dwords = 1 + 2 * self.pairs.len() as u32;
        out.push(mi_header(MI_LOAD_REGISTER_IMM, dwords));
        for &(reg, value) in &self.pairs {
            out.push(reg);
            out.push(value);
        }
    }

    fn name(&self) -> &'static str {
        "MI_LOAD_REGISTER_IMM"
    }
}

// =============================================================================
// MI_FLUSH_DW
// =============================================================================

/// MI_FLUSH_DW, the flush used on the video engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MiFlushDw {
    /// Post-sync destination
    pub addr: GpuAddr,
    /// Post-sync write
    pub post_sync: PostSync,
}

impl Encode for MiFlushDw {
    fn encode(&self, out: &mut Dwords) {
        out.push(mi_header(MI_FLUSH_DW, 5) | (self.post_sync.op() << POST_SYNC_SHIFT));
        out.push(self.addr.low());
        out.push(self.addr.high());
        let data = self.post_sync.data();
        out.push(data as u32);
        out.push((data >> 32) as u32);
    }

    fn name(&self) -> &'static str {
        "MI_FLUSH_DW"
    }
}

impl MiFlushDw {
    /// Parse from encoded dwords
    pub fn parse(dw: &[u32]) -> Option<Self> {
        if dw.len() < 5 {
            return None;
        }
        let data = ((dw[4] as u64) << 32) | dw[3] as u64;
        Some(Self {
            addr: GpuAddr::from_parts(dw[1], dw[2]),
            post_sync: PostSync::from_parts((dw[0] >> POST_SYNC_SHIFT) & 0x3, data),
        })
    }
}

// =============================================================================
// PIPE_CONTROL
// =============================================================================

bitflags! {
    /// PIPE_CONTROL dword 1 flush/invalidate bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipeControlFlags: u32 {
        /// Depth cache flush
        const DEPTH_CACHE_FLUSH = 1 << 0;
        /// Stall at pixel scoreboard
        const STALL_AT_SCOREBOARD = 1 << 1;
        /// State cache invalidate
        const STATE_CACHE_INVALIDATE = 1 << 2;
        /// Constant cache invalidate
        const CONSTANT_CACHE_INVALIDATE = 1 << 3;
        /// VF cache invalidate
        const VF_CACHE_INVALIDATE = 1 << 4;
        /// Data cache flush
        const DC_FLUSH = 1 << 5;
        /// Indirect state pointers disable
        const INDIRECT_STATE_POINTERS_DISABLE = 1 << 9;
        /// Texture cache invalidate
        const TEXTURE_CACHE_INVALIDATE = 1 << 10;
        /// Instruction cache invalidate
        const INSTRUCTION_CACHE_INVALIDATE = 1 << 11;
        /// Render target cache flush
        const RENDER_TARGET_CACHE_FLUSH = 1 << 12;
        /// Depth stall
        const DEPTH_STALL = 1 << 13;
        /// Generic media state clear
        const GENERIC_MEDIA_STATE_CLEAR = 1 << 16;
        /// Command streamer stall
        const CS_STALL = 1 << 20;
    }
}

impl PipeControlFlags {
    /// Flush every write cache
    pub const fn write_cache() -> Self {
        Self::RENDER_TARGET_CACHE_FLUSH
            .union(Self::DC_FLUSH)
            .union(Self::DEPTH_CACHE_FLUSH)
            .union(Self::CS_STALL)
    }

    /// Invalidate every read-only cache
    pub const fn read_cache() -> Self {
        Self::STATE_CACHE_INVALIDATE
            .union(Self::CONSTANT_CACHE_INVALIDATE)
            .union(Self::VF_CACHE_INVALIDATE)
            .union(Self::TEXTURE_CACHE_INVALIDATE)
            .union(Self::INSTRUCTION_CACHE_INVALIDATE)
            .union(Self::CS_STALL)
    }
}

const POST_SYNC_MASK: u32 = 0x3 << POST_SYNC_SHIFT;

static_assertions::const_assert_eq!(PipeControlFlags::all().bits() & POST_SYNC_MASK, 0);

/// PIPE_CONTROL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipeControl {
    /// Flush/invalidate bits
    pub flags: PipeControlFlags,
    /// Post-sync write
    pub post_sync: PostSync,
    /// Post-sync destination
    pub addr: GpuAddr,
}

impl PipeControl {
    /// Timestamp write after flushing
    pub const fn timestamp(addr: GpuAddr, flags: PipeControlFlags) -> Self {
        Self {
            flags,
            post_sync: PostSync::Timestamp,
            addr,
        }
    }

    /// Flush/invalidate with no post-sync write
    pub const fn flush(flags: PipeControlFlags) -> Self {
        Self {
            flags,
            post_sync: PostSync::None,
            addr: GpuAddr::new(0),
        }
    }

    /// Parse from encoded dwords
    pub fn parse(dw: &[u32]) -> Option<Self> {
        if dw.len() < 6 {
            return None;
        }
        let data = ((dw[5] as u64) << 32) | dw[4] as u64;
        Some(Self {
            flags: PipeControlFlags::from_bits_truncate(dw[1]),
            post_sync: PostSync::from_parts((dw[1] & POST_SYNC_MASK) >> POST_SYNC_SHIFT, data),
            addr: GpuAddr::from_parts(dw[2], dw[3]),
        })
    }
}

impl Encode for PipeControl {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(3, 2, 0, 6));
        out.push(self.flags.bits() | (self.post_sync.op() << POST_SYNC_SHIFT));
        out.push(self.addr.low());
        out.push(self.addr.high());
        let data = self.post_sync.data();
        out.push(data as u32);
        out.push((data >> 32) as u32);
    }

    fn name(&self) -> &'static str {
        "PIPE_CONTROL"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<C: Encode>(cmd: &C) -> Dwords {
        let mut out = Dwords::new();
        cmd.encode(&mut out);
        out
    }

    #[test]
    fn test_batch_buffer_end_dword() {
        assert_eq!(encode(&MiBatchBufferEnd).as_slice(), &[0x0500_0000]);
    }

    #[test]
    fn test_pipe_control_layout() {
        let pc = PipeControl::timestamp(GpuAddr::new(0x1_0000_0040), PipeControlFlags::write_cache());
        let dw = encode(&pc);
        assert_eq!(dw.len(), 6);
        assert_eq!(dw[0], 0x7A00_0004);
        assert_eq!((dw[1] >> 14) & 0x3, 3);
        assert_eq!(dw[2], 0x40);
        assert_eq!(dw[3], 0x1);
        assert_eq!(PipeControl::parse(&dw), Some(pc));
    }

    #[test]
    fn test_store_data_imm_sizes() {
        let addr = GpuAddr::new(0x2000);
        assert_eq!(encode(&MiStoreDataImm::dword(addr, 7)).len(), 4);
        let q = MiStoreDataImm::qword(addr, 0x1_0000_0002);
        let dw = encode(&q);
        assert_eq!(dw.len(), 5);
        assert_eq!(dw[0] & 0xFF, 3);
        assert_eq!(MiStoreDataImm::parse(&dw), Some(q));
    }

    #[test]
    fn test_lri_length() {
        let mut lri = MiLoadRegisterImm::single(0x2580, 0x0006_0004);
        lri.pairs.push((0x7034, 0x6000_0060));
        let dw = encode(&lri);
        assert_eq!(dw.len(), 5);
        assert_eq!(dw[0], (0x22 << 23) | 3);
        assert_eq!(MiLoadRegisterImm::parse(&dw), Some(lri));
    }

    #[test]
    fn test_conditional_end_fields() {
        let cmd = MiConditionalBatchBufferEnd {
            addr: GpuAddr::new(0x3000),
            compare_value: 5,
            mask_enabled: true,
            end_current_level: false,
            op: CompareOp::NotEqual,
        };
        let dw = encode(&cmd);
        assert_eq!(dw.len(), 4);
        assert_eq!(MiConditionalBatchBufferEnd::parse(&dw), Some(cmd));
    }

    #[test]
    fn test_compare_ops() {
        assert!(CompareOp::GreaterThan.holds(3, 2));
        assert!(!CompareOp::GreaterThan.holds(2, 2));
        assert!(CompareOp::LessOrEqual.holds(2, 2));
        assert!(CompareOp::NotEqual.holds(1, 2));
    }

    #[test]
    fn test_flush_dw_timestamp() {
        let cmd = MiFlushDw {
            addr: GpuAddr::new(0x4008),
            post_sync: PostSync::Timestamp,
        };
        let dw = encode(&cmd);
        assert_eq!(dw.len(), 5);
        assert_eq!(MiFlushDw::parse(&dw), Some(cmd));
    }
}
