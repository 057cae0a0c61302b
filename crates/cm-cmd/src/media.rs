//! # Render/Media Pipe Commands
//!
//! State and dispatch commands for the media and GPGPU pipelines.

use cm_core::GpuAddr;

use crate::buffer::{Dwords, Encode};
use crate::gfx_header;

// =============================================================================
// PIPELINE SELECT
// =============================================================================

/// Pipeline chosen by PIPELINE_SELECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuPipeline {
    /// Media pipe (media walker, media objects)
    Media,
    /// GPGPU pipe (GPGPU walker)
    Gpgpu,
}

/// PIPELINE_SELECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSelect {
    /// Selected pipeline
    pub pipeline: GpuPipeline,
}

impl PipelineSelect {
    /// Header bits without the pipeline field
    pub(crate) const BASE: u32 = (3 << 29) | (1 << 27) | (1 << 24) | (4 << 16) | (0x3 << 8);
}

impl Encode for PipelineSelect {
    fn encode(&self, out: &mut Dwords) {
        let pipeline = match self.pipeline {
            GpuPipeline::Media => 1,
            GpuPipeline::Gpgpu => 2,
        };
        out.push(Self::BASE | pipeline);
    }

    fn name(&self) -> &'static str {
        "PIPELINE_SELECT"
    }
}

// =============================================================================
// STATE BASE ADDRESS
// =============================================================================

const MODIFY_ENABLE: u32 = 1;

/// STATE_BASE_ADDRESS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateBaseAddress {
    /// General state base
    pub general: GpuAddr,
    /// Surface state base
    pub surface: GpuAddr,
    /// Dynamic state base
    pub dynamic: GpuAddr,
    /// Indirect object base
    pub indirect: GpuAddr,
    /// Instruction base
    pub instruction: GpuAddr,
    /// General state size in bytes
    pub general_size: u32,
    /// Dynamic state size in bytes
    pub dynamic_size: u32,
    /// Instruction size in bytes
    pub instruction_size: u32,
    /// Stateless data port MOCS
    pub stateless_mocs: u8,
}

impl StateBaseAddress {
    /// Encoded length
    pub const DWORDS: u32 = 16;
}

impl Encode for StateBaseAddress {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(0, 1, 1, Self::DWORDS));
        out.push(self.general.low() | MODIFY_ENABLE);
        out.push(self.general.high());
        out.push((self.stateless_mocs as u32) << 16);
        for base in [self.surface, self.dynamic, self.indirect, self.instruction] {
            out.push(base.low() | MODIFY_ENABLE);
            out.push(base.high());
        }
        out.push(self.general_size | MODIFY_ENABLE);
        out.push(self.dynamic_size | MODIFY_ENABLE);
        out.push(MODIFY_ENABLE);
        out.push(self.instruction_size | MODIFY_ENABLE);
    }

    fn name(&self) -> &'static str {
        "STATE_BASE_ADDRESS"
    }
}

// =============================================================================
// DEBUG / PREEMPTION STATE
// =============================================================================

/// STATE_SIP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSip {
    /// System instruction pointer, relative to instruction base
    pub addr: GpuAddr,
}

impl Encode for StateSip {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(0, 1, 2, 3));
        out.push(self.addr.low());
        out.push(self.addr.high());
    }

    fn name(&self) -> &'static str {
        "STATE_SIP"
    }
}

/// GPGPU_CSR_BASE_ADDRESS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpgpuCsrBaseAddress {
    /// Context save/restore buffer
    pub addr: GpuAddr,
}

impl Encode for GpgpuCsrBaseAddress {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(0, 1, 4, 3));
        out.push(self.addr.low());
        out.push(self.addr.high());
    }

    fn name(&self) -> &'static str {
        "GPGPU_CSR_BASE_ADDRESS"
    }
}

// =============================================================================
// MEDIA STATE
// =============================================================================

/// MEDIA_VFE_STATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaVfeState {
    /// Scratch space base
    pub scratch_base: GpuAddr,
    /// Scratch bytes per thread; 0 disables scratch
    pub scratch_per_thread: u32,
    /// Maximum hardware threads
    pub max_threads: u32,
    /// URB entries
    pub urb_entries: u32,
    /// URB entry allocation size in 256-bit units
    pub urb_entry_size: u32,
    /// CURBE allocation size in 256-bit units
    pub curbe_size: u32,
    /// Scoreboard mask; 0 disables the scoreboard
    pub scoreboard_mask: u8,
}

impl MediaVfeState {
    /// Encoded length
    pub const DWORDS: u32 = 9;

    /// Per-thread scratch encoding: log2(bytes / 1K)
    fn scratch_encoding(&self) -> u32 {
        if self.scratch_per_thread == 0 {
            return 0;
        }
        let kib = (self.scratch_per_thread / 1024).max(1);
        31 - kib.leading_zeros()
    }

    /// Parse `max_threads` back out of an encoded command
    pub fn parse_max_threads(dw: &[u32]) -> Option<u32> {
        dw.get(3).map(|v| (v >> 16) + 1)
    }
}

impl Encode for MediaVfeState {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(2, 0, 0, Self::DWORDS));
        out.push((self.scratch_base.low() & !0x3FF) | self.scratch_encoding());
        out.push(self.scratch_base.high());
        out.push((self.max_threads.saturating_sub(1) << 16) | ((self.urb_entries & 0xFF) << 8));
        out.push(0);
        out.push((self.urb_entry_size << 16) | (self.curbe_size & 0xFFFF));
        let scoreboard = if self.scoreboard_mask != 0 { 1 << 31 } else { 0 };
        out.push(scoreboard | self.scoreboard_mask as u32);
        out.push(0);
        out.push(0);
    }

    fn name(&self) -> &'static str {
        "MEDIA_VFE_STATE"
    }
}

/// MEDIA_CURBE_LOAD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaCurbeLoad {
    /// Offset from dynamic state base
    pub start: u32,
    /// Bytes
    pub length: u32,
}

impl Encode for MediaCurbeLoad {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(2, 0, 1, 4));
        out.push(0);
        out.push(self.length);
        out.push(self.start);
    }

    fn name(&self) -> &'static str {
        "MEDIA_CURBE_LOAD"
    }
}

/// MEDIA_INTERFACE_DESCRIPTOR_LOAD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaInterfaceDescriptorLoad {
    /// Offset from dynamic state base
    pub start: u32,
    /// Bytes
    pub length: u32,
}

impl MediaInterfaceDescriptorLoad {
    /// Parse from encoded dwords
    pub fn parse(dw: &[u32]) -> Option<Self> {
        Some(Self {
            start: *dw.get(3)?,
            length: *dw.get(2)?,
        })
    }
}

impl Encode for MediaInterfaceDescriptorLoad {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(2, 0, 2, 4));
        out.push(0);
        out.push(self.length);
        out.push(self.start);
    }

    fn name(&self) -> &'static str {
        "MEDIA_INTERFACE_DESCRIPTOR_LOAD"
    }
}

/// MEDIA_STATE_FLUSH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaStateFlush {
    /// Interface descriptor to wait on
    pub interface_descriptor: u8,
}

impl Encode for MediaStateFlush {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(2, 0, 4, 2));
        out.push(self.interface_descriptor as u32);
    }

    fn name(&self) -> &'static str {
        "MEDIA_STATE_FLUSH"
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// MEDIA_OBJECT with two dwords of inline thread coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaObject {
    /// Interface descriptor offset
    pub interface_descriptor: u8,
    /// Thread x
    pub x: u32,
    /// Thread y
    pub y: u32,
}

impl MediaObject {
    /// Encoded length
    pub const DWORDS: u32 = 8;
}

impl Encode for MediaObject {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(2, 1, 0, Self::DWORDS));
        out.push(self.interface_descriptor as u32 & 0x3F);
        out.push(0);
        out.push(0);
        out.push(0);
        out.push(0);
        out.push(self.x);
        out.push(self.y);
    }

    fn name(&self) -> &'static str {
        "MEDIA_OBJECT"
    }
}

/// Signed 2D step or coordinate, packed as two 16-bit halves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkerPoint {
    /// X
    pub x: i16,
    /// Y
    pub y: i16,
}

impl WalkerPoint {
    /// Build a point
    pub const fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }

    const fn pack(self) -> u32 {
        ((self.y as u16 as u32) << 16) | self.x as u16 as u32
    }
}

/// MEDIA_OBJECT_WALKER
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaObjectWalker {
    /// Interface descriptor offset
    pub interface_descriptor: u8,
    /// Scoreboard dependency mask
    pub scoreboard_mask: u8,
    /// Thread-space color count minus one
    pub color_count_minus_one: u8,
    /// Group-id loop select
    pub group_id_loop_select: u8,
    /// Mid-loop unit x
    pub mid_loop_unit_x: u8,
    /// Mid-loop unit y
    pub mid_loop_unit_y: u8,
    /// Local loop execution count
    pub local_loop_exec_count: u16,
    /// Global loop execution count
    pub global_loop_exec_count: u16,
    /// Block resolution
    pub block_resolution: WalkerPoint,
    /// Local start
    pub local_start: WalkerPoint,
    /// Local outer loop stride
    pub local_outer_loop_stride: WalkerPoint,
    /// Local inner loop unit
    pub local_inner_loop_unit: WalkerPoint,
    /// Global resolution
    pub global_resolution: WalkerPoint,
    /// Global start
    pub global_start: WalkerPoint,
    /// Global outer loop stride
    pub global_outer_loop_stride: WalkerPoint,
    /// Global inner loop unit
    pub global_inner_loop_unit: WalkerPoint,
}

impl MediaObjectWalker {
    /// Encoded length
    pub const DWORDS: u32 = 17;

    /// Parse the fields tests and the simulator care about
    pub fn parse(dw: &[u32]) -> Option<Self> {
        if dw.len() < Self::DWORDS as usize {
            return None;
        }
        let point = |v: u32| WalkerPoint::new(v as u16 as i16, (v >> 16) as u16 as i16);
        Some(Self {
            interface_descriptor: (dw[1] & 0x3F) as u8,
            scoreboard_mask: dw[5] as u8,
            group_id_loop_select: (dw[5] >> 8) as u8,
            color_count_minus_one: ((dw[6] >> 24) & 0xF) as u8,
            mid_loop_unit_x: ((dw[6] >> 8) & 0x3) as u8,
            mid_loop_unit_y: ((dw[6] >> 12) & 0x3) as u8,
            local_loop_exec_count: dw[7] as u16,
            global_loop_exec_count: (dw[7] >> 16) as u16,
            block_resolution: point(dw[8]),
            local_start: point(dw[9]),
            local_outer_loop_stride: point(dw[11]),
            local_inner_loop_unit: point(dw[12]),
            global_resolution: point(dw[13]),
            global_start: point(dw[14]),
            global_outer_loop_stride: point(dw[15]),
            global_inner_loop_unit: point(dw[16]),
        })
    }
}

impl Encode for MediaObjectWalker {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(2, 1, 3, Self::DWORDS));
        out.push(self.interface_descriptor as u32 & 0x3F);
        let use_scoreboard = if self.scoreboard_mask != 0 { 1 << 21 } else { 0 };
        out.push(use_scoreboard);
        out.push(0);
        out.push(0);
        out.push(self.scoreboard_mask as u32 | ((self.group_id_loop_select as u32) << 8));
        out.push(
            ((self.color_count_minus_one as u32 & 0xF) << 24)
                | ((self.mid_loop_unit_y as u32 & 0x3) << 12)
                | ((self.mid_loop_unit_x as u32 & 0x3) << 8),
        );
        out.push(((self.global_loop_exec_count as u32) << 16) | self.local_loop_exec_count as u32);
        out.push(self.block_resolution.pack());
        out.push(self.local_start.pack());
        out.push(0);
        out.push(self.local_outer_loop_stride.pack());
        out.push(self.local_inner_loop_unit.pack());
        out.push(self.global_resolution.pack());
        out.push(self.global_start.pack());
        out.push(self.global_outer_loop_stride.pack());
        out.push(self.global_inner_loop_unit.pack());
    }

    fn name(&self) -> &'static str {
        "MEDIA_OBJECT_WALKER"
    }
}

/// GPGPU_WALKER
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpgpuWalker {
    /// Interface descriptor offset
    pub interface_descriptor: u8,
    /// SIMD width: 8, 16 or 32
    pub simd_width: u8,
    /// Threads per group along x
    pub thread_width: u32,
    /// Threads per group along y
    pub thread_height: u32,
    /// Threads per group along z
    pub thread_depth: u32,
    /// Groups along x
    pub group_width: u32,
    /// Groups along y
    pub group_height: u32,
    /// Groups along z
    pub group_depth: u32,
    /// Execution mask of the right-most threads
    pub right_mask: u32,
    /// Execution mask of the bottom threads
    pub bottom_mask: u32,
}

impl GpgpuWalker {
    /// Encoded length
    pub const DWORDS: u32 = 15;

    /// Parse from encoded dwords
    pub fn parse(dw: &[u32]) -> Option<Self> {
        if dw.len() < Self::DWORDS as usize {
            return None;
        }
        let simd_width = match dw[4] >> 30 {
            0 => 8,
            1 => 16,
            _ => 32,
        };
        Some(Self {
            interface_descriptor: (dw[1] & 0x3F) as u8,
            simd_width,
            thread_width: (dw[4] & 0x3F) + 1,
            thread_height: ((dw[4] >> 8) & 0x3F) + 1,
            thread_depth: ((dw[4] >> 16) & 0x3F) + 1,
            group_width: dw[6],
            group_height: dw[9],
            group_depth: dw[11],
            right_mask: dw[12],
            bottom_mask: dw[13],
        })
    }
}

impl Encode for GpgpuWalker {
    fn encode(&self, out: &mut Dwords) {
        let simd = match self.simd_width {
            8 => 0,
            16 => 1,
            _ => 2,
        };
        out.push(gfx_header(2, 1, 5, Self::DWORDS));
        out.push(self.interface_descriptor as u32 & 0x3F);
        out.push(0);
        out.push(0);
        out.push(
            (simd << 30)
                | ((self.thread_depth.saturating_sub(1) & 0x3F) << 16)
                | ((self.thread_height.saturating_sub(1) & 0x3F) << 8)
                | (self.thread_width.saturating_sub(1) & 0x3F),
        );
        out.push(0);
        out.push(self.group_width);
        out.push(0);
        out.push(0);
        out.push(self.group_height);
        out.push(0);
        out.push(self.group_depth);
        out.push(self.right_mask);
        out.push(self.bottom_mask);
        out.push(0);
    }

    fn name(&self) -> &'static str {
        "GPGPU_WALKER"
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
    fn test_lengths_match_headers() {
        let cases: [(Dwords, u32); 6] = [
            (encode(&StateBaseAddress::default()), StateBaseAddress::DWORDS),
            (encode(&MediaVfeState::default()), MediaVfeState::DWORDS),
            (encode(&MediaObjectWalker::default()), MediaObjectWalker::DWORDS),
            (encode(&GpgpuWalker::default()), GpgpuWalker::DWORDS),
            (
                encode(&MediaObject {
                    interface_descriptor: 0,
                    x: 0,
                    y: 0,
                }),
                MediaObject::DWORDS,
            ),
            (encode(&MediaCurbeLoad { start: 0, length: 64 }), 4),
        ];
        for (dw, len) in cases.iter() {
            assert_eq!(dw.len() as u32, *len);
            assert_eq!(dw[0] & 0xFF, len - 2);
        }
    }

    #[test]
    fn test_pipeline_select_single_dword() {
        let dw = encode(&PipelineSelect {
            pipeline: GpuPipeline::Gpgpu,
        });
        assert_eq!(dw.as_slice(), &[0x6904_0302]);
    }

    #[test]
    fn test_vfe_max_threads_round_trip() {
        let vfe = MediaVfeState {
            max_threads: 168,
            scratch_per_thread: 16 * 1024,
            ..MediaVfeState::default()
        };
        let dw = encode(&vfe);
        assert_eq!(MediaVfeState::parse_max_threads(&dw), Some(168));
        assert_eq!(dw[1] & 0xF, 4);
    }

    #[test]
    fn test_walker_negative_strides() {
        let walker = MediaObjectWalker {
            scoreboard_mask: 0x7,
            color_count_minus_one: 3,
            local_inner_loop_unit: WalkerPoint::new(-1, 1),
            global_resolution: WalkerPoint::new(64, 32),
            ..MediaObjectWalker::default()
        };
        let parsed = MediaObjectWalker::parse(&encode(&walker)).unwrap();
        assert_eq!(parsed, walker);
    }

    #[test]
    fn test_gpgpu_walker_round_trip() {
        let walker = GpgpuWalker {
            interface_descriptor: 2,
            simd_width: 16,
            thread_width: 4,
            thread_height: 2,
            thread_depth: 1,
            group_width: 8,
            group_height: 8,
            group_depth: 1,
            right_mask: 0xFFFF,
            bottom_mask: 0xFFFF,
        };
        assert_eq!(GpgpuWalker::parse(&encode(&walker)), Some(walker));
    }
}
