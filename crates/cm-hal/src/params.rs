//! # Task and Kernel Parameters
//!
//! What the upstream runtime hands the engine for one submission: kernels
//! with their arguments and binaries, thread or thread-group geometry, and
//! the per-task synchronization bitmaps.

use alloc::vec::Vec;
use core::fmt;

use arrayvec::ArrayVec;
use cm_cmd::CompareOp;
use cm_core::consts::{
    KERNEL_BINARY_BLOCK_SIZE, MAX_COLOR_COUNT, MAX_DEPENDENCY_COUNT, MAX_KERNELS_PER_TASK,
};
use cm_core::{
    BufferHandle, Error, Result, Sampler8x8Index, SamplerIndex, Surface2DHandle,
    Surface2DUpHandle, Surface3DHandle,
};

// =============================================================================
// KERNEL IDENTITY
// =============================================================================

/// Runtime-assigned kernel identity, the key of the kernel binary cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelId(u64);

impl KernelId {
    /// Wrap a raw id
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel:{:#x}", self.0)
    }
}

// =============================================================================
// KERNEL ARGUMENTS
// =============================================================================

/// Surfaces a VME argument references besides the current picture
pub const MAX_VME_REFERENCES: usize = 4;

/// Argument payload, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// Raw bytes copied into the CURBE
    General(Vec<u8>),
    /// Sampler state
    Sampler(SamplerIndex),
    /// Buffer surface, optionally through an alias
    Buffer {
        /// Buffer
        handle: BufferHandle,
        /// 0 for the base surface state, n for alias n
        alias: u8,
    },
    /// 2D surface, optionally through an alias
    Surface2D {
        /// Surface
        handle: Surface2DHandle,
        /// 0 for the base surface state, n for alias n
        alias: u8,
    },
    /// 2D surface backed by user memory
    Surface2DUp(Surface2DUpHandle),
    /// 3D surface
    Surface3D(Surface3DHandle),
    /// 2D surface read through the sampler
    SamplerSurface(Surface2DHandle),
    /// Motion-estimation surface group
    Vme {
        /// Current picture
        current: Surface2DHandle,
        /// Forward references
        forward: ArrayVec<Surface2DHandle, MAX_VME_REFERENCES>,
        /// Backward references
        backward: ArrayVec<Surface2DHandle, MAX_VME_REFERENCES>,
    },
    /// AVS/VA sampler with the surface it samples
    Sampler8x8 {
        /// Sampler state
        sampler: Sampler8x8Index,
        /// Sampled surface
        surface: Surface2DHandle,
    },
    /// Buffer used as a state buffer
    StateBuffer(BufferHandle),
    /// Value supplied by the runtime rather than the user
    Implicit(u32),
}

/// One kernel argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArg {
    /// Byte offset of the argument in the CURBE
    pub offset: u32,
    /// Payload
    pub value: ArgValue,
}

impl KernelArg {
    /// Build an argument
    pub fn new(offset: u32, value: ArgValue) -> Self {
        Self { offset, value }
    }

    /// Bytes the argument occupies in the CURBE
    pub fn curbe_bytes(&self) -> u32 {
        match &self.value {
            ArgValue::General(bytes) => bytes.len() as u32,
            _ => 4,
        }
    }
}

// =============================================================================
// THREAD SPACE
// =============================================================================

/// Scoreboard dependency between neighbouring threads
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DependencyPattern {
    /// Threads are independent
    #[default]
    None,
    /// Left, top-left and top neighbours
    Wavefront45,
    /// Wavefront45 plus top-right
    Wavefront26,
    /// Left neighbour; columns run in order
    Vertical,
    /// Top neighbour; rows run in order
    Horizontal,
    /// Caller-provided deltas
    Custom(ArrayVec<(i8, i8), MAX_DEPENDENCY_COUNT>),
}

impl DependencyPattern {
    /// Dependency deltas as (dx, dy)
    pub fn deltas(&self) -> ArrayVec<(i8, i8), MAX_DEPENDENCY_COUNT> {
        let fixed: &[(i8, i8)] = match self {
            Self::None => &[],
            Self::Wavefront45 => &[(-1, 0), (-1, -1), (0, -1)],
            Self::Wavefront26 => &[(-1, 0), (-1, -1), (0, -1), (1, -1)],
            Self::Vertical => &[(-1, 0)],
            Self::Horizontal => &[(0, -1)],
            Self::Custom(deltas) => return deltas.clone(),
        };
        fixed.iter().copied().collect()
    }

    /// Scoreboard mask enabling one bit per delta
    pub fn scoreboard_mask(&self) -> u8 {
        let n = self.deltas().len() as u32;
        ((1u32 << n) - 1) as u8
    }

    /// Whether any dependency is declared
    pub fn is_none(&self) -> bool {
        self.deltas().is_empty()
    }
}

/// Order in which the media walker visits the thread space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkingPattern {
    /// Row by row
    #[default]
    Raster,
    /// 45-degree wavefront
    Wavefront45,
    /// 26-degree wavefront
    Wavefront26,
    /// Column by column
    Vertical,
    /// Row by row, one row per outer step
    Horizontal,
}

/// 2D thread space of a media-walker dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSpace {
    /// Threads along x
    pub width: u32,
    /// Threads along y
    pub height: u32,
    /// Scoreboard dependency
    pub dependency: DependencyPattern,
    /// Walk order; derived from the dependency when unset
    pub walking: Option<WalkingPattern>,
    /// Thread-space colors, 1..=16
    pub color_count: u32,
}

impl ThreadSpace {
    /// Independent threads over `width` x `height`
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            dependency: DependencyPattern::None,
            walking: None,
            color_count: 1,
        }
    }

    /// Same space with a dependency pattern
    pub fn with_dependency(mut self, dependency: DependencyPattern) -> Self {
        self.dependency = dependency;
        self
    }

    /// Walk order actually used
    pub fn walking_pattern(&self) -> WalkingPattern {
        self.walking.unwrap_or(match self.dependency {
            DependencyPattern::Wavefront45 => WalkingPattern::Wavefront45,
            DependencyPattern::Wavefront26 => WalkingPattern::Wavefront26,
            DependencyPattern::Vertical => WalkingPattern::Vertical,
            DependencyPattern::Horizontal => WalkingPattern::Horizontal,
            DependencyPattern::None | DependencyPattern::Custom(_) => WalkingPattern::Raster,
        })
    }

    /// Threads dispatched
    pub fn thread_count(&self) -> u32 {
        self.width * self.height
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidParameter);
        }
        if self.color_count == 0 || self.color_count > MAX_COLOR_COUNT {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

/// Thread-group space of a GPGPU dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadGroupSpace {
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
}

impl ThreadGroupSpace {
    /// 2D groups of 2D threads
    pub const fn new_2d(thread_width: u32, thread_height: u32, group_width: u32, group_height: u32) -> Self {
        Self {
            thread_width,
            thread_height,
            thread_depth: 1,
            group_width,
            group_height,
            group_depth: 1,
        }
    }

    /// Threads in one group
    pub const fn threads_per_group(&self) -> u32 {
        self.thread_width * self.thread_height * self.thread_depth
    }

    fn validate(&self) -> Result<()> {
        let dims = [
            self.thread_width,
            self.thread_height,
            self.thread_depth,
            self.group_width,
            self.group_height,
            self.group_depth,
        ];
        if dims.iter().any(|&d| d == 0) {
            return Err(Error::InvalidParameter);
        }
        // thread dimensions are 6-bit fields in the walker
        if self.thread_width > 64 || self.thread_height > 64 || self.thread_depth > 64 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

// =============================================================================
// KERNEL
// =============================================================================

/// One kernel of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelParam {
    /// Cache key
    pub id: KernelId,
    /// Identity of the runtime kernel object, used for state-buffer lookup
    pub kernel_ptr: u64,
    /// ISA
    pub binary: Vec<u8>,
    /// Arguments
    pub args: Vec<KernelArg>,
    /// Threads to launch when no thread space is given
    pub thread_count: u32,
    /// CURBE bytes per thread
    pub curbe_size: u32,
    /// Shared local memory bytes per group
    pub slm_size: u32,
    /// Uses a thread-group barrier
    pub barrier: bool,
    /// SIMD width for GPGPU dispatch
    pub simd_width: u8,
    /// Per-thread scratch bytes; 0 when the kernel does not spill
    pub spill_size: u32,
    /// Kernel whose binary this one duplicates
    pub clone_of: Option<KernelId>,
    /// Kernel-specific thread space
    pub thread_space: Option<ThreadSpace>,
}

impl KernelParam {
    /// Kernel with no arguments
    pub fn new(id: KernelId, binary: Vec<u8>) -> Self {
        Self {
            id,
            kernel_ptr: id.raw(),
            binary,
            args: Vec::new(),
            thread_count: 1,
            curbe_size: 0,
            slm_size: 0,
            barrier: false,
            simd_width: 16,
            spill_size: 0,
            clone_of: None,
            thread_space: None,
        }
    }

    /// Append an argument, growing the CURBE to hold it
    pub fn arg(mut self, offset: u32, value: ArgValue) -> Self {
        let arg = KernelArg::new(offset, value);
        self.curbe_size = self.curbe_size.max(offset + arg.curbe_bytes());
        self.args.push(arg);
        self
    }

    /// Threads this kernel launches
    pub fn dispatch_threads(&self) -> u32 {
        self.thread_space
            .as_ref()
            .map_or(self.thread_count, ThreadSpace::thread_count)
    }

    /// Check the kernel is internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.binary.is_empty() {
            return Err(Error::NullPointer);
        }
        if self.binary.len() > KERNEL_BINARY_BLOCK_SIZE as usize {
            log::warn!("cm-hal: {} binary of {} bytes is too large", self.id, self.binary.len());
            return Err(Error::InvalidParameter);
        }
        if self.thread_count == 0 {
            return Err(Error::InvalidParameter);
        }
        if !matches!(self.simd_width, 8 | 16 | 32) {
            return Err(Error::InvalidParameter);
        }
        if self
            .args
            .iter()
            .any(|a| a.offset + a.curbe_bytes() > self.curbe_size)
        {
            return Err(Error::InvalidParameter);
        }
        if let Some(ts) = &self.thread_space {
            ts.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// TASK
// =============================================================================

/// Operands of a conditional batch-buffer end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionalEndParam {
    /// Buffer holding the compared dword
    pub buffer: BufferHandle,
    /// Byte offset of the dword
    pub offset: u32,
    /// Value compared against
    pub compare_value: u32,
    /// AND the dword with the one after it first
    pub mask: bool,
    /// Execution continues while `memory <op> compare_value` holds
    pub op: CompareOp,
}

/// How a task's kernels are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// MEDIA_OBJECT_WALKER per kernel
    MediaWalker,
    /// GPGPU_WALKER per kernel
    GpgpuWalker,
    /// MEDIA_OBJECT per thread, from a batch buffer
    MediaObject,
}

/// One submission
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskParam {
    /// Kernels in dispatch order
    pub kernels: Vec<KernelParam>,
    /// Bit i: barrier between kernel i and kernel i + 1
    pub sync_bitmap: u64,
    /// Bit i: conditional end before kernel i
    pub conditional_end_bitmap: u64,
    /// One entry per set bit of `conditional_end_bitmap`, lowest bit first
    pub conditional_ends: Vec<ConditionalEndParam>,
    /// Task-wide thread space for the media walker
    pub thread_space: Option<ThreadSpace>,
    /// Thread-group space for the GPGPU walker
    pub group_space: Option<ThreadGroupSpace>,
}

impl TaskParam {
    /// Task over `kernels` with no synchronization
    pub fn new(kernels: Vec<KernelParam>) -> Self {
        Self {
            kernels,
            ..Self::default()
        }
    }

    /// Dispatch mode implied by the geometry
    pub fn dispatch_mode(&self) -> Result<DispatchMode> {
        let walker = self.thread_space.is_some()
            || self.kernels.iter().any(|k| k.thread_space.is_some());
        match (self.group_space.is_some(), walker) {
            (true, true) => Err(Error::InvalidParameter),
            (true, false) => Ok(DispatchMode::GpgpuWalker),
            (false, true) => Ok(DispatchMode::MediaWalker),
            (false, false) => Ok(DispatchMode::MediaObject),
        }
    }

    /// Thread space used for kernel `index` in walker mode
    pub fn kernel_thread_space(&self, index: usize) -> Option<ThreadSpace> {
        let kernel = self.kernels.get(index)?;
        kernel
            .thread_space
            .clone()
            .or_else(|| self.thread_space.clone())
            .or_else(|| Some(ThreadSpace::new(kernel.thread_count, 1)))
    }

    /// Conditional-end operands for kernel `index`
    pub fn conditional_end(&self, index: usize) -> Result<Option<ConditionalEndParam>> {
        if index >= 64 || self.conditional_end_bitmap & (1 << index) == 0 {
            return Ok(None);
        }
        let below = self.conditional_end_bitmap & ((1u64 << index) - 1);
        self.conditional_ends
            .get(below.count_ones() as usize)
            .copied()
            .map(Some)
            .ok_or(Error::NullPointer)
    }

    /// Check the task is internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.kernels.is_empty() {
            return Err(Error::NullPointer);
        }
        if self.kernels.len() > MAX_KERNELS_PER_TASK {
            return Err(Error::InvalidParameter);
        }
        let n = self.kernels.len() as u32;
        if n < 64 && (self.sync_bitmap >> n != 0 || self.conditional_end_bitmap >> n != 0) {
            return Err(Error::InvalidParameter);
        }
        if self.conditional_ends.len() < self.conditional_end_bitmap.count_ones() as usize {
            return Err(Error::NullPointer);
        }
        if let Some(ts) = &self.thread_space {
            ts.validate()?;
        }
        if let Some(gs) = &self.group_space {
            gs.validate()?;
        }
        for kernel in &self.kernels {
            kernel.validate()?;
        }
        self.dispatch_mode().map(|_| ())
    }
}

// =============================================================================
// HINTS
// =============================================================================

const HINTS_MASK_MEDIA_OBJECT: u32 = 0x1;
const HINTS_MASK_NUM_TASKS: u32 = 0x70;
const HINTS_NUM_TASKS_SHIFT: u32 = 4;

/// Decoded enqueue hints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hints {
    /// Dispatch with media objects rather than the walker
    pub media_object: bool,
    /// Enqueue groups the kernels are split into
    pub num_tasks: u32,
}

impl Hints {
    /// Decode the runtime's hint word
    pub const fn from_bits(bits: u32) -> Self {
        let num_tasks = (bits & HINTS_MASK_NUM_TASKS) >> HINTS_NUM_TASKS_SHIFT;
        Self {
            media_object: bits & HINTS_MASK_MEDIA_OBJECT != 0,
            num_tasks: if num_tasks == 0 { 1 } else { num_tasks },
        }
    }

    /// Sync bits that put a barrier at every group boundary of `kernels`
    pub fn group_boundaries(&self, kernels: usize) -> u64 {
        let groups = (self.num_tasks as usize).min(kernels.max(1));
        let per_group = kernels.div_ceil(groups);
        let mut bits = 0u64;
        let mut end = per_group;
        while end < kernels {
            bits |= 1 << (end - 1);
            end += per_group;
        }
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(id: u64) -> KernelParam {
        KernelParam::new(KernelId::new(id), vec![0u8; 256])
    }

    #[test]
    fn test_arg_grows_curbe() {
        let k = kernel(1)
            .arg(0, ArgValue::Implicit(5))
            .arg(8, ArgValue::General(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(k.curbe_size, 16);
        assert!(k.validate().is_ok());
    }

    #[test]
    fn test_empty_binary_is_null() {
        let k = KernelParam::new(KernelId::new(1), Vec::new());
        assert_eq!(k.validate(), Err(Error::NullPointer));
    }

    #[test]
    fn test_dispatch_mode_exclusive() {
        let mut task = TaskParam::new(vec![kernel(1)]);
        assert_eq!(task.dispatch_mode(), Ok(DispatchMode::MediaObject));
        task.thread_space = Some(ThreadSpace::new(4, 4));
        assert_eq!(task.dispatch_mode(), Ok(DispatchMode::MediaWalker));
        task.group_space = Some(ThreadGroupSpace::new_2d(4, 4, 2, 2));
        assert_eq!(task.dispatch_mode(), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_sync_bits_beyond_kernels_rejected() {
        let mut task = TaskParam::new(vec![kernel(1), kernel(2)]);
        task.sync_bitmap = 0b100;
        assert_eq!(task.validate(), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_conditional_end_lookup() {
        let mut task = TaskParam::new(vec![kernel(1), kernel(2), kernel(3)]);
        task.conditional_end_bitmap = 0b101;
        let cond = |v| ConditionalEndParam {
            buffer: BufferHandle::new(0),
            offset: 0,
            compare_value: v,
            mask: false,
            op: CompareOp::GreaterThan,
        };
        task.conditional_ends = vec![cond(10), cond(20)];
        assert_eq!(task.conditional_end(0).unwrap().unwrap().compare_value, 10);
        assert_eq!(task.conditional_end(1).unwrap(), None);
        assert_eq!(task.conditional_end(2).unwrap().unwrap().compare_value, 20);
        task.conditional_ends.pop();
        assert_eq!(task.validate(), Err(Error::NullPointer));
    }

    #[test]
    fn test_dependency_masks() {
        assert_eq!(DependencyPattern::None.scoreboard_mask(), 0);
        assert_eq!(DependencyPattern::Wavefront45.scoreboard_mask(), 0x7);
        assert_eq!(DependencyPattern::Wavefront26.scoreboard_mask(), 0xF);
        let ts = ThreadSpace::new(8, 8).with_dependency(DependencyPattern::Wavefront26);
        assert_eq!(ts.walking_pattern(), WalkingPattern::Wavefront26);
    }

    #[test]
    fn test_hints_groups() {
        let hints = Hints::from_bits(3 << 4);
        assert_eq!(hints.num_tasks, 3);
        assert!(!hints.media_object);
        // six kernels in three groups: barriers after kernels 1 and 3
        assert_eq!(hints.group_boundaries(6), 0b1010);
        assert_eq!(Hints::from_bits(1).num_tasks, 1);
        assert_eq!(Hints::from_bits(0).group_boundaries(4), 0);
    }
}
