//! # CM HAL Core Types
//!
//! Fundamental type definitions used across the task-execution engine.
//!
//! These types provide:
//! - Strong typing for GPU addresses and OS resources
//! - Distinct handle types per surface table, so a buffer handle can never
//!   be passed where a 2D surface handle is expected
//! - Shared enumerations (task status, GPU contexts, surface formats)

use core::fmt;
use core::ops::Add;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU graphics address
///
/// An address in the GPU's virtual address space. It is not a CPU pointer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Low 32 bits, as encoded in the first address dword of a command
    #[inline]
    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits, as encoded in the second address dword of a command
    #[inline]
    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Rebuild an address from its two command dwords
    #[inline]
    pub const fn from_parts(low: u32, high: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        self.offset(rhs)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// HANDLES
// =============================================================================

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Wrap a raw table index
            #[inline]
            pub const fn new(index: u32) -> Self {
                Self(index)
            }

            /// Raw table index
            #[inline]
            pub const fn index(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

define_handle!(
    /// Memory resource owned by the OS/driver collaborator
    OsResource
);
define_handle!(
    /// Task slot index
    TaskId
);
define_handle!(
    /// Entry in the buffer table
    BufferHandle
);
define_handle!(
    /// Entry in the 2D surface table
    Surface2DHandle
);
define_handle!(
    /// Entry in the 2D user-provided-memory surface table
    Surface2DUpHandle
);
define_handle!(
    /// Entry in the 3D surface table
    Surface3DHandle
);
define_handle!(
    /// Entry in the sampler table
    SamplerIndex
);
define_handle!(
    /// Entry in the sampler8x8 table
    Sampler8x8Index
);

// =============================================================================
// TASK STATUS
// =============================================================================

/// Lifecycle state of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Submitted, the GPU has not started it
    Queued,
    /// Begin timestamp written, end timestamp not yet written
    InProgress,
    /// Both timestamps written
    Finished,
    /// Invalidated by a reset; equivalent to free
    Reset,
}

impl TaskStatus {
    /// Whether the slot can be reused after this status is reported
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Reset)
    }
}

// =============================================================================
// GPU CONTEXTS
// =============================================================================

/// GPU context a command buffer is submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuContext {
    /// Render engine, media pipe
    Render,
    /// Render engine, custom CM context
    Render3,
    /// Compute engine
    Compute,
    /// Video enhancement engine
    Vebox,
}

impl GpuContext {
    /// All contexts, in index order
    pub const ALL: [GpuContext; 4] = [Self::Render, Self::Render3, Self::Compute, Self::Vebox];

    /// Dense index for per-context tables
    pub const fn index(self) -> usize {
        match self {
            Self::Render => 0,
            Self::Render3 => 1,
            Self::Compute => 2,
            Self::Vebox => 3,
        }
    }

    /// Whether commands for this context run on the render engine
    pub const fn is_render(self) -> bool {
        matches!(self, Self::Render | Self::Render3 | Self::Compute)
    }
}

// =============================================================================
// SURFACE FORMATS
// =============================================================================

/// Surface pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceFormat {
    /// Raw bytes (buffers)
    Buffer,
    /// 8-bit alpha
    A8,
    /// 8-bit luminance
    L8,
    /// 8-bit unsigned integer
    R8Uint,
    /// 16-bit unsigned integer
    R16Uint,
    /// 32-bit float
    R32F,
    /// 32-bit BGRA
    A8R8G8B8,
    /// 32-bit BGRX
    X8R8G8B8,
    /// 32-bit RGBA
    A8B8G8R8,
    /// 10:10:10:2 RGBA
    R10G10B10A2,
    /// 64-bit float RGBA
    A16B16G16R16F,
    /// Packed 4:2:2
    Yuy2,
    /// Planar 4:2:0, 8-bit
    Nv12,
    /// Planar 4:2:0, 10-bit
    P010,
    /// Planar 4:2:0, 16-bit
    P016,
}

impl SurfaceFormat {
    /// Bytes per pixel of the first plane
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Buffer | Self::A8 | Self::L8 | Self::R8Uint | Self::Nv12 => 1,
            Self::R16Uint | Self::Yuy2 | Self::P010 | Self::P016 => 2,
            Self::R32F
            | Self::A8R8G8B8
            | Self::X8R8G8B8
            | Self::A8B8G8R8
            | Self::R10G10B10A2 => 4,
            Self::A16B16G16R16F => 8,
        }
    }

    /// Whether the format stores chroma in a separate plane
    pub const fn is_planar(self) -> bool {
        matches!(self, Self::Nv12 | Self::P010 | Self::P016)
    }

    /// Hardware surface-format code used in surface states
    pub const fn hw_code(self) -> u32 {
        match self {
            Self::Buffer => 0x1FF,
            Self::A8 => 0x144,
            Self::L8 => 0x114,
            Self::R8Uint => 0x142,
            Self::R16Uint => 0x10D,
            Self::R32F => 0xD8,
            Self::A8R8G8B8 => 0xC0,
            Self::X8R8G8B8 => 0xE9,
            Self::A8B8G8R8 => 0xC7,
            Self::R10G10B10A2 => 0xC2,
            Self::A16B16G16R16F => 0x84,
            Self::Yuy2 => 0x182,
            Self::Nv12 => 0x259,
            Self::P010 => 0x18A,
            Self::P016 => 0x18B,
        }
    }
}

/// Which surface table a resource lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    /// Linear buffer
    Buffer,
    /// 2D surface backed by a driver allocation
    Surface2D,
    /// 2D surface backed by user memory
    Surface2DUp,
    /// 3D surface
    Surface3D,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_addr_parts() {
        let addr = GpuAddr::new(0x0000_0012_3456_7890);
        assert_eq!(addr.low(), 0x3456_7890);
        assert_eq!(addr.high(), 0x12);
        assert_eq!(GpuAddr::from_parts(addr.low(), addr.high()), addr);
        assert_eq!((addr + 0x10).raw(), 0x0000_0012_3456_78A0);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(format!("{}", TaskId::new(3)), "TaskId#3");
        assert_eq!(BufferHandle::new(7).index(), 7);
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Finished.is_terminal());
        assert!(TaskStatus::Reset.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_context_index_dense() {
        for (i, ctx) in GpuContext::ALL.iter().enumerate() {
            assert_eq!(ctx.index(), i);
        }
        assert!(!GpuContext::Vebox.is_render());
    }
}
