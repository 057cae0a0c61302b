//! # Limits
//!
//! Fixed capacities imposed by the hardware and the CM runtime ABI.

// =============================================================================
// SCRATCH SPACE
// =============================================================================

/// Per-thread scratch space when the device options leave it unset
pub const SCRATCH_SPACE_SIZE_DEFAULT: u32 = 128 * 1024;
/// Scratch size granularity in the device config word
pub const SCRATCH_SPACE_SIZE_STEP: u32 = 16 * 1024;

// =============================================================================
// TASKS
// =============================================================================

/// Task slots when the device options do not ask for more
pub const MAX_TASKS_DEFAULT: u32 = 4;
/// Upper bound on task slots
pub const MAX_TASKS: u32 = 64;
/// Kernels in one task
pub const MAX_KERNELS_PER_TASK: usize = 16;
/// Conditional batch-buffer-end commands in one task
pub const MAX_CONDITIONAL_END_CMDS: usize = 64;
/// Dependency vectors in one thread space
pub const MAX_DEPENDENCY_COUNT: usize = 8;
/// Thread-space color count ceiling
pub const MAX_COLOR_COUNT: u32 = 16;

// =============================================================================
// RESOURCE TABLES
// =============================================================================

/// Sampler table entries
pub const MAX_SAMPLER_TABLE_SIZE: usize = 512;
/// Sampler8x8 table entries
pub const MAX_SAMPLER8X8_TABLE_SIZE: usize = 2;
/// Buffer table entries
pub const MAX_BUFFER_TABLE_SIZE: usize = 256;
/// 2D surface table entries
pub const MAX_2D_TABLE_SIZE: usize = 256;
/// 2D user-memory surface table entries
pub const MAX_2D_UP_TABLE_SIZE: usize = 512;
/// 3D surface table entries
pub const MAX_3D_TABLE_SIZE: usize = 64;
/// Alias views over one 2D surface
pub const MAX_2D_ALIASES: usize = 10;
/// Alias views over one buffer
pub const MAX_BUFFER_ALIASES: usize = 10;

// =============================================================================
// BINDING TABLES
// =============================================================================

/// Binding-table indices tracked per task
pub const MAX_BINDING_INDICES: usize = 256;
/// Surface states one kernel's binding table may reference
pub const MAX_SURFACE_STATES_PER_BT: usize = 64;
/// Index reserved for the null surface
pub const NULL_SURFACE_BINDING_INDEX: u8 = 0;
/// Index the debug surface is pinned at
pub const DEBUG_SURFACE_INDEX: u8 = 252;

// =============================================================================
// KERNEL BINARIES AND HEAPS
// =============================================================================

/// Largest single kernel binary
pub const KERNEL_BINARY_BLOCK_SIZE: u32 = 65536;
/// Granularity of the kernel binary region in the general state heap
pub const KERNEL_BINARY_GSH_STEP: u32 = 2 * 1024 * 1024;
/// Kernel binaries are padded to this boundary
pub const KERNEL_BINARY_PADDING_SIZE: u32 = 128;
/// Size of a clone placeholder entry
pub const CLONE_ENTRY_SIZE: u32 = 64;
/// Misses before the cache considers a compaction
pub const KERNEL_CACHE_MISS_THRESHOLD: u32 = 4;
/// Hits per miss below which the cache compacts
pub const KERNEL_CACHE_HIT_TO_MISS_RATIO: u32 = 100;

// =============================================================================
// SYNCHRONIZATION
// =============================================================================

/// Bytes of timestamp memory per task slot (begin, end, tag, tracker)
pub const SYNC_SLOT_STRIDE: u32 = 32;
/// Timestamp value meaning "not written yet"
pub const INVALID_TIMESTAMP: u64 = u64::MAX;

// =============================================================================
// VEBOX
// =============================================================================

/// Size of one vebox parameter page
pub const VEBOX_PARAM_PAGE_SIZE: u32 = 0x1000;
/// Vebox parameter pages
pub const VEBOX_PARAM_PAGE_NUM: u32 = 5;
/// Vebox surface slots
pub const MAX_VEBOX_SURFACES: usize = 16;
/// DN/DI history initial value written to STMM surfaces
pub const DNDI_HISTORY_INIT_VALUE: u8 = 0xFF;

static_assertions::const_assert!(MAX_TASKS_DEFAULT <= MAX_TASKS);
static_assertions::const_assert_eq!(SYNC_SLOT_STRIDE % 8, 0);
static_assertions::const_assert!((DEBUG_SURFACE_INDEX as usize) < MAX_BINDING_INDICES);
static_assertions::const_assert!(KERNEL_BINARY_BLOCK_SIZE < KERNEL_BINARY_GSH_STEP);
static_assertions::const_assert!(CLONE_ENTRY_SIZE <= KERNEL_BINARY_PADDING_SIZE);
