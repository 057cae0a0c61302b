//! # Platform Capabilities
//!
//! Description of the GPU the device context drives: generation, GT
//! topology, feature (SKU) flags and workaround flags.

use bitflags::bitflags;

// =============================================================================
// PLATFORM
// =============================================================================

/// GPU generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Gen8 (Broadwell)
    Gen8,
    /// Gen9 big core (Skylake, Kaby Lake)
    Gen9,
    /// Gen9 low power (Broxton, Gemini Lake)
    Gen9Lp,
    /// Gen10 (Cannon Lake)
    Gen10,
    /// Gen11 (Ice Lake)
    Gen11,
}

impl Platform {
    /// Short name for logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gen8 => "gen8",
            Self::Gen9 => "gen9",
            Self::Gen9Lp => "gen9lp",
            Self::Gen10 => "gen10",
            Self::Gen11 => "gen11",
        }
    }
}

// =============================================================================
// GT SYSTEM INFO
// =============================================================================

/// GT topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GtSystemInfo {
    /// Enabled slices
    pub slice_count: u32,
    /// Enabled sub-slices
    pub subslice_count: u32,
    /// Enabled execution units
    pub eu_count: u32,
    /// Hardware threads per EU
    pub threads_per_eu: u32,
}

impl GtSystemInfo {
    /// Total hardware threads
    pub const fn max_hw_threads(&self) -> u32 {
        self.eu_count * self.threads_per_eu
    }
}

impl Default for GtSystemInfo {
    fn default() -> Self {
        // GT2 part
        Self {
            slice_count: 1,
            subslice_count: 3,
            eu_count: 24,
            threads_per_eu: 7,
        }
    }
}

// =============================================================================
// SKU / WORKAROUND FLAGS
// =============================================================================

bitflags! {
    /// Hardware feature flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SkuFlags: u32 {
        /// Preemption granularity is programmable per context
        const PER_CTX_PREEMPTION_GRANULARITY = 1 << 0;
        /// Media pipe supports mid-thread preemption
        const MEDIA_MID_THREAD_PREEMPT = 1 << 1;
        /// Media pipe supports thread-group preemption
        const MEDIA_THREAD_GROUP_PREEMPT = 1 << 2;
        /// Media pipe supports mid-batch preemption
        const MEDIA_MID_BATCH_PREEMPT = 1 << 3;
        /// GPGPU pipe supports mid-thread preemption
        const GPGPU_MID_THREAD_PREEMPT = 1 << 4;
        /// GPGPU pipe supports thread-group preemption
        const GPGPU_THREAD_GROUP_PREEMPT = 1 << 5;
        /// GPGPU pipe supports mid-batch preemption
        const GPGPU_MID_BATCH_PREEMPT = 1 << 6;
        /// A video enhancement engine is present
        const VEBOX = 1 << 7;
        /// Slice/sub-slice/EU shutdown can be requested
        const SSEU_POWER_GATING = 1 << 8;
        /// A dedicated compute context is available
        const COMPUTE_CONTEXT = 1 << 9;
    }
}

bitflags! {
    /// Hardware workaround flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WaFlags: u32 {
        /// A dummy MEDIA_VFE_STATE must follow the last walker
        const SEND_DUMMY_VFE_AFTER_WALKER = 1 << 0;
        /// Instruction cache must be invalidated on every kernel reload
        const FORCE_ICACHE_INVALIDATE = 1 << 1;
    }
}

// =============================================================================
// PLATFORM INFO
// =============================================================================

/// Everything the engine needs to know about the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Generation
    pub platform: Platform,
    /// GT topology
    pub gt: GtSystemInfo,
    /// Feature flags
    pub sku: SkuFlags,
    /// Workaround flags
    pub wa: WaFlags,
}

impl PlatformInfo {
    /// Typical configuration for a generation
    pub fn for_platform(platform: Platform) -> Self {
        let mut sku = SkuFlags::VEBOX | SkuFlags::SSEU_POWER_GATING;
        let mut gt = GtSystemInfo::default();
        match platform {
            Platform::Gen8 => {}
            Platform::Gen9 | Platform::Gen10 => {
                sku |= SkuFlags::PER_CTX_PREEMPTION_GRANULARITY
                    | SkuFlags::MEDIA_THREAD_GROUP_PREEMPT
                    | SkuFlags::GPGPU_THREAD_GROUP_PREEMPT
                    | SkuFlags::MEDIA_MID_BATCH_PREEMPT
                    | SkuFlags::GPGPU_MID_BATCH_PREEMPT;
            }
            Platform::Gen9Lp => {
                sku |= SkuFlags::PER_CTX_PREEMPTION_GRANULARITY
                    | SkuFlags::MEDIA_MID_BATCH_PREEMPT
                    | SkuFlags::GPGPU_MID_BATCH_PREEMPT;
                gt = GtSystemInfo {
                    slice_count: 1,
                    subslice_count: 3,
                    eu_count: 18,
                    threads_per_eu: 6,
                };
            }
            Platform::Gen11 => {
                sku |= SkuFlags::PER_CTX_PREEMPTION_GRANULARITY
                    | SkuFlags::MEDIA_THREAD_GROUP_PREEMPT
                    | SkuFlags::GPGPU_MID_THREAD_PREEMPT
                    | SkuFlags::GPGPU_THREAD_GROUP_PREEMPT
                    | SkuFlags::MEDIA_MID_BATCH_PREEMPT
                    | SkuFlags::GPGPU_MID_BATCH_PREEMPT
                    | SkuFlags::COMPUTE_CONTEXT;
                gt = GtSystemInfo {
                    slice_count: 1,
                    subslice_count: 8,
                    eu_count: 64,
                    threads_per_eu: 7,
                };
            }
        }
        Self {
            platform,
            gt,
            sku,
            wa: WaFlags::empty(),
        }
    }
}
