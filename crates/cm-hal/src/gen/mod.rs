//! # Generation Profiles
//!
//! Everything that differs between GPU generations sits behind
//! [`HardwareProfile`]: timestamp frequency, walker limits, L3 partitions,
//! preemption selection and the walker encodings.
//!
//! ## Profiles
//!
//! | Platform | Walker max | ns/tick | Preemption |
//! |----------|-----------|---------|------------|
//! | Gen8     | 511       | 80      | none       |
//! | Gen9     | 2047      | 83.333  | TG / batch |
//! | Gen9 LP  | 2047      | 52.083  | TG / batch |
//! | Gen10    | 2047      | 52.083  | TG / batch |
//! | Gen11    | 2047      | 52.083  | MT / TG / batch |

mod gen10;
mod gen11;
mod gen8;
mod gen9;

use alloc::boxed::Box;
use core::fmt;

use cm_cmd::{CommandBuffer, GpgpuWalker, GpuPipeline, MediaObjectWalker};
use cm_core::consts::MAX_COLOR_COUNT;
use cm_core::{
    Error, GtSystemInfo, L3Config, Platform, Result, SkuFlags, SurfaceFormat, SurfaceKind,
    WaFlags,
};

pub use gen10::Gen10Profile;
pub use gen11::Gen11Profile;
pub use gen8::Gen8Profile;
pub use gen9::Gen9Profile;

// =============================================================================
// REGISTERS
// =============================================================================

/// Per-context preemption control
pub const CS_CHICKEN1_REGISTER: u32 = 0x2580;
/// Thread debug control
pub const TD_CTL_REGISTER: u32 = 0xE400;
/// Power clock state
pub const POWER_CLOCK_STATE_REGISTER: u32 = 0x20C8;

/// TD_CTL value enabling breakpoints and force-external-halt
pub const TD_CTL_DEBUG_ENABLE: u32 = (1 << 4) | (1 << 7);

const PREEMPTION_MASK: u32 = 0x0006 << 16;

// =============================================================================
// PREEMPTION
// =============================================================================

/// Preemption granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionMode {
    /// Preempt between instructions
    MidThread,
    /// Preempt at thread-group boundaries
    ThreadGroup,
    /// Preempt between commands
    MidBatch,
}

impl PreemptionMode {
    /// Masked value for the preemption control register
    pub const fn register_value(self) -> u32 {
        PREEMPTION_MASK
            | match self {
                Self::MidThread => 0x0,
                Self::ThreadGroup => 0x2,
                Self::MidBatch => 0x4,
            }
    }
}

/// Thread-group if the pipe supports it, mid-batch otherwise
pub(crate) fn thread_group_or_mid_batch(sku: SkuFlags, pipeline: GpuPipeline) -> PreemptionMode {
    let (tg, mt) = match pipeline {
        GpuPipeline::Gpgpu => (
            SkuFlags::GPGPU_THREAD_GROUP_PREEMPT,
            SkuFlags::GPGPU_MID_THREAD_PREEMPT,
        ),
        GpuPipeline::Media => (
            SkuFlags::MEDIA_THREAD_GROUP_PREEMPT,
            SkuFlags::MEDIA_MID_THREAD_PREEMPT,
        ),
    };
    if sku.intersects(tg | mt) {
        PreemptionMode::ThreadGroup
    } else {
        PreemptionMode::MidBatch
    }
}

// =============================================================================
// HARDWARE PROFILE
// =============================================================================

/// Generation-specific behavior
pub trait HardwareProfile: fmt::Debug {
    /// Generation
    fn platform(&self) -> Platform;

    /// Convert timestamp ticks to nanoseconds
    fn ticks_to_ns(&self, ticks: u64) -> u64;

    /// Widest media-walker thread space
    fn media_walker_max_width(&self) -> u32 {
        2047
    }

    /// Tallest media-walker thread space
    fn media_walker_max_height(&self) -> u32 {
        2047
    }

    /// Thread-space color counts are 1..=16
    fn color_count_sanity_check(&self, color_count: u32) -> Result<()> {
        if color_count == 0 || color_count > MAX_COLOR_COUNT {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    /// Reject MOCS indices the generation does not define
    fn mocs_policy_check(&self, _kind: SurfaceKind, mocs: u8) -> Result<()> {
        if mocs >= 64 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    /// L3 partitions the runtime may choose from
    fn suggested_l3_configs(&self) -> &'static [L3Config];

    /// Look up a suggested L3 partition
    fn set_suggested_l3_conf(&self, index: usize) -> Result<L3Config> {
        self.suggested_l3_configs()
            .get(index)
            .copied()
            .ok_or(Error::InvalidParameter)
    }

    /// L3 control register
    fn l3_register(&self) -> u32;

    /// Preemption granularity, or `None` when it is not programmable
    fn preemption_mode(
        &self,
        sku: SkuFlags,
        pipeline: GpuPipeline,
        sip: bool,
        csr: bool,
    ) -> Result<Option<PreemptionMode>>;

    /// Whether a format can be bound as a VME surface
    fn vme_surface_supported(&self, format: SurfaceFormat) -> bool {
        matches!(format, SurfaceFormat::Nv12)
    }

    /// Whether GPGPU_WALKER dispatch exists
    fn supports_gpgpu_walker(&self) -> bool {
        true
    }

    /// Append a media walker after checking generation limits
    fn emit_media_walker(&self, buffer: &mut CommandBuffer, walker: &MediaObjectWalker) -> Result<()> {
        let res = walker.global_resolution;
        if res.x <= 0
            || res.y <= 0
            || res.x as u32 > self.media_walker_max_width()
            || res.y as u32 > self.media_walker_max_height()
        {
            log::warn!(
                "cm-hal: {:?} walker of {}x{} exceeds limits",
                self.platform(),
                res.x,
                res.y
            );
            return Err(Error::InvalidParameter);
        }
        self.color_count_sanity_check(walker.color_count_minus_one as u32 + 1)?;
        buffer.add(walker)
    }

    /// Append a GPGPU walker
    fn emit_gpgpu_walker(&self, buffer: &mut CommandBuffer, walker: &GpgpuWalker) -> Result<()> {
        if !self.supports_gpgpu_walker() {
            return Err(Error::Unimplemented);
        }
        buffer.add(walker)
    }

    /// Whether a dummy MEDIA_VFE_STATE must follow the last walker
    fn requires_dummy_vfe(&self, wa: WaFlags) -> bool {
        wa.contains(WaFlags::SEND_DUMMY_VFE_AFTER_WALKER)
    }

    /// Hardware thread ceiling for VFE state
    fn hw_max_threads(&self, gt: &GtSystemInfo) -> u32 {
        gt.max_hw_threads()
    }
}

/// Profile for a platform
pub fn profile_for(platform: Platform) -> Box<dyn HardwareProfile> {
    match platform {
        Platform::Gen8 => Box::new(Gen8Profile),
        Platform::Gen9 => Box::new(Gen9Profile::new(false)),
        Platform::Gen9Lp => Box::new(Gen9Profile::new(true)),
        Platform::Gen10 => Box::new(Gen10Profile),
        Platform::Gen11 => Box::new(Gen11Profile),
    }
}

/// `ticks * num / den` without intermediate overflow
pub(crate) fn scale_ticks(ticks: u64, num: u64, den: u64) -> u64 {
    ((ticks as u128 * num as u128) / den as u128) as u64
}
