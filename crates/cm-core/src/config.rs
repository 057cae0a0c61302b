//! # Device Configuration
//!
//! Options fixed at device creation, user-feature overrides and the
//! runtime-adjustable power and L3 settings.

use crate::consts::{
    KERNEL_BINARY_BLOCK_SIZE, KERNEL_BINARY_GSH_STEP, MAX_TASKS, MAX_TASKS_DEFAULT,
    SCRATCH_SPACE_SIZE_DEFAULT, SCRATCH_SPACE_SIZE_STEP,
};
use crate::error::{Error, Result};
use crate::caps::GtSystemInfo;

// =============================================================================
// CONFIG WORD LAYOUT
// =============================================================================

const SCRATCH_SPACE_DISABLE: u32 = 1 << 0;
const SCRATCH_SPACE_SIZE_SHIFT: u32 = 1;
const SCRATCH_SPACE_SIZE_MASK: u32 = 0x7 << SCRATCH_SPACE_SIZE_SHIFT;
const TASK_NUM_SHIFT: u32 = 4;
const TASK_NUM_MASK: u32 = 0x3 << TASK_NUM_SHIFT;
const TASK_NUM_STEP: u32 = 4;
const MEDIA_RESET_ENABLE: u32 = 1 << 7;
const EXTRA_TASK_NUM_SHIFT: u32 = 8;
const EXTRA_TASK_NUM_MASK: u32 = 0x3 << EXTRA_TASK_NUM_SHIFT;
const SLICE_SHUTDOWN_ENABLE: u32 = 1 << 10;
const GPU_CONTEXT_ENABLE: u32 = 1 << 12;
const KERNEL_BINARY_GSH_SHIFT: u32 = 13;
const KERNEL_BINARY_GSH_MASK: u32 = 0xFF << KERNEL_BINARY_GSH_SHIFT;
const DSH_DISABLE: u32 = 1 << 21;
const MID_THREAD_PREEMPTION_DISABLE: u32 = 1 << 22;
const KERNEL_DEBUG_ENABLE: u32 = 1 << 23;
const VEBOX_DISABLE: u32 = 1 << 28;

// =============================================================================
// DEVICE OPTIONS
// =============================================================================

/// Device creation options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    /// No per-thread scratch space is reserved
    pub disable_scratch_space: bool,
    /// Scratch bytes per thread
    pub scratch_space_size: u32,
    /// Task-slot table size
    pub max_task_number: u32,
    /// Power-saving slice disable
    pub request_slice_shutdown: bool,
    /// Submit on a dedicated CM GPU context
    pub request_custom_gpu_context: bool,
    /// Bytes of general state heap reserved for kernel binaries
    pub kernel_binary_size_in_gsh: u32,
    /// Per-dispatch state lives in the dynamic state heap
    pub dynamic_state_heap: bool,
    /// Never program mid-thread preemption
    pub disable_mid_thread_preemption: bool,
    /// Reserve SIP/CSR resources for kernel debugging
    pub enable_kernel_debug: bool,
    /// Do not create the vebox context
    pub disable_vebox: bool,
    /// Media reset on hang
    pub media_reset: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            disable_scratch_space: false,
            scratch_space_size: SCRATCH_SPACE_SIZE_DEFAULT,
            max_task_number: MAX_TASKS_DEFAULT,
            request_slice_shutdown: false,
            request_custom_gpu_context: false,
            kernel_binary_size_in_gsh: KERNEL_BINARY_GSH_STEP,
            dynamic_state_heap: true,
            disable_mid_thread_preemption: false,
            enable_kernel_debug: false,
            disable_vebox: false,
            media_reset: false,
        }
    }
}

impl DeviceOptions {
    /// Decode the runtime's packed device-creation word
    pub fn from_config_bits(bits: u32) -> Result<Self> {
        let disable_scratch_space = bits & SCRATCH_SPACE_DISABLE != 0;
        let scratch_space_size = if disable_scratch_space {
            0
        } else {
            match (bits & SCRATCH_SPACE_SIZE_MASK) >> SCRATCH_SPACE_SIZE_SHIFT {
                0 => SCRATCH_SPACE_SIZE_DEFAULT,
                n => n * SCRATCH_SPACE_SIZE_STEP,
            }
        };

        let base_tasks = (((bits & TASK_NUM_MASK) >> TASK_NUM_SHIFT) + 1) * TASK_NUM_STEP;
        let multiplier = ((bits & EXTRA_TASK_NUM_MASK) >> EXTRA_TASK_NUM_SHIFT) + 1;
        let max_task_number = (base_tasks * multiplier).min(MAX_TASKS);

        let gsh_blocks = match (bits & KERNEL_BINARY_GSH_MASK) >> KERNEL_BINARY_GSH_SHIFT {
            0 => 1,
            n => n,
        };

        let options = Self {
            disable_scratch_space,
            scratch_space_size,
            max_task_number,
            request_slice_shutdown: bits & SLICE_SHUTDOWN_ENABLE != 0,
            request_custom_gpu_context: bits & GPU_CONTEXT_ENABLE != 0,
            kernel_binary_size_in_gsh: gsh_blocks * KERNEL_BINARY_GSH_STEP,
            dynamic_state_heap: bits & DSH_DISABLE == 0,
            disable_mid_thread_preemption: bits & MID_THREAD_PREEMPTION_DISABLE != 0,
            enable_kernel_debug: bits & KERNEL_DEBUG_ENABLE != 0,
            disable_vebox: bits & VEBOX_DISABLE != 0,
            media_reset: bits & MEDIA_RESET_ENABLE != 0,
        };
        options.validate()?;
        Ok(options)
    }

    /// Check option ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_task_number == 0 || self.max_task_number > MAX_TASKS {
            log::warn!("cm: rejected task number {}", self.max_task_number);
            return Err(Error::InvalidParameter);
        }
        if self.kernel_binary_size_in_gsh < KERNEL_BINARY_BLOCK_SIZE {
            log::warn!(
                "cm: kernel binary region of {} bytes is too small",
                self.kernel_binary_size_in_gsh
            );
            return Err(Error::InvalidParameter);
        }
        if !self.disable_scratch_space && self.scratch_space_size > SCRATCH_SPACE_SIZE_DEFAULT {
            log::warn!("cm: rejected scratch size {}", self.scratch_space_size);
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    /// Scratch bytes per thread actually reserved
    pub const fn effective_scratch_size(&self) -> u32 {
        if self.disable_scratch_space {
            0
        } else {
            self.scratch_space_size
        }
    }
}

// =============================================================================
// USER FEATURES
// =============================================================================

/// Overrides normally read from the driver's user-feature store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserFeatures {
    /// Max hardware threads for VFE state; 0 leaves it to the API/hardware
    pub max_threads: u32,
    /// Rebuild batch buffers even when other tasks still reference them
    pub force_batch_rebuild: bool,
}

// =============================================================================
// POWER OPTION
// =============================================================================

/// Requested slice/sub-slice/EU configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerOption {
    /// Slices; 0 means unchanged
    pub slice_count: u16,
    /// Sub-slices; 0 means unchanged
    pub subslice_count: u16,
    /// EUs; 0 means unchanged
    pub eu_count: u16,
}

impl PowerOption {
    /// Reject requests beyond the GT topology
    pub fn validate(&self, gt: &GtSystemInfo) -> Result<()> {
        if u32::from(self.slice_count) > gt.slice_count
            || u32::from(self.subslice_count) > gt.subslice_count
            || u32::from(self.eu_count) > gt.eu_count
        {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    /// Whether any field asks for a change
    pub const fn is_requested(&self) -> bool {
        self.slice_count != 0 || self.subslice_count != 0 || self.eu_count != 0
    }

    /// Value for the power clock state register
    pub const fn register_value(&self) -> u32 {
        const ENABLE: u32 = 1 << 31;
        ENABLE
            | ((self.slice_count as u32 & 0x7) << 15)
            | ((self.subslice_count as u32 & 0xF) << 8)
            | (self.eu_count as u32 & 0xFF)
    }
}

// =============================================================================
// L3 CONFIGURATION
// =============================================================================

/// L3 cache partitioning register values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct L3Config {
    /// SQC register 1
    pub sqc1: u32,
    /// SQC register 2
    pub sqc2: u32,
    /// L3 LRA register
    pub lra: u32,
    /// L3 control/allocation register
    pub cntl: u32,
}

impl L3Config {
    /// Build from the four register values
    pub const fn new(sqc1: u32, sqc2: u32, lra: u32, cntl: u32) -> Self {
        Self { sqc1, sqc2, lra, cntl }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_word_matches_defaults() {
        let opts = DeviceOptions::from_config_bits(0).unwrap();
        assert_eq!(opts.max_task_number, 4);
        assert_eq!(opts.scratch_space_size, 128 * 1024);
        assert_eq!(opts.kernel_binary_size_in_gsh, 2 * 1024 * 1024);
        assert!(opts.dynamic_state_heap);
        assert!(!opts.disable_vebox);
    }

    #[test]
    fn test_task_number_bits() {
        // bits 4-5 = 3 -> 16 tasks, bits 8-9 = 3 -> x4
        let opts = DeviceOptions::from_config_bits((3 << 4) | (3 << 8)).unwrap();
        assert_eq!(opts.max_task_number, 64);
        let opts = DeviceOptions::from_config_bits(1 << 4).unwrap();
        assert_eq!(opts.max_task_number, 8);
    }

    #[test]
    fn test_scratch_bits() {
        let opts = DeviceOptions::from_config_bits(1 << 1).unwrap();
        assert_eq!(opts.scratch_space_size, 16 * 1024);
        let opts = DeviceOptions::from_config_bits(1 | (3 << 1)).unwrap();
        assert!(opts.disable_scratch_space);
        assert_eq!(opts.effective_scratch_size(), 0);
    }

    #[test]
    fn test_flag_bits() {
        let bits = (1 << 10) | (1 << 12) | (1 << 21) | (1 << 22) | (1 << 23) | (1 << 28);
        let opts = DeviceOptions::from_config_bits(bits).unwrap();
        assert!(opts.request_slice_shutdown);
        assert!(opts.request_custom_gpu_context);
        assert!(!opts.dynamic_state_heap);
        assert!(opts.disable_mid_thread_preemption);
        assert!(opts.enable_kernel_debug);
        assert!(opts.disable_vebox);
    }

    #[test]
    fn test_gsh_size_bits() {
        let opts = DeviceOptions::from_config_bits(2 << 13).unwrap();
        assert_eq!(opts.kernel_binary_size_in_gsh, 4 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_zero_tasks() {
        let opts = DeviceOptions {
            max_task_number: 0,
            ..DeviceOptions::default()
        };
        assert_eq!(opts.validate(), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_power_option_bounds() {
        let gt = GtSystemInfo::default();
        let ok = PowerOption {
            slice_count: 1,
            subslice_count: 2,
            eu_count: 16,
        };
        assert!(ok.validate(&gt).is_ok());
        assert!(ok.is_requested());
        let bad = PowerOption {
            slice_count: 2,
            ..PowerOption::default()
        };
        assert_eq!(bad.validate(&gt), Err(Error::InvalidParameter));
    }
}
