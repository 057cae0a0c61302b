//! Gen11 (Ice Lake) profile.

use cm_cmd::GpuPipeline;
use cm_core::{L3Config, Platform, Result, SkuFlags, SurfaceFormat};

use super::{scale_ticks, HardwareProfile, PreemptionMode};

const L3_ALLOC_REGISTER: u32 = 0xB134;

static L3_CONFIGS: [L3Config; 6] = [
    L3Config::new(0, 0, 0, 0xA000_0420),
    L3Config::new(0, 0, 0, 0xC000_0040),
    L3Config::new(0, 0, 0, 0xA000_0040),
    L3Config::new(0, 0, 0, 0x8000_0040),
    L3Config::new(0, 0, 0, 0x6000_0060),
    L3Config::new(0, 0, 0, 0x4000_0080),
];

/// Gen11
#[derive(Debug, Clone, Copy, Default)]
pub struct Gen11Profile;

impl HardwareProfile for Gen11Profile {
    fn platform(&self) -> Platform {
        Platform::Gen11
    }

    fn ticks_to_ns(&self, ticks: u64) -> u64 {
        scale_ticks(ticks, 52_083, 1000)
    }

    fn suggested_l3_configs(&self) -> &'static [L3Config] {
        &L3_CONFIGS
    }

    fn l3_register(&self) -> u32 {
        L3_ALLOC_REGISTER
    }

    fn preemption_mode(
        &self,
        sku: SkuFlags,
        pipeline: GpuPipeline,
        sip: bool,
        csr: bool,
    ) -> Result<Option<PreemptionMode>> {
        if !sku.contains(SkuFlags::PER_CTX_PREEMPTION_GRANULARITY) {
            return Ok(None);
        }
        if sip {
            return Ok(Some(PreemptionMode::MidBatch));
        }
        let mode = match pipeline {
            GpuPipeline::Gpgpu => {
                if sku.contains(SkuFlags::GPGPU_MID_THREAD_PREEMPT) {
                    if csr {
                        PreemptionMode::MidThread
                    } else {
                        PreemptionMode::ThreadGroup
                    }
                } else if sku.contains(SkuFlags::GPGPU_THREAD_GROUP_PREEMPT) {
                    PreemptionMode::ThreadGroup
                } else {
                    PreemptionMode::MidBatch
                }
            }
            GpuPipeline::Media => {
                if sku.contains(SkuFlags::MEDIA_MID_THREAD_PREEMPT) {
                    PreemptionMode::MidThread
                } else if sku.contains(SkuFlags::MEDIA_THREAD_GROUP_PREEMPT) {
                    PreemptionMode::ThreadGroup
                } else {
                    PreemptionMode::MidBatch
                }
            }
        };
        Ok(Some(mode))
    }

    fn vme_surface_supported(&self, format: SurfaceFormat) -> bool {
        matches!(
            format,
            SurfaceFormat::Nv12 | SurfaceFormat::P010 | SurfaceFormat::Yuy2
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mid_thread_needs_csr() {
        let p = Gen11Profile;
        let sku = SkuFlags::PER_CTX_PREEMPTION_GRANULARITY | SkuFlags::GPGPU_MID_THREAD_PREEMPT;
        assert_eq!(
            p.preemption_mode(sku, GpuPipeline::Gpgpu, false, true),
            Ok(Some(PreemptionMode::MidThread))
        );
        assert_eq!(
            p.preemption_mode(sku, GpuPipeline::Gpgpu, false, false),
            Ok(Some(PreemptionMode::ThreadGroup))
        );
        assert_eq!(
            p.preemption_mode(sku, GpuPipeline::Media, false, false),
            Ok(Some(PreemptionMode::MidBatch))
        );
        assert_eq!(
            p.preemption_mode(
                sku | SkuFlags::MEDIA_MID_THREAD_PREEMPT,
                GpuPipeline::Media,
                false,
                false
            ),
            Ok(Some(PreemptionMode::MidThread))
        );
        assert_eq!(p.l3_register(), 0xB134);
    }
}
