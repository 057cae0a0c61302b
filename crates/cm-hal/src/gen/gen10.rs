//! Gen10 (Cannon Lake) profile.

use cm_cmd::GpuPipeline;
use cm_core::{L3Config, Platform, Result, SkuFlags, SurfaceFormat};

use super::{scale_ticks, thread_group_or_mid_batch, HardwareProfile, PreemptionMode};

const L3_CNTL_REGISTER: u32 = 0x7034;

static L3_CONFIGS: [L3Config; 6] = [
    L3Config::new(0, 0, 0, 0x8000_0040),
    L3Config::new(0, 0, 0, 0x0081_8040),
    L3Config::new(0, 0, 0, 0x0080_8060),
    L3Config::new(0, 0, 0, 0x6000_0060),
    L3Config::new(0, 0, 0, 0x0041_0121),
    L3Config::new(0, 0, 0, 0x0080_8121),
];

/// Gen10
#[derive(Debug, Clone, Copy, Default)]
pub struct Gen10Profile;

impl HardwareProfile for Gen10Profile {
    fn platform(&self) -> Platform {
        Platform::Gen10
    }

    fn ticks_to_ns(&self, ticks: u64) -> u64 {
        scale_ticks(ticks, 52_083, 1000)
    }

    fn suggested_l3_configs(&self) -> &'static [L3Config] {
        &L3_CONFIGS
    }

    fn l3_register(&self) -> u32 {
        L3_CNTL_REGISTER
    }

    fn preemption_mode(
        &self,
        sku: SkuFlags,
        pipeline: GpuPipeline,
        sip: bool,
        _csr: bool,
    ) -> Result<Option<PreemptionMode>> {
        if !sku.contains(SkuFlags::PER_CTX_PREEMPTION_GRANULARITY) {
            return Ok(None);
        }
        if sip {
            return Ok(Some(PreemptionMode::MidBatch));
        }
        Ok(Some(thread_group_or_mid_batch(sku, pipeline)))
    }

    fn vme_surface_supported(&self, format: SurfaceFormat) -> bool {
        matches!(format, SurfaceFormat::Nv12 | SurfaceFormat::P010)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vme_formats() {
        let p = Gen10Profile;
        assert!(p.vme_surface_supported(SurfaceFormat::P010));
        assert!(!p.vme_surface_supported(SurfaceFormat::A8R8G8B8));
    }
}
