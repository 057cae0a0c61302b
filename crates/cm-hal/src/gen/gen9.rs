//! Gen9 (Skylake, Kaby Lake) and Gen9 LP (Broxton) profile.

use cm_cmd::GpuPipeline;
use cm_core::{L3Config, Platform, Result, SkuFlags};

use super::{scale_ticks, thread_group_or_mid_batch, HardwareProfile, PreemptionMode};

const L3_CNTL_REGISTER: u32 = 0x7034;

static L3_CONFIGS: [L3Config; 8] = [
    L3Config::new(0, 0, 0, 0x6000_0060),
    L3Config::new(0, 0, 0, 0x0080_8060),
    L3Config::new(0, 0, 0, 0x0081_8040),
    L3Config::new(0, 0, 0, 0x0003_0040),
    L3Config::new(0, 0, 0, 0x8000_0040),
    L3Config::new(0, 0, 0, 0x6000_0121),
    L3Config::new(0, 0, 0, 0x0041_0121),
    L3Config::new(0, 0, 0, 0x0080_8121),
];

/// Gen9, with the low-power variant's slower timestamp
#[derive(Debug, Clone, Copy)]
pub struct Gen9Profile {
    low_power: bool,
}

impl Gen9Profile {
    /// Profile for the core (`false`) or LP (`true`) part
    pub const fn new(low_power: bool) -> Self {
        Self { low_power }
    }
}

impl HardwareProfile for Gen9Profile {
    fn platform(&self) -> Platform {
        if self.low_power {
            Platform::Gen9Lp
        } else {
            Platform::Gen9
        }
    }

    fn ticks_to_ns(&self, ticks: u64) -> u64 {
        if self.low_power {
            scale_ticks(ticks, 52_083, 1000)
        } else {
            scale_ticks(ticks, 83_333, 1000)
        }
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preemption_selection() {
        let p = Gen9Profile::new(false);
        let base = SkuFlags::PER_CTX_PREEMPTION_GRANULARITY;
        assert_eq!(
            p.preemption_mode(base | SkuFlags::GPGPU_THREAD_GROUP_PREEMPT, GpuPipeline::Gpgpu, false, false),
            Ok(Some(PreemptionMode::ThreadGroup))
        );
        assert_eq!(
            p.preemption_mode(base | SkuFlags::GPGPU_THREAD_GROUP_PREEMPT, GpuPipeline::Media, false, false),
            Ok(Some(PreemptionMode::MidBatch))
        );
        assert_eq!(
            p.preemption_mode(base | SkuFlags::MEDIA_MID_THREAD_PREEMPT, GpuPipeline::Media, false, false),
            Ok(Some(PreemptionMode::ThreadGroup))
        );
        assert_eq!(
            p.preemption_mode(SkuFlags::MEDIA_THREAD_GROUP_PREEMPT, GpuPipeline::Media, false, false),
            Ok(None)
        );
        assert_eq!(
            p.preemption_mode(SkuFlags::all(), GpuPipeline::Media, true, false),
            Ok(Some(PreemptionMode::MidBatch))
        );
    }

    #[test]
    fn test_l3_table() {
        let p = Gen9Profile::new(true);
        assert_eq!(p.platform(), Platform::Gen9Lp);
        assert_eq!(p.set_suggested_l3_conf(0).unwrap().cntl, 0x6000_0060);
        assert_eq!(p.l3_register(), 0x7034);
    }
}
