//! Gen8 (Broadwell) profile.

use cm_cmd::GpuPipeline;
use cm_core::{Error, L3Config, Platform, Result, SkuFlags, SurfaceKind};

use super::{HardwareProfile, PreemptionMode};

const L3_CNTL_REGISTER: u32 = 0x7034;

static L3_CONFIGS: [L3Config; 8] = [
    L3Config::new(0, 0, 0, 0x6000_0060),
    L3Config::new(0, 0, 0, 0x0041_0060),
    L3Config::new(0, 0, 0, 0x0041_8040),
    L3Config::new(0, 0, 0, 0x0002_0040),
    L3Config::new(0, 0, 0, 0x8000_0040),
    L3Config::new(0, 0, 0, 0x6000_0021),
    L3Config::new(0, 0, 0, 0x0041_0021),
    L3Config::new(0, 0, 0, 0x0080_8021),
];

/// Gen8
#[derive(Debug, Clone, Copy, Default)]
pub struct Gen8Profile;

impl HardwareProfile for Gen8Profile {
    fn platform(&self) -> Platform {
        Platform::Gen8
    }

    fn ticks_to_ns(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(80)
    }

    fn media_walker_max_width(&self) -> u32 {
        511
    }

    fn media_walker_max_height(&self) -> u32 {
        511
    }

    fn mocs_policy_check(&self, _kind: SurfaceKind, mocs: u8) -> Result<()> {
        if mocs >= 128 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    fn suggested_l3_configs(&self) -> &'static [L3Config] {
        &L3_CONFIGS
    }

    fn l3_register(&self) -> u32 {
        L3_CNTL_REGISTER
    }

    fn preemption_mode(
        &self,
        _sku: SkuFlags,
        _pipeline: GpuPipeline,
        _sip: bool,
        csr: bool,
    ) -> Result<Option<PreemptionMode>> {
        if csr {
            log::warn!("cm-hal: mid-thread preemption is not available on Gen8");
            return Err(Error::Unimplemented);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_preemption_control() {
        let p = Gen8Profile;
        let sku = SkuFlags::all();
        assert_eq!(p.preemption_mode(sku, GpuPipeline::Media, false, false), Ok(None));
        assert_eq!(
            p.preemption_mode(sku, GpuPipeline::Gpgpu, false, true),
            Err(Error::Unimplemented)
        );
        assert_eq!(p.suggested_l3_configs()[1].cntl, 0x0041_0060);
    }
}
