//! # Vebox Commands
//!
//! Commands for the fixed-function video enhancement engine.

use bitflags::bitflags;
use cm_core::GpuAddr;

use crate::buffer::{Dwords, Encode};
use crate::gfx_header;

bitflags! {
    /// VEBOX_STATE dword 1 enables
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VeboxStateFlags: u32 {
        /// Denoise
        const DN_ENABLE = 1 << 0;
        /// Deinterlace
        const DI_ENABLE = 1 << 1;
        /// DN/DI first frame (no history)
        const DNDI_FIRST_FRAME = 1 << 2;
        /// Image enhancement / color processing
        const IECP_ENABLE = 1 << 3;
        /// Deinterlace writes both output frames
        const DI_OUTPUT_BOTH_FRAMES = 1 << 4;
        /// Bayer demosaic
        const DEMOSAIC_ENABLE = 1 << 5;
        /// Vignette correction
        const VIGNETTE_ENABLE = 1 << 6;
        /// Hot pixel filter
        const HOT_PIXEL_FILTER_ENABLE = 1 << 7;
    }
}

/// VEBOX_STATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VeboxState {
    /// Pipeline enables
    pub flags: VeboxStateFlags,
    /// DN/DI state page
    pub dndi_state: GpuAddr,
    /// IECP state page
    pub iecp_state: GpuAddr,
    /// Gamut state page
    pub gamut_state: GpuAddr,
    /// Vertex table page
    pub vertex_table: GpuAddr,
    /// Capture pipe state page
    pub capture_pipe_state: GpuAddr,
}

impl VeboxState {
    /// Encoded length
    pub const DWORDS: u32 = 14;

    /// Parse the enable flags
    pub fn parse_flags(dw: &[u32]) -> Option<VeboxStateFlags> {
        dw.get(1).map(|v| VeboxStateFlags::from_bits_truncate(*v))
    }
}

impl Encode for VeboxState {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(2, 4, 2, Self::DWORDS));
        out.push(self.flags.bits());
        for addr in [
            self.dndi_state,
            self.iecp_state,
            self.gamut_state,
            self.vertex_table,
            self.capture_pipe_state,
        ] {
            out.push(addr.low());
            out.push(addr.high());
        }
        out.push(0);
        out.push(0);
    }

    fn name(&self) -> &'static str {
        "VEBOX_STATE"
    }
}

/// VEBOX_SURFACE_STATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VeboxSurfaceState {
    /// Describes the output surface
    pub is_output: bool,
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Pitch in bytes
    pub pitch: u32,
    /// Hardware format code
    pub format: u32,
}

impl VeboxSurfaceState {
    /// Encoded length
    pub const DWORDS: u32 = 9;
}

impl Encode for VeboxSurfaceState {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(2, 4, 0, Self::DWORDS));
        out.push(self.is_output as u32);
        out.push(
            ((self.height.saturating_sub(1) & 0x3FFF) << 18)
                | ((self.width.saturating_sub(1) & 0x3FFF) << 4),
        );
        out.push(((self.format & 0x1FF) << 20) | (self.pitch.saturating_sub(1) & 0x1FFFF));
        for _ in 0..5 {
            out.push(0);
        }
    }

    fn name(&self) -> &'static str {
        "VEBOX_SURFACE_STATE"
    }
}

/// Surfaces VEBOX_DI_IECP reads and writes
pub const VEBOX_DI_IECP_SURFACES: usize = 9;

/// VEBOX_DI_IECP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VeboxDiIecp {
    /// Last column processed plus one
    pub end_x: u32,
    /// Rows processed
    pub end_y: u32,
    /// Addresses in fixed order: current in, previous in, STMM in, STMM out,
    /// denoised current out, current out, previous out, statistics out,
    /// alpha/vignette. Null for absent surfaces.
    pub surfaces: [GpuAddr; VEBOX_DI_IECP_SURFACES],
}

impl VeboxDiIecp {
    /// Encoded length
    pub const DWORDS: u32 = 3 + 2 * VEBOX_DI_IECP_SURFACES as u32;
}

impl Encode for VeboxDiIecp {
    fn encode(&self, out: &mut Dwords) {
        out.push(gfx_header(2, 4, 3, Self::DWORDS));
        out.push((self.end_x.saturating_sub(1) & 0x3FFF) << 16);
        out.push(self.end_y);
        for addr in self.surfaces {
            out.push(addr.low());
            out.push(addr.high());
        }
    }

    fn name(&self) -> &'static str {
        "VEBOX_DI_IECP"
    }
}
