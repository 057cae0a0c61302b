//! Sampler and sampler8x8 states.

/// Texel filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Nearest texel
    #[default]
    Nearest,
    /// Bilinear
    Linear,
    /// Anisotropic
    Anisotropic,
}

impl FilterMode {
    const fn hw(self) -> u32 {
        match self {
            Self::Nearest => 0,
            Self::Linear => 1,
            Self::Anisotropic => 2,
        }
    }
}

/// Out-of-range coordinate handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    /// Repeat
    #[default]
    Wrap,
    /// Repeat mirrored
    Mirror,
    /// Clamp to the edge texel
    Clamp,
    /// Use the border color
    Border,
}

impl AddressMode {
    const fn hw(self) -> u32 {
        match self {
            Self::Wrap => 0,
            Self::Mirror => 1,
            Self::Clamp => 2,
            Self::Border => 3,
        }
    }
}

/// Sampler state parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplerState {
    /// Minification filter
    pub min_filter: FilterMode,
    /// Magnification filter
    pub mag_filter: FilterMode,
    /// U address mode
    pub address_u: AddressMode,
    /// V address mode
    pub address_v: AddressMode,
    /// R address mode
    pub address_r: AddressMode,
    /// Border color, RGBA8888
    pub border_color: u32,
}

/// Encoded SAMPLER_STATE size in bytes
pub const SAMPLER_STATE_SIZE: u32 = 16;

impl SamplerState {
    /// SAMPLER_STATE dwords
    pub fn encode(&self) -> [u32; 4] {
        [
            (self.mag_filter.hw() << 17) | (self.min_filter.hw() << 14),
            0,
            self.border_color,
            (self.address_r.hw() << 6) | (self.address_v.hw() << 3) | self.address_u.hw(),
        ]
    }
}

/// Sampler8x8 variety
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampler8x8Kind {
    /// Adaptive video scaler
    Avs,
    /// Video analytics
    Va,
}

/// AVS or VA sampler state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sampler8x8State {
    /// Variety
    pub kind: Sampler8x8Kind,
    /// Adaptive filtering for the Y channel
    pub adaptive_filter: bool,
    /// 8-tap filter coefficients, one per phase
    pub coefficients: alloc::vec::Vec<u32>,
}

impl Sampler8x8State {
    /// Default AVS state
    pub fn avs() -> Self {
        Self {
            kind: Sampler8x8Kind::Avs,
            adaptive_filter: true,
            coefficients: alloc::vec::Vec::new(),
        }
    }

    /// Default VA state
    pub fn va() -> Self {
        Self {
            kind: Sampler8x8Kind::Va,
            adaptive_filter: false,
            coefficients: alloc::vec::Vec::new(),
        }
    }
}
