//! 2D, 2D-UP and 3D surface table entries.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use cm_core::consts::MAX_2D_ALIASES;
use cm_core::{Error, GpuAddr, OsResource, Result, SurfaceFormat, SurfaceKind};

use super::binding::SurfaceStateDesc;

/// Row pitch alignment of runtime-allocated 2D surfaces
pub const PITCH_ALIGNMENT: u32 = 64;

const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Rows a surface occupies, counting a half-height chroma plane
const fn total_rows(height: u32, format: SurfaceFormat) -> u32 {
    if format.is_planar() {
        height + height.div_ceil(2)
    } else {
        height
    }
}

// =============================================================================
// SURFACE 2D
// =============================================================================

/// Field structure of a 2D surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    /// Progressive frame
    #[default]
    Progressive,
    /// Top field
    TopField,
    /// Bottom field
    BottomField,
}

/// 2D surface allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface2DParams {
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Pixel format
    pub format: SurfaceFormat,
    /// Existing allocation to wrap
    pub resource: Option<OsResource>,
    /// Row pitch of a wrapped allocation; computed otherwise
    pub pitch: Option<u32>,
}

impl Surface2DParams {
    /// Runtime-allocated surface
    pub const fn new(width: u32, height: u32, format: SurfaceFormat) -> Self {
        Self {
            width,
            height,
            format,
            resource: None,
            pitch: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.format == SurfaceFormat::Buffer {
            return Err(Error::InvalidParameter);
        }
        if self.format.is_planar() && (self.width % 2 != 0 || self.height % 2 != 0) {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    pub(crate) fn pitch(&self) -> u32 {
        self.pitch
            .unwrap_or_else(|| align_up(self.width * self.format.bytes_per_pixel(), PITCH_ALIGNMENT))
    }

    pub(crate) fn byte_size(&self) -> u32 {
        self.pitch() * total_rows(self.height, self.format)
    }
}

/// Surface-state override of a 2D alias
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface2DAlias {
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Pixel format
    pub format: SurfaceFormat,
    /// Row pitch
    pub pitch: u32,
    /// Byte offset of the aliased view
    pub surface_offset: u32,
    /// X offset in pixels
    pub x_offset: u32,
    /// Y offset in rows
    pub y_offset: u32,
    /// Cache control
    pub mocs: u8,
}

/// Registered 2D surface
#[derive(Debug, Clone)]
pub struct Surface2DEntry {
    /// Backing resource
    pub resource: OsResource,
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Row pitch
    pub pitch: u32,
    /// Pixel format
    pub format: SurfaceFormat,
    /// Cache control
    pub mocs: u8,
    /// Allocated by the registry
    pub owned: bool,
    /// Host mapping held
    pub locked: bool,
    /// Field structure
    pub frame_type: FrameType,
    /// Reads must wait for earlier writes on other engines
    pub read_sync: bool,
    /// Alias overrides; alias n is `aliases[n - 1]`
    pub aliases: ArrayVec<Option<Surface2DAlias>, MAX_2D_ALIASES>,
}

impl Surface2DEntry {
    pub(crate) fn new(resource: OsResource, params: &Surface2DParams, owned: bool) -> Self {
        Self {
            resource,
            width: params.width,
            height: params.height,
            pitch: params.pitch(),
            format: params.format,
            mocs: 0,
            owned,
            locked: false,
            frame_type: FrameType::Progressive,
            read_sync: false,
            aliases: ArrayVec::new(),
        }
    }

    pub(crate) fn add_alias(&mut self) -> Result<u8> {
        self.aliases
            .try_push(None)
            .map_err(|_| Error::ResourceExhausted)?;
        Ok(self.aliases.len() as u8)
    }

    pub(crate) fn set_alias(&mut self, alias: u8, state: Surface2DAlias) -> Result<()> {
        if state.width == 0 || state.height == 0 {
            return Err(Error::InvalidParameter);
        }
        let rows = total_rows(state.y_offset + state.height, state.format);
        let bytes = state.surface_offset as u64 + state.pitch as u64 * rows as u64;
        if bytes > self.pitch as u64 * total_rows(self.height, self.format) as u64 {
            return Err(Error::InvalidParameter);
        }
        match alias {
            0 => {
                self.width = state.width;
                self.height = state.height;
                self.format = state.format;
                self.pitch = state.pitch;
                self.mocs = state.mocs;
            }
            n => {
                *self
                    .aliases
                    .get_mut(n as usize - 1)
                    .ok_or(Error::InvalidParameter)? = Some(state);
            }
        }
        Ok(())
    }

    fn base_view(&self) -> Surface2DAlias {
        Surface2DAlias {
            width: self.width,
            height: self.height,
            format: self.format,
            pitch: self.pitch,
            surface_offset: 0,
            x_offset: 0,
            y_offset: 0,
            mocs: self.mocs,
        }
    }

    /// Surface state for `alias` with the surface mapped at `base`
    pub fn state_desc(&self, base: GpuAddr, alias: u8) -> Result<SurfaceStateDesc> {
        let view = match alias {
            0 => self.base_view(),
            n => self
                .aliases
                .get(n as usize - 1)
                .ok_or(Error::InvalidParameter)?
                .unwrap_or_else(|| self.base_view()),
        };
        Ok(SurfaceStateDesc {
            kind: SurfaceKind::Surface2D,
            addr: base.offset(view.surface_offset as u64),
            width: view.width,
            height: view.height,
            depth: 1,
            pitch: view.pitch,
            format: view.format,
            mocs: view.mocs,
            x_offset: view.x_offset,
            y_offset: view.y_offset,
        })
    }
}

// =============================================================================
// SURFACE 2D-UP
// =============================================================================

/// Registered 2D surface over user memory
///
/// The user bytes are mirrored into an OS resource at allocation; the
/// entry keeps its own copy so the contents can be read back host-side.
#[derive(Debug, Clone)]
pub struct Surface2DUpEntry {
    /// Mirror resource
    pub resource: OsResource,
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Pixel format
    pub format: SurfaceFormat,
    /// Cache control
    pub mocs: u8,
    /// User memory
    pub data: Vec<u8>,
}

impl Surface2DUpEntry {
    /// Row pitch of the packed user memory
    pub fn pitch(&self) -> u32 {
        self.width * self.format.bytes_per_pixel()
    }

    /// Bytes the user memory must hold
    pub fn required_size(width: u32, height: u32, format: SurfaceFormat) -> usize {
        (width * format.bytes_per_pixel()) as usize * total_rows(height, format) as usize
    }

    /// Surface state with the mirror mapped at `base`
    pub fn state_desc(&self, base: GpuAddr) -> SurfaceStateDesc {
        SurfaceStateDesc {
            kind: SurfaceKind::Surface2DUp,
            addr: base,
            width: self.width,
            height: self.height,
            depth: 1,
            pitch: self.pitch(),
            format: self.format,
            mocs: self.mocs,
            x_offset: 0,
            y_offset: 0,
        }
    }
}

// =============================================================================
// SURFACE 3D
// =============================================================================

/// 3D surface allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface3DParams {
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Depth in slices
    pub depth: u32,
    /// Pixel format
    pub format: SurfaceFormat,
}

/// Registered 3D surface
#[derive(Debug, Clone)]
pub struct Surface3DEntry {
    /// Backing resource
    pub resource: OsResource,
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Depth in slices
    pub depth: u32,
    /// Pixel format
    pub format: SurfaceFormat,
    /// Cache control
    pub mocs: u8,
    /// Host mapping held
    pub locked: bool,
}

impl Surface3DEntry {
    /// Row pitch
    pub fn pitch(&self) -> u32 {
        align_up(self.width * self.format.bytes_per_pixel(), PITCH_ALIGNMENT)
    }

    /// Bytes the backing resource holds
    pub fn byte_size(params: &Surface3DParams) -> u32 {
        align_up(params.width * params.format.bytes_per_pixel(), PITCH_ALIGNMENT)
            * params.height
            * params.depth
    }

    /// Surface state with the surface mapped at `base`
    pub fn state_desc(&self, base: GpuAddr) -> SurfaceStateDesc {
        SurfaceStateDesc {
            kind: SurfaceKind::Surface3D,
            addr: base,
            width: self.width,
            height: self.height,
            depth: self.depth,
            pitch: self.pitch(),
            format: self.format,
            mocs: self.mocs,
            x_offset: 0,
            y_offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pitch_and_planar_size() {
        let p = Surface2DParams::new(100, 10, SurfaceFormat::A8R8G8B8);
        assert_eq!(p.pitch(), 448);
        assert_eq!(p.byte_size(), 4480);
        let nv12 = Surface2DParams::new(64, 32, SurfaceFormat::Nv12);
        assert_eq!(nv12.byte_size(), 64 * 48);
        assert_eq!(Surface2DParams::new(63, 32, SurfaceFormat::Nv12).validate(), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_alias_view() {
        let params = Surface2DParams::new(64, 64, SurfaceFormat::R8Uint);
        let mut entry = Surface2DEntry::new(OsResource::new(3), &params, true);
        let alias = entry.add_alias().unwrap();
        let view = Surface2DAlias {
            width: 32,
            height: 32,
            format: SurfaceFormat::R8Uint,
            pitch: 64,
            surface_offset: 64 * 32,
            x_offset: 4,
            y_offset: 0,
            mocs: 1,
        };
        entry.set_alias(alias, view).unwrap();
        let desc = entry.state_desc(GpuAddr::new(0x10_0000), alias).unwrap();
        assert_eq!(desc.addr.raw(), 0x10_0000 + 64 * 32);
        assert_eq!((desc.width, desc.height, desc.x_offset), (32, 32, 4));
        // the base view is untouched
        assert_eq!(entry.state_desc(GpuAddr::new(0x10_0000), 0).unwrap().width, 64);

        let too_big = Surface2DAlias { height: 64, ..view };
        assert_eq!(entry.set_alias(alias, too_big), Err(Error::InvalidParameter));
    }
}
