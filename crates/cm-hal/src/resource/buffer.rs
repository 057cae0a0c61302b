//! Buffer table entries.

use arrayvec::ArrayVec;
use cm_core::consts::MAX_BUFFER_ALIASES;
use cm_core::{Error, GpuAddr, OsResource, Result, SurfaceFormat, SurfaceKind};

use super::binding::SurfaceStateDesc;

/// Buffer allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferParams {
    /// Bytes
    pub size: u32,
    /// Existing allocation to wrap; the registry allocates when `None`
    pub resource: Option<OsResource>,
    /// Shared virtual memory
    pub svm: bool,
    /// Accessed through stateless messages
    pub stateless: bool,
    /// Cache control
    pub mocs: u8,
}

impl BufferParams {
    /// Runtime-allocated buffer of `size` bytes
    pub const fn new(size: u32) -> Self {
        Self {
            size,
            resource: None,
            svm: false,
            stateless: false,
            mocs: 0,
        }
    }
}

/// Surface-state override of an alias
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAlias {
    /// Byte offset into the buffer
    pub offset: u32,
    /// Bytes visible through the alias
    pub size: u32,
    /// Cache control
    pub mocs: u8,
}

/// Registered buffer
#[derive(Debug, Clone)]
pub struct BufferEntry {
    /// Backing resource
    pub resource: OsResource,
    /// Bytes
    pub size: u32,
    /// Allocated by the registry rather than the caller
    pub owned: bool,
    /// Shared virtual memory
    pub svm: bool,
    /// Stateless access
    pub stateless: bool,
    /// Cache control
    pub mocs: u8,
    /// Host mapping held
    pub locked: bool,
    /// Alias overrides; alias n is `aliases[n - 1]`
    pub aliases: ArrayVec<Option<BufferAlias>, MAX_BUFFER_ALIASES>,
}

impl BufferEntry {
    pub(crate) fn new(resource: OsResource, params: &BufferParams, owned: bool) -> Self {
        Self {
            resource,
            size: params.size,
            owned,
            svm: params.svm,
            stateless: params.stateless,
            mocs: params.mocs,
            locked: false,
            aliases: ArrayVec::new(),
        }
    }

    /// Must be made resident before every submission
    pub fn always_registered(&self) -> bool {
        self.svm || self.stateless
    }

    pub(crate) fn add_alias(&mut self) -> Result<u8> {
        self.aliases
            .try_push(None)
            .map_err(|_| Error::ResourceExhausted)?;
        Ok(self.aliases.len() as u8)
    }

    pub(crate) fn set_alias(&mut self, alias: u8, state: BufferAlias) -> Result<()> {
        if state.offset.checked_add(state.size).map_or(true, |end| end > self.size) {
            return Err(Error::InvalidParameter);
        }
        match alias {
            0 => {
                if state.offset != 0 || state.size != self.size {
                    return Err(Error::InvalidParameter);
                }
                self.mocs = state.mocs;
            }
            n => {
                let slot = self
                    .aliases
                    .get_mut(n as usize - 1)
                    .ok_or(Error::InvalidParameter)?;
                *slot = Some(state);
            }
        }
        Ok(())
    }

    /// Surface state for `alias` with the buffer mapped at `base`
    pub fn state_desc(&self, base: GpuAddr, alias: u8) -> Result<SurfaceStateDesc> {
        let view = match alias {
            0 => BufferAlias {
                offset: 0,
                size: self.size,
                mocs: self.mocs,
            },
            n => self
                .aliases
                .get(n as usize - 1)
                .ok_or(Error::InvalidParameter)?
                .unwrap_or(BufferAlias {
                    offset: 0,
                    size: self.size,
                    mocs: self.mocs,
                }),
        };
        Ok(SurfaceStateDesc {
            kind: SurfaceKind::Buffer,
            addr: base.offset(view.offset as u64),
            width: view.size,
            height: 1,
            depth: 1,
            pitch: 0,
            format: SurfaceFormat::Buffer,
            mocs: view.mocs,
            x_offset: 0,
            y_offset: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_override_and_ceiling() {
        let mut entry = BufferEntry::new(OsResource::new(1), &BufferParams::new(4096), true);
        let a = entry.add_alias().unwrap();
        assert_eq!(a, 1);
        entry
            .set_alias(a, BufferAlias { offset: 1024, size: 512, mocs: 3 })
            .unwrap();
        let desc = entry.state_desc(GpuAddr::new(0x1_0000), a).unwrap();
        assert_eq!(desc.addr.raw(), 0x1_0400);
        assert_eq!(desc.width, 512);
        assert_eq!(desc.mocs, 3);

        for _ in 1..MAX_BUFFER_ALIASES {
            entry.add_alias().unwrap();
        }
        assert_eq!(entry.add_alias(), Err(Error::ResourceExhausted));
    }

    #[test]
    fn test_alias_out_of_bounds() {
        let mut entry = BufferEntry::new(OsResource::new(1), &BufferParams::new(256), true);
        let a = entry.add_alias().unwrap();
        let bad = BufferAlias { offset: 200, size: 100, mocs: 0 };
        assert_eq!(entry.set_alias(a, bad), Err(Error::InvalidParameter));
        assert_eq!(entry.set_alias(5, BufferAlias { offset: 0, size: 1, mocs: 0 }), Err(Error::InvalidParameter));
    }
}
