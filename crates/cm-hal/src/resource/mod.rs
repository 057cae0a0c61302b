//! # Resource Registry
//!
//! Handle tables for buffers, 2D, 2D-UP and 3D surfaces, samplers and
//! sampler8x8 states, plus resolution of kernel arguments to binding-table
//! indices.
//!
//! ## Ownership
//!
//! A table entry either wraps a resource the caller allocated (and keeps
//! owning) or one the registry allocated itself through the OS
//! collaborator. Only the latter is released on free.

pub mod binding;
pub mod buffer;
pub mod sampler;
pub mod surface;
mod table;

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use cm_core::consts::{
    MAX_2D_TABLE_SIZE, MAX_2D_UP_TABLE_SIZE, MAX_3D_TABLE_SIZE, MAX_BUFFER_TABLE_SIZE,
    MAX_SAMPLER8X8_TABLE_SIZE, MAX_SAMPLER_TABLE_SIZE,
};
use cm_core::{
    BufferHandle, Error, OsResource, Result, Sampler8x8Index, SamplerIndex, Surface2DHandle,
    Surface2DUpHandle, Surface3DHandle, SurfaceFormat, SurfaceKind,
};
use cm_os::{LockFlags, OsInterface, ResourceDesc};

use crate::gen::HardwareProfile;
use crate::params::ArgValue;

pub use binding::{BindingIndices, BindingKind, BindingTable, IndexCounters, SurfaceStateDesc};
pub use buffer::{BufferAlias, BufferEntry, BufferParams};
pub use sampler::{AddressMode, FilterMode, Sampler8x8Kind, Sampler8x8State, SamplerState};
pub use surface::{
    FrameType, Surface2DAlias, Surface2DEntry, Surface2DParams, Surface2DUpEntry, Surface3DEntry,
    Surface3DParams,
};
pub use table::HandleTable;

// =============================================================================
// HANDLES
// =============================================================================

/// Handle into any of the surface tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceHandle {
    /// Buffer table
    Buffer(BufferHandle),
    /// 2D table
    Surface2D(Surface2DHandle),
    /// 2D-UP table
    Surface2DUp(Surface2DUpHandle),
    /// 3D table
    Surface3D(Surface3DHandle),
}

impl SurfaceHandle {
    /// Table the handle indexes
    pub const fn kind(self) -> SurfaceKind {
        match self {
            Self::Buffer(_) => SurfaceKind::Buffer,
            Self::Surface2D(_) => SurfaceKind::Surface2D,
            Self::Surface2DUp(_) => SurfaceKind::Surface2DUp,
            Self::Surface3D(_) => SurfaceKind::Surface3D,
        }
    }
}

/// Surface-state override for [`ResourceRegistry::set_surface_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStateParams {
    /// Buffer view
    Buffer(BufferAlias),
    /// 2D view
    Surface2D(Surface2DAlias),
}

/// Sampler states referenced by one kernel, in binding order
pub type KernelSamplers = ArrayVec<(SamplerIndex, SamplerState), 16>;

/// Registry statistics
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Surfaces and buffers allocated
    pub allocations: u64,
    /// Surfaces and buffers freed
    pub frees: u64,
    /// Allocations refused for lack of a slot
    pub exhausted: u64,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// All resource tables of a device
#[derive(Debug)]
pub struct ResourceRegistry {
    buffers: HandleTable<BufferEntry>,
    surfaces_2d: HandleTable<Surface2DEntry>,
    surfaces_2d_up: HandleTable<Surface2DUpEntry>,
    surfaces_3d: HandleTable<Surface3DEntry>,
    samplers: HandleTable<SamplerState>,
    samplers_8x8: HandleTable<Sampler8x8State>,
    stats: RegistryStats,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    /// Empty tables at their fixed capacities
    pub fn new() -> Self {
        Self {
            buffers: HandleTable::new(MAX_BUFFER_TABLE_SIZE),
            surfaces_2d: HandleTable::new(MAX_2D_TABLE_SIZE),
            surfaces_2d_up: HandleTable::new(MAX_2D_UP_TABLE_SIZE),
            surfaces_3d: HandleTable::new(MAX_3D_TABLE_SIZE),
            samplers: HandleTable::new(MAX_SAMPLER_TABLE_SIZE),
            samplers_8x8: HandleTable::new(MAX_SAMPLER8X8_TABLE_SIZE),
            stats: RegistryStats::default(),
        }
    }

    /// Statistics
    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.stats.allocations += 1,
            Err(Error::ResourceExhausted) => self.stats.exhausted += 1,
            Err(_) => {}
        }
        result
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Register a buffer, allocating its memory unless the caller supplied it
    pub fn allocate_buffer<O: OsInterface + ?Sized>(
        &mut self,
        os: &mut O,
        params: &BufferParams,
    ) -> Result<BufferHandle> {
        if params.size == 0 {
            return Err(Error::InvalidParameter);
        }
        if self.buffers.len() == self.buffers.capacity() {
            return self.track(Err(Error::ResourceExhausted));
        }
        let (resource, owned) = match params.resource {
            Some(res) => {
                if os.resource_size(res)? < params.size as usize {
                    return Err(Error::InvalidParameter);
                }
                (res, false)
            }
            None => (
                os.allocate_resource(&ResourceDesc::new(params.size as usize, "CmBuffer"))?,
                true,
            ),
        };
        let inserted = self.buffers.insert(BufferEntry::new(resource, params, owned));
        let index = self.track(inserted)?;
        log::trace!("cm-hal: buffer {} -> {} ({} bytes)", index, resource, params.size);
        Ok(BufferHandle::new(index))
    }

    /// Register a 2D surface
    pub fn allocate_surface_2d<O: OsInterface + ?Sized>(
        &mut self,
        os: &mut O,
        params: &Surface2DParams,
    ) -> Result<Surface2DHandle> {
        params.validate()?;
        if self.surfaces_2d.len() == self.surfaces_2d.capacity() {
            return self.track(Err(Error::ResourceExhausted));
        }
        let (resource, owned) = match params.resource {
            Some(res) => (res, false),
            None => (
                os.allocate_resource(&ResourceDesc::new(params.byte_size() as usize, "CmSurface2D"))?,
                true,
            ),
        };
        let inserted = self.surfaces_2d.insert(Surface2DEntry::new(resource, params, owned));
        self.track(inserted).map(Surface2DHandle::new)
    }

    /// Register a 2D surface over user memory
    ///
    /// `data` must hold at least the packed surface; it is copied into a
    /// GPU-visible mirror.
    pub fn allocate_surface_2d_up<O: OsInterface + ?Sized>(
        &mut self,
        os: &mut O,
        width: u32,
        height: u32,
        format: SurfaceFormat,
        data: Vec<u8>,
    ) -> Result<Surface2DUpHandle> {
        if width == 0 || height == 0 || format == SurfaceFormat::Buffer {
            return Err(Error::InvalidParameter);
        }
        let size = Surface2DUpEntry::required_size(width, height, format);
        if data.is_empty() {
            return Err(Error::NullPointer);
        }
        if data.len() < size {
            return Err(Error::InvalidParameter);
        }
        if self.surfaces_2d_up.len() == self.surfaces_2d_up.capacity() {
            return self.track(Err(Error::ResourceExhausted));
        }
        let resource = os.allocate_resource(&ResourceDesc::new(size, "CmSurface2DUP"))?;
        if let Err(e) = os.write_resource(resource, 0, &data[..size]) {
            if let Err(free) = os.free_resource(resource) {
                log::warn!("cm-hal: failed to free surface {}: {}", resource, free);
            }
            return Err(e);
        }
        let inserted = self.surfaces_2d_up.insert(Surface2DUpEntry {
            resource,
            width,
            height,
            format,
            mocs: 0,
            data,
        });
        self.track(inserted).map(Surface2DUpHandle::new)
    }

    /// Register a 3D surface
    pub fn allocate_surface_3d<O: OsInterface + ?Sized>(
        &mut self,
        os: &mut O,
        params: &Surface3DParams,
    ) -> Result<Surface3DHandle> {
        if params.width == 0 || params.height == 0 || params.depth == 0 {
            return Err(Error::InvalidParameter);
        }
        if params.format.is_planar() || params.format == SurfaceFormat::Buffer {
            return Err(Error::InvalidParameter);
        }
        if self.surfaces_3d.len() == self.surfaces_3d.capacity() {
            return self.track(Err(Error::ResourceExhausted));
        }
        let size = Surface3DEntry::byte_size(params) as usize;
        let resource = os.allocate_resource(&ResourceDesc::new(size, "CmSurface3D"))?;
        let inserted = self.surfaces_3d.insert(Surface3DEntry {
            resource,
            width: params.width,
            height: params.height,
            depth: params.depth,
            format: params.format,
            mocs: 0,
            locked: false,
        });
        self.track(inserted).map(Surface3DHandle::new)
    }

    /// Drop a table entry, releasing memory the registry allocated
    pub fn free<O: OsInterface + ?Sized>(&mut self, os: &mut O, handle: SurfaceHandle) -> Result<()> {
        let (resource, owned) = self.backing(handle)?;
        if owned {
            os.free_resource(resource)?;
        }
        match handle {
            SurfaceHandle::Buffer(h) => self.buffers.remove(h.index()).map(drop)?,
            SurfaceHandle::Surface2D(h) => self.surfaces_2d.remove(h.index()).map(drop)?,
            SurfaceHandle::Surface2DUp(h) => self.surfaces_2d_up.remove(h.index()).map(drop)?,
            SurfaceHandle::Surface3D(h) => self.surfaces_3d.remove(h.index()).map(drop)?,
        }
        self.stats.frees += 1;
        Ok(())
    }

    /// Free every entry; used on device teardown
    pub fn free_all<O: OsInterface + ?Sized>(&mut self, os: &mut O) {
        let owned_buffers = self.buffers.drain().into_iter().filter(|b| b.owned).map(|b| b.resource);
        let owned_2d = self.surfaces_2d.drain().into_iter().filter(|s| s.owned).map(|s| s.resource);
        let mirrors = self.surfaces_2d_up.drain().into_iter().map(|s| s.resource);
        let volumes = self.surfaces_3d.drain().into_iter().map(|s| s.resource);
        for resource in owned_buffers.chain(owned_2d).chain(mirrors).chain(volumes) {
            if let Err(e) = os.free_resource(resource) {
                log::warn!("cm-hal: failed to free {}: {}", resource, e);
            }
        }
    }

    /// OS resource behind a handle and whether the registry owns it
    pub fn backing(&self, handle: SurfaceHandle) -> Result<(OsResource, bool)> {
        Ok(match handle {
            SurfaceHandle::Buffer(h) => {
                let b = self.buffers.get(h.index())?;
                (b.resource, b.owned)
            }
            SurfaceHandle::Surface2D(h) => {
                let s = self.surfaces_2d.get(h.index())?;
                (s.resource, s.owned)
            }
            SurfaceHandle::Surface2DUp(h) => (self.surfaces_2d_up.get(h.index())?.resource, true),
            SurfaceHandle::Surface3D(h) => (self.surfaces_3d.get(h.index())?.resource, true),
        })
    }

    /// Buffer entry
    pub fn buffer(&self, handle: BufferHandle) -> Result<&BufferEntry> {
        self.buffers.get(handle.index())
    }

    /// 2D surface entry
    pub fn surface_2d(&self, handle: Surface2DHandle) -> Result<&Surface2DEntry> {
        self.surfaces_2d.get(handle.index())
    }

    /// Mutable 2D surface entry
    pub fn surface_2d_mut(&mut self, handle: Surface2DHandle) -> Result<&mut Surface2DEntry> {
        self.surfaces_2d.get_mut(handle.index())
    }

    /// 2D-UP surface entry
    pub fn surface_2d_up(&self, handle: Surface2DUpHandle) -> Result<&Surface2DUpEntry> {
        self.surfaces_2d_up.get(handle.index())
    }

    /// 3D surface entry
    pub fn surface_3d(&self, handle: Surface3DHandle) -> Result<&Surface3DEntry> {
        self.surfaces_3d.get(handle.index())
    }

    // =========================================================================
    // Host access
    // =========================================================================

    /// Map a surface for host access
    pub fn lock<O: OsInterface + ?Sized>(
        &mut self,
        os: &mut O,
        handle: SurfaceHandle,
        flags: LockFlags,
    ) -> Result<()> {
        let resource = self.backing(handle)?.0;
        let locked = match handle {
            SurfaceHandle::Buffer(h) => &mut self.buffers.get_mut(h.index())?.locked,
            SurfaceHandle::Surface2D(h) => &mut self.surfaces_2d.get_mut(h.index())?.locked,
            SurfaceHandle::Surface3D(h) => &mut self.surfaces_3d.get_mut(h.index())?.locked,
            SurfaceHandle::Surface2DUp(_) => return Err(Error::InvalidParameter),
        };
        if *locked {
            return Err(Error::InvalidParameter);
        }
        os.lock_resource(resource, flags)?;
        *locked = true;
        Ok(())
    }

    /// Drop host access
    pub fn unlock<O: OsInterface + ?Sized>(&mut self, os: &mut O, handle: SurfaceHandle) -> Result<()> {
        let resource = self.backing(handle)?.0;
        let locked = match handle {
            SurfaceHandle::Buffer(h) => &mut self.buffers.get_mut(h.index())?.locked,
            SurfaceHandle::Surface2D(h) => &mut self.surfaces_2d.get_mut(h.index())?.locked,
            SurfaceHandle::Surface3D(h) => &mut self.surfaces_3d.get_mut(h.index())?.locked,
            SurfaceHandle::Surface2DUp(_) => return Err(Error::InvalidParameter),
        };
        if !*locked {
            return Err(Error::InvalidParameter);
        }
        os.unlock_resource(resource)?;
        *locked = false;
        Ok(())
    }

    /// Copy host bytes into a surface at `offset`
    ///
    /// The surface is locked for the copy unless the caller already holds
    /// the lock. 2D-UP surfaces update both the user copy and the mirror.
    pub fn write<O: OsInterface + ?Sized>(
        &mut self,
        os: &mut O,
        handle: SurfaceHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Err(Error::NullPointer);
        }
        if let SurfaceHandle::Surface2DUp(h) = handle {
            let entry = self.surfaces_2d_up.get_mut(h.index())?;
            let dst = entry
                .data
                .get_mut(offset..offset + data.len())
                .ok_or(Error::InvalidParameter)?;
            dst.copy_from_slice(data);
            return os.write_resource(entry.resource, offset, data);
        }
        self.with_lock(os, handle, LockFlags::WRITE, |os, res| {
            os.write_resource(res, offset, data)
        })
    }

    /// Copy surface bytes at `offset` to the host
    pub fn read<O: OsInterface + ?Sized>(
        &mut self,
        os: &mut O,
        handle: SurfaceHandle,
        offset: usize,
        out: &mut [u8],
    ) -> Result<()> {
        if let SurfaceHandle::Surface2DUp(h) = handle {
            let entry = self.surfaces_2d_up.get_mut(h.index())?;
            os.read_resource(entry.resource, offset, out)?;
            if let Some(dst) = entry.data.get_mut(offset..offset + out.len()) {
                dst.copy_from_slice(out);
            }
            return Ok(());
        }
        self.with_lock(os, handle, LockFlags::READ, |os, res| {
            os.read_resource(res, offset, out)
        })
    }

    fn with_lock<O, F>(&mut self, os: &mut O, handle: SurfaceHandle, flags: LockFlags, f: F) -> Result<()>
    where
        O: OsInterface + ?Sized,
        F: FnOnce(&mut O, OsResource) -> Result<()>,
    {
        let resource = self.backing(handle)?.0;
        let held = match handle {
            SurfaceHandle::Buffer(h) => self.buffers.get(h.index())?.locked,
            SurfaceHandle::Surface2D(h) => self.surfaces_2d.get(h.index())?.locked,
            SurfaceHandle::Surface3D(h) => self.surfaces_3d.get(h.index())?.locked,
            SurfaceHandle::Surface2DUp(_) => true,
        };
        if held {
            return f(os, resource);
        }
        os.lock_resource(resource, flags)?;
        let result = f(os, resource);
        os.unlock_resource(resource)?;
        result
    }

    // =========================================================================
    // Surface state
    // =========================================================================

    /// Add an alias to a buffer or 2D surface
    pub fn create_alias(&mut self, handle: SurfaceHandle) -> Result<u8> {
        match handle {
            SurfaceHandle::Buffer(h) => self.buffers.get_mut(h.index())?.add_alias(),
            SurfaceHandle::Surface2D(h) => self.surfaces_2d.get_mut(h.index())?.add_alias(),
            _ => Err(Error::InvalidParameter),
        }
    }

    /// Override the surface state of the base view (alias 0) or an alias
    pub fn set_surface_state(
        &mut self,
        handle: SurfaceHandle,
        alias: u8,
        params: SurfaceStateParams,
    ) -> Result<()> {
        match (handle, params) {
            (SurfaceHandle::Buffer(h), SurfaceStateParams::Buffer(p)) => {
                self.buffers.get_mut(h.index())?.set_alias(alias, p)
            }
            (SurfaceHandle::Surface2D(h), SurfaceStateParams::Surface2D(p)) => {
                self.surfaces_2d.get_mut(h.index())?.set_alias(alias, p)
            }
            _ => Err(Error::InvalidParameter),
        }
    }

    /// Store a cache-control value the profile has accepted
    pub fn set_mocs(&mut self, handle: SurfaceHandle, mocs: u8) -> Result<()> {
        match handle {
            SurfaceHandle::Buffer(h) => self.buffers.get_mut(h.index())?.mocs = mocs,
            SurfaceHandle::Surface2D(h) => self.surfaces_2d.get_mut(h.index())?.mocs = mocs,
            SurfaceHandle::Surface2DUp(h) => self.surfaces_2d_up.get_mut(h.index())?.mocs = mocs,
            SurfaceHandle::Surface3D(h) => self.surfaces_3d.get_mut(h.index())?.mocs = mocs,
        }
        Ok(())
    }

    // =========================================================================
    // Samplers
    // =========================================================================

    /// Store a sampler state in the first free slot
    pub fn register_sampler(&mut self, state: SamplerState) -> Result<SamplerIndex> {
        self.samplers.insert(state).map(SamplerIndex::new)
    }

    /// Free a sampler slot
    pub fn unregister_sampler(&mut self, index: SamplerIndex) -> Result<()> {
        self.samplers.remove(index.index()).map(drop)
    }

    /// Store a sampler8x8 state
    pub fn register_sampler_8x8(&mut self, state: Sampler8x8State) -> Result<Sampler8x8Index> {
        self.samplers_8x8.insert(state).map(Sampler8x8Index::new)
    }

    /// Free a sampler8x8 slot
    pub fn unregister_sampler_8x8(&mut self, index: Sampler8x8Index) -> Result<()> {
        self.samplers_8x8.remove(index.index()).map(drop)
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Buffers that must be made resident for every submission
    pub fn always_registered(&self) -> impl Iterator<Item = OsResource> + '_ {
        self.buffers
            .iter()
            .filter(|(_, b)| b.always_registered())
            .map(|(_, b)| b.resource)
    }

    fn state_2d<O: OsInterface + ?Sized>(
        &self,
        os: &O,
        handle: Surface2DHandle,
        alias: u8,
    ) -> Result<(OsResource, SurfaceStateDesc)> {
        let entry = self.surfaces_2d.get(handle.index())?;
        let desc = entry.state_desc(os.gfx_address(entry.resource)?, alias)?;
        Ok((entry.resource, desc))
    }

    /// Resolve an argument to the dword written into the CURBE
    ///
    /// Surface arguments get a binding-table index in `bt` and their
    /// resources are registered with the OS for the next submission.
    /// Sampler arguments append to `samplers` and resolve to the position
    /// there. [`ArgValue::General`] is copied verbatim by the caller and
    /// is rejected here.
    pub fn bind_argument<O: OsInterface + ?Sized>(
        &self,
        os: &mut O,
        profile: &dyn HardwareProfile,
        bt: &mut BindingTable,
        samplers: &mut KernelSamplers,
        value: &ArgValue,
    ) -> Result<u32> {
        let (resource, write, index) = match value {
            ArgValue::General(_) => return Err(Error::InvalidParameter),
            ArgValue::Implicit(v) => return Ok(*v),
            ArgValue::Sampler(index) => {
                let state = *self.samplers.get(index.index())?;
                if let Some(pos) = samplers.iter().position(|(i, _)| i == index) {
                    return Ok(pos as u32);
                }
                samplers
                    .try_push((*index, state))
                    .map_err(|_| Error::ResourceExhausted)?;
                return Ok(samplers.len() as u32 - 1);
            }
            ArgValue::Buffer { handle, alias } => {
                let entry = self.buffers.get(handle.index())?;
                let desc = entry.state_desc(os.gfx_address(entry.resource)?, *alias)?;
                let bti = bt.get_or_create(entry.resource, *alias, BindingKind::Regular, &[desc])?;
                (entry.resource, true, bti)
            }
            ArgValue::StateBuffer(handle) => {
                let entry = self.buffers.get(handle.index())?;
                let desc = entry.state_desc(os.gfx_address(entry.resource)?, 0)?;
                let bti = bt.get_or_create(entry.resource, 0, BindingKind::Regular, &[desc])?;
                (entry.resource, false, bti)
            }
            ArgValue::Surface2D { handle, alias } => {
                let (res, desc) = self.state_2d(&*os, *handle, *alias)?;
                (res, true, bt.get_or_create(res, *alias, BindingKind::Regular, &[desc])?)
            }
            ArgValue::Surface2DUp(handle) => {
                let entry = self.surfaces_2d_up.get(handle.index())?;
                let desc = entry.state_desc(os.gfx_address(entry.resource)?);
                let bti = bt.get_or_create(entry.resource, 0, BindingKind::Regular, &[desc])?;
                (entry.resource, true, bti)
            }
            ArgValue::Surface3D(handle) => {
                let entry = self.surfaces_3d.get(handle.index())?;
                let desc = entry.state_desc(os.gfx_address(entry.resource)?);
                let bti = bt.get_or_create(entry.resource, 0, BindingKind::Regular, &[desc])?;
                (entry.resource, true, bti)
            }
            ArgValue::SamplerSurface(handle) => {
                let (res, desc) = self.state_2d(&*os, *handle, 0)?;
                (res, false, bt.get_or_create(res, 0, BindingKind::SamplerSurface, &[desc])?)
            }
            ArgValue::Sampler8x8 { sampler, surface } => {
                self.samplers_8x8.get(sampler.index())?;
                let (res, desc) = self.state_2d(&*os, *surface, 0)?;
                (res, false, bt.get_or_create(res, 0, BindingKind::Sampler8x8, &[desc])?)
            }
            ArgValue::Vme { current, forward, backward } => {
                let mut run: ArrayVec<SurfaceStateDesc, 9> = ArrayVec::new();
                let res = self.surfaces_2d.get(current.index())?.resource;
                for handle in core::iter::once(current).chain(forward.iter()).chain(backward.iter()) {
                    let (r, d) = self.state_2d(&*os, *handle, 0)?;
                    if !profile.vme_surface_supported(d.format) {
                        log::warn!("cm-hal: {:?} cannot be a VME surface", d.format);
                        return Err(Error::InvalidParameter);
                    }
                    if r != res {
                        os.register_resource(r, false)?;
                    }
                    run.push(d);
                }
                (res, false, bt.get_or_create(res, 0, BindingKind::Vme, &run)?)
            }
        };
        os.register_resource(resource, write)?;
        Ok(index as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gen::profile_for;
    use cm_core::Platform;
    use cm_os::SimOs;

    fn setup() -> (SimOs, ResourceRegistry) {
        (SimOs::new(), ResourceRegistry::new())
    }

    #[test]
    fn test_buffer_lifecycle() {
        let (mut os, mut reg) = setup();
        let gpu = os.gpu();
        let h = reg.allocate_buffer(&mut os, &BufferParams::new(256)).unwrap();
        reg.write(&mut os, SurfaceHandle::Buffer(h), 16, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        reg.read(&mut os, SurfaceHandle::Buffer(h), 16, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(gpu.live_resources(), 1);
        reg.free(&mut os, SurfaceHandle::Buffer(h)).unwrap();
        assert_eq!(gpu.live_resources(), 0);
        assert_eq!(reg.free(&mut os, SurfaceHandle::Buffer(h)), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_wrapped_buffer_not_freed() {
        let (mut os, mut reg) = setup();
        let gpu = os.gpu();
        let res = os.allocate_resource(&ResourceDesc::new(128, "user")).unwrap();
        let params = BufferParams { resource: Some(res), ..BufferParams::new(128) };
        let h = reg.allocate_buffer(&mut os, &params).unwrap();
        reg.free(&mut os, SurfaceHandle::Buffer(h)).unwrap();
        assert_eq!(gpu.live_resources(), 1);
    }

    #[test]
    fn test_lock_rules() {
        let (mut os, mut reg) = setup();
        let gpu = os.gpu();
        let h = reg
            .allocate_surface_2d(&mut os, &Surface2DParams::new(16, 16, SurfaceFormat::A8R8G8B8))
            .unwrap();
        let handle = SurfaceHandle::Surface2D(h);
        reg.lock(&mut os, handle, LockFlags::READ | LockFlags::WRITE).unwrap();
        assert_eq!(reg.lock(&mut os, handle, LockFlags::READ), Err(Error::InvalidParameter));
        let res = reg.backing(handle).unwrap().0;
        assert!(gpu.is_locked(res));
        reg.unlock(&mut os, handle).unwrap();
        assert!(!gpu.is_locked(res));

        let up = reg
            .allocate_surface_2d_up(&mut os, 4, 4, SurfaceFormat::R8Uint, vec![7u8; 16])
            .unwrap();
        assert_eq!(
            reg.lock(&mut os, SurfaceHandle::Surface2DUp(up), LockFlags::READ),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            reg.lock(&mut os, SurfaceHandle::Surface3D(Surface3DHandle::new(0)), LockFlags::READ),
            Err(Error::InvalidHandle)
        );
    }

    #[test]
    fn test_2d_up_mirrors_user_memory() {
        let (mut os, mut reg) = setup();
        let gpu = os.gpu();
        let up = reg
            .allocate_surface_2d_up(&mut os, 4, 2, SurfaceFormat::R8Uint, (0u8..8).collect())
            .unwrap();
        let res = reg.surface_2d_up(up).unwrap().resource;
        assert_eq!(gpu.resource_bytes(res).unwrap(), (0u8..8).collect::<Vec<_>>());
        assert_eq!(
            reg.allocate_surface_2d_up(&mut os, 4, 4, SurfaceFormat::R8Uint, vec![0; 8]),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_table_exhaustion() {
        let (mut os, mut reg) = setup();
        let params = Surface3DParams { width: 4, height: 4, depth: 2, format: SurfaceFormat::R8Uint };
        for _ in 0..MAX_3D_TABLE_SIZE {
            reg.allocate_surface_3d(&mut os, &params).unwrap();
        }
        assert_eq!(reg.allocate_surface_3d(&mut os, &params), Err(Error::ResourceExhausted));
        assert_eq!(reg.stats().exhausted, 1);
    }

    #[test]
    fn test_sampler_slots() {
        let mut reg = ResourceRegistry::new();
        let a = reg.register_sampler(SamplerState::default()).unwrap();
        let b = reg.register_sampler(SamplerState::default()).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        reg.unregister_sampler(a).unwrap();
        assert_eq!(reg.register_sampler(SamplerState::default()).unwrap().index(), 0);

        reg.register_sampler_8x8(Sampler8x8State::avs()).unwrap();
        reg.register_sampler_8x8(Sampler8x8State::va()).unwrap();
        assert_eq!(reg.register_sampler_8x8(Sampler8x8State::avs()), Err(Error::ResourceExhausted));
    }

    #[test]
    fn test_bind_arguments() {
        let (mut os, mut reg) = setup();
        let gpu = os.gpu();
        let profile = profile_for(Platform::Gen9);
        let buf = reg.allocate_buffer(&mut os, &BufferParams::new(64)).unwrap();
        let s = reg
            .allocate_surface_2d(&mut os, &Surface2DParams::new(16, 16, SurfaceFormat::Nv12))
            .unwrap();
        let sampler = reg.register_sampler(SamplerState::default()).unwrap();

        let mut bt = BindingTable::new(false);
        let mut samplers = KernelSamplers::new();
        let mut bind = |reg: &ResourceRegistry, os: &mut SimOs, v: &ArgValue| {
            reg.bind_argument(os, profile.as_ref(), &mut bt, &mut samplers, v)
        };
        let b = bind(&reg, &mut os, &ArgValue::Buffer { handle: buf, alias: 0 }).unwrap();
        let again = bind(&reg, &mut os, &ArgValue::Buffer { handle: buf, alias: 0 }).unwrap();
        assert_eq!(b, again);
        let surf = bind(&reg, &mut os, &ArgValue::Surface2D { handle: s, alias: 0 }).unwrap();
        assert_ne!(surf, b);
        assert_eq!(bind(&reg, &mut os, &ArgValue::Sampler(sampler)), Ok(0));
        assert_eq!(bind(&reg, &mut os, &ArgValue::Sampler(sampler)), Ok(0));
        assert_eq!(bind(&reg, &mut os, &ArgValue::Implicit(42)), Ok(42));
        assert_eq!(
            bind(&reg, &mut os, &ArgValue::General(vec![0; 4])),
            Err(Error::InvalidParameter)
        );

        let vme = ArgValue::Vme {
            current: s,
            forward: [s].into_iter().collect(),
            backward: ArrayVec::new(),
        };
        let first = bind(&reg, &mut os, &vme).unwrap();
        assert!(first > surf);

        os.create_gpu_context(cm_core::GpuContext::Render).unwrap();
        os.set_gpu_context(cm_core::GpuContext::Render).unwrap();
        let cb = os.get_command_buffer().unwrap();
        os.return_command_buffer(cb);
        os.submit_command_buffer().unwrap();
        assert_eq!(gpu.registered(0).len(), 2);
    }
}
