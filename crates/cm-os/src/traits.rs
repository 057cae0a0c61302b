//! # OS Interface Trait
//!
//! Operations the engine needs from the OS/driver layer.

use bitflags::bitflags;
use cm_cmd::CommandBuffer;
use cm_core::{GpuAddr, GpuContext, OsResource, Result};

// =============================================================================
// RESOURCE DESCRIPTION
// =============================================================================

/// Allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDesc {
    /// Bytes
    pub size: usize,
    /// Debug name
    pub name: &'static str,
}

impl ResourceDesc {
    /// Describe a linear allocation
    pub const fn new(size: usize, name: &'static str) -> Self {
        Self { size, name }
    }
}

bitflags! {
    /// Host access requested by a lock
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LockFlags: u32 {
        /// Host reads
        const READ = 1 << 0;
        /// Host writes
        const WRITE = 1 << 1;
    }
}

// =============================================================================
// OS INTERFACE
// =============================================================================

/// OS/driver collaborator
///
/// Command buffers follow a get/return protocol: [`get_command_buffer`]
/// moves the current context's pending buffer out, the caller appends
/// commands, and [`return_command_buffer`] hands it back.
/// [`submit_command_buffer`] then sends everything pending on the context.
///
/// [`get_command_buffer`]: OsInterface::get_command_buffer
/// [`return_command_buffer`]: OsInterface::return_command_buffer
/// [`submit_command_buffer`]: OsInterface::submit_command_buffer
pub trait OsInterface {
    // =========================================================================
    // Resources
    // =========================================================================

    /// Allocate zeroed GPU-visible memory
    fn allocate_resource(&mut self, desc: &ResourceDesc) -> Result<OsResource>;

    /// Release a resource
    fn free_resource(&mut self, resource: OsResource) -> Result<()>;

    /// Size in bytes
    fn resource_size(&self, resource: OsResource) -> Result<usize>;

    /// GPU address of the first byte
    fn gfx_address(&self, resource: OsResource) -> Result<GpuAddr>;

    /// Make a resource resident for the next submission
    fn register_resource(&mut self, resource: OsResource, write: bool) -> Result<()>;

    /// Forget registrations made since the last submission
    fn discard_registrations(&mut self);

    /// Map for host access
    fn lock_resource(&mut self, resource: OsResource, flags: LockFlags) -> Result<()>;

    /// Drop host access
    fn unlock_resource(&mut self, resource: OsResource) -> Result<()>;

    /// Host read
    fn read_resource(&self, resource: OsResource, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Host write
    fn write_resource(&mut self, resource: OsResource, offset: usize, data: &[u8]) -> Result<()>;

    // =========================================================================
    // Command Buffers
    // =========================================================================

    /// Take the current context's pending command buffer
    fn get_command_buffer(&mut self) -> Result<CommandBuffer>;

    /// Give a command buffer back
    fn return_command_buffer(&mut self, buffer: CommandBuffer);

    /// Submit the current context's pending commands
    fn submit_command_buffer(&mut self) -> Result<()>;

    // =========================================================================
    // GPU Contexts
    // =========================================================================

    /// Create a context
    fn create_gpu_context(&mut self, context: GpuContext) -> Result<()>;

    /// Make a context current
    fn set_gpu_context(&mut self, context: GpuContext) -> Result<()>;

    /// Current context
    fn gpu_context(&self) -> GpuContext;

    /// Bump a context's status tag
    fn increment_gpu_status_tag(&mut self, context: GpuContext);

    /// A context's status tag
    fn gpu_status_tag(&self, context: GpuContext) -> u32;

    /// Make `to` wait on work already submitted to `from`
    fn sync_gpu_context(&mut self, from: GpuContext, to: GpuContext) -> Result<()>;

    // =========================================================================
    // Time
    // =========================================================================

    /// GPU timestamp counter
    fn gpu_time(&self) -> u64;

    /// CPU timestamp counter
    fn cpu_time(&self) -> u64;

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Read a little-endian u64
    fn read_u64(&self, resource: OsResource, offset: usize) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read_resource(resource, offset, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write a little-endian u64
    fn write_u64(&mut self, resource: OsResource, offset: usize, value: u64) -> Result<()> {
        self.write_resource(resource, offset, &value.to_le_bytes())
    }
}
