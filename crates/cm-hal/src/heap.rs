//! # State Heaps
//!
//! Memory the hardware reads indirectly while a task runs.
//!
//! ## Layout
//!
//! ```text
//! DSH mode                         GSH mode
//! ┌──────────────┐ ISH             ┌──────────────┐ GSH
//! │ kernel region│                 │ kernel region│
//! └──────────────┘                 ├──────────────┤ media_base
//! ┌──────────────┐ DSH             │ task 0 block │
//! │ task 0 block │                 │ task 1 block │
//! │ task 1 block │                 │ ...          │
//! │ ...          │                 └──────────────┘
//! └──────────────┘
//! ```
//!
//! Each task block holds CURBE data, then interface descriptors, then
//! sampler states. Binding tables and surface states live in a separate
//! surface state heap, one block per task.

use arrayvec::ArrayVec;
use cm_core::consts::{MAX_BINDING_INDICES, MAX_KERNELS_PER_TASK};
use cm_core::{DeviceOptions, Error, GpuAddr, OsResource, Result};
use cm_os::{OsInterface, ResourceDesc};
use static_assertions::const_assert;

use crate::resource::binding::{BindingTable, SURFACE_STATE_SIZE};
use crate::resource::sampler::{SamplerState, SAMPLER_STATE_SIZE};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Media state bytes per task
pub const MEDIA_STATE_BLOCK_SIZE: u32 = 64 * 1024;
/// Surface state heap bytes per task
pub const SSH_BLOCK_SIZE: u32 = 20 * 1024;
/// Binding table bytes at the start of each SSH block
pub const BINDING_TABLE_SIZE: u32 = MAX_BINDING_INDICES as u32 * 4;
/// Interface descriptor size
pub const INTERFACE_DESCRIPTOR_SIZE: u32 = 32;

const CURBE_ALIGN: u32 = 64;
const SAMPLER_ALIGN: u32 = 64;

const_assert!(BINDING_TABLE_SIZE + MAX_BINDING_INDICES as u32 * SURFACE_STATE_SIZE <= SSH_BLOCK_SIZE);
const_assert!(INTERFACE_DESCRIPTOR_SIZE * MAX_KERNELS_PER_TASK as u32 <= MEDIA_STATE_BLOCK_SIZE);

const fn align(value: u32, to: u32) -> u32 {
    (value + to - 1) & !(to - 1)
}

// =============================================================================
// INTERFACE DESCRIPTOR
// =============================================================================

/// INTERFACE_DESCRIPTOR_DATA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceDescriptor {
    /// Kernel offset from instruction base
    pub kernel_offset: u32,
    /// Sampler states offset from dynamic state base
    pub sampler_offset: u32,
    /// Sampler states used
    pub sampler_count: u32,
    /// Binding table offset from surface state base
    pub binding_table_offset: u32,
    /// Binding table entries used
    pub binding_table_count: u32,
    /// CURBE bytes per thread
    pub curbe_length: u32,
    /// Threads in a thread group
    pub threads_in_group: u32,
    /// Shared local memory bytes
    pub slm_size: u32,
    /// Thread-group barrier enabled
    pub barrier: bool,
}

impl InterfaceDescriptor {
    fn slm_encoding(bytes: u32) -> u32 {
        match bytes {
            0 => 0,
            b => {
                let kib = b.div_ceil(1024).next_power_of_two().max(1);
                // 1K -> 1, 2K -> 2, 4K -> 3, ...
                32 - kib.leading_zeros()
            }
        }
    }

    /// Encoded dwords
    pub fn encode(&self) -> [u32; 8] {
        let sampler_count = self.sampler_count.div_ceil(4).min(4);
        [
            self.kernel_offset & !0x3F,
            0,
            (self.sampler_offset & !0x1F) | (sampler_count << 2),
            (self.binding_table_offset & !0x1F) | self.binding_table_count.min(31),
            (self.curbe_length.div_ceil(32) & 0xFFFF) << 16,
            ((self.barrier as u32) << 21)
                | (Self::slm_encoding(self.slm_size) << 16)
                | (self.threads_in_group & 0x3FF),
            0,
            0,
        ]
    }

    /// Decode kernel offset and CURBE length back out of encoded dwords
    pub fn parse(dw: &[u32]) -> Option<(u32, u32)> {
        Some((dw.first()? & !0x3F, (dw.get(4)? >> 16) * 32))
    }
}

// =============================================================================
// MEDIA STATE LAYOUT
// =============================================================================

/// Per-kernel needs that drive the layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelFootprint {
    /// CURBE bytes
    pub curbe_size: u32,
    /// Sampler states
    pub sampler_count: u32,
}

/// Offsets inside one task's media state block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStateLayout {
    /// CURBE offset per kernel
    pub curbe_offsets: ArrayVec<u32, MAX_KERNELS_PER_TASK>,
    /// CURBE bytes across all kernels
    pub curbe_total: u32,
    /// First interface descriptor
    pub id_offset: u32,
    /// Sampler states offset per kernel
    pub sampler_offsets: ArrayVec<u32, MAX_KERNELS_PER_TASK>,
    /// Bytes used
    pub end: u32,
}

impl MediaStateLayout {
    /// Lay out `kernels` in a block of `block_size` bytes
    pub fn compute(kernels: &[KernelFootprint], block_size: u32) -> Result<Self> {
        if kernels.len() > MAX_KERNELS_PER_TASK {
            return Err(Error::InvalidParameter);
        }
        let mut curbe_offsets = ArrayVec::new();
        let mut offset = 0;
        for k in kernels {
            curbe_offsets.push(offset);
            offset += align(k.curbe_size, CURBE_ALIGN);
        }
        let curbe_total = offset;
        let id_offset = align(offset, 64);
        offset = id_offset + kernels.len() as u32 * INTERFACE_DESCRIPTOR_SIZE;
        let mut sampler_offsets = ArrayVec::new();
        for k in kernels {
            offset = align(offset, SAMPLER_ALIGN);
            sampler_offsets.push(offset);
            offset += k.sampler_count * SAMPLER_STATE_SIZE;
        }
        if offset > block_size {
            log::warn!("cm-hal: media state needs {} of {} bytes", offset, block_size);
            return Err(Error::ResourceExhausted);
        }
        Ok(Self {
            curbe_offsets,
            curbe_total,
            id_offset,
            sampler_offsets,
            end: offset,
        })
    }
}

// =============================================================================
// STATE HEAP
// =============================================================================

/// Where per-task media state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapMode {
    /// Separate instruction and dynamic state heaps
    Dynamic,
    /// One general state heap holding kernels and media state
    General,
}

/// Heap resources of a device
#[derive(Debug)]
pub struct StateHeap {
    mode: HeapMode,
    kernel_heap: OsResource,
    media_heap: OsResource,
    ssh: OsResource,
    kernel_region_size: u32,
    media_base: u32,
    max_tasks: u32,
}

impl StateHeap {
    /// Allocate heaps for `max_tasks` slots
    pub fn create<O: OsInterface + ?Sized>(os: &mut O, options: &DeviceOptions) -> Result<Self> {
        let max_tasks = options.max_task_number;
        let region = options.kernel_binary_size_in_gsh;
        let media_bytes = max_tasks * MEDIA_STATE_BLOCK_SIZE;
        let ssh = os.allocate_resource(&ResourceDesc::new(
            (max_tasks * SSH_BLOCK_SIZE) as usize,
            "CmSurfaceStateHeap",
        ))?;
        let heap = if options.dynamic_state_heap {
            let kernel_heap = os.allocate_resource(&ResourceDesc::new(region as usize, "CmInstructionHeap"))?;
            let media_heap =
                os.allocate_resource(&ResourceDesc::new(media_bytes as usize, "CmDynamicStateHeap"))?;
            Self {
                mode: HeapMode::Dynamic,
                kernel_heap,
                media_heap,
                ssh,
                kernel_region_size: region,
                media_base: 0,
                max_tasks,
            }
        } else {
            let gsh = os.allocate_resource(&ResourceDesc::new(
                (region + media_bytes) as usize,
                "CmGeneralStateHeap",
            ))?;
            Self {
                mode: HeapMode::General,
                kernel_heap: gsh,
                media_heap: gsh,
                ssh,
                kernel_region_size: region,
                media_base: region,
                max_tasks,
            }
        };
        log::debug!(
            "cm-hal: {:?} heaps, {} byte kernel region, {} task blocks",
            heap.mode,
            region,
            max_tasks
        );
        Ok(heap)
    }

    /// Release the heap resources
    pub fn destroy<O: OsInterface + ?Sized>(&self, os: &mut O) {
        let mut resources: ArrayVec<OsResource, 3> = ArrayVec::new();
        resources.push(self.ssh);
        resources.push(self.kernel_heap);
        if self.media_heap != self.kernel_heap {
            resources.push(self.media_heap);
        }
        for res in resources {
            if let Err(e) = os.free_resource(res) {
                log::warn!("cm-hal: failed to free heap {}: {}", res, e);
            }
        }
    }

    /// Heap mode
    pub fn mode(&self) -> HeapMode {
        self.mode
    }

    /// Bytes reserved for kernel binaries
    pub fn kernel_region_size(&self) -> u32 {
        self.kernel_region_size
    }

    /// Resource holding kernel binaries
    pub fn kernel_heap(&self) -> OsResource {
        self.kernel_heap
    }

    /// Resource holding media state blocks
    pub fn media_heap(&self) -> OsResource {
        self.media_heap
    }

    /// Surface state heap
    pub fn surface_heap(&self) -> OsResource {
        self.ssh
    }

    /// Offset of a task's media block from dynamic state base
    pub fn media_block_offset(&self, task: u32) -> u32 {
        self.media_base + task * MEDIA_STATE_BLOCK_SIZE
    }

    /// Offset of a task's binding table from surface state base
    pub fn binding_table_offset(&self, task: u32) -> u32 {
        task * SSH_BLOCK_SIZE
    }

    /// Offset of a surface state from surface state base
    pub fn surface_state_offset(&self, task: u32, index: u8) -> u32 {
        task * SSH_BLOCK_SIZE + BINDING_TABLE_SIZE + index as u32 * SURFACE_STATE_SIZE
    }

    /// Bytes a task's media block may use
    pub fn media_block_size(&self) -> u32 {
        MEDIA_STATE_BLOCK_SIZE
    }

    /// STATE_BASE_ADDRESS fields for the heaps
    pub fn base_addresses<O: OsInterface + ?Sized>(&self, os: &O) -> Result<cm_cmd::StateBaseAddress> {
        let media = os.gfx_address(self.media_heap)?;
        let media_size = os.resource_size(self.media_heap)? as u32;
        Ok(cm_cmd::StateBaseAddress {
            general: media,
            surface: os.gfx_address(self.ssh)?,
            dynamic: media,
            indirect: GpuAddr::new(0),
            instruction: os.gfx_address(self.kernel_heap)?,
            general_size: media_size,
            dynamic_size: media_size,
            instruction_size: self.kernel_region_size,
            stateless_mocs: 0,
        })
    }

    /// Register every heap for the next submission
    pub fn register<O: OsInterface + ?Sized>(&self, os: &mut O) -> Result<()> {
        os.register_resource(self.kernel_heap, false)?;
        if self.media_heap != self.kernel_heap {
            os.register_resource(self.media_heap, false)?;
        }
        os.register_resource(self.ssh, false)
    }

    fn check_task(&self, task: u32) -> Result<()> {
        if task >= self.max_tasks {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    // =========================================================================
    // Writers
    // =========================================================================

    /// Copy a kernel binary into the kernel region
    pub fn write_kernel<O: OsInterface + ?Sized>(&self, os: &mut O, offset: u32, binary: &[u8]) -> Result<()> {
        if offset as usize + binary.len() > self.kernel_region_size as usize {
            return Err(Error::InvalidParameter);
        }
        os.write_resource(self.kernel_heap, offset as usize, binary)
    }

    /// Copy CURBE bytes into a task block
    pub fn write_curbe<O: OsInterface + ?Sized>(
        &self,
        os: &mut O,
        task: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        self.check_task(task)?;
        if offset as usize + data.len() > MEDIA_STATE_BLOCK_SIZE as usize {
            return Err(Error::InvalidParameter);
        }
        let at = self.media_block_offset(task) + offset;
        os.write_resource(self.media_heap, at as usize, data)
    }

    /// Write interface descriptor `index` of a task
    pub fn write_interface_descriptor<O: OsInterface + ?Sized>(
        &self,
        os: &mut O,
        task: u32,
        layout: &MediaStateLayout,
        index: usize,
        id: &InterfaceDescriptor,
    ) -> Result<()> {
        self.check_task(task)?;
        let at = self.media_block_offset(task) + layout.id_offset + index as u32 * INTERFACE_DESCRIPTOR_SIZE;
        os.write_resource(self.media_heap, at as usize, &dwords_to_bytes(&id.encode()))
    }

    /// Write a kernel's sampler states
    pub fn write_samplers<O: OsInterface + ?Sized>(
        &self,
        os: &mut O,
        task: u32,
        offset: u32,
        samplers: &[SamplerState],
    ) -> Result<()> {
        self.check_task(task)?;
        for (i, sampler) in samplers.iter().enumerate() {
            let at = self.media_block_offset(task) + offset + i as u32 * SAMPLER_STATE_SIZE;
            os.write_resource(self.media_heap, at as usize, &dwords_to_bytes(&sampler.encode()))?;
        }
        Ok(())
    }

    /// Write a task's binding table and the surface states it points at
    pub fn write_binding_table<O: OsInterface + ?Sized>(
        &self,
        os: &mut O,
        task: u32,
        bt: &BindingTable,
    ) -> Result<()> {
        self.check_task(task)?;
        let mut table = [0u32; MAX_BINDING_INDICES];
        for (index, state) in bt.states() {
            let offset = self.surface_state_offset(task, *index);
            table[*index as usize] = offset;
            os.write_resource(self.ssh, offset as usize, &dwords_to_bytes(&state.encode()))?;
        }
        os.write_resource(
            self.ssh,
            self.binding_table_offset(task) as usize,
            &dwords_to_bytes(&table),
        )
    }
}

fn dwords_to_bytes(dwords: &[u32]) -> alloc::vec::Vec<u8> {
    dwords.iter().flat_map(|d| d.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::binding::{BindingKind, SurfaceStateDesc};
    use cm_core::{SurfaceFormat, SurfaceKind};
    use cm_os::SimOs;

    fn fp(curbe_size: u32, sampler_count: u32) -> KernelFootprint {
        KernelFootprint { curbe_size, sampler_count }
    }

    #[test]
    fn test_layout_alignment() {
        let layout = MediaStateLayout::compute(&[fp(40, 1), fp(100, 0), fp(0, 2)], MEDIA_STATE_BLOCK_SIZE).unwrap();
        assert_eq!(layout.curbe_offsets.as_slice(), &[0, 64, 192]);
        assert_eq!(layout.curbe_total, 192);
        assert_eq!(layout.id_offset, 192);
        // three descriptors end at 288; samplers start 64-aligned
        assert_eq!(layout.sampler_offsets.as_slice(), &[320, 384, 384]);
        assert_eq!(layout.end, 416);
    }

    #[test]
    fn test_layout_overflow() {
        assert_eq!(
            MediaStateLayout::compute(&[fp(4096, 0)], 1024),
            Err(Error::ResourceExhausted)
        );
    }

    #[test]
    fn test_heap_modes() {
        let mut os = SimOs::new();
        let gpu = os.gpu();
        let dsh = StateHeap::create(&mut os, &DeviceOptions::default()).unwrap();
        assert_eq!(dsh.mode(), HeapMode::Dynamic);
        assert_eq!(dsh.media_block_offset(1), MEDIA_STATE_BLOCK_SIZE);
        assert_eq!(gpu.live_resources(), 3);

        let options = DeviceOptions { dynamic_state_heap: false, ..DeviceOptions::default() };
        let gsh = StateHeap::create(&mut os, &options).unwrap();
        assert_eq!(gsh.mode(), HeapMode::General);
        assert_eq!(gsh.kernel_heap(), gsh.media_heap());
        assert_eq!(gsh.media_block_offset(0), options.kernel_binary_size_in_gsh);
        gsh.destroy(&mut os);
        dsh.destroy(&mut os);
        assert_eq!(gpu.live_resources(), 0);
    }

    #[test]
    fn test_binding_table_written() {
        let mut os = SimOs::new();
        let gpu = os.gpu();
        let heap = StateHeap::create(&mut os, &DeviceOptions::default()).unwrap();
        let mut bt = BindingTable::new(false);
        let desc = SurfaceStateDesc {
            kind: SurfaceKind::Buffer,
            addr: GpuAddr::new(0x1234_0000),
            width: 256,
            height: 1,
            depth: 1,
            pitch: 0,
            format: SurfaceFormat::Buffer,
            mocs: 0,
            x_offset: 0,
            y_offset: 0,
        };
        let idx = bt.get_or_create(OsResource::new(9), 0, BindingKind::Regular, &[desc]).unwrap();
        heap.write_binding_table(&mut os, 2, &bt).unwrap();
        let bytes = gpu.resource_bytes(heap.surface_heap()).unwrap();
        let bt_at = heap.binding_table_offset(2) as usize + idx as usize * 4;
        let entry = u32::from_le_bytes(bytes[bt_at..bt_at + 4].try_into().unwrap());
        assert_eq!(entry, heap.surface_state_offset(2, idx));
        let ss = entry as usize;
        let addr_low = u32::from_le_bytes(bytes[ss + 32..ss + 36].try_into().unwrap());
        assert_eq!(addr_low, 0x1234_0000);
        assert_eq!(heap.write_binding_table(&mut os, 4, &bt), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_interface_descriptor_round_trip() {
        let id = InterfaceDescriptor {
            kernel_offset: 0x1000,
            curbe_length: 96,
            threads_in_group: 8,
            slm_size: 4096,
            barrier: true,
            ..InterfaceDescriptor::default()
        };
        let dw = id.encode();
        assert_eq!(InterfaceDescriptor::parse(&dw), Some((0x1000, 96)));
        assert_eq!((dw[5] >> 16) & 0x1F, 3);
        assert_eq!((dw[5] >> 21) & 1, 1);
    }
}
