//! # Synchronization Engine
//!
//! Sync tags, per-task timestamps, the tracker and state-buffer bindings.
//!
//! ## Timestamp slots
//!
//! ```text
//! slot = task * 32
//! +0   begin timestamp   (sentinel until the task starts)
//! +8   end timestamp     (sentinel until the task ends)
//! +16  sync tag
//! +24  tracker tag
//! ```
//!
//! The render and vebox engines each have their own timestamp resource
//! with this layout, indexed by the shared task id.

use cm_cmd::{CommandBuffer, MiFlushDw, MiStoreDataImm, PipeControl, PipeControlFlags, PostSync};
use cm_core::consts::{INVALID_TIMESTAMP, SYNC_SLOT_STRIDE};
use cm_core::{Error, GpuAddr, OsResource, Result, TaskId};
use cm_os::{OsInterface, ResourceDesc};
use hashbrown::HashMap;

use crate::task::TaskEngine;

const BEGIN_OFFSET: u32 = 0;
const END_OFFSET: u32 = 8;
const TAG_OFFSET: u32 = 16;
const TRACKER_OFFSET: u32 = 24;

// =============================================================================
// STATE BUFFERS
// =============================================================================

/// How a bound state buffer is consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBufferType {
    /// Bound but not consumed by composition
    None,
    /// Replaces the kernel's CURBE payload
    Curbe,
}

/// A state buffer bound to a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateBufferBinding {
    /// Backing resource
    pub resource: OsResource,
    /// Bytes
    pub size: u32,
    /// Consumption
    pub kind: StateBufferType,
    /// GPU address the runtime mapped it at
    pub va: GpuAddr,
    /// Media state the binding belongs to
    pub media_state: u64,
}

// =============================================================================
// SLOT CONTENTS
// =============================================================================

/// Values read back from a timestamp slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotValues {
    /// Begin timestamp
    pub begin: u64,
    /// End timestamp
    pub end: u64,
    /// Sync tag
    pub tag: u64,
    /// Tracker tag
    pub tracker: u64,
}

// =============================================================================
// SYNC ENGINE
// =============================================================================

/// Timestamp and tag bookkeeping of a device
#[derive(Debug)]
pub struct SyncEngine {
    timestamps: OsResource,
    vebox_timestamps: Option<OsResource>,
    tracker: OsResource,
    max_tasks: u32,
    next_tag: u64,
    next_tracker: u64,
    state_buffers: HashMap<u64, StateBufferBinding>,
}

impl SyncEngine {
    /// Allocate timestamp resources for `max_tasks` slots
    pub fn create<O: OsInterface + ?Sized>(os: &mut O, max_tasks: u32, vebox: bool) -> Result<Self> {
        let bytes = (max_tasks * SYNC_SLOT_STRIDE) as usize;
        let timestamps = os.allocate_resource(&ResourceDesc::new(bytes, "CmTimestamps"))?;
        let vebox_timestamps = if vebox {
            Some(os.allocate_resource(&ResourceDesc::new(bytes, "CmVeboxTimestamps"))?)
        } else {
            None
        };
        let tracker = os.allocate_resource(&ResourceDesc::new(8, "CmTracker"))?;
        let engine = Self {
            timestamps,
            vebox_timestamps,
            tracker,
            max_tasks,
            next_tag: 1,
            next_tracker: 1,
            state_buffers: HashMap::new(),
        };
        for task in 0..max_tasks {
            let offset = (task * SYNC_SLOT_STRIDE) as usize;
            for res in core::iter::once(timestamps).chain(vebox_timestamps) {
                os.write_u64(res, offset, INVALID_TIMESTAMP)?;
                os.write_u64(res, offset + END_OFFSET as usize, INVALID_TIMESTAMP)?;
            }
        }
        Ok(engine)
    }

    /// Release the resources
    pub fn destroy<O: OsInterface + ?Sized>(&self, os: &mut O) {
        for res in [Some(self.timestamps), self.vebox_timestamps, Some(self.tracker)]
            .into_iter()
            .flatten()
        {
            if let Err(e) = os.free_resource(res) {
                log::warn!("cm-hal: failed to free {}: {}", res, e);
            }
        }
    }

    fn resource(&self, engine: TaskEngine) -> Result<OsResource> {
        match engine {
            TaskEngine::Render => Ok(self.timestamps),
            TaskEngine::Vebox => self.vebox_timestamps.ok_or(Error::Unimplemented),
        }
    }

    fn slot_offset(&self, task: TaskId) -> Result<u32> {
        if task.index() >= self.max_tasks {
            return Err(Error::InvalidParameter);
        }
        Ok(task.index() * SYNC_SLOT_STRIDE)
    }

    fn slot_addr<O: OsInterface + ?Sized>(
        &self,
        os: &O,
        engine: TaskEngine,
        task: TaskId,
        field: u32,
    ) -> Result<GpuAddr> {
        let base = os.gfx_address(self.resource(engine)?)?;
        Ok(base.offset((self.slot_offset(task)? + field) as u64))
    }

    /// Resources the GPU writes during a submission
    pub fn register<O: OsInterface + ?Sized>(&self, os: &mut O, engine: TaskEngine) -> Result<()> {
        os.register_resource(self.resource(engine)?, true)?;
        os.register_resource(self.tracker, true)
    }

    // =========================================================================
    // Tags
    // =========================================================================

    /// Take the next sync tag
    pub fn next_sync_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }

    /// Take the next tracker tag
    pub fn next_tracker_tag(&mut self) -> u64 {
        let tag = self.next_tracker;
        self.next_tracker = self.next_tracker.wrapping_add(1);
        tag
    }

    /// Tracker tag most recently written by the GPU
    pub fn tracker_value<O: OsInterface + ?Sized>(&self, os: &O) -> Result<u64> {
        os.read_u64(self.tracker, 0)
    }

    /// Whether the GPU has passed the submission that wrote `tag`
    pub fn tracker_completed<O: OsInterface + ?Sized>(&self, os: &O, tag: u64) -> Result<bool> {
        Ok(self.tracker_value(os)? >= tag)
    }

    // =========================================================================
    // Slots
    // =========================================================================

    /// Reset a slot before submission
    pub fn init_slot<O: OsInterface + ?Sized>(
        &self,
        os: &mut O,
        engine: TaskEngine,
        task: TaskId,
        tag: u64,
        tracker: u64,
    ) -> Result<()> {
        let res = self.resource(engine)?;
        let base = self.slot_offset(task)? as usize;
        os.write_u64(res, base + BEGIN_OFFSET as usize, INVALID_TIMESTAMP)?;
        os.write_u64(res, base + END_OFFSET as usize, INVALID_TIMESTAMP)?;
        os.write_u64(res, base + TAG_OFFSET as usize, tag)?;
        os.write_u64(res, base + TRACKER_OFFSET as usize, tracker)
    }

    /// Read a slot
    pub fn read_slot<O: OsInterface + ?Sized>(&self, os: &O, engine: TaskEngine, task: TaskId) -> Result<SlotValues> {
        let res = self.resource(engine)?;
        let base = self.slot_offset(task)? as usize;
        Ok(SlotValues {
            begin: os.read_u64(res, base + BEGIN_OFFSET as usize)?,
            end: os.read_u64(res, base + END_OFFSET as usize)?,
            tag: os.read_u64(res, base + TAG_OFFSET as usize)?,
            tracker: os.read_u64(res, base + TRACKER_OFFSET as usize)?,
        })
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Begin timestamp with a write-cache flush
    pub fn write_begin_timestamp<O: OsInterface + ?Sized>(
        &self,
        os: &O,
        buffer: &mut CommandBuffer,
        task: TaskId,
    ) -> Result<()> {
        let addr = self.slot_addr(os, TaskEngine::Render, task, BEGIN_OFFSET)?;
        buffer.add(&PipeControl::timestamp(addr, PipeControlFlags::write_cache()))
    }

    /// End timestamp with a read-cache invalidate
    pub fn write_end_timestamp<O: OsInterface + ?Sized>(
        &self,
        os: &O,
        buffer: &mut CommandBuffer,
        task: TaskId,
    ) -> Result<()> {
        let addr = self.slot_addr(os, TaskEngine::Render, task, END_OFFSET)?;
        buffer.add(&PipeControl::timestamp(addr, PipeControlFlags::read_cache()))
    }

    /// End timestamp ahead of a conditional end, so an early-ended task
    /// still reads as finished
    pub fn write_conditional_end_timestamp<O: OsInterface + ?Sized>(
        &self,
        os: &O,
        buffer: &mut CommandBuffer,
        task: TaskId,
    ) -> Result<()> {
        let addr = self.slot_addr(os, TaskEngine::Render, task, END_OFFSET)?;
        buffer.add(&PipeControl::timestamp(addr, PipeControlFlags::CS_STALL))
    }

    /// Sync tag through a pipe-control write
    pub fn write_sync_tag_flush<O: OsInterface + ?Sized>(
        &self,
        os: &O,
        buffer: &mut CommandBuffer,
        task: TaskId,
        tag: u64,
    ) -> Result<()> {
        let addr = self.slot_addr(os, TaskEngine::Render, task, TAG_OFFSET)?;
        buffer.add(&PipeControl {
            flags: PipeControlFlags::CS_STALL,
            post_sync: PostSync::WriteImmediate(tag),
            addr,
        })
    }

    /// Sync tag through a store-data command
    pub fn write_sync_tag<O: OsInterface + ?Sized>(
        &self,
        os: &O,
        buffer: &mut CommandBuffer,
        engine: TaskEngine,
        task: TaskId,
        tag: u64,
    ) -> Result<()> {
        let addr = self.slot_addr(os, engine, task, TAG_OFFSET)?;
        buffer.add(&MiStoreDataImm::qword(addr, tag))
    }

    /// Tracker tag
    pub fn write_tracker<O: OsInterface + ?Sized>(&self, os: &O, buffer: &mut CommandBuffer, tag: u64) -> Result<()> {
        let addr = os.gfx_address(self.tracker)?;
        buffer.add(&MiStoreDataImm::qword(addr, tag))
    }

    /// Vebox timestamp through a flush
    pub fn write_vebox_timestamp<O: OsInterface + ?Sized>(
        &self,
        os: &O,
        buffer: &mut CommandBuffer,
        task: TaskId,
        end: bool,
    ) -> Result<()> {
        let field = if end { END_OFFSET } else { BEGIN_OFFSET };
        let addr = self.slot_addr(os, TaskEngine::Vebox, task, field)?;
        buffer.add(&MiFlushDw {
            addr,
            post_sync: PostSync::Timestamp,
        })
    }

    // =========================================================================
    // State buffers
    // =========================================================================

    /// Bind a state buffer to a kernel, replacing any previous binding
    pub fn bind_state_buffer(&mut self, kernel_ptr: u64, binding: StateBufferBinding) -> Result<()> {
        if binding.size == 0 {
            return Err(Error::InvalidParameter);
        }
        self.state_buffers.insert(kernel_ptr, binding);
        Ok(())
    }

    /// Drop a kernel's state buffer
    pub fn unbind_state_buffer(&mut self, kernel_ptr: u64) -> Result<StateBufferBinding> {
        self.state_buffers
            .remove(&kernel_ptr)
            .ok_or(Error::InvalidParameter)
    }

    /// A kernel's state buffer
    pub fn state_buffer(&self, kernel_ptr: u64) -> Option<&StateBufferBinding> {
        self.state_buffers.get(&kernel_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_core::GpuContext;
    use cm_os::SimOs;

    fn setup() -> (SimOs, SyncEngine) {
        let mut os = SimOs::new();
        os.create_gpu_context(GpuContext::Render).unwrap();
        os.set_gpu_context(GpuContext::Render).unwrap();
        let sync = SyncEngine::create(&mut os, 4, true).unwrap();
        (os, sync)
    }

    #[test]
    fn test_slots_start_at_sentinel() {
        let (mut os, sync) = setup();
        let task = TaskId::new(3);
        let slot = sync.read_slot(&os, TaskEngine::Render, task).unwrap();
        assert_eq!((slot.begin, slot.end), (INVALID_TIMESTAMP, INVALID_TIMESTAMP));
        sync.init_slot(&mut os, TaskEngine::Vebox, task, 7, 9).unwrap();
        let slot = sync.read_slot(&os, TaskEngine::Vebox, task).unwrap();
        assert_eq!((slot.tag, slot.tracker), (7, 9));
        assert_eq!(
            sync.read_slot(&os, TaskEngine::Render, TaskId::new(4)),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_gpu_fills_slot() {
        let (mut os, mut sync) = setup();
        let gpu = os.gpu();
        let task = TaskId::new(1);
        let tag = sync.next_sync_tag();
        let tracker = sync.next_tracker_tag();
        sync.init_slot(&mut os, TaskEngine::Render, task, tag, tracker).unwrap();
        let mut buf = os.get_command_buffer().unwrap();
        sync.write_begin_timestamp(&os, &mut buf, task).unwrap();
        sync.write_sync_tag(&os, &mut buf, TaskEngine::Render, task, 0x55).unwrap();
        sync.write_tracker(&os, &mut buf, tracker).unwrap();
        sync.write_end_timestamp(&os, &mut buf, task).unwrap();
        buf.add(&cm_cmd::MiBatchBufferEnd).unwrap();
        os.return_command_buffer(buf);
        os.submit_command_buffer().unwrap();

        assert!(!sync.tracker_completed(&os, tracker).unwrap());
        gpu.step(1);
        let slot = sync.read_slot(&os, TaskEngine::Render, task).unwrap();
        assert_ne!(slot.begin, INVALID_TIMESTAMP);
        assert_eq!(slot.end, INVALID_TIMESTAMP);
        gpu.run();
        let slot = sync.read_slot(&os, TaskEngine::Render, task).unwrap();
        assert!(slot.end > slot.begin);
        assert_eq!(slot.tag, 0x55);
        assert!(sync.tracker_completed(&os, tracker).unwrap());
    }

    #[test]
    fn test_tags_increase() {
        let (_os, mut sync) = setup();
        let a = sync.next_sync_tag();
        let b = sync.next_sync_tag();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_state_buffer_binding() {
        let (_os, mut sync) = setup();
        let binding = StateBufferBinding {
            resource: OsResource::new(1),
            size: 64,
            kind: StateBufferType::Curbe,
            va: GpuAddr::new(0x1000),
            media_state: 0,
        };
        sync.bind_state_buffer(0xAB, binding).unwrap();
        assert_eq!(sync.state_buffer(0xAB).map(|b| b.kind), Some(StateBufferType::Curbe));
        assert_eq!(sync.unbind_state_buffer(0xAB), Ok(binding));
        assert_eq!(sync.unbind_state_buffer(0xAB), Err(Error::InvalidParameter));
    }
}
