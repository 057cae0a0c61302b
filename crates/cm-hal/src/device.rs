//! # Device Context
//!
//! [`CmHalState`] owns every table, heap and pool of one device and
//! implements the [`CmHal`] entry points the runtime calls.
//!
//! ## Lifecycle
//!
//! ```text
//! create ──► execute_* ──► query_task (Queued / InProgress / Finished)
//!    │            │                               │
//!    │            └── slot, pins, batch ref ◄─────┘ released on Finished
//!    ▼
//! drop: frees registry entries, pools, heaps and timestamp resources
//! ```
//!
//! All entry points take `&mut self`; callers serialize access to a device.

use alloc::boxed::Box;
use alloc::vec::Vec;

use cm_core::consts::INVALID_TIMESTAMP;
use cm_core::{
    BufferHandle, DeviceOptions, Error, GpuContext, L3Config, OsResource, PlatformInfo,
    PowerOption, Result, Sampler8x8Index, SamplerIndex, SkuFlags, Surface2DHandle,
    Surface2DUpHandle, Surface3DHandle, SurfaceFormat, TaskId, TaskStatus, UserFeatures,
};
use cm_os::{LockFlags, OsInterface, ResourceDesc};

use crate::composer::batch::{BatchBufferPool, BATCH_BUFFER_COUNT, BATCH_BUFFER_SIZE};
use crate::gen::{profile_for, HardwareProfile};
use crate::heap::StateHeap;
use crate::kernel_cache::KernelCache;
use crate::params::{Hints, KernelId, TaskParam};
use crate::resource::{
    BufferParams, ResourceRegistry, Sampler8x8State, SamplerState, Surface2DParams,
    Surface3DParams, SurfaceHandle, SurfaceStateParams,
};
use crate::sync::{StateBufferBinding, StateBufferType, SyncEngine};
use crate::task::{TaskReport, TaskTable};
use crate::vebox::{VeboxParam, VEBOX_PARAM_SIZE};

/// System instruction pointer (debug handler) bytes
const SIP_SIZE: usize = 16 * 1024;
/// Context save/restore bytes per hardware thread
const CSR_SIZE_PER_THREAD: usize = 8 * 1024;

// =============================================================================
// API
// =============================================================================

/// Capability update for [`CmHal::set_caps`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsParam {
    /// VFE thread count for the next task
    MaxHwThreads(u32),
    /// Index into the generation's suggested L3 partitions
    L3Config(usize),
}

/// Entry points of the task-execution engine
pub trait CmHal {
    /// Submit a media-walker or media-object task
    fn execute_task(&mut self, task: &TaskParam) -> Result<TaskId>;

    /// Submit a GPGPU task; `task.group_space` is required
    fn execute_group_task(&mut self, task: &TaskParam) -> Result<TaskId>;

    /// Submit a task split into enqueue groups by `hints`
    fn execute_hints_task(&mut self, task: &TaskParam, hints: u32) -> Result<TaskId>;

    /// Submit a vebox task
    fn execute_vebox_task(&mut self, param: &VeboxParam) -> Result<TaskId>;

    /// Status of a submitted task; a Finished or Reset task frees its slot
    fn query_task(&mut self, id: TaskId) -> Result<TaskReport>;

    /// Invalidate a task
    fn reset_task(&mut self, id: TaskId) -> Result<()>;

    /// Invalidate every task in flight
    fn reset_all(&mut self);

    /// Store a sampler state
    fn register_sampler(&mut self, state: SamplerState) -> Result<SamplerIndex>;

    /// Free a sampler state
    fn unregister_sampler(&mut self, index: SamplerIndex) -> Result<()>;

    /// Store a sampler8x8 state
    fn register_sampler_8x8(&mut self, state: Sampler8x8State) -> Result<Sampler8x8Index>;

    /// Free a sampler8x8 state
    fn unregister_sampler_8x8(&mut self, index: Sampler8x8Index) -> Result<()>;

    /// Register a buffer
    fn allocate_buffer(&mut self, params: &BufferParams) -> Result<BufferHandle>;

    /// Register a 2D surface
    fn allocate_surface_2d(&mut self, params: &Surface2DParams) -> Result<Surface2DHandle>;

    /// Register a 2D surface over user memory
    fn allocate_surface_2d_up(
        &mut self,
        width: u32,
        height: u32,
        format: SurfaceFormat,
        data: Vec<u8>,
    ) -> Result<Surface2DUpHandle>;

    /// Register a 3D surface
    fn allocate_surface_3d(&mut self, params: &Surface3DParams) -> Result<Surface3DHandle>;

    /// Drop a buffer or surface
    fn free_surface(&mut self, handle: SurfaceHandle) -> Result<()>;

    /// Map a buffer or surface for host access
    fn lock_surface(&mut self, handle: SurfaceHandle, flags: LockFlags) -> Result<()>;

    /// Drop host access
    fn unlock_surface(&mut self, handle: SurfaceHandle) -> Result<()>;

    /// Copy host bytes into a buffer or surface
    fn write_surface(&mut self, handle: SurfaceHandle, offset: usize, data: &[u8]) -> Result<()>;

    /// Copy buffer or surface bytes to the host
    fn read_surface(&mut self, handle: SurfaceHandle, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Add an alias view
    fn create_alias(&mut self, handle: SurfaceHandle) -> Result<u8>;

    /// Override the surface state of a view
    fn set_surface_state(&mut self, handle: SurfaceHandle, alias: u8, params: SurfaceStateParams) -> Result<()>;

    /// Set a surface's cache control
    fn set_surface_mocs(&mut self, handle: SurfaceHandle, mocs: u8) -> Result<()>;

    /// Update a capability
    fn set_caps(&mut self, caps: CapsParam) -> Result<()>;

    /// Slice/sub-slice/EU configuration programmed with slice shutdown
    fn set_power_option(&mut self, option: PowerOption) -> Result<()>;

    /// Bind a buffer as a kernel's state buffer
    fn bind_state_buffer(
        &mut self,
        kernel_ptr: u64,
        buffer: BufferHandle,
        kind: StateBufferType,
        media_state: u64,
    ) -> Result<()>;

    /// Remove a kernel's state buffer
    fn unbind_state_buffer(&mut self, kernel_ptr: u64) -> Result<()>;

    /// Drop a kernel from the binary cache
    fn unload_kernel(&mut self, id: KernelId) -> Result<()>;
}

// =============================================================================
// DEVICE STATE
// =============================================================================

/// One device
pub struct CmHalState<O: OsInterface> {
    pub(crate) os: O,
    pub(crate) platform: PlatformInfo,
    pub(crate) options: DeviceOptions,
    pub(crate) features: UserFeatures,
    pub(crate) profile: Box<dyn HardwareProfile>,
    pub(crate) render_context: GpuContext,
    pub(crate) tasks: TaskTable,
    pub(crate) resources: ResourceRegistry,
    pub(crate) kernels: KernelCache,
    pub(crate) heap: StateHeap,
    pub(crate) sync: SyncEngine,
    pub(crate) batches: BatchBufferPool,
    pub(crate) vebox_params: Option<OsResource>,
    pub(crate) scratch: Option<OsResource>,
    pub(crate) sip: Option<OsResource>,
    pub(crate) csr: Option<OsResource>,
    pub(crate) l3: L3Config,
    pub(crate) power: PowerOption,
    pub(crate) api_max_threads: u32,
}

impl<O: OsInterface> core::fmt::Debug for CmHalState<O> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CmHalState")
            .field("platform", &self.platform.platform)
            .field("tasks", &self.tasks.occupied())
            .field("heap", &self.heap.mode())
            .finish_non_exhaustive()
    }
}

impl<O: OsInterface> CmHalState<O> {
    /// Create a device over `os`
    ///
    /// Creates the render (and, when available, vebox) GPU context and
    /// allocates heaps, timestamp resources and the batch-buffer pool.
    pub fn create(
        mut os: O,
        platform: PlatformInfo,
        options: DeviceOptions,
        features: UserFeatures,
    ) -> Result<Self> {
        options.validate()?;
        let profile = profile_for(platform.platform);

        let render_context = if options.request_custom_gpu_context {
            GpuContext::Render3
        } else {
            GpuContext::Render
        };
        let vebox = !options.disable_vebox && platform.sku.contains(SkuFlags::VEBOX);
        os.create_gpu_context(render_context)?;
        if vebox {
            os.create_gpu_context(GpuContext::Vebox)?;
        }
        os.set_gpu_context(render_context)?;

        let heap = StateHeap::create(&mut os, &options)?;
        let sync = match SyncEngine::create(&mut os, options.max_task_number, vebox) {
            Ok(sync) => sync,
            Err(e) => {
                heap.destroy(&mut os);
                return Err(e);
            }
        };
        let batches = match BatchBufferPool::create(&mut os, BATCH_BUFFER_COUNT, BATCH_BUFFER_SIZE) {
            Ok(pool) => pool,
            Err(e) => {
                sync.destroy(&mut os);
                heap.destroy(&mut os);
                return Err(e);
            }
        };

        let mut state = Self {
            kernels: KernelCache::new(heap.kernel_region_size()),
            l3: profile.suggested_l3_configs().first().copied().unwrap_or_default(),
            os,
            platform,
            options,
            features,
            profile,
            render_context,
            tasks: TaskTable::new(options.max_task_number),
            resources: ResourceRegistry::new(),
            heap,
            sync,
            batches,
            vebox_params: None,
            scratch: None,
            sip: None,
            csr: None,
            power: PowerOption::default(),
            api_max_threads: 0,
        };

        // Dropping `state` on failure releases what was allocated so far
        if vebox {
            state.vebox_params = Some(
                state
                    .os
                    .allocate_resource(&ResourceDesc::new(VEBOX_PARAM_SIZE, "CmVeboxParam"))?,
            );
        }
        if options.enable_kernel_debug {
            state.sip = Some(state.os.allocate_resource(&ResourceDesc::new(SIP_SIZE, "CmSip"))?);
        }
        if platform.sku.contains(SkuFlags::GPGPU_MID_THREAD_PREEMPT) && !options.disable_mid_thread_preemption {
            let threads = state.profile.hw_max_threads(&platform.gt) as usize;
            state.csr = Some(
                state
                    .os
                    .allocate_resource(&ResourceDesc::new(threads * CSR_SIZE_PER_THREAD, "CmCsr"))?,
            );
        }

        log::info!(
            "cm-hal: {:?} device, {} task slots, {:?} heaps, vebox {}",
            platform.platform,
            options.max_task_number,
            state.heap.mode(),
            if vebox { "on" } else { "off" }
        );
        Ok(state)
    }

    /// OS interface
    pub fn os(&self) -> &O {
        &self.os
    }

    /// Mutable OS interface
    pub fn os_mut(&mut self) -> &mut O {
        &mut self.os
    }

    /// Platform the device was created for
    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    /// Creation options
    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Generation profile
    pub fn profile(&self) -> &dyn HardwareProfile {
        &*self.profile
    }

    /// Task slots
    pub fn task_table(&self) -> &TaskTable {
        &self.tasks
    }

    /// Resource tables
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Kernel binary cache
    pub fn kernel_cache(&self) -> &KernelCache {
        &self.kernels
    }

    /// State heaps
    pub fn heap(&self) -> &StateHeap {
        &self.heap
    }

    /// Timestamps and tags
    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    /// Media-object batch buffers
    pub fn batch_pool(&self) -> &BatchBufferPool {
        &self.batches
    }

    /// L3 partition programmed with each task
    pub fn l3_config(&self) -> L3Config {
        self.l3
    }

    /// Free a slot whose task is done and drop its references
    fn retire(&mut self, id: TaskId) {
        if let Some(record) = self.tasks.complete(id) {
            for serial in record.cache_pins {
                self.kernels.unpin(serial);
            }
            if let Some(index) = record.batch {
                self.batches.release(index);
            }
        }
    }
}

impl<O: OsInterface> Drop for CmHalState<O> {
    fn drop(&mut self) {
        self.resources.free_all(&mut self.os);
        self.batches.destroy(&mut self.os);
        self.sync.destroy(&mut self.os);
        self.heap.destroy(&mut self.os);
        for res in [self.vebox_params, self.scratch, self.sip, self.csr]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.os.free_resource(res) {
                log::warn!("cm-hal: failed to free {}: {}", res, e);
            }
        }
        log::debug!("cm-hal: device destroyed");
    }
}

// =============================================================================
// ENTRY POINTS
// =============================================================================

impl<O: OsInterface> CmHal for CmHalState<O> {
    fn execute_task(&mut self, task: &TaskParam) -> Result<TaskId> {
        self.submit_task(task)
    }

    fn execute_group_task(&mut self, task: &TaskParam) -> Result<TaskId> {
        if task.group_space.is_none() {
            return Err(Error::InvalidParameter);
        }
        self.submit_task(task)
    }

    fn execute_hints_task(&mut self, task: &TaskParam, hints: u32) -> Result<TaskId> {
        let hints = Hints::from_bits(hints);
        let mut task = task.clone();
        task.sync_bitmap |= hints.group_boundaries(task.kernels.len());
        if hints.media_object {
            let counts: Vec<u32> = (0..task.kernels.len())
                .map(|i| task.kernel_thread_space(i).map_or(1, |ts| ts.thread_count()))
                .collect();
            for (kernel, count) in task.kernels.iter_mut().zip(counts) {
                kernel.thread_count = count;
                kernel.thread_space = None;
            }
            task.thread_space = None;
        }
        log::debug!(
            "cm-hal: hints task, {} groups, sync {:#x}",
            hints.num_tasks,
            task.sync_bitmap
        );
        self.submit_task(&task)
    }

    fn execute_vebox_task(&mut self, param: &VeboxParam) -> Result<TaskId> {
        self.submit_vebox_task(param)
    }

    fn query_task(&mut self, id: TaskId) -> Result<TaskReport> {
        let record = self.tasks.get(id)?;
        if record.reset {
            self.retire(id);
            return Ok(TaskReport::status_only(TaskStatus::Reset));
        }
        let (engine, cpu_submit_time, gpu_submit_time) =
            (record.engine, record.cpu_submit_time, record.gpu_submit_time);
        let slot = self.sync.read_slot(&self.os, engine, id)?;
        if slot.begin == INVALID_TIMESTAMP {
            return Ok(TaskReport::status_only(TaskStatus::Queued));
        }
        if slot.end == INVALID_TIMESTAMP {
            return Ok(TaskReport::status_only(TaskStatus::InProgress));
        }

        let duration_ticks = slot.end.saturating_sub(slot.begin);
        self.retire(id);
        Ok(TaskReport {
            status: TaskStatus::Finished,
            duration_ticks,
            duration_ns: self.profile.ticks_to_ns(duration_ticks),
            start_ticks: slot.begin,
            end_ticks: slot.end,
            cpu_submit_time,
            gpu_submit_time,
        })
    }

    fn reset_task(&mut self, id: TaskId) -> Result<()> {
        self.tasks.reset(id)
    }

    fn reset_all(&mut self) {
        log::info!("cm-hal: resetting {} tasks", self.tasks.occupied());
        self.tasks.reset_all();
    }

    fn register_sampler(&mut self, state: SamplerState) -> Result<SamplerIndex> {
        self.resources.register_sampler(state)
    }

    fn unregister_sampler(&mut self, index: SamplerIndex) -> Result<()> {
        self.resources.unregister_sampler(index)
    }

    fn register_sampler_8x8(&mut self, state: Sampler8x8State) -> Result<Sampler8x8Index> {
        self.resources.register_sampler_8x8(state)
    }

    fn unregister_sampler_8x8(&mut self, index: Sampler8x8Index) -> Result<()> {
        self.resources.unregister_sampler_8x8(index)
    }

    fn allocate_buffer(&mut self, params: &BufferParams) -> Result<BufferHandle> {
        self.resources.allocate_buffer(&mut self.os, params)
    }

    fn allocate_surface_2d(&mut self, params: &Surface2DParams) -> Result<Surface2DHandle> {
        self.resources.allocate_surface_2d(&mut self.os, params)
    }

    fn allocate_surface_2d_up(
        &mut self,
        width: u32,
        height: u32,
        format: SurfaceFormat,
        data: Vec<u8>,
    ) -> Result<Surface2DUpHandle> {
        self.resources
            .allocate_surface_2d_up(&mut self.os, width, height, format, data)
    }

    fn allocate_surface_3d(&mut self, params: &Surface3DParams) -> Result<Surface3DHandle> {
        self.resources.allocate_surface_3d(&mut self.os, params)
    }

    fn free_surface(&mut self, handle: SurfaceHandle) -> Result<()> {
        self.resources.free(&mut self.os, handle)
    }

    fn lock_surface(&mut self, handle: SurfaceHandle, flags: LockFlags) -> Result<()> {
        self.resources.lock(&mut self.os, handle, flags)
    }

    fn unlock_surface(&mut self, handle: SurfaceHandle) -> Result<()> {
        self.resources.unlock(&mut self.os, handle)
    }

    fn write_surface(&mut self, handle: SurfaceHandle, offset: usize, data: &[u8]) -> Result<()> {
        self.resources.write(&mut self.os, handle, offset, data)
    }

    fn read_surface(&mut self, handle: SurfaceHandle, offset: usize, out: &mut [u8]) -> Result<()> {
        self.resources.read(&mut self.os, handle, offset, out)
    }

    fn create_alias(&mut self, handle: SurfaceHandle) -> Result<u8> {
        self.resources.create_alias(handle)
    }

    fn set_surface_state(&mut self, handle: SurfaceHandle, alias: u8, params: SurfaceStateParams) -> Result<()> {
        self.resources.set_surface_state(handle, alias, params)
    }

    fn set_surface_mocs(&mut self, handle: SurfaceHandle, mocs: u8) -> Result<()> {
        self.profile.mocs_policy_check(handle.kind(), mocs)?;
        self.resources.set_mocs(handle, mocs)
    }

    fn set_caps(&mut self, caps: CapsParam) -> Result<()> {
        match caps {
            CapsParam::MaxHwThreads(threads) => {
                let max = self.profile.hw_max_threads(&self.platform.gt);
                if threads == 0 || threads > max {
                    log::warn!("cm-hal: rejected {} threads, max {}", threads, max);
                    return Err(Error::InvalidParameter);
                }
                self.api_max_threads = threads;
            }
            CapsParam::L3Config(index) => {
                self.l3 = self.profile.set_suggested_l3_conf(index)?;
                log::info!("cm-hal: L3 config {} selected", index);
            }
        }
        Ok(())
    }

    fn set_power_option(&mut self, option: PowerOption) -> Result<()> {
        option.validate(&self.platform.gt)?;
        if !self.options.request_slice_shutdown {
            log::debug!("cm-hal: power option stored, slice shutdown not requested");
        }
        self.power = option;
        Ok(())
    }

    fn bind_state_buffer(
        &mut self,
        kernel_ptr: u64,
        buffer: BufferHandle,
        kind: StateBufferType,
        media_state: u64,
    ) -> Result<()> {
        let entry = self.resources.buffer(buffer)?;
        let binding = StateBufferBinding {
            resource: entry.resource,
            size: entry.size,
            kind,
            va: self.os.gfx_address(entry.resource)?,
            media_state,
        };
        self.sync.bind_state_buffer(kernel_ptr, binding)
    }

    fn unbind_state_buffer(&mut self, kernel_ptr: u64) -> Result<()> {
        self.sync.unbind_state_buffer(kernel_ptr).map(drop)
    }

    fn unload_kernel(&mut self, id: KernelId) -> Result<()> {
        self.kernels.unregister(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use cm_cmd::{decode, CompareOp, DecodedCommand, MediaVfeState, Opcode, PipeControl, PipeControlFlags, PostSync};
    use cm_core::Platform;
    use cm_os::{SimGpu, SimOs};

    use crate::gen::{PreemptionMode, CS_CHICKEN1_REGISTER};
    use crate::params::{ArgValue, ConditionalEndParam, KernelParam, ThreadGroupSpace, ThreadSpace};

    fn device_on(platform: Platform, options: DeviceOptions) -> (CmHalState<SimOs>, SimGpu) {
        let os = SimOs::new();
        let gpu = os.gpu();
        let hal = CmHalState::create(
            os,
            PlatformInfo::for_platform(platform),
            options,
            UserFeatures::default(),
        )
        .unwrap();
        (hal, gpu)
    }

    fn device() -> (CmHalState<SimOs>, SimGpu) {
        device_on(Platform::Gen9, DeviceOptions::default())
    }

    fn kernel(id: u64) -> KernelParam {
        KernelParam::new(KernelId::new(id), vec![0xAB; 256])
    }

    fn walker_task(kernels: Vec<KernelParam>) -> TaskParam {
        TaskParam {
            thread_space: Some(ThreadSpace::new(4, 4)),
            ..TaskParam::new(kernels)
        }
    }

    fn commands(gpu: &SimGpu) -> Vec<DecodedCommand> {
        decode(&gpu.last_submission().unwrap()).unwrap()
    }

    fn count(cmds: &[DecodedCommand], opcode: Opcode) -> usize {
        cmds.iter().filter(|c| c.opcode == opcode).count()
    }

    /// Pipe controls between the first and second dispatch
    fn barriers_between_dispatches(cmds: &[DecodedCommand], first: usize) -> usize {
        let dispatches: Vec<usize> = cmds
            .iter()
            .enumerate()
            .filter(|(_, c)| c.opcode.is_dispatch())
            .map(|(i, _)| i)
            .collect();
        cmds[dispatches[first] + 1..dispatches[first + 1]]
            .iter()
            .filter(|c| c.opcode == Opcode::PipeControl)
            .count()
    }

    #[test]
    fn test_basic_task() {
        let (mut hal, gpu) = device();
        let id = hal.execute_task(&walker_task(vec![kernel(1)])).unwrap();
        assert_eq!(id.index(), 0);

        let cmds = commands(&gpu);
        assert_eq!(count(&cmds, Opcode::MediaObjectWalker), 1);
        assert_eq!(cmds.last().unwrap().opcode, Opcode::BatchBufferEnd);

        assert_eq!(hal.query_task(id).unwrap().status, TaskStatus::Queued);
        gpu.step(1);
        assert_eq!(hal.query_task(id).unwrap().status, TaskStatus::InProgress);
        gpu.run();
        let report = hal.query_task(id).unwrap();
        assert_eq!(report.status, TaskStatus::Finished);
        assert!(report.end_ticks > report.start_ticks);
        assert_eq!(report.duration_ticks, report.end_ticks - report.start_ticks);
        assert_eq!(gpu.dispatch_count(), 1);

        // the slot is free once Finished has been observed
        assert_eq!(hal.query_task(id), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_dependent_pair_gets_one_barrier() {
        let (mut hal, gpu) = device();
        let mut task = walker_task(vec![kernel(1), kernel(2)]);
        hal.execute_task(&task).unwrap();
        assert_eq!(barriers_between_dispatches(&commands(&gpu), 0), 0);

        task.sync_bitmap = 0b1;
        hal.execute_task(&task).unwrap();
        let cmds = commands(&gpu);
        assert_eq!(barriers_between_dispatches(&cmds, 0), 1);
        let between = cmds
            .iter()
            .skip_while(|c| c.opcode != Opcode::MediaObjectWalker)
            .find(|c| c.opcode == Opcode::PipeControl)
            .unwrap();
        let pc = PipeControl::parse(&between.dwords).unwrap();
        assert!(pc.flags.contains(PipeControlFlags::TEXTURE_CACHE_INVALIDATE));
    }

    #[test]
    fn test_dependency_pattern_implies_barrier() {
        let (mut hal, gpu) = device();
        let mut second = kernel(2);
        second.thread_space =
            Some(ThreadSpace::new(4, 4).with_dependency(crate::params::DependencyPattern::Wavefront45));
        hal.execute_task(&walker_task(vec![kernel(1), second])).unwrap();
        assert_eq!(barriers_between_dispatches(&commands(&gpu), 0), 1);
    }

    #[test]
    fn test_slot_exhaustion_and_reuse() {
        let options = DeviceOptions {
            max_task_number: 2,
            ..DeviceOptions::default()
        };
        let (mut hal, gpu) = device_on(Platform::Gen9, options);
        let task = walker_task(vec![kernel(1)]);
        let first = hal.execute_task(&task).unwrap();
        let second = hal.execute_task(&task).unwrap();
        assert_ne!(first, second);
        assert_eq!(hal.execute_task(&task), Err(Error::ResourceExhausted));

        gpu.run();
        assert_eq!(hal.query_task(first).unwrap().status, TaskStatus::Finished);
        assert_eq!(hal.execute_task(&task).unwrap(), first);
    }

    #[test]
    fn test_overflow_rolls_back() {
        let (mut hal, gpu) = device();
        gpu.set_command_buffer_size(64);
        let result = hal.execute_task(&walker_task(vec![kernel(1)]));
        assert!(matches!(result, Err(Error::BufferOverflow { .. })));

        assert_eq!(hal.task_table().occupied(), 0);
        assert!(hal.kernel_cache().entries().iter().all(|e| e.in_flight == 0));
        assert_eq!(gpu.submission_count(), 0);
        let cb = hal.os_mut().get_command_buffer().unwrap();
        assert_eq!(cb.offset(), 0);
        assert_eq!(cb.remaining(), 64);
        hal.os_mut().return_command_buffer(cb);
    }

    #[test]
    fn test_failed_submit_rolls_back() {
        let (mut hal, gpu) = device();
        gpu.fail_next_submit();
        let task = walker_task(vec![kernel(1)]);
        assert_eq!(hal.execute_task(&task), Err(Error::OsFailure));
        assert_eq!(hal.task_table().occupied(), 0);

        let cb = hal.os_mut().get_command_buffer().unwrap();
        assert_eq!(cb.offset(), 0);
        hal.os_mut().return_command_buffer(cb);

        let id = hal.execute_task(&task).unwrap();
        gpu.run();
        assert_eq!(hal.query_task(id).unwrap().status, TaskStatus::Finished);
    }

    #[test]
    fn test_media_object_batch_shared() {
        let (mut hal, gpu) = device();
        let mut k = kernel(7);
        k.thread_count = 4;
        let task = TaskParam::new(vec![k]);

        let a = hal.execute_task(&task).unwrap();
        let b = hal.execute_task(&task).unwrap();
        let stats = hal.batch_pool().stats();
        assert_eq!((stats.builds, stats.shared, stats.reuses), (1, 1, 1));
        assert_eq!(count(&commands(&gpu), Opcode::BatchBufferStart), 1);

        gpu.run();
        assert_eq!(gpu.dispatch_count(), 8);
        assert_eq!(hal.query_task(a).unwrap().status, TaskStatus::Finished);
        assert_eq!(hal.query_task(b).unwrap().status, TaskStatus::Finished);
        assert!(hal.batch_pool().get(0).unwrap().is_idle());
    }

    #[test]
    fn test_media_object_batch_not_shared_across_geometry() {
        let (mut hal, gpu) = device();
        let mut small = kernel(7);
        small.thread_count = 4;
        let mut large = kernel(7);
        large.thread_count = 16;

        let a = hal.execute_task(&TaskParam::new(vec![small])).unwrap();
        let b = hal.execute_task(&TaskParam::new(vec![large])).unwrap();
        let stats = hal.batch_pool().stats();
        assert_eq!((stats.builds, stats.shared, stats.reuses), (2, 0, 0));

        gpu.run();
        assert_eq!(gpu.dispatch_count(), 20);
        assert_eq!(hal.query_task(a).unwrap().status, TaskStatus::Finished);
        assert_eq!(hal.query_task(b).unwrap().status, TaskStatus::Finished);
    }

    #[test]
    fn test_conditional_end_stops_early() {
        let (mut hal, gpu) = device();
        let flag = hal.allocate_buffer(&BufferParams::new(8)).unwrap();
        let mut task = walker_task(vec![kernel(1), kernel(2)]);
        task.conditional_end_bitmap = 0b10;
        task.conditional_ends = vec![ConditionalEndParam {
            buffer: flag,
            offset: 0,
            compare_value: 0,
            mask: false,
            op: CompareOp::GreaterThan,
        }];
        let id = hal.execute_task(&task).unwrap();
        assert_eq!(count(&commands(&gpu), Opcode::ConditionalBatchBufferEnd), 1);

        gpu.run();
        assert_eq!(gpu.dispatch_count(), 1);
        assert_eq!(hal.query_task(id).unwrap().status, TaskStatus::Finished);
    }

    #[test]
    fn test_conditional_end_passes() {
        let (mut hal, gpu) = device();
        let flag = hal.allocate_buffer(&BufferParams::new(8)).unwrap();
        hal.write_surface(SurfaceHandle::Buffer(flag), 0, &5u32.to_le_bytes())
            .unwrap();
        let mut task = walker_task(vec![kernel(1), kernel(2)]);
        task.conditional_end_bitmap = 0b10;
        task.conditional_ends = vec![ConditionalEndParam {
            buffer: flag,
            offset: 0,
            compare_value: 0,
            mask: false,
            op: CompareOp::GreaterThan,
        }];
        hal.execute_task(&task).unwrap();
        gpu.run();
        assert_eq!(gpu.dispatch_count(), 2);
    }

    #[test]
    fn test_second_task_hits_kernel_cache() {
        let (mut hal, gpu) = device();
        let mut clone = kernel(2);
        clone.clone_of = Some(KernelId::new(1));
        let task = walker_task(vec![kernel(1), clone]);

        let a = hal.execute_task(&task).unwrap();
        assert_eq!(hal.kernel_cache().stats().misses, 2);
        hal.execute_task(&task).unwrap();
        assert_eq!(hal.kernel_cache().stats().hits, 2);

        // only a cache miss reloads kernel state with a bare icache invalidate
        let reload = PipeControlFlags::INSTRUCTION_CACHE_INVALIDATE | PipeControlFlags::CS_STALL;
        let icache = |cmds: &[DecodedCommand]| {
            cmds.iter()
                .filter_map(|c| (c.opcode == Opcode::PipeControl).then(|| PipeControl::parse(&c.dwords)).flatten())
                .any(|pc| pc.flags == reload && pc.post_sync == PostSync::None)
        };
        assert!(icache(&decode(&gpu.submission(0).unwrap()).unwrap()));
        assert!(!icache(&commands(&gpu)));

        gpu.run();
        hal.query_task(a).unwrap();
        assert!(hal.kernel_cache().validate().is_ok());
    }

    #[test]
    fn test_same_buffer_twice_shares_binding_index() {
        let (mut hal, gpu) = device();
        let buffer = hal.allocate_buffer(&BufferParams::new(256)).unwrap();
        let value = ArgValue::Buffer { handle: buffer, alias: 0 };
        let k = kernel(1).arg(0, value.clone()).arg(4, value);
        hal.execute_task(&walker_task(vec![k])).unwrap();

        let heap = gpu.resource_bytes(hal.heap().media_heap()).unwrap();
        let at = hal.heap().media_block_offset(0) as usize;
        let first = u32::from_le_bytes(heap[at..at + 4].try_into().unwrap());
        let second = u32::from_le_bytes(heap[at + 4..at + 8].try_into().unwrap());
        assert_eq!(first, second);
        assert_eq!(first, 1);
    }

    #[test]
    fn test_curbe_state_buffer_replaces_payload() {
        let (mut hal, gpu) = device();
        let buffer = hal.allocate_buffer(&BufferParams::new(64)).unwrap();
        hal.write_surface(SurfaceHandle::Buffer(buffer), 0, &[0x5A; 64]).unwrap();
        let k = kernel(3).arg(0, ArgValue::Implicit(0x1234));
        hal.bind_state_buffer(k.kernel_ptr, buffer, StateBufferType::Curbe, 0)
            .unwrap();
        hal.execute_task(&walker_task(vec![k.clone()])).unwrap();

        let heap = gpu.resource_bytes(hal.heap().media_heap()).unwrap();
        let at = hal.heap().media_block_offset(0) as usize;
        assert_eq!(&heap[at..at + 64], &[0x5A; 64]);

        hal.unbind_state_buffer(k.kernel_ptr).unwrap();
        assert_eq!(hal.unbind_state_buffer(k.kernel_ptr), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_api_max_threads_applies_once() {
        let (mut hal, gpu) = device();
        let task = walker_task(vec![kernel(1)]);
        let vfe_threads = |gpu: &SimGpu| {
            let cmds = commands(gpu);
            let vfe = cmds.iter().find(|c| c.opcode == Opcode::MediaVfeState).unwrap();
            MediaVfeState::parse_max_threads(&vfe.dwords).unwrap()
        };

        hal.set_caps(CapsParam::MaxHwThreads(32)).unwrap();
        hal.execute_task(&task).unwrap();
        assert_eq!(vfe_threads(&gpu), 32);
        hal.execute_task(&task).unwrap();
        assert_eq!(vfe_threads(&gpu), 168);

        assert_eq!(hal.set_caps(CapsParam::MaxHwThreads(0)), Err(Error::InvalidParameter));
        assert_eq!(hal.set_caps(CapsParam::L3Config(99)), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_hints_split_groups() {
        let (mut hal, gpu) = device();
        let task = walker_task(vec![kernel(1), kernel(2), kernel(3), kernel(4)]);
        // two enqueue groups: barrier only between kernels 1 and 2
        hal.execute_hints_task(&task, 0x20).unwrap();
        let cmds = commands(&gpu);
        assert_eq!(barriers_between_dispatches(&cmds, 0), 0);
        assert_eq!(barriers_between_dispatches(&cmds, 1), 1);
        assert_eq!(barriers_between_dispatches(&cmds, 2), 0);
    }

    #[test]
    fn test_hints_media_object() {
        let (mut hal, gpu) = device();
        hal.execute_hints_task(&walker_task(vec![kernel(1)]), 0x1).unwrap();
        assert_eq!(count(&commands(&gpu), Opcode::MediaObjectWalker), 0);
        gpu.run();
        assert_eq!(gpu.dispatch_count(), 16);
    }

    #[test]
    fn test_group_task_with_mid_thread_preemption() {
        let (mut hal, gpu) = device_on(Platform::Gen11, DeviceOptions::default());
        let task = TaskParam {
            group_space: Some(ThreadGroupSpace::new_2d(4, 4, 2, 2)),
            ..TaskParam::new(vec![kernel(1)])
        };
        assert_eq!(
            hal.execute_group_task(&TaskParam::new(vec![kernel(1)])),
            Err(Error::InvalidParameter)
        );
        let id = hal.execute_group_task(&task).unwrap();
        let cmds = commands(&gpu);
        assert_eq!(count(&cmds, Opcode::GpgpuWalker), 1);
        assert_eq!(count(&cmds, Opcode::StateSip), 1);
        assert_eq!(count(&cmds, Opcode::CsrBaseAddress), 1);

        gpu.run();
        assert_eq!(
            gpu.register(CS_CHICKEN1_REGISTER),
            Some(PreemptionMode::MidThread.register_value())
        );
        assert_eq!(hal.query_task(id).unwrap().status, TaskStatus::Finished);
    }

    #[test]
    fn test_media_task_without_csr() {
        let options = DeviceOptions {
            disable_mid_thread_preemption: true,
            ..DeviceOptions::default()
        };
        let (mut hal, gpu) = device_on(Platform::Gen11, options);
        let task = TaskParam {
            group_space: Some(ThreadGroupSpace::new_2d(4, 4, 2, 2)),
            ..TaskParam::new(vec![kernel(1)])
        };
        hal.execute_group_task(&task).unwrap();
        assert_eq!(count(&commands(&gpu), Opcode::StateSip), 0);
        gpu.run();
        assert_eq!(
            gpu.register(CS_CHICKEN1_REGISTER),
            Some(PreemptionMode::ThreadGroup.register_value())
        );
    }

    #[test]
    fn test_reset_task() {
        let (mut hal, _gpu) = device();
        let id = hal.execute_task(&walker_task(vec![kernel(1)])).unwrap();
        hal.reset_task(id).unwrap();
        assert_eq!(hal.query_task(id).unwrap().status, TaskStatus::Reset);
        assert_eq!(hal.task_table().occupied(), 0);
        assert!(hal.kernel_cache().entries().iter().all(|e| e.in_flight == 0));
    }

    #[test]
    fn test_vebox_task() {
        let (mut hal, gpu) = device();
        let params = Surface2DParams::new(64, 16, SurfaceFormat::Nv12);
        let input = hal.allocate_surface_2d(&params).unwrap();
        let output = hal.allocate_surface_2d(&params).unwrap();
        let stmm = hal
            .allocate_surface_2d(&Surface2DParams::new(64, 16, SurfaceFormat::A8R8G8B8))
            .unwrap();
        let mut param = VeboxParam::new(input, output).with_surface(crate::vebox::STMM_INPUT, stmm);
        param.settings.dn = true;
        param.settings.dndi_first_frame = true;

        let id = hal.execute_vebox_task(&param).unwrap();
        assert_eq!(gpu.barriers(), vec![(GpuContext::Render, GpuContext::Vebox)]);
        assert_eq!(gpu.submission_context(0), Some(GpuContext::Vebox));
        assert_eq!(hal.os().gpu_context(), GpuContext::Render);

        let cmds = decode(&gpu.submission(0).unwrap()).unwrap();
        assert_eq!(count(&cmds, Opcode::VeboxState), 1);
        assert_eq!(count(&cmds, Opcode::VeboxSurfaceState), 2);
        assert_eq!(count(&cmds, Opcode::VeboxDiIecp), 1);
        assert_eq!(count(&cmds, Opcode::FlushDw), 2);

        let stmm_bytes = gpu
            .resource_bytes(hal.resources().surface_2d(stmm).unwrap().resource)
            .unwrap();
        assert_eq!(&stmm_bytes[..4], &[0xFF, 0xFF, 0, 0]);

        assert_eq!(hal.query_task(id).unwrap().status, TaskStatus::Queued);
        gpu.run();
        assert_eq!(hal.query_task(id).unwrap().status, TaskStatus::Finished);
    }

    #[test]
    fn test_vebox_without_slot_leaves_history_alone() {
        let options = DeviceOptions {
            max_task_number: 1,
            ..DeviceOptions::default()
        };
        let (mut hal, gpu) = device_on(Platform::Gen9, options);
        let params = Surface2DParams::new(64, 16, SurfaceFormat::Nv12);
        let input = hal.allocate_surface_2d(&params).unwrap();
        let output = hal.allocate_surface_2d(&params).unwrap();
        let stmm = hal
            .allocate_surface_2d(&Surface2DParams::new(64, 16, SurfaceFormat::A8R8G8B8))
            .unwrap();
        let mut param = VeboxParam::new(input, output).with_surface(crate::vebox::STMM_INPUT, stmm);
        param.settings.dn = true;
        param.settings.dndi_first_frame = true;

        hal.execute_task(&walker_task(vec![kernel(1)])).unwrap();
        assert_eq!(hal.execute_vebox_task(&param), Err(Error::ResourceExhausted));
        let stmm_bytes = gpu
            .resource_bytes(hal.resources().surface_2d(stmm).unwrap().resource)
            .unwrap();
        assert!(stmm_bytes.iter().all(|&b| b == 0));
        assert_eq!(gpu.submission_count(), 1);
    }

    #[test]
    fn test_vebox_disabled() {
        let options = DeviceOptions {
            disable_vebox: true,
            ..DeviceOptions::default()
        };
        let (mut hal, _gpu) = device_on(Platform::Gen9, options);
        let input = hal
            .allocate_surface_2d(&Surface2DParams::new(64, 16, SurfaceFormat::Nv12))
            .unwrap();
        assert_eq!(
            hal.execute_vebox_task(&VeboxParam::new(input, input)),
            Err(Error::Unimplemented)
        );
    }

    #[test]
    fn test_drop_frees_everything() {
        let (mut hal, gpu) = device();
        hal.allocate_buffer(&BufferParams::new(64)).unwrap();
        hal.allocate_surface_2d(&Surface2DParams::new(16, 16, SurfaceFormat::A8R8G8B8))
            .unwrap();
        assert!(gpu.live_resources() > 0);
        drop(hal);
        assert_eq!(gpu.live_resources(), 0);
    }

    #[test]
    fn test_settings_validation() {
        let (mut hal, _gpu) = device();
        let buffer = hal.allocate_buffer(&BufferParams::new(64)).unwrap();
        assert_eq!(hal.set_surface_mocs(SurfaceHandle::Buffer(buffer), 200), Err(Error::InvalidParameter));
        hal.set_surface_mocs(SurfaceHandle::Buffer(buffer), 2).unwrap();
        assert_eq!(hal.resources().buffer(buffer).unwrap().mocs, 2);

        let too_many = PowerOption {
            slice_count: 4,
            ..PowerOption::default()
        };
        assert_eq!(hal.set_power_option(too_many), Err(Error::InvalidParameter));
        hal.set_caps(CapsParam::L3Config(1)).unwrap();
        assert_eq!(hal.l3_config(), hal.profile().suggested_l3_configs()[1]);
    }
}
