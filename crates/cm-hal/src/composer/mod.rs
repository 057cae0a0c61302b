//! # Command Composer
//!
//! Turns a [`TaskParam`] into one command-buffer submission.
//!
//! ## Sequence
//!
//! ```text
//! PIPE_CONTROL (begin timestamp)
//! MI_LOAD_REGISTER_IMM (L3, preemption, debug, power)
//! PIPELINE_SELECT
//! STATE_BASE_ADDRESS
//! [PIPE_CONTROL + STATE_SIP + GPGPU_CSR_BASE_ADDRESS]   GPGPU only
//! MEDIA_VFE_STATE
//! MEDIA_CURBE_LOAD
//! MEDIA_INTERFACE_DESCRIPTOR_LOAD
//! [PIPE_CONTROL (instruction cache invalidate)]
//! for each kernel:
//!     [sync tag, barrier, end timestamp, MI_CONDITIONAL_BATCH_BUFFER_END]
//!     [PIPE_CONTROL barrier]
//!     MEDIA_OBJECT_WALKER | GPGPU_WALKER | MI_BATCH_BUFFER_START
//! PIPE_CONTROL (flush)
//! MI_STORE_DATA_IMM (sync tag, tracker)
//! PIPE_CONTROL (end timestamp)
//! PIPE_CONTROL (media state clear)
//! MI_BATCH_BUFFER_END
//! ```
//!
//! Everything that can fail without touching the command buffer (kernel
//! residency, binding, heap writes, batch buffers) runs first. The command
//! buffer is then filled under a [`CommandBufferScope`], which rewinds it if
//! any later step fails.

pub mod batch;
pub mod walker;

use alloc::vec;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use cm_cmd::{
    GpgpuCsrBaseAddress, GpgpuWalker, GpuPipeline, MediaCurbeLoad, MediaInterfaceDescriptorLoad,
    MediaObjectWalker, MediaVfeState, MiBatchBufferEnd, MiBatchBufferStart,
    MiConditionalBatchBufferEnd, MiLoadRegisterImm, PipeControl, PipeControlFlags, PipelineSelect,
    StateSip,
};
use cm_core::consts::MAX_KERNELS_PER_TASK;
use cm_core::{Error, GpuAddr, Result, TaskId, WaFlags};
use cm_os::{CommandBufferScope, OsInterface, ResourceDesc};

use crate::device::CmHalState;
use crate::gen::{
    PreemptionMode, CS_CHICKEN1_REGISTER, POWER_CLOCK_STATE_REGISTER, TD_CTL_DEBUG_ENABLE,
    TD_CTL_REGISTER,
};
use crate::heap::{InterfaceDescriptor, KernelFootprint, MediaStateLayout, INTERFACE_DESCRIPTOR_SIZE};
use crate::params::{ArgValue, DispatchMode, KernelId, KernelParam, TaskParam};
use crate::resource::{BindingTable, KernelSamplers, SamplerState};
use crate::sync::StateBufferType;
use crate::task::TaskEngine;

use batch::BatchKernel;

const URB_ENTRIES: u32 = 32;
const URB_ENTRY_SIZE: u32 = 2;

// =============================================================================
// ROLLBACK STATE
// =============================================================================

/// References taken while composing, returned if the submission fails
#[derive(Debug, Default)]
pub(crate) struct Held {
    pub(crate) pins: ArrayVec<u64, MAX_KERNELS_PER_TASK>,
    pub(crate) batch: Option<usize>,
}

// =============================================================================
// PER-KERNEL PLAN
// =============================================================================

#[derive(Debug)]
enum Dispatch {
    Media(MediaObjectWalker),
    Gpgpu(GpgpuWalker),
    Batch(GpuAddr),
}

#[derive(Debug)]
struct KernelStep {
    conditional_end: Option<MiConditionalBatchBufferEnd>,
    barrier: bool,
    dispatch: Dispatch,
}

/// Register loads emitted before the pipeline is selected
#[derive(Debug, Default)]
struct Prolog {
    l3: Option<(u32, u32)>,
    preemption: Option<PreemptionMode>,
    debug: bool,
    power: Option<u32>,
}

fn barrier_flags() -> PipeControlFlags {
    PipeControlFlags::write_cache() | PipeControlFlags::TEXTURE_CACHE_INVALIDATE
}

fn write_dword(curbe: &mut [u8], offset: u32, value: u32) -> Result<()> {
    let at = offset as usize;
    curbe
        .get_mut(at..at + 4)
        .ok_or(Error::InvalidParameter)?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// =============================================================================
// COMPOSER
// =============================================================================

impl<O: OsInterface> CmHalState<O> {
    /// Compose and submit a render/compute task
    pub(crate) fn submit_task(&mut self, task: &TaskParam) -> Result<TaskId> {
        task.validate()?;
        let mode = task.dispatch_mode()?;
        if mode == DispatchMode::GpgpuWalker && !self.profile.supports_gpgpu_walker() {
            return Err(Error::Unimplemented);
        }
        let id = self.tasks.acquire(TaskEngine::Render)?;
        let mut held = Held::default();
        match self.compose(id, task, mode, &mut held) {
            Ok(()) => {
                log::debug!(
                    "cm-hal: task {} submitted, {} kernels, {:?}",
                    id,
                    task.kernels.len(),
                    mode
                );
                Ok(id)
            }
            Err(e) => {
                log::warn!("cm-hal: task {} rolled back: {}", id, e);
                self.undo(id, held);
                Err(e)
            }
        }
    }

    /// Return everything a failed submission took
    pub(crate) fn undo(&mut self, id: TaskId, held: Held) {
        for serial in held.pins {
            self.kernels.unpin(serial);
        }
        if let Some(index) = held.batch {
            self.batches.release(index);
        }
        self.tasks.release(id);
    }

    /// VFE thread count: user feature, then API value, then hardware max
    pub(crate) fn vfe_max_threads(&self) -> u32 {
        let hw = self.profile.hw_max_threads(&self.platform.gt);
        let user = self.features.max_threads;
        if user > 0 && user < hw {
            user
        } else if self.api_max_threads > 0 && self.api_max_threads < hw {
            self.api_max_threads
        } else {
            hw
        }
    }

    fn load_kernels(&mut self, task: &TaskParam, held: &mut Held) -> Result<(ArrayVec<u32, MAX_KERNELS_PER_TASK>, bool)> {
        let mut offsets = ArrayVec::new();
        let mut miss = false;
        for kernel in &task.kernels {
            let loc = self
                .kernels
                .ensure_resident(kernel.id, kernel.binary.len() as u32, kernel.clone_of)?;
            held.pins.push(loc.serial);
            if loc.needs_upload {
                self.heap.write_kernel(&mut self.os, loc.offset, &kernel.binary)?;
            }
            miss |= !loc.hit;
            offsets.push(loc.offset);
        }
        Ok((offsets, miss))
    }

    fn build_curbe(
        &mut self,
        kernel: &KernelParam,
        bt: &mut BindingTable,
        samplers: &mut KernelSamplers,
    ) -> Result<Vec<u8>> {
        let mut curbe = vec![0u8; kernel.curbe_size as usize];
        for arg in &kernel.args {
            match &arg.value {
                ArgValue::General(bytes) => {
                    let at = arg.offset as usize;
                    curbe
                        .get_mut(at..at + bytes.len())
                        .ok_or(Error::InvalidParameter)?
                        .copy_from_slice(bytes);
                }
                value => {
                    let dw = self
                        .resources
                        .bind_argument(&mut self.os, &*self.profile, bt, samplers, value)?;
                    write_dword(&mut curbe, arg.offset, dw)?;
                }
            }
        }
        if let Some(sb) = self.sync.state_buffer(kernel.kernel_ptr) {
            if sb.kind == StateBufferType::Curbe {
                let mut data = vec![0u8; sb.size as usize];
                self.os.read_resource(sb.resource, 0, &mut data)?;
                self.os.register_resource(sb.resource, false)?;
                curbe = data;
            }
        }
        Ok(curbe)
    }

    fn scratch_space(&mut self, task: &TaskParam) -> Result<Option<(GpuAddr, u32)>> {
        let spill = task.kernels.iter().map(|k| k.spill_size).max().unwrap_or(0);
        if spill == 0 {
            return Ok(None);
        }
        let limit = self.options.effective_scratch_size();
        let per_thread = spill.div_ceil(1024).next_power_of_two() * 1024;
        if per_thread > limit {
            log::warn!("cm-hal: {} bytes of spill exceeds {} byte scratch", spill, limit);
            return Err(Error::InvalidParameter);
        }
        let resource = match self.scratch {
            Some(res) => res,
            None => {
                let threads = self.profile.hw_max_threads(&self.platform.gt);
                let res = self.os.allocate_resource(&ResourceDesc::new(
                    limit as usize * threads as usize,
                    "CmScratchSpace",
                ))?;
                self.scratch = Some(res);
                res
            }
        };
        self.os.register_resource(resource, true)?;
        Ok(Some((self.os.gfx_address(resource)?, per_thread)))
    }

    fn prolog(&self, pipeline: GpuPipeline, sip: bool, csr: bool) -> Result<Prolog> {
        let sku = self.platform.sku;
        let l3 = (self.l3 != Default::default()).then(|| (self.profile.l3_register(), self.l3.cntl));
        let power = (self.options.request_slice_shutdown && self.power.is_requested())
            .then(|| self.power.register_value());
        Ok(Prolog {
            l3,
            preemption: self.profile.preemption_mode(sku, pipeline, sip, csr)?,
            debug: self.options.enable_kernel_debug,
            power,
        })
    }

    fn compose(&mut self, id: TaskId, task: &TaskParam, mode: DispatchMode, held: &mut Held) -> Result<()> {
        let slot = id.index();
        let n = task.kernels.len();

        // Kernel binaries
        let (kernel_offsets, cache_miss) = self.load_kernels(task, held)?;

        // Arguments, binding table and CURBE
        let mut bt = BindingTable::new(self.options.enable_kernel_debug);
        let mut curbes: Vec<Vec<u8>> = Vec::with_capacity(n);
        let mut kernel_samplers: Vec<ArrayVec<SamplerState, 16>> = Vec::with_capacity(n);
        for kernel in &task.kernels {
            bt.begin_kernel();
            let mut samplers = KernelSamplers::new();
            curbes.push(self.build_curbe(kernel, &mut bt, &mut samplers)?);
            kernel_samplers.push(samplers.iter().map(|(_, s)| *s).collect());
        }

        // Media state block
        let footprints: ArrayVec<KernelFootprint, MAX_KERNELS_PER_TASK> = curbes
            .iter()
            .zip(&kernel_samplers)
            .map(|(c, s)| KernelFootprint {
                curbe_size: c.len() as u32,
                sampler_count: s.len() as u32,
            })
            .collect();
        let layout = MediaStateLayout::compute(&footprints, self.heap.media_block_size())?;
        let block = self.heap.media_block_offset(slot);
        let threads_in_group = task.group_space.map_or(1, |g| g.threads_per_group());
        for (i, kernel) in task.kernels.iter().enumerate() {
            if !curbes[i].is_empty() {
                self.heap
                    .write_curbe(&mut self.os, slot, layout.curbe_offsets[i], &curbes[i])?;
            }
            self.heap
                .write_samplers(&mut self.os, slot, layout.sampler_offsets[i], &kernel_samplers[i])?;
            let descriptor = InterfaceDescriptor {
                kernel_offset: kernel_offsets[i],
                sampler_offset: block + layout.sampler_offsets[i],
                sampler_count: kernel_samplers[i].len() as u32,
                binding_table_offset: self.heap.binding_table_offset(slot),
                binding_table_count: bt.states().len() as u32,
                curbe_length: curbes[i].len() as u32,
                threads_in_group,
                slm_size: kernel.slm_size,
                barrier: kernel.barrier,
            };
            self.heap
                .write_interface_descriptor(&mut self.os, slot, &layout, i, &descriptor)?;
        }
        self.heap.write_binding_table(&mut self.os, slot, &bt)?;

        // Media-object batch buffer
        if mode == DispatchMode::MediaObject {
            let ids: ArrayVec<KernelId, MAX_KERNELS_PER_TASK> = task.kernels.iter().map(|k| k.id).collect();
            let body: ArrayVec<BatchKernel, MAX_KERNELS_PER_TASK> = task
                .kernels
                .iter()
                .enumerate()
                .map(|(i, k)| BatchKernel {
                    interface_descriptor: i as u8,
                    width: k.thread_space.as_ref().map_or(k.thread_count, |ts| ts.width),
                    threads: k.dispatch_threads(),
                })
                .collect();
            let index = self.batches.select(&ids, &body)?;
            held.batch = Some(index);
            let force = self.features.force_batch_rebuild;
            self.batches.prepare(&mut self.os, index, &body, force)?;
            self.os.register_resource(self.batches.get(index)?.resource, false)?;
        }

        let scratch = self.scratch_space(task)?;

        // Per-kernel plan
        let mut steps: ArrayVec<KernelStep, MAX_KERNELS_PER_TASK> = ArrayVec::new();
        let mut scoreboard_mask = 0u8;
        for (i, kernel) in task.kernels.iter().enumerate() {
            let conditional_end = match task.conditional_end(i)? {
                Some(ce) => {
                    let entry = self.resources.buffer(ce.buffer)?;
                    let needed = if ce.mask { 8 } else { 4 };
                    if ce.offset + needed > entry.size {
                        return Err(Error::InvalidParameter);
                    }
                    self.os.register_resource(entry.resource, false)?;
                    Some(MiConditionalBatchBufferEnd {
                        addr: self.os.gfx_address(entry.resource)?.offset(ce.offset as u64),
                        compare_value: ce.compare_value,
                        mask_enabled: ce.mask,
                        end_current_level: false,
                        op: ce.op,
                    })
                }
                None => None,
            };
            let previous_sync = i > 0 && task.sync_bitmap & (1 << (i - 1)) != 0;
            let (dispatch, dependent) = match mode {
                DispatchMode::MediaWalker => {
                    let space = task.kernel_thread_space(i).ok_or(Error::InvalidParameter)?;
                    scoreboard_mask |= space.dependency.scoreboard_mask();
                    let dependent = !space.dependency.is_none();
                    (Dispatch::Media(walker::media_walker(i as u8, &space)?), dependent)
                }
                DispatchMode::GpgpuWalker => {
                    let space = task.group_space.ok_or(Error::InvalidParameter)?;
                    (
                        Dispatch::Gpgpu(walker::gpgpu_walker(i as u8, kernel.simd_width, &space)),
                        false,
                    )
                }
                DispatchMode::MediaObject => {
                    let index = held.batch.ok_or(Error::InvalidParameter)?;
                    (Dispatch::Batch(self.batches.segment_addr(&self.os, index, i)?), false)
                }
            };
            steps.push(KernelStep {
                conditional_end,
                barrier: i > 0 && (previous_sync || dependent),
                dispatch,
            });
        }

        // Synchronization
        let tag = self.sync.next_sync_tag();
        let tracker = self.sync.next_tracker_tag();
        self.sync
            .init_slot(&mut self.os, TaskEngine::Render, id, tag, tracker)?;
        self.heap.register(&mut self.os)?;
        self.sync.register(&mut self.os, TaskEngine::Render)?;

        let pipeline = match mode {
            DispatchMode::GpgpuWalker => GpuPipeline::Gpgpu,
            _ => GpuPipeline::Media,
        };
        let gpgpu = pipeline == GpuPipeline::Gpgpu;
        let sip = if gpgpu { self.sip } else { None };
        let csr = if gpgpu { self.csr } else { None };
        for res in [sip, csr].into_iter().flatten() {
            self.os.register_resource(res, true)?;
        }
        let prolog = self.prolog(pipeline, sip.is_some(), csr.is_some())?;
        let sip_addr = sip.map(|r| self.os.gfx_address(r)).transpose()?;
        let csr_addr = csr.map(|r| self.os.gfx_address(r)).transpose()?;

        let vfe = MediaVfeState {
            scratch_base: scratch.map_or(GpuAddr::new(0), |s| s.0),
            scratch_per_thread: scratch.map_or(0, |s| s.1),
            max_threads: self.vfe_max_threads(),
            urb_entries: URB_ENTRIES,
            urb_entry_size: URB_ENTRY_SIZE,
            curbe_size: layout.curbe_total.div_ceil(32),
            scoreboard_mask,
        };
        let base = self.heap.base_addresses(&self.os)?;
        let icache_invalidate = cache_miss || self.platform.wa.contains(WaFlags::FORCE_ICACHE_INVALIDATE);
        let dummy_vfe = mode != DispatchMode::MediaObject && self.profile.requires_dummy_vfe(self.platform.wa);

        // Command buffer
        let mut scope = CommandBufferScope::acquire(&mut self.os)?;
        let (os, buf) = scope.parts();

        self.sync.write_begin_timestamp(&*os, buf, id)?;

        if let Some((register, value)) = prolog.l3 {
            buf.add(&MiLoadRegisterImm::single(register, value))?;
        }
        if let Some(preemption) = prolog.preemption {
            buf.add(&MiLoadRegisterImm::single(CS_CHICKEN1_REGISTER, preemption.register_value()))?;
        }
        if prolog.debug {
            buf.add(&MiLoadRegisterImm::single(TD_CTL_REGISTER, TD_CTL_DEBUG_ENABLE))?;
        }
        if let Some(value) = prolog.power {
            buf.add(&MiLoadRegisterImm::single(POWER_CLOCK_STATE_REGISTER, value))?;
        }

        buf.add(&PipelineSelect { pipeline })?;
        buf.add(&base)?;

        if gpgpu {
            if csr_addr.is_some() {
                buf.add(&PipeControl::flush(PipeControlFlags::CS_STALL))?;
            }
            if sip_addr.is_some() || csr_addr.is_some() {
                buf.add(&StateSip {
                    addr: sip_addr.unwrap_or(GpuAddr::new(0)),
                })?;
                buf.add(&GpgpuCsrBaseAddress {
                    addr: csr_addr.unwrap_or(GpuAddr::new(0)),
                })?;
            }
        }

        buf.add(&vfe)?;
        if layout.curbe_total > 0 {
            buf.add(&MediaCurbeLoad {
                start: block,
                length: layout.curbe_total,
            })?;
        }
        buf.add(&MediaInterfaceDescriptorLoad {
            start: block + layout.id_offset,
            length: n as u32 * INTERFACE_DESCRIPTOR_SIZE,
        })?;
        if icache_invalidate {
            buf.add(&PipeControl::flush(
                PipeControlFlags::INSTRUCTION_CACHE_INVALIDATE | PipeControlFlags::CS_STALL,
            ))?;
        }

        for step in &steps {
            if let Some(cond) = &step.conditional_end {
                self.sync.write_sync_tag_flush(&*os, buf, id, tag)?;
                buf.add(&PipeControl::flush(PipeControlFlags::CS_STALL))?;
                self.sync.write_conditional_end_timestamp(&*os, buf, id)?;
                buf.add(cond)?;
            }
            if step.barrier {
                buf.add(&PipeControl::flush(barrier_flags()))?;
            }
            match &step.dispatch {
                Dispatch::Media(w) => self.profile.emit_media_walker(buf, w)?,
                Dispatch::Gpgpu(w) => self.profile.emit_gpgpu_walker(buf, w)?,
                Dispatch::Batch(addr) => buf.add(&MiBatchBufferStart {
                    addr: *addr,
                    second_level: true,
                })?,
            }
        }
        if dummy_vfe {
            buf.add(&vfe)?;
        }

        buf.add(&PipeControl::flush(PipeControlFlags::write_cache()))?;
        for res in self.resources.always_registered() {
            os.register_resource(res, true)?;
        }
        self.sync
            .write_sync_tag(&*os, buf, TaskEngine::Render, id, tag)?;
        self.sync.write_tracker(&*os, buf, tracker)?;
        self.sync.write_end_timestamp(&*os, buf, id)?;
        buf.add(&PipeControl::flush(
            PipeControlFlags::GENERIC_MEDIA_STATE_CLEAR | PipeControlFlags::CS_STALL,
        ))?;
        buf.add(&MiBatchBufferEnd)?;

        let cpu_submit_time = os.cpu_time();
        let gpu_submit_time = os.gpu_time();
        scope.submit()?;

        // Bookkeeping
        let record = self.tasks.get_mut(id)?;
        record.kernels = task.kernels.iter().map(|k| k.id).collect();
        record.cache_pins = core::mem::take(&mut held.pins);
        record.mode = Some(mode);
        record.sync_bitmap = task.sync_bitmap;
        record.conditional_end_bitmap = task.conditional_end_bitmap;
        record.batch = held.batch.take();
        record.sync_tag = tag;
        record.tracker_tag = tracker;
        record.cpu_submit_time = cpu_submit_time;
        record.gpu_submit_time = gpu_submit_time;
        if let Some(index) = record.batch {
            self.batches.mark_submitted(index, tag);
        }
        self.api_max_threads = 0;
        Ok(())
    }
}
