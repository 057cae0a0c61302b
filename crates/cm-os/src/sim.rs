//! # Simulated OS and GPU
//!
//! An in-memory [`OsInterface`] backed by byte vectors, and a [`SimGpu`]
//! handle that executes what was submitted.
//!
//! The GPU model understands the commands that matter for completion
//! tracking: post-sync writes of PIPE_CONTROL and MI_FLUSH_DW, immediate
//! stores, register loads, batch-buffer chaining and conditional ends.
//! Everything else is consumed as a no-op. Execution can be stepped one
//! command at a time, so tests can observe a task that has started but
//! not finished.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cm_cmd::{
    command_length, CommandBuffer, MiBatchBufferStart, MiConditionalBatchBufferEnd, MiFlushDw,
    MiLoadRegisterImm, MiStoreDataImm, Opcode, PipeControl, PostSync,
};
use cm_core::{Error, GpuAddr, GpuContext, OsResource, Result};
use hashbrown::HashMap;
use spin::Mutex;

use crate::traits::{LockFlags, OsInterface, ResourceDesc};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Command buffer size handed out by default
pub const DEFAULT_COMMAND_BUFFER_SIZE: u32 = 64 * 1024;

const GPU_VA_BASE: u64 = 0x1_0000_0000;
const RESOURCE_ALIGN: u64 = 0x1000;
const TIMESTAMP_STEP: u64 = 10;
const MAX_STEPS_PER_RUN: usize = 1 << 20;
const MAX_NESTING: usize = 8;

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug)]
struct SimResource {
    name: &'static str,
    data: Vec<u8>,
    gpu_addr: u64,
    lock_count: u32,
}

#[derive(Debug, Default)]
struct ContextState {
    created: bool,
    buffer: Option<CommandBuffer>,
    checked_out: bool,
    status_tag: u32,
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Ring,
    Resource(OsResource),
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    source: Source,
    pc: usize,
}

/// One submitted command stream
#[derive(Debug)]
struct Submission {
    context: GpuContext,
    stream: Vec<u32>,
    registered: Vec<OsResource>,
    stack: Vec<Frame>,
}

impl Submission {
    fn done(&self) -> bool {
        self.stack.is_empty()
    }
}

#[derive(Debug)]
struct SimState {
    resources: Vec<Option<SimResource>>,
    next_va: u64,
    contexts: [ContextState; 4],
    current: GpuContext,
    command_buffer_size: u32,
    pending_registrations: Vec<OsResource>,
    submissions: Vec<Submission>,
    barriers: Vec<(GpuContext, GpuContext)>,
    registers: HashMap<u32, u32>,
    gpu_clock: u64,
    cpu_clock: u64,
    dispatches: u64,
    executed: u64,
    fail_next_submit: bool,
}

impl SimState {
    fn new() -> Self {
        Self {
            resources: Vec::new(),
            next_va: GPU_VA_BASE,
            contexts: Default::default(),
            current: GpuContext::Render,
            command_buffer_size: DEFAULT_COMMAND_BUFFER_SIZE,
            pending_registrations: Vec::new(),
            submissions: Vec::new(),
            barriers: Vec::new(),
            registers: HashMap::new(),
            gpu_clock: 1000,
            cpu_clock: 0,
            dispatches: 0,
            executed: 0,
            fail_next_submit: false,
        }
    }

    fn resource(&self, res: OsResource) -> Result<&SimResource> {
        self.resources
            .get(res.index() as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidHandle)
    }

    fn resource_mut(&mut self, res: OsResource) -> Result<&mut SimResource> {
        self.resources
            .get_mut(res.index() as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidHandle)
    }

    fn context(&self, ctx: GpuContext) -> &ContextState {
        &self.contexts[ctx.index()]
    }

    fn context_mut(&mut self, ctx: GpuContext) -> &mut ContextState {
        &mut self.contexts[ctx.index()]
    }

    /// Resolve a GPU address to the resource and byte offset holding it
    fn resolve(&self, addr: GpuAddr) -> Option<(OsResource, usize)> {
        let addr = addr.raw();
        self.resources.iter().enumerate().find_map(|(i, r)| {
            let r = r.as_ref()?;
            let end = r.gpu_addr + r.data.len() as u64;
            (addr >= r.gpu_addr && addr < end)
                .then(|| (OsResource::new(i as u32), (addr - r.gpu_addr) as usize))
        })
    }

    fn gpu_write(&mut self, addr: GpuAddr, bytes: &[u8]) {
        let Some((res, offset)) = self.resolve(addr) else {
            log::warn!("sim-gpu: write to unmapped address {}", addr);
            return;
        };
        if let Ok(r) = self.resource_mut(res) {
            if let Some(dst) = r.data.get_mut(offset..offset + bytes.len()) {
                dst.copy_from_slice(bytes);
            }
        }
    }

    fn gpu_read_u32(&self, addr: GpuAddr) -> u32 {
        let Some((res, offset)) = self.resolve(addr) else {
            return 0;
        };
        self.resource(res)
            .ok()
            .and_then(|r| r.data.get(offset..offset + 4))
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0)
    }

    fn post_sync(&mut self, addr: GpuAddr, post_sync: PostSync) {
        match post_sync {
            PostSync::None => {}
            PostSync::WriteImmediate(value) => self.gpu_write(addr, &value.to_le_bytes()),
            PostSync::Timestamp => {
                let now = self.gpu_clock;
                self.gpu_write(addr, &now.to_le_bytes());
            }
        }
    }

    /// Fetch the command at the top frame of submission `idx`
    fn fetch(&self, idx: usize) -> Option<Vec<u32>> {
        let sub = &self.submissions[idx];
        let frame = sub.stack.last()?;
        match frame.source {
            Source::Ring => {
                let header = *sub.stream.get(frame.pc)?;
                let len = command_length(header).ok()?;
                sub.stream.get(frame.pc..frame.pc + len).map(<[u32]>::to_vec)
            }
            Source::Resource(res) => {
                let data = &self.resource(res).ok()?.data;
                let dword = |i: usize| {
                    data.get(i * 4..i * 4 + 4)
                        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                };
                let header = dword(frame.pc)?;
                let len = command_length(header).ok()?;
                (frame.pc..frame.pc + len).map(dword).collect()
            }
        }
    }

    /// Execute one command of the oldest unfinished submission
    fn step(&mut self) -> bool {
        let Some(idx) = self.submissions.iter().position(|s| !s.done()) else {
            return false;
        };
        let Some(cmd) = self.fetch(idx) else {
            // Ran off the end of a buffer without an end marker
            self.submissions[idx].stack.pop();
            return true;
        };
        if let Some(frame) = self.submissions[idx].stack.last_mut() {
            frame.pc += cmd.len();
        }
        self.executed += 1;
        self.gpu_clock += TIMESTAMP_STEP;

        match Opcode::of(cmd[0]) {
            Opcode::BatchBufferEnd => {
                self.submissions[idx].stack.pop();
            }
            Opcode::BatchBufferStart => {
                if let Some(bb) = MiBatchBufferStart::parse(&cmd) {
                    self.start_batch(idx, bb);
                }
            }
            Opcode::ConditionalBatchBufferEnd => {
                if let Some(cond) = MiConditionalBatchBufferEnd::parse(&cmd) {
                    let mut value = self.gpu_read_u32(cond.addr);
                    if cond.mask_enabled {
                        value &= self.gpu_read_u32(cond.addr + 4);
                    }
                    if !cond.op.holds(value, cond.compare_value) {
                        let stack = &mut self.submissions[idx].stack;
                        if cond.end_current_level {
                            stack.pop();
                        } else {
                            stack.clear();
                        }
                    }
                }
            }
            Opcode::StoreDataImm => {
                if let Some(store) = MiStoreDataImm::parse(&cmd) {
                    if store.qword {
                        self.gpu_write(store.addr, &store.value.to_le_bytes());
                    } else {
                        self.gpu_write(store.addr, &(store.value as u32).to_le_bytes());
                    }
                }
            }
            Opcode::LoadRegisterImm => {
                if let Some(lri) = MiLoadRegisterImm::parse(&cmd) {
                    for (reg, value) in lri.pairs {
                        self.registers.insert(reg, value);
                    }
                }
            }
            Opcode::PipeControl => {
                if let Some(pc) = PipeControl::parse(&cmd) {
                    self.post_sync(pc.addr, pc.post_sync);
                }
            }
            Opcode::FlushDw => {
                if let Some(flush) = MiFlushDw::parse(&cmd) {
                    self.post_sync(flush.addr, flush.post_sync);
                }
            }
            op if op.is_dispatch() => self.dispatches += 1,
            _ => {}
        }
        true
    }

    fn start_batch(&mut self, idx: usize, bb: MiBatchBufferStart) {
        let Some((res, offset)) = self.resolve(bb.addr) else {
            log::warn!("sim-gpu: batch start at unmapped address {}", bb.addr);
            self.submissions[idx].stack.clear();
            return;
        };
        let stack = &mut self.submissions[idx].stack;
        if !bb.second_level {
            stack.pop();
        }
        if stack.len() >= MAX_NESTING {
            log::warn!("sim-gpu: batch nesting too deep");
            stack.clear();
            return;
        }
        stack.push(Frame {
            source: Source::Resource(res),
            pc: offset / 4,
        });
    }
}

// =============================================================================
// SIM OS
// =============================================================================

/// In-memory OS interface
#[derive(Debug, Clone)]
pub struct SimOs {
    state: Arc<Mutex<SimState>>,
}

impl SimOs {
    /// Create an OS with no resources and no contexts
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Handle to the GPU executing this OS's submissions
    pub fn gpu(&self) -> SimGpu {
        SimGpu {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for SimOs {
    fn default() -> Self {
        Self::new()
    }
}

impl OsInterface for SimOs {
    fn allocate_resource(&mut self, desc: &ResourceDesc) -> Result<OsResource> {
        if desc.size == 0 {
            return Err(Error::InvalidParameter);
        }
        let mut s = self.state.lock();
        let gpu_addr = s.next_va;
        let span = (desc.size as u64 + RESOURCE_ALIGN - 1) & !(RESOURCE_ALIGN - 1);
        s.next_va += span + RESOURCE_ALIGN;
        let resource = SimResource {
            name: desc.name,
            data: alloc::vec![0; desc.size],
            gpu_addr,
            lock_count: 0,
        };
        let index = match s.resources.iter().position(Option::is_none) {
            Some(i) => {
                s.resources[i] = Some(resource);
                i
            }
            None => {
                s.resources.push(Some(resource));
                s.resources.len() - 1
            }
        };
        log::trace!("sim-os: allocated {} ({} bytes) at 0x{:x}", desc.name, desc.size, gpu_addr);
        Ok(OsResource::new(index as u32))
    }

    fn free_resource(&mut self, resource: OsResource) -> Result<()> {
        let mut s = self.state.lock();
        if s.resource(resource)?.lock_count != 0 {
            return Err(Error::InvalidParameter);
        }
        s.resources[resource.index() as usize] = None;
        Ok(())
    }

    fn resource_size(&self, resource: OsResource) -> Result<usize> {
        Ok(self.state.lock().resource(resource)?.data.len())
    }

    fn gfx_address(&self, resource: OsResource) -> Result<GpuAddr> {
        Ok(GpuAddr::new(self.state.lock().resource(resource)?.gpu_addr))
    }

    fn register_resource(&mut self, resource: OsResource, _write: bool) -> Result<()> {
        let mut s = self.state.lock();
        s.resource(resource)?;
        if !s.pending_registrations.contains(&resource) {
            s.pending_registrations.push(resource);
        }
        Ok(())
    }

    fn discard_registrations(&mut self) {
        self.state.lock().pending_registrations.clear();
    }

    fn lock_resource(&mut self, resource: OsResource, flags: LockFlags) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidParameter);
        }
        self.state.lock().resource_mut(resource)?.lock_count += 1;
        Ok(())
    }

    fn unlock_resource(&mut self, resource: OsResource) -> Result<()> {
        let mut s = self.state.lock();
        let r = s.resource_mut(resource)?;
        if r.lock_count == 0 {
            return Err(Error::InvalidParameter);
        }
        r.lock_count -= 1;
        Ok(())
    }

    fn read_resource(&self, resource: OsResource, offset: usize, out: &mut [u8]) -> Result<()> {
        let s = self.state.lock();
        let src = s
            .resource(resource)?
            .data
            .get(offset..offset + out.len())
            .ok_or(Error::InvalidParameter)?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn write_resource(&mut self, resource: OsResource, offset: usize, data: &[u8]) -> Result<()> {
        let mut s = self.state.lock();
        let dst = s
            .resource_mut(resource)?
            .data
            .get_mut(offset..offset + data.len())
            .ok_or(Error::InvalidParameter)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn get_command_buffer(&mut self) -> Result<CommandBuffer> {
        let mut s = self.state.lock();
        let size = s.command_buffer_size;
        let current = s.current;
        let ctx = s.context_mut(current);
        if !ctx.created || ctx.checked_out {
            return Err(Error::OsFailure);
        }
        ctx.checked_out = true;
        Ok(ctx.buffer.take().unwrap_or_else(|| CommandBuffer::new(size)))
    }

    fn return_command_buffer(&mut self, buffer: CommandBuffer) {
        let mut s = self.state.lock();
        let current = s.current;
        let ctx = s.context_mut(current);
        ctx.checked_out = false;
        ctx.buffer = Some(buffer);
    }

    fn submit_command_buffer(&mut self) -> Result<()> {
        let mut s = self.state.lock();
        if s.fail_next_submit {
            s.fail_next_submit = false;
            s.pending_registrations.clear();
            log::warn!("sim-os: injected submit failure");
            return Err(Error::OsFailure);
        }
        let current = s.current;
        let ctx = s.context_mut(current);
        let buffer = if ctx.checked_out { None } else { ctx.buffer.take() };
        let Some(buffer) = buffer else {
            s.pending_registrations.clear();
            return Err(Error::OsFailure);
        };
        let stream = buffer.into_dwords();
        let registered = core::mem::take(&mut s.pending_registrations);
        log::debug!("sim-os: submit {} dwords on {:?}", stream.len(), current);
        let stack = if stream.is_empty() {
            Vec::new()
        } else {
            alloc::vec![Frame {
                source: Source::Ring,
                pc: 0,
            }]
        };
        s.submissions.push(Submission {
            context: current,
            stream,
            registered,
            stack,
        });
        Ok(())
    }

    fn create_gpu_context(&mut self, context: GpuContext) -> Result<()> {
        self.state.lock().context_mut(context).created = true;
        Ok(())
    }

    fn set_gpu_context(&mut self, context: GpuContext) -> Result<()> {
        let mut s = self.state.lock();
        if !s.context(context).created {
            return Err(Error::InvalidParameter);
        }
        s.current = context;
        Ok(())
    }

    fn gpu_context(&self) -> GpuContext {
        self.state.lock().current
    }

    fn increment_gpu_status_tag(&mut self, context: GpuContext) {
        let mut s = self.state.lock();
        let ctx = s.context_mut(context);
        ctx.status_tag = ctx.status_tag.wrapping_add(1);
    }

    fn gpu_status_tag(&self, context: GpuContext) -> u32 {
        self.state.lock().context(context).status_tag
    }

    fn sync_gpu_context(&mut self, from: GpuContext, to: GpuContext) -> Result<()> {
        let mut s = self.state.lock();
        if !s.context(from).created || !s.context(to).created {
            return Err(Error::InvalidParameter);
        }
        s.barriers.push((from, to));
        Ok(())
    }

    fn gpu_time(&self) -> u64 {
        self.state.lock().gpu_clock
    }

    fn cpu_time(&self) -> u64 {
        let mut s = self.state.lock();
        s.cpu_clock += 1;
        s.cpu_clock
    }
}

// =============================================================================
// SIM GPU
// =============================================================================

/// Test-side handle that executes submissions and inspects memory
#[derive(Debug, Clone)]
pub struct SimGpu {
    state: Arc<Mutex<SimState>>,
}

impl SimGpu {
    /// Execute up to `n` commands; returns how many ran
    pub fn step(&self, n: usize) -> usize {
        let mut s = self.state.lock();
        let mut ran = 0;
        while ran < n && s.step() {
            ran += 1;
        }
        ran
    }

    /// Execute everything submitted
    pub fn run(&self) -> usize {
        self.step(MAX_STEPS_PER_RUN)
    }

    /// Submissions not yet finished
    pub fn pending(&self) -> usize {
        self.state.lock().submissions.iter().filter(|s| !s.done()).count()
    }

    /// Submissions made so far
    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Stream of submission `i`
    pub fn submission(&self, i: usize) -> Option<Vec<u32>> {
        self.state.lock().submissions.get(i).map(|s| s.stream.clone())
    }

    /// Stream of the most recent submission
    pub fn last_submission(&self) -> Option<Vec<u32>> {
        self.state.lock().submissions.last().map(|s| s.stream.clone())
    }

    /// Context of submission `i`
    pub fn submission_context(&self, i: usize) -> Option<GpuContext> {
        self.state.lock().submissions.get(i).map(|s| s.context)
    }

    /// Resources registered for submission `i`
    pub fn registered(&self, i: usize) -> Vec<OsResource> {
        self.state
            .lock()
            .submissions
            .get(i)
            .map(|s| s.registered.clone())
            .unwrap_or_default()
    }

    /// Cross-context barriers requested so far
    pub fn barriers(&self) -> Vec<(GpuContext, GpuContext)> {
        self.state.lock().barriers.clone()
    }

    /// Last value loaded into a register
    pub fn register(&self, reg: u32) -> Option<u32> {
        self.state.lock().registers.get(&reg).copied()
    }

    /// Thread dispatch commands executed
    pub fn dispatch_count(&self) -> u64 {
        self.state.lock().dispatches
    }

    /// Commands executed
    pub fn executed(&self) -> u64 {
        self.state.lock().executed
    }

    /// Current GPU clock
    pub fn time(&self) -> u64 {
        self.state.lock().gpu_clock
    }

    /// Copy of a resource's memory
    pub fn resource_bytes(&self, res: OsResource) -> Option<Vec<u8>> {
        self.state.lock().resource(res).ok().map(|r| r.data.clone())
    }

    /// Name of a live resource
    pub fn resource_name(&self, res: OsResource) -> Option<&'static str> {
        self.state.lock().resource(res).ok().map(|r| r.name)
    }

    /// Live resource count
    pub fn live_resources(&self) -> usize {
        self.state.lock().resources.iter().filter(|r| r.is_some()).count()
    }

    /// Whether a resource is currently locked by the host
    pub fn is_locked(&self, res: OsResource) -> bool {
        self.state
            .lock()
            .resource(res)
            .map(|r| r.lock_count > 0)
            .unwrap_or(false)
    }

    /// Size of command buffers handed out from now on
    pub fn set_command_buffer_size(&self, bytes: u32) {
        self.state.lock().command_buffer_size = bytes;
    }

    /// Make the next submission fail
    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next_submit = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandBufferScope;
    use cm_cmd::{MiBatchBufferEnd, PipeControlFlags};

    fn os_with_render() -> (SimOs, SimGpu) {
        let mut os = SimOs::new();
        os.create_gpu_context(GpuContext::Render).unwrap();
        let gpu = os.gpu();
        (os, gpu)
    }

    #[test]
    fn test_resource_read_write() {
        let (mut os, _gpu) = os_with_render();
        let res = os.allocate_resource(&ResourceDesc::new(64, "scratch")).unwrap();
        os.write_u64(res, 8, 0xDEAD_BEEF).unwrap();
        assert_eq!(os.read_u64(res, 8).unwrap(), 0xDEAD_BEEF);
        assert_eq!(os.read_u64(res, 60), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_free_locked_resource_fails() {
        let (mut os, _gpu) = os_with_render();
        let res = os.allocate_resource(&ResourceDesc::new(16, "locked")).unwrap();
        os.lock_resource(res, LockFlags::WRITE).unwrap();
        assert_eq!(os.free_resource(res), Err(Error::InvalidParameter));
        os.unlock_resource(res).unwrap();
        os.free_resource(res).unwrap();
        assert_eq!(os.resource_size(res), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_command_buffer_checkout() {
        let (mut os, _gpu) = os_with_render();
        let cb = os.get_command_buffer().unwrap();
        assert_eq!(os.get_command_buffer(), Err(Error::OsFailure));
        os.return_command_buffer(cb);
        assert!(os.get_command_buffer().is_ok());
    }

    #[test]
    fn test_gpu_writes_timestamp_and_ends() {
        let (mut os, gpu) = os_with_render();
        let res = os.allocate_resource(&ResourceDesc::new(64, "ts")).unwrap();
        let addr = os.gfx_address(res).unwrap();
        os.write_u64(res, 0, u64::MAX).unwrap();

        let mut cb = os.get_command_buffer().unwrap();
        cb.add(&PipeControl::timestamp(addr, PipeControlFlags::write_cache())).unwrap();
        cb.add(&MiStoreDataImm::dword(addr + 16, 42)).unwrap();
        cb.add(&MiBatchBufferEnd).unwrap();
        os.return_command_buffer(cb);
        os.submit_command_buffer().unwrap();

        assert_eq!(gpu.pending(), 1);
        assert_eq!(gpu.step(1), 1);
        assert_ne!(os.read_u64(res, 0).unwrap(), u64::MAX);
        gpu.run();
        assert_eq!(gpu.pending(), 0);
        let mut tag = [0u8; 4];
        os.read_resource(res, 16, &mut tag).unwrap();
        assert_eq!(u32::from_le_bytes(tag), 42);
    }

    #[test]
    fn test_second_level_batch_returns() {
        let (mut os, gpu) = os_with_render();
        let bb = os.allocate_resource(&ResourceDesc::new(256, "bb")).unwrap();
        let out = os.allocate_resource(&ResourceDesc::new(16, "out")).unwrap();
        let out_addr = os.gfx_address(out).unwrap();

        let mut body = CommandBuffer::new(256);
        body.add(&MiStoreDataImm::dword(out_addr, 1)).unwrap();
        body.add(&MiBatchBufferEnd).unwrap();
        os.write_resource(bb, 0, &body.to_bytes()).unwrap();

        let mut cb = os.get_command_buffer().unwrap();
        cb.add(&MiBatchBufferStart {
            addr: os.gfx_address(bb).unwrap(),
            second_level: true,
        })
        .unwrap();
        cb.add(&MiStoreDataImm::dword(out_addr + 4, 2)).unwrap();
        cb.add(&MiBatchBufferEnd).unwrap();
        os.return_command_buffer(cb);
        os.submit_command_buffer().unwrap();
        gpu.run();

        let bytes = gpu.resource_bytes(out).unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[4], 2);
    }

    #[test]
    fn test_conditional_end_stops_batch() {
        let (mut os, gpu) = os_with_render();
        let flag = os.allocate_resource(&ResourceDesc::new(16, "flag")).unwrap();
        let flag_addr = os.gfx_address(flag).unwrap();

        let mut cb = os.get_command_buffer().unwrap();
        cb.add(&MiConditionalBatchBufferEnd {
            addr: flag_addr,
            compare_value: 0,
            mask_enabled: false,
            end_current_level: false,
            op: cm_cmd::CompareOp::GreaterThan,
        })
        .unwrap();
        cb.add(&MiStoreDataImm::dword(flag_addr + 8, 7)).unwrap();
        cb.add(&MiBatchBufferEnd).unwrap();
        os.return_command_buffer(cb);
        os.submit_command_buffer().unwrap();
        gpu.run();

        // flag == 0 is not > 0, so the store never ran
        assert_eq!(gpu.resource_bytes(flag).unwrap()[8], 0);
    }

    #[test]
    fn test_injected_submit_failure_keeps_buffer() {
        let (mut os, gpu) = os_with_render();
        let mut cb = os.get_command_buffer().unwrap();
        cb.add(&MiBatchBufferEnd).unwrap();
        os.return_command_buffer(cb);
        gpu.fail_next_submit();
        assert_eq!(os.submit_command_buffer(), Err(Error::OsFailure));
        assert_eq!(gpu.submission_count(), 0);
        let cb = os.get_command_buffer().unwrap();
        assert_eq!(cb.offset(), 4);
    }

    #[test]
    fn test_failed_submit_drops_registrations() {
        let (mut os, gpu) = os_with_render();
        let stale = os.allocate_resource(&ResourceDesc::new(16, "stale")).unwrap();
        let fresh = os.allocate_resource(&ResourceDesc::new(16, "fresh")).unwrap();
        os.register_resource(stale, false).unwrap();
        let mut cb = os.get_command_buffer().unwrap();
        cb.add(&MiBatchBufferEnd).unwrap();
        os.return_command_buffer(cb);
        gpu.fail_next_submit();
        assert_eq!(os.submit_command_buffer(), Err(Error::OsFailure));

        os.register_resource(fresh, false).unwrap();
        os.submit_command_buffer().unwrap();
        assert_eq!(gpu.registered(0), vec![fresh]);
    }

    #[test]
    fn test_rolled_back_scope_drops_registrations() {
        let (mut os, gpu) = os_with_render();
        let stale = os.allocate_resource(&ResourceDesc::new(16, "stale")).unwrap();
        let fresh = os.allocate_resource(&ResourceDesc::new(16, "fresh")).unwrap();
        {
            let mut scope = CommandBufferScope::acquire(&mut os).unwrap();
            let (os, buf) = scope.parts();
            os.register_resource(stale, false).unwrap();
            buf.add(&MiBatchBufferEnd).unwrap();
        }

        os.register_resource(fresh, false).unwrap();
        let mut scope = CommandBufferScope::acquire(&mut os).unwrap();
        assert_eq!(scope.buffer().offset(), 0);
        scope.buffer().add(&MiBatchBufferEnd).unwrap();
        scope.submit().unwrap();
        assert_eq!(gpu.registered(0), vec![fresh]);
    }

    #[test]
    fn test_sync_requires_contexts() {
        let (mut os, gpu) = os_with_render();
        assert_eq!(
            os.sync_gpu_context(GpuContext::Render, GpuContext::Vebox),
            Err(Error::InvalidParameter)
        );
        os.create_gpu_context(GpuContext::Vebox).unwrap();
        os.sync_gpu_context(GpuContext::Render, GpuContext::Vebox).unwrap();
        assert_eq!(gpu.barriers(), vec![(GpuContext::Render, GpuContext::Vebox)]);
    }
}
