//! # Vebox Task Path
//!
//! Submissions for the fixed-function video enhancement engine
//! (denoise, deinterlace, image enhancement).
//!
//! A vebox task takes a slot from the shared task table and reports through
//! the vebox timestamp resource with the same slot layout as render tasks.
//! Its command sequence is short:
//!
//! ```text
//! MI_FLUSH_DW (begin timestamp)
//! VEBOX_STATE
//! VEBOX_SURFACE_STATE (input)
//! VEBOX_SURFACE_STATE (output)
//! VEBOX_DI_IECP
//! MI_STORE_DATA_IMM (sync tag, tracker)
//! MI_FLUSH_DW (end timestamp)
//! MI_BATCH_BUFFER_END
//! ```

use alloc::vec::Vec;

use cm_cmd::vebox::VEBOX_DI_IECP_SURFACES;
use cm_cmd::{MiBatchBufferEnd, VeboxDiIecp, VeboxState, VeboxStateFlags, VeboxSurfaceState};
use cm_core::consts::{
    DNDI_HISTORY_INIT_VALUE, MAX_VEBOX_SURFACES, VEBOX_PARAM_PAGE_NUM, VEBOX_PARAM_PAGE_SIZE,
};
use cm_core::{Error, GpuAddr, GpuContext, OsResource, Result, Surface2DHandle, TaskId};
use cm_os::{CommandBufferScope, LockFlags, OsInterface};

use crate::device::CmHalState;
use crate::resource::{Surface2DEntry, SurfaceHandle};
use crate::task::TaskEngine;

// =============================================================================
// SURFACE SLOTS
// =============================================================================

/// Current frame in
pub const CURRENT_INPUT: usize = 0;
/// Previous frame in
pub const PREVIOUS_INPUT: usize = 1;
/// Motion history in
pub const STMM_INPUT: usize = 2;
/// Motion history out
pub const STMM_OUTPUT: usize = 3;
/// Denoised current frame out
pub const DENOISED_OUTPUT: usize = 4;
/// Current frame out
pub const CURRENT_OUTPUT: usize = 5;
/// Previous frame out
pub const PREVIOUS_OUTPUT: usize = 6;
/// Statistics out
pub const STATISTICS_OUTPUT: usize = 7;
/// Alpha / vignette correction
pub const ALPHA_VIGNETTE: usize = 8;

/// Bytes of parameter data a task may carry
pub const VEBOX_PARAM_SIZE: usize = (VEBOX_PARAM_PAGE_SIZE * VEBOX_PARAM_PAGE_NUM) as usize;

const fn is_output(slot: usize) -> bool {
    matches!(
        slot,
        STMM_OUTPUT | DENOISED_OUTPUT | CURRENT_OUTPUT | PREVIOUS_OUTPUT | STATISTICS_OUTPUT
    )
}

// =============================================================================
// PARAMETERS
// =============================================================================

/// Pipeline enables of one vebox task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VeboxSettings {
    /// Deinterlace
    pub di: bool,
    /// First frame of a DN/DI sequence; motion history is initialized
    pub dndi_first_frame: bool,
    /// Image enhancement / color processing
    pub iecp: bool,
    /// Denoise
    pub dn: bool,
    /// Deinterlace writes both fields' frames
    pub di_output_frames: bool,
    /// Bayer demosaic
    pub demosaic: bool,
    /// Vignette correction
    pub vignette: bool,
    /// Hot pixel filter
    pub hot_pixel_filter: bool,
}

impl VeboxSettings {
    /// VEBOX_STATE enables
    pub fn flags(&self) -> VeboxStateFlags {
        let mut flags = VeboxStateFlags::empty();
        flags.set(VeboxStateFlags::DI_ENABLE, self.di);
        flags.set(VeboxStateFlags::DNDI_FIRST_FRAME, self.dndi_first_frame);
        flags.set(VeboxStateFlags::IECP_ENABLE, self.iecp);
        flags.set(VeboxStateFlags::DN_ENABLE, self.dn);
        flags.set(VeboxStateFlags::DI_OUTPUT_BOTH_FRAMES, self.di_output_frames);
        flags.set(VeboxStateFlags::DEMOSAIC_ENABLE, self.demosaic);
        flags.set(VeboxStateFlags::VIGNETTE_ENABLE, self.vignette);
        flags.set(VeboxStateFlags::HOT_PIXEL_FILTER_ENABLE, self.hot_pixel_filter);
        flags
    }
}

/// One vebox submission
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VeboxParam {
    /// Pipeline enables
    pub settings: VeboxSettings,
    /// Surfaces by slot
    pub surfaces: [Option<Surface2DHandle>; MAX_VEBOX_SURFACES],
    /// DN/DI, IECP, gamut, vertex and capture state pages
    pub param_data: Vec<u8>,
}

impl VeboxParam {
    /// Task from `input` to `output` with nothing enabled
    pub fn new(input: Surface2DHandle, output: Surface2DHandle) -> Self {
        let mut param = Self::default();
        param.surfaces[CURRENT_INPUT] = Some(input);
        param.surfaces[CURRENT_OUTPUT] = Some(output);
        param
    }

    /// Put a surface in a slot
    pub fn with_surface(mut self, slot: usize, surface: Surface2DHandle) -> Self {
        if let Some(s) = self.surfaces.get_mut(slot) {
            *s = Some(surface);
        }
        self
    }

    /// Check required surfaces and parameter size
    pub fn validate(&self) -> Result<()> {
        if self.surfaces[CURRENT_INPUT].is_none() || self.surfaces[CURRENT_OUTPUT].is_none() {
            return Err(Error::NullPointer);
        }
        if self.settings.dndi_first_frame && self.surfaces[STMM_INPUT].is_none() {
            return Err(Error::NullPointer);
        }
        if self.param_data.len() > VEBOX_PARAM_SIZE {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    fn required(&self, slot: usize) -> Result<Surface2DHandle> {
        self.surfaces[slot].ok_or(Error::NullPointer)
    }
}

fn surface_state(entry: &Surface2DEntry, is_output: bool) -> VeboxSurfaceState {
    VeboxSurfaceState {
        is_output,
        width: entry.width,
        height: entry.height,
        pitch: entry.pitch,
        format: entry.format.hw_code(),
    }
}

/// Write the DN/DI history init value into the first two bytes of every
/// 4-byte motion-history pixel
fn fill_motion_history<O: OsInterface + ?Sized>(
    os: &mut O,
    resource: OsResource,
    width: u32,
    height: u32,
    pitch: u32,
) -> Result<()> {
    let pixels = (width / 4) as usize;
    let mut row = alloc::vec![0u8; pitch as usize];
    for y in 0..height as usize {
        let at = y * pitch as usize;
        os.read_resource(resource, at, &mut row)?;
        for pixel in row.chunks_exact_mut(4).take(pixels) {
            pixel[0] = DNDI_HISTORY_INIT_VALUE;
            pixel[1] = DNDI_HISTORY_INIT_VALUE;
        }
        os.write_resource(resource, at, &row)?;
    }
    Ok(())
}

// =============================================================================
// SUBMISSION
// =============================================================================

impl<O: OsInterface> CmHalState<O> {
    /// Compose and submit a vebox task
    pub(crate) fn submit_vebox_task(&mut self, param: &VeboxParam) -> Result<TaskId> {
        let params = self.vebox_params.ok_or(Error::Unimplemented)?;
        param.validate()?;
        let id = self.tasks.acquire(TaskEngine::Vebox)?;
        if param.settings.dndi_first_frame {
            if let Err(e) = param.required(STMM_INPUT).and_then(|stmm| self.init_motion_history(stmm)) {
                self.tasks.release(id);
                return Err(e);
            }
        }

        let submitted = self.run_on_vebox(id, param, params);
        if let Err(e) = self.os.set_gpu_context(self.render_context) {
            log::warn!("cm-hal: failed to restore render context: {}", e);
        }
        match submitted {
            Ok(()) => {
                log::debug!("cm-hal: vebox task {} submitted, {:?}", id, param.settings.flags());
                Ok(id)
            }
            Err(e) => {
                log::warn!("cm-hal: vebox task {} rolled back: {}", id, e);
                self.tasks.release(id);
                Err(e)
            }
        }
    }

    fn init_motion_history(&mut self, handle: Surface2DHandle) -> Result<()> {
        let entry = self.resources.surface_2d(handle)?;
        let (resource, width, height, pitch) = (entry.resource, entry.width, entry.height, entry.pitch);
        let surface = SurfaceHandle::Surface2D(handle);
        self.resources.lock(&mut self.os, surface, LockFlags::WRITE)?;
        let filled = fill_motion_history(&mut self.os, resource, width, height, pitch);
        self.resources.unlock(&mut self.os, surface)?;
        filled
    }

    fn run_on_vebox(&mut self, id: TaskId, param: &VeboxParam, params: OsResource) -> Result<()> {
        self.os.sync_gpu_context(self.render_context, GpuContext::Vebox)?;
        self.os.set_gpu_context(GpuContext::Vebox)?;

        if !param.param_data.is_empty() {
            self.os.write_resource(params, 0, &param.param_data)?;
        }
        self.os.register_resource(params, false)?;
        let base = self.os.gfx_address(params)?;
        let page = |n: u32| base.offset((n * VEBOX_PARAM_PAGE_SIZE) as u64);

        let mut addrs = [GpuAddr::new(0); VEBOX_DI_IECP_SURFACES];
        for (slot, handle) in param.surfaces.iter().enumerate() {
            let Some(handle) = handle else { continue };
            let resource = self.resources.surface_2d(*handle)?.resource;
            self.os.register_resource(resource, is_output(slot))?;
            if let Some(addr) = addrs.get_mut(slot) {
                *addr = self.os.gfx_address(resource)?;
            }
        }
        let input = surface_state(self.resources.surface_2d(param.required(CURRENT_INPUT)?)?, false);
        let output = surface_state(self.resources.surface_2d(param.required(CURRENT_OUTPUT)?)?, true);

        let tag = self.sync.next_sync_tag();
        let tracker = self.sync.next_tracker_tag();
        self.sync
            .init_slot(&mut self.os, TaskEngine::Vebox, id, tag, tracker)?;
        self.sync.register(&mut self.os, TaskEngine::Vebox)?;

        let mut scope = CommandBufferScope::acquire(&mut self.os)?;
        let (os, buf) = scope.parts();
        self.sync.write_vebox_timestamp(&*os, buf, id, false)?;
        buf.add(&VeboxState {
            flags: param.settings.flags(),
            dndi_state: page(0),
            iecp_state: page(1),
            gamut_state: page(2),
            vertex_table: page(3),
            capture_pipe_state: page(4),
        })?;
        buf.add(&input)?;
        buf.add(&output)?;
        buf.add(&VeboxDiIecp {
            end_x: input.width.saturating_sub(1),
            end_y: input.height.saturating_sub(1),
            surfaces: addrs,
        })?;
        self.sync
            .write_sync_tag(&*os, buf, TaskEngine::Vebox, id, tag)?;
        self.sync.write_tracker(&*os, buf, tracker)?;
        self.sync.write_vebox_timestamp(&*os, buf, id, true)?;
        buf.add(&MiBatchBufferEnd)?;
        let cpu_submit_time = os.cpu_time();
        let gpu_submit_time = os.gpu_time();
        scope.submit()?;

        let record = self.tasks.get_mut(id)?;
        record.sync_tag = tag;
        record.tracker_tag = tracker;
        record.cpu_submit_time = cpu_submit_time;
        record.gpu_submit_time = gpu_submit_time;
        Ok(())
    }
}
