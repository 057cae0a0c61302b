//! # Binding Table
//!
//! Per-task assignment of binding-table indices to surfaces.
//!
//! All kernels of a task share one 256-entry table. A resource (and alias)
//! gets at most one index per binding kind; later arguments naming the same
//! resource reuse it. Index 0 is the null surface and is never handed out.

use alloc::vec::Vec;

use cm_core::consts::{
    DEBUG_SURFACE_INDEX, MAX_BINDING_INDICES, MAX_SURFACE_STATES_PER_BT,
    NULL_SURFACE_BINDING_INDEX,
};
use cm_core::{Error, GpuAddr, OsResource, Result, SurfaceFormat, SurfaceKind};
use hashbrown::HashMap;

// =============================================================================
// SURFACE STATE
// =============================================================================

/// Encoded surface state size in bytes
pub const SURFACE_STATE_SIZE: u32 = 64;

const SURFTYPE_2D: u32 = 1;
const SURFTYPE_3D: u32 = 2;
const SURFTYPE_BUFFER: u32 = 4;

/// Everything needed to encode one surface state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceStateDesc {
    /// Surface kind
    pub kind: SurfaceKind,
    /// Base address, offset applied
    pub addr: GpuAddr,
    /// Width in pixels, or bytes for buffers
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Depth in slices
    pub depth: u32,
    /// Row pitch in bytes
    pub pitch: u32,
    /// Pixel format
    pub format: SurfaceFormat,
    /// Cache control
    pub mocs: u8,
    /// X offset in pixels
    pub x_offset: u32,
    /// Y offset in rows
    pub y_offset: u32,
}

impl SurfaceStateDesc {
    /// RENDER_SURFACE_STATE dwords
    pub fn encode(&self) -> [u32; 16] {
        let mut dw = [0u32; 16];
        let surftype = match self.kind {
            SurfaceKind::Buffer => SURFTYPE_BUFFER,
            SurfaceKind::Surface3D => SURFTYPE_3D,
            SurfaceKind::Surface2D | SurfaceKind::Surface2DUp => SURFTYPE_2D,
        };
        dw[0] = (surftype << 29) | ((self.format.hw_code() & 0x1FF) << 18);
        dw[1] = (self.mocs as u32) << 24;
        match self.kind {
            SurfaceKind::Buffer => {
                // size - 1 split across width (7 bits), height (14) and depth (11)
                let n = self.width.saturating_sub(1);
                dw[2] = ((n >> 7) & 0x3FFF) << 16 | (n & 0x7F);
                dw[3] = ((n >> 21) & 0x7FF) << 21;
            }
            _ => {
                dw[2] = ((self.height.saturating_sub(1) & 0x3FFF) << 16)
                    | (self.width.saturating_sub(1) & 0x3FFF);
                dw[3] = ((self.depth.saturating_sub(1) & 0x7FF) << 21)
                    | (self.pitch.saturating_sub(1) & 0x3FFFF);
            }
        }
        dw[5] = ((self.x_offset >> 2) << 25) | ((self.y_offset >> 1) << 21);
        dw[8] = self.addr.low();
        dw[9] = self.addr.high();
        dw
    }
}

// =============================================================================
// BINDING KINDS
// =============================================================================

/// Pool an index is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Data-port access
    Regular,
    /// Sampler access
    SamplerSurface,
    /// Motion estimation
    Vme,
    /// AVS/VA sampler
    Sampler8x8,
}

/// Indices one resource holds, at most one per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindingIndices {
    /// Regular index
    pub regular: Option<u8>,
    /// Sampler-surface index
    pub sampler: Option<u8>,
    /// First index of the VME run
    pub vme: Option<u8>,
    /// Sampler8x8 index
    pub sampler8x8: Option<u8>,
}

impl BindingIndices {
    fn slot(&mut self, kind: BindingKind) -> &mut Option<u8> {
        match kind {
            BindingKind::Regular => &mut self.regular,
            BindingKind::SamplerSurface => &mut self.sampler,
            BindingKind::Vme => &mut self.vme,
            BindingKind::Sampler8x8 => &mut self.sampler8x8,
        }
    }
}

/// Indices consumed per kind
#[derive(Debug, Clone, Default)]
pub struct IndexCounters {
    /// Regular indices
    pub regular: u32,
    /// Sampler-surface indices
    pub sampler_surfaces: u32,
    /// VME indices, references included
    pub vme: u32,
    /// Sampler8x8 indices
    pub sampler8x8: u32,
}

// =============================================================================
// BINDING TABLE
// =============================================================================

const WORDS: usize = MAX_BINDING_INDICES / 64;

#[derive(Debug, Clone, Copy, Default)]
struct Bitmap([u64; WORDS]);

impl Bitmap {
    fn get(&self, i: usize) -> bool {
        self.0[i / 64] & (1 << (i % 64)) != 0
    }

    fn set(&mut self, i: usize) {
        self.0[i / 64] |= 1 << (i % 64);
    }

    fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// One task's binding table
#[derive(Debug)]
pub struct BindingTable {
    occupied: Bitmap,
    kernel_used: Bitmap,
    entries: HashMap<(OsResource, u8), BindingIndices>,
    runs: HashMap<u8, u8>,
    states: Vec<(u8, SurfaceStateDesc)>,
    counters: IndexCounters,
    debug_pinned: bool,
}

impl BindingTable {
    /// Empty table; pins the debug surface index when `kernel_debug`
    pub fn new(kernel_debug: bool) -> Self {
        let mut occupied = Bitmap::default();
        occupied.set(NULL_SURFACE_BINDING_INDEX as usize);
        if kernel_debug {
            occupied.set(DEBUG_SURFACE_INDEX as usize);
        }
        Self {
            occupied,
            kernel_used: Bitmap::default(),
            entries: HashMap::new(),
            runs: HashMap::new(),
            states: Vec::new(),
            counters: IndexCounters::default(),
            debug_pinned: kernel_debug,
        }
    }

    /// Start counting surface states for the next kernel
    pub fn begin_kernel(&mut self) {
        self.kernel_used = Bitmap::default();
    }

    /// Surface states the current kernel references
    pub fn kernel_state_count(&self) -> usize {
        self.kernel_used.count()
    }

    /// Per-kind consumption
    pub fn counters(&self) -> &IndexCounters {
        &self.counters
    }

    /// Whether the debug surface index is reserved
    pub fn debug_pinned(&self) -> bool {
        self.debug_pinned
    }

    /// Surface states to write, by index
    pub fn states(&self) -> &[(u8, SurfaceStateDesc)] {
        &self.states
    }

    /// Index of `resource` for `kind`, allocating on first use
    ///
    /// `states` holds the surface state of every index the binding
    /// consumes: one for most kinds, the whole contiguous run for VME.
    pub fn get_or_create(
        &mut self,
        resource: OsResource,
        alias: u8,
        kind: BindingKind,
        states: &[SurfaceStateDesc],
    ) -> Result<u8> {
        if states.is_empty() {
            return Err(Error::NullPointer);
        }
        let existing = *self.entries.entry((resource, alias)).or_default().slot(kind);
        if let Some(index) = existing {
            let run = if kind == BindingKind::Vme {
                self.runs.get(&index).copied().unwrap_or(1)
            } else {
                1
            };
            self.mark_kernel_use(index, run)?;
            return Ok(index);
        }

        let run = states.len();
        let index = self.find_free_run(run).ok_or(Error::ResourceExhausted)?;
        self.mark_kernel_use(index, run as u8)?;
        for (i, state) in states.iter().enumerate() {
            self.occupied.set(index as usize + i);
            self.states.push((index + i as u8, *state));
        }
        if let Some(indices) = self.entries.get_mut(&(resource, alias)) {
            *indices.slot(kind) = Some(index);
        }
        match kind {
            BindingKind::Regular => self.counters.regular += 1,
            BindingKind::SamplerSurface => self.counters.sampler_surfaces += 1,
            BindingKind::Vme => {
                self.counters.vme += run as u32;
                self.runs.insert(index, run as u8);
            }
            BindingKind::Sampler8x8 => self.counters.sampler8x8 += 1,
        }
        Ok(index)
    }

    /// Indices recorded for a resource
    pub fn lookup(&self, resource: OsResource, alias: u8) -> Option<BindingIndices> {
        self.entries.get(&(resource, alias)).copied()
    }

    fn mark_kernel_use(&mut self, index: u8, run: u8) -> Result<()> {
        let mut used = self.kernel_used;
        for i in 0..run as usize {
            used.set(index as usize + i);
        }
        if used.count() > MAX_SURFACE_STATES_PER_BT {
            log::warn!(
                "cm-hal: kernel binds more than {} surfaces",
                MAX_SURFACE_STATES_PER_BT
            );
            return Err(Error::ResourceExhausted);
        }
        self.kernel_used = used;
        Ok(())
    }

    fn find_free_run(&self, run: usize) -> Option<u8> {
        let mut start = 1;
        while start + run <= MAX_BINDING_INDICES {
            match (start..start + run).find(|&i| self.occupied.get(i)) {
                Some(taken) => start = taken + 1,
                None => return Some(start as u8),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(addr: u64) -> SurfaceStateDesc {
        SurfaceStateDesc {
            kind: SurfaceKind::Surface2D,
            addr: GpuAddr::new(addr),
            width: 64,
            height: 64,
            depth: 1,
            pitch: 256,
            format: SurfaceFormat::A8R8G8B8,
            mocs: 2,
            x_offset: 0,
            y_offset: 0,
        }
    }

    #[test]
    fn test_same_resource_same_index() {
        let mut bt = BindingTable::new(false);
        let res = OsResource::new(7);
        let a = bt.get_or_create(res, 0, BindingKind::Regular, &[state(0x1000)]).unwrap();
        let b = bt.get_or_create(res, 0, BindingKind::Regular, &[state(0x1000)]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 1);
        assert_eq!(bt.states().len(), 1);
        // a different kind on the same resource gets its own index
        let s = bt.get_or_create(res, 0, BindingKind::SamplerSurface, &[state(0x1000)]).unwrap();
        assert_ne!(s, a);
        assert_eq!(bt.counters().sampler_surfaces, 1);
        // an alias is a different entry
        let alias = bt.get_or_create(res, 1, BindingKind::Regular, &[state(0x1100)]).unwrap();
        assert_ne!(alias, a);
    }

    #[test]
    fn test_vme_takes_contiguous_run() {
        let mut bt = BindingTable::new(false);
        bt.get_or_create(OsResource::new(1), 0, BindingKind::Regular, &[state(0)]).unwrap();
        let run = [state(0x1000), state(0x2000), state(0x3000)];
        let first = bt.get_or_create(OsResource::new(2), 0, BindingKind::Vme, &run).unwrap();
        assert_eq!(first, 2);
        assert_eq!(bt.counters().vme, 3);
        let next = bt.get_or_create(OsResource::new(3), 0, BindingKind::Regular, &[state(0)]).unwrap();
        assert_eq!(next, 5);
    }

    #[test]
    fn test_debug_index_pinned() {
        let mut bt = BindingTable::new(true);
        assert!(bt.debug_pinned());
        for i in 0..MAX_SURFACE_STATES_PER_BT as u32 {
            let idx = bt
                .get_or_create(OsResource::new(i), 0, BindingKind::Regular, &[state(0)])
                .unwrap();
            assert_ne!(idx, DEBUG_SURFACE_INDEX);
            assert_ne!(idx, NULL_SURFACE_BINDING_INDEX);
        }
    }

    #[test]
    fn test_per_kernel_limit() {
        let mut bt = BindingTable::new(false);
        for i in 0..MAX_SURFACE_STATES_PER_BT as u32 {
            bt.get_or_create(OsResource::new(i), 0, BindingKind::Regular, &[state(0)]).unwrap();
        }
        let over = bt.get_or_create(OsResource::new(100), 0, BindingKind::Regular, &[state(0)]);
        assert_eq!(over, Err(Error::ResourceExhausted));
        // the next kernel starts a fresh count and may reuse existing indices
        bt.begin_kernel();
        assert_eq!(
            bt.get_or_create(OsResource::new(0), 0, BindingKind::Regular, &[state(0)]),
            Ok(1)
        );
        assert_eq!(bt.kernel_state_count(), 1);
    }

    #[test]
    fn test_buffer_state_splits_size() {
        let desc = SurfaceStateDesc {
            kind: SurfaceKind::Buffer,
            width: 0x1000,
            height: 1,
            ..state(0x2_0000_0000)
        };
        let dw = desc.encode();
        let n = 0xFFF;
        assert_eq!(dw[2] & 0x7F, n & 0x7F);
        assert_eq!((dw[2] >> 16) & 0x3FFF, (n >> 7) & 0x3FFF);
        assert_eq!(dw[9], 0x2);
        assert_eq!(dw[0] >> 29, SURFTYPE_BUFFER);
    }
}
