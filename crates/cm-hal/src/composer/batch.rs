//! # Batch-Buffer Pool
//!
//! Second-level batch buffers holding MEDIA_OBJECT dispatches for tasks
//! that do not use a walker.
//!
//! Each buffer is split into one segment per kernel; a segment is that
//! kernel's MEDIA_OBJECT commands followed by MI_BATCH_BUFFER_END, so the
//! ring can chain into segment `i` and return. One trailing end marker
//! follows the last segment.
//!
//! A buffer built for the same kernels with the same geometry is reused.
//! While more than one task references a buffer its body is left alone
//! unless a rebuild is forced; only the trailing marker is switched to a
//! no-op, and the next rebuild writes it back.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use cm_cmd::{CommandBuffer, MediaObject, MediaStateFlush, MiBatchBufferEnd, MiNoop};
use cm_core::consts::MAX_KERNELS_PER_TASK;
use cm_core::{Error, GpuAddr, OsResource, Result};
use cm_os::{LockFlags, OsInterface, ResourceDesc};

use crate::params::KernelId;

/// Buffers in the pool
pub const BATCH_BUFFER_COUNT: usize = 4;
/// Bytes per buffer
pub const BATCH_BUFFER_SIZE: u32 = 64 * 1024;

// =============================================================================
// TYPES
// =============================================================================

/// What one kernel's segment dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchKernel {
    /// Interface descriptor index
    pub interface_descriptor: u8,
    /// Threads per row
    pub width: u32,
    /// Threads launched
    pub threads: u32,
}

/// One pooled buffer
#[derive(Debug)]
pub struct BatchBuffer {
    /// Backing resource
    pub resource: OsResource,
    /// Kernels the contents were built for
    pub kernels: ArrayVec<KernelId, MAX_KERNELS_PER_TASK>,
    /// Dispatch geometry the contents were built for
    pub geometry: ArrayVec<BatchKernel, MAX_KERNELS_PER_TASK>,
    /// Segment byte offsets, one per kernel
    pub segments: ArrayVec<u32, MAX_KERNELS_PER_TASK>,
    /// Tasks referencing the buffer
    pub ref_count: u32,
    /// Sync tag of the last submission using it
    pub sync_tag: u64,
    /// Contents are valid for `kernels` and `geometry`
    pub built: bool,
    /// Byte offset of the trailing end marker
    pub tail: u32,
    /// Trailing end marker is live
    pub end_marker: bool,
}

impl BatchBuffer {
    /// Whether no task references the buffer
    pub fn is_idle(&self) -> bool {
        self.ref_count == 0
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    /// Bodies written
    pub builds: u64,
    /// Bodies reused untouched
    pub reuses: u64,
    /// Selections that shared a busy buffer
    pub shared: u64,
}

// =============================================================================
// POOL
// =============================================================================

/// Fixed pool of batch buffers
#[derive(Debug)]
pub struct BatchBufferPool {
    buffers: Vec<BatchBuffer>,
    size: u32,
    stats: BatchStats,
}

impl BatchBufferPool {
    /// Allocate `count` buffers of `size` bytes
    pub fn create<O: OsInterface + ?Sized>(os: &mut O, count: usize, size: u32) -> Result<Self> {
        let mut buffers: Vec<BatchBuffer> = Vec::with_capacity(count);
        for _ in 0..count {
            let resource = match os.allocate_resource(&ResourceDesc::new(size as usize, "CmBatchBuffer")) {
                Ok(res) => res,
                Err(e) => {
                    for b in &buffers {
                        if let Err(free) = os.free_resource(b.resource) {
                            log::warn!("cm-hal: failed to free batch buffer {}: {}", b.resource, free);
                        }
                    }
                    return Err(e);
                }
            };
            buffers.push(BatchBuffer {
                resource,
                kernels: ArrayVec::new(),
                geometry: ArrayVec::new(),
                segments: ArrayVec::new(),
                ref_count: 0,
                sync_tag: 0,
                built: false,
                tail: 0,
                end_marker: false,
            });
        }
        Ok(Self {
            buffers,
            size,
            stats: BatchStats::default(),
        })
    }

    /// Release every buffer
    pub fn destroy<O: OsInterface + ?Sized>(&self, os: &mut O) {
        for b in &self.buffers {
            if let Err(e) = os.free_resource(b.resource) {
                log::warn!("cm-hal: failed to free batch buffer {}: {}", b.resource, e);
            }
        }
    }

    /// Buffer `index`
    pub fn get(&self, index: usize) -> Result<&BatchBuffer> {
        self.buffers.get(index).ok_or(Error::InvalidParameter)
    }

    /// Statistics
    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    /// Pick a buffer for a task dispatching `kernels` with `geometry` and
    /// reference it
    ///
    /// Prefers an idle buffer already built for the same body, then a busy
    /// one (shared), then an unbuilt idle buffer, then the least recently
    /// submitted idle one.
    pub fn select(&mut self, kernels: &[KernelId], geometry: &[BatchKernel]) -> Result<usize> {
        let matches = |b: &BatchBuffer| {
            b.built && b.kernels.as_slice() == kernels && b.geometry.as_slice() == geometry
        };
        let index = if let Some(i) = self.buffers.iter().position(|b| b.is_idle() && matches(b)) {
            i
        } else if let Some(i) = self.buffers.iter().position(|b| !b.is_idle() && matches(b)) {
            self.stats.shared += 1;
            i
        } else if let Some(i) = self.victim() {
            let b = &mut self.buffers[i];
            b.kernels = kernels.iter().copied().collect();
            b.geometry = geometry.iter().copied().collect();
            b.segments.clear();
            b.built = false;
            i
        } else {
            log::debug!("cm-hal: all {} batch buffers busy", self.buffers.len());
            return Err(Error::ResourceExhausted);
        };
        self.buffers[index].ref_count += 1;
        Ok(index)
    }

    /// Idle buffer to rebuild for a new body
    fn victim(&self) -> Option<usize> {
        let idle = || self.buffers.iter().enumerate().filter(|(_, b)| b.is_idle());
        idle()
            .find(|(_, b)| !b.built)
            .or_else(|| idle().min_by_key(|(_, b)| b.sync_tag))
            .map(|(i, _)| i)
    }

    /// Write the buffer body unless other tasks still read it
    ///
    /// A shared buffer keeps its body and only has its trailing end marker
    /// skipped. Returns whether the body was rewritten.
    pub fn prepare<O: OsInterface + ?Sized>(
        &mut self,
        os: &mut O,
        index: usize,
        kernels: &[BatchKernel],
        force_rebuild: bool,
    ) -> Result<bool> {
        let size = self.size;
        let buffer = self.buffers.get_mut(index).ok_or(Error::InvalidParameter)?;
        if buffer.built && buffer.ref_count > 1 && !force_rebuild {
            if buffer.end_marker {
                os.lock_resource(buffer.resource, LockFlags::WRITE)?;
                let written = os.write_resource(buffer.resource, buffer.tail as usize, &MiNoop::DWORD.to_le_bytes());
                os.unlock_resource(buffer.resource)?;
                written?;
                buffer.end_marker = false;
            }
            self.stats.reuses += 1;
            log::debug!("cm-hal: reusing batch buffer {} ({} users)", index, buffer.ref_count);
            return Ok(false);
        }

        let mut body = CommandBuffer::new(size);
        let mut segments = ArrayVec::new();
        for k in kernels {
            segments.try_push(body.offset()).map_err(|_| Error::InvalidParameter)?;
            let width = k.width.max(1);
            for t in 0..k.threads {
                body.add(&MediaObject {
                    interface_descriptor: k.interface_descriptor,
                    x: t % width,
                    y: t / width,
                })?;
            }
            body.add(&MediaStateFlush {
                interface_descriptor: k.interface_descriptor,
            })?;
            body.add(&MiBatchBufferEnd)?;
        }
        let tail = body.offset();
        body.add(&MiBatchBufferEnd)?;

        os.lock_resource(buffer.resource, LockFlags::WRITE)?;
        let written = os.write_resource(buffer.resource, 0, &body.to_bytes());
        os.unlock_resource(buffer.resource)?;
        written?;

        buffer.geometry = kernels.iter().copied().collect();
        buffer.segments = segments;
        buffer.tail = tail;
        buffer.end_marker = true;
        buffer.built = true;
        self.stats.builds += 1;
        Ok(true)
    }

    /// GPU address of a kernel's segment
    pub fn segment_addr<O: OsInterface + ?Sized>(&self, os: &O, index: usize, kernel: usize) -> Result<GpuAddr> {
        let buffer = self.get(index)?;
        let offset = *buffer.segments.get(kernel).ok_or(Error::InvalidParameter)?;
        Ok(os.gfx_address(buffer.resource)?.offset(offset as u64))
    }

    /// Record the submission that uses a buffer
    pub fn mark_submitted(&mut self, index: usize, sync_tag: u64) {
        if let Some(b) = self.buffers.get_mut(index) {
            b.sync_tag = sync_tag;
        }
    }

    /// Drop a task's reference
    pub fn release(&mut self, index: usize) {
        if let Some(b) = self.buffers.get_mut(index) {
            b.ref_count = b.ref_count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_os::SimOs;

    fn ids(raw: &[u64]) -> Vec<KernelId> {
        raw.iter().map(|&r| KernelId::new(r)).collect()
    }

    fn one_kernel(threads: u32) -> [BatchKernel; 1] {
        [BatchKernel {
            interface_descriptor: 0,
            width: 4,
            threads,
        }]
    }

    fn dwords(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_select_prefers_matching_buffer() {
        let mut os = SimOs::new();
        let mut pool = BatchBufferPool::create(&mut os, 2, 4096).unwrap();
        let a = pool.select(&ids(&[1]), &one_kernel(4)).unwrap();
        pool.prepare(&mut os, a, &one_kernel(4), false).unwrap();
        pool.release(a);
        let b = pool.select(&ids(&[2]), &one_kernel(4)).unwrap();
        assert_ne!(a, b);
        pool.release(b);
        assert_eq!(pool.select(&ids(&[1]), &one_kernel(4)).unwrap(), a);
    }

    #[test]
    fn test_rebuild_takes_least_recent_idle_buffer() {
        let mut os = SimOs::new();
        let mut pool = BatchBufferPool::create(&mut os, 2, 4096).unwrap();
        let a = pool.select(&ids(&[1]), &one_kernel(4)).unwrap();
        pool.prepare(&mut os, a, &one_kernel(4), false).unwrap();
        pool.mark_submitted(a, 5);
        pool.release(a);
        let b = pool.select(&ids(&[2]), &one_kernel(4)).unwrap();
        pool.prepare(&mut os, b, &one_kernel(4), false).unwrap();
        pool.mark_submitted(b, 6);
        pool.release(b);

        assert_eq!(pool.select(&ids(&[3]), &one_kernel(4)).unwrap(), a);
        assert_eq!(pool.get(b).unwrap().kernels.as_slice(), ids(&[2]).as_slice());
    }

    #[test]
    fn test_busy_match_is_shared() {
        let mut os = SimOs::new();
        let mut pool = BatchBufferPool::create(&mut os, 1, 4096).unwrap();
        let a = pool.select(&ids(&[1]), &one_kernel(4)).unwrap();
        pool.prepare(&mut os, a, &one_kernel(4), false).unwrap();
        assert_eq!(pool.select(&ids(&[1]), &one_kernel(4)).unwrap(), a);
        assert_eq!(pool.get(a).unwrap().ref_count, 2);
        assert_eq!(pool.stats().shared, 1);
        assert_eq!(pool.select(&ids(&[3]), &one_kernel(4)), Err(Error::ResourceExhausted));
    }

    #[test]
    fn test_busy_buffer_with_other_geometry_not_shared() {
        let mut os = SimOs::new();
        let mut pool = BatchBufferPool::create(&mut os, 2, 4096).unwrap();
        let a = pool.select(&ids(&[7]), &one_kernel(4)).unwrap();
        pool.prepare(&mut os, a, &one_kernel(4), false).unwrap();

        let b = pool.select(&ids(&[7]), &one_kernel(16)).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.stats().shared, 0);
        assert!(pool.prepare(&mut os, b, &one_kernel(16), false).unwrap());
        assert_eq!(pool.get(a).unwrap().ref_count, 1);

        assert_eq!(pool.select(&ids(&[7]), &one_kernel(8)), Err(Error::ResourceExhausted));
    }

    #[test]
    fn test_shared_body_skips_only_end_marker() {
        let mut os = SimOs::new();
        let gpu = os.gpu();
        let mut pool = BatchBufferPool::create(&mut os, 1, 4096).unwrap();
        let a = pool.select(&ids(&[1]), &one_kernel(4)).unwrap();
        assert!(pool.prepare(&mut os, a, &one_kernel(4), false).unwrap());
        let res = pool.get(a).unwrap().resource;
        let tail = pool.get(a).unwrap().tail as usize / 4;
        let before = dwords(&gpu.resource_bytes(res).unwrap());
        assert_eq!(before[tail], MiBatchBufferEnd::DWORD);

        pool.select(&ids(&[1]), &one_kernel(4)).unwrap();
        assert!(!pool.prepare(&mut os, a, &one_kernel(4), false).unwrap());
        assert!(!pool.get(a).unwrap().end_marker);
        let shared = dwords(&gpu.resource_bytes(res).unwrap());
        let changed: Vec<usize> = (0..before.len()).filter(|&i| before[i] != shared[i]).collect();
        assert_eq!(changed, vec![tail]);
        assert_eq!(shared[tail], MiNoop::DWORD);
        assert_eq!(pool.stats().reuses, 1);

        assert!(pool.prepare(&mut os, a, &one_kernel(4), true).unwrap());
        assert!(pool.get(a).unwrap().end_marker);
        assert_eq!(dwords(&gpu.resource_bytes(res).unwrap()), before);
        assert!(!gpu.is_locked(res));
    }

    #[test]
    fn test_segments_end_with_batch_end() {
        let mut os = SimOs::new();
        let gpu = os.gpu();
        let mut pool = BatchBufferPool::create(&mut os, 1, 4096).unwrap();
        let kernels = [
            BatchKernel { interface_descriptor: 0, width: 2, threads: 2 },
            BatchKernel { interface_descriptor: 1, width: 1, threads: 1 },
        ];
        let a = pool.select(&ids(&[1, 2]), &kernels).unwrap();
        pool.prepare(&mut os, a, &kernels, false).unwrap();
        let buffer = pool.get(a).unwrap();
        let body = dwords(&gpu.resource_bytes(buffer.resource).unwrap());
        let second = buffer.segments[1] as usize / 4;
        assert_eq!(body[second - 1], MiBatchBufferEnd::DWORD);
        let tail = buffer.tail as usize / 4;
        assert_eq!(body[tail - 1], MiBatchBufferEnd::DWORD);
        assert_eq!(body[tail], MiBatchBufferEnd::DWORD);
    }

    #[test]
    fn test_failed_create_leaves_nothing_allocated() {
        let mut os = SimOs::new();
        let gpu = os.gpu();
        assert!(BatchBufferPool::create(&mut os, 2, 0).is_err());
        assert_eq!(gpu.live_resources(), 0);
    }

    #[test]
    fn test_oversized_body_overflows() {
        let mut os = SimOs::new();
        let mut pool = BatchBufferPool::create(&mut os, 1, 256).unwrap();
        let a = pool.select(&ids(&[1]), &one_kernel(64)).unwrap();
        assert!(matches!(
            pool.prepare(&mut os, a, &one_kernel(64), false),
            Err(Error::BufferOverflow { .. })
        ));
    }
}
