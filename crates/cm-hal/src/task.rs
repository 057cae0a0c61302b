//! # Task Manager
//!
//! Fixed table of task slots handed out round-robin.
//!
//! A slot is occupied from acquisition until the caller observes the task
//! as finished (or reset) through a query. Acquisition scans from a
//! rotating cursor so recently freed slots are not immediately reused.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use cm_core::consts::MAX_KERNELS_PER_TASK;
use cm_core::{Error, Result, TaskId, TaskStatus};

use crate::params::{DispatchMode, KernelId};

// =============================================================================
// TASK RECORD
// =============================================================================

/// Which timestamp resource a task reports through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEngine {
    /// Render/compute command streamer
    Render,
    /// Video enhancement engine
    Vebox,
}

/// Bookkeeping for an occupied slot
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Engine the task runs on
    pub engine: TaskEngine,
    /// Kernels dispatched
    pub kernels: ArrayVec<KernelId, MAX_KERNELS_PER_TASK>,
    /// Kernel-cache pins held until completion
    pub cache_pins: ArrayVec<u64, MAX_KERNELS_PER_TASK>,
    /// Dispatch mode
    pub mode: Option<DispatchMode>,
    /// Barrier bitmap actually composed
    pub sync_bitmap: u64,
    /// Conditional-end bitmap
    pub conditional_end_bitmap: u64,
    /// Batch buffer referenced
    pub batch: Option<usize>,
    /// Sync tag written on completion
    pub sync_tag: u64,
    /// Tracker tag written on completion
    pub tracker_tag: u64,
    /// CPU time at submission
    pub cpu_submit_time: u64,
    /// GPU time at submission
    pub gpu_submit_time: u64,
    /// Explicitly invalidated
    pub reset: bool,
}

impl TaskRecord {
    fn new(engine: TaskEngine) -> Self {
        Self {
            engine,
            kernels: ArrayVec::new(),
            cache_pins: ArrayVec::new(),
            mode: None,
            sync_bitmap: 0,
            conditional_end_bitmap: 0,
            batch: None,
            sync_tag: 0,
            tracker_tag: 0,
            cpu_submit_time: 0,
            gpu_submit_time: 0,
            reset: false,
        }
    }
}

/// Result of a task query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskReport {
    /// Lifecycle state
    pub status: TaskStatus,
    /// End minus begin, in GPU ticks
    pub duration_ticks: u64,
    /// Duration converted with the generation's tick period
    pub duration_ns: u64,
    /// Begin timestamp
    pub start_ticks: u64,
    /// End timestamp
    pub end_ticks: u64,
    /// CPU time at submission
    pub cpu_submit_time: u64,
    /// GPU time at submission
    pub gpu_submit_time: u64,
}

impl TaskReport {
    /// Report carrying only a status
    pub const fn status_only(status: TaskStatus) -> Self {
        Self {
            status,
            duration_ticks: 0,
            duration_ns: 0,
            start_ticks: 0,
            end_ticks: 0,
            cpu_submit_time: 0,
            gpu_submit_time: 0,
        }
    }
}

// =============================================================================
// TASK TABLE
// =============================================================================

/// Task table statistics
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    /// Successful acquisitions
    pub acquired: u64,
    /// Acquisitions refused for lack of a slot
    pub exhausted: u64,
    /// Slots released without completing
    pub rolled_back: u64,
}

/// Fixed set of task slots
#[derive(Debug)]
pub struct TaskTable {
    slots: Vec<Option<TaskRecord>>,
    cursor: usize,
    stats: TaskStats,
}

impl TaskTable {
    /// Create `max_tasks` free slots
    pub fn new(max_tasks: u32) -> Self {
        Self {
            slots: (0..max_tasks).map(|_| None).collect(),
            cursor: 0,
            stats: TaskStats::default(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Statistics
    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    /// Reserve the next free slot
    pub fn acquire(&mut self, engine: TaskEngine) -> Result<TaskId> {
        let n = self.slots.len();
        for step in 0..n {
            let index = (self.cursor + step) % n;
            if self.slots[index].is_none() {
                self.slots[index] = Some(TaskRecord::new(engine));
                self.cursor = (index + 1) % n;
                self.stats.acquired += 1;
                return Ok(TaskId::new(index as u32));
            }
        }
        self.stats.exhausted += 1;
        log::debug!("cm-hal: all {} task slots in flight", n);
        Err(Error::ResourceExhausted)
    }

    /// Give back a slot whose submission failed
    pub fn release(&mut self, id: TaskId) -> Option<TaskRecord> {
        let record = self.slots.get_mut(id.index() as usize)?.take();
        if record.is_some() {
            self.stats.rolled_back += 1;
        }
        record
    }

    /// Free a slot whose completion has been observed
    pub fn complete(&mut self, id: TaskId) -> Option<TaskRecord> {
        self.slots.get_mut(id.index() as usize)?.take()
    }

    /// Record of an occupied slot
    pub fn get(&self, id: TaskId) -> Result<&TaskRecord> {
        self.slots
            .get(id.index() as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidParameter)
    }

    /// Mutable record of an occupied slot
    pub fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord> {
        self.slots
            .get_mut(id.index() as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidParameter)
    }

    /// Invalidate one task
    pub fn reset(&mut self, id: TaskId) -> Result<()> {
        self.get_mut(id)?.reset = true;
        Ok(())
    }

    /// Invalidate every occupied slot
    pub fn reset_all(&mut self) {
        for record in self.slots.iter_mut().flatten() {
            record.reset = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_unique_until_exhausted() {
        let mut table = TaskTable::new(4);
        let ids: Vec<u32> = (0..4)
            .map(|_| table.acquire(TaskEngine::Render).unwrap().index())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(table.acquire(TaskEngine::Render), Err(Error::ResourceExhausted));
        assert_eq!(table.stats().exhausted, 1);
    }

    #[test]
    fn test_cursor_rotates_past_freed_slot() {
        let mut table = TaskTable::new(3);
        let a = table.acquire(TaskEngine::Render).unwrap();
        let _b = table.acquire(TaskEngine::Render).unwrap();
        table.complete(a);
        // cursor sits at 2, so slot 2 comes before the freed slot 0
        assert_eq!(table.acquire(TaskEngine::Render).unwrap().index(), 2);
        assert_eq!(table.acquire(TaskEngine::Render).unwrap().index(), 0);
    }

    #[test]
    fn test_free_slot_is_invalid() {
        let mut table = TaskTable::new(2);
        assert_eq!(table.get(TaskId::new(0)).err(), Some(Error::InvalidParameter));
        assert_eq!(table.get(TaskId::new(9)).err(), Some(Error::InvalidParameter));
        let id = table.acquire(TaskEngine::Vebox).unwrap();
        assert_eq!(table.get(id).unwrap().engine, TaskEngine::Vebox);
        assert!(table.release(id).is_some());
        assert_eq!(table.stats().rolled_back, 1);
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn test_reset_all_marks_occupied() {
        let mut table = TaskTable::new(2);
        let a = table.acquire(TaskEngine::Render).unwrap();
        table.reset_all();
        assert!(table.get(a).unwrap().reset);
        assert_eq!(table.reset(TaskId::new(1)), Err(Error::InvalidParameter));
    }
}
