//! # Kernel Binary Cache
//!
//! Placement of kernel binaries in the kernel region of the state heap.
//!
//! ## Layout
//!
//! The region is covered by an ordered list of entries with no gaps, each
//! either free or allocated. Allocation is first-fit with splitting; freeing
//! merges with free neighbours. Because entries are addressed by position,
//! every insertion or removal renumbers the head references of clone
//! entries to its right.
//!
//! ## Clones
//!
//! A kernel loaded as a clone of a resident kernel gets a 64-byte
//! placeholder that reports the head's binary offset. The head cannot be
//! evicted while clones reference it; a head whose kernel is unregistered
//! stays allocated, detached, until its last clone goes.

use alloc::vec::Vec;

use cm_core::consts::{
    CLONE_ENTRY_SIZE, KERNEL_BINARY_PADDING_SIZE, KERNEL_CACHE_HIT_TO_MISS_RATIO,
    KERNEL_CACHE_MISS_THRESHOLD,
};
use cm_core::{Error, Result};

use crate::params::KernelId;

// =============================================================================
// ENTRIES
// =============================================================================

/// Whether an entry holds a binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Unused space
    Free,
    /// Holds a binary or a clone placeholder
    Allocated,
}

/// Role of an entry in cloning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneType {
    /// Ordinary kernel
    NoClone,
    /// Placeholder sharing a head's binary
    CloneEntry,
    /// Kernel other entries clone
    HeadKernel,
    /// Clone loaded with its own binary because its head was absent
    CloneAsHead,
}

/// One span of the kernel region
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Free or allocated
    pub state: EntryState,
    /// Byte offset in the kernel region
    pub offset: u32,
    /// Bytes covered
    pub size: u32,
    /// Kernel loaded here; `None` once detached
    pub kernel: Option<KernelId>,
    /// Cloning role
    pub clone_type: CloneType,
    /// Index of the head entry of a clone
    pub head: Option<usize>,
    /// Clone entries referencing this one
    pub clone_count: u32,
    /// Use stamp for LRU eviction
    pub last_used: u64,
    /// Tasks in flight using this entry
    pub in_flight: u32,
    /// Stable identity, unchanged by renumbering
    pub serial: u64,
}

impl CacheEntry {
    fn free(offset: u32, size: u32) -> Self {
        Self {
            state: EntryState::Free,
            offset,
            size,
            kernel: None,
            clone_type: CloneType::NoClone,
            head: None,
            clone_count: 0,
            last_used: 0,
            in_flight: 0,
            serial: 0,
        }
    }

    fn is_allocated(&self) -> bool {
        self.state == EntryState::Allocated
    }

    fn evictable(&self) -> bool {
        self.is_allocated()
            && self.in_flight == 0
            && self.clone_count == 0
            && self.clone_type != CloneType::CloneEntry
    }
}

/// Where a kernel's binary can be fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLocation {
    /// Byte offset of the binary in the kernel region
    pub offset: u32,
    /// Bytes reserved for the entry
    pub size: u32,
    /// Already resident before this call
    pub hit: bool,
    /// The caller must copy the binary to `offset`
    pub needs_upload: bool,
    /// Pin handle to release with [`KernelCache::unpin`]
    pub serial: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups that found the kernel resident
    pub hits: u64,
    /// Lookups that had to load it
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Full compactions
    pub compactions: u64,
}

const fn pad(size: u32) -> u32 {
    (size + KERNEL_BINARY_PADDING_SIZE - 1) & !(KERNEL_BINARY_PADDING_SIZE - 1)
}

// =============================================================================
// CACHE
// =============================================================================

/// Kernel binary placement over a fixed region
#[derive(Debug)]
pub struct KernelCache {
    entries: Vec<CacheEntry>,
    region_size: u32,
    clock: u64,
    next_serial: u64,
    hits: u32,
    misses: u32,
    stats: CacheStats,
}

impl KernelCache {
    /// Cache over `region_size` bytes
    pub fn new(region_size: u32) -> Self {
        Self {
            entries: alloc::vec![CacheEntry::free(0, region_size)],
            region_size,
            clock: 0,
            next_serial: 1,
            hits: 0,
            misses: 0,
            stats: CacheStats::default(),
        }
    }

    /// Region size
    pub fn region_size(&self) -> u32 {
        self.region_size
    }

    /// Allocated bytes
    pub fn used(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.is_allocated())
            .map(|e| e.size)
            .sum()
    }

    /// Entries in offset order
    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    /// Statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn find(&self, id: KernelId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.is_allocated() && e.kernel == Some(id))
    }

    fn find_serial(&self, serial: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.is_allocated() && e.serial == serial)
    }

    /// Binary offset an entry reports; clones report their head's
    fn binary_offset(&self, index: usize) -> u32 {
        let entry = &self.entries[index];
        match (entry.clone_type, entry.head) {
            (CloneType::CloneEntry, Some(head)) => self.entries[head].offset,
            _ => entry.offset,
        }
    }

    /// Whether a kernel is resident
    pub fn contains(&self, id: KernelId) -> bool {
        self.find(id).is_some()
    }

    /// Make a kernel resident and pin it
    ///
    /// `clone_of` names the kernel whose binary this one duplicates. The
    /// returned location stays pinned until [`unpin`](Self::unpin) is
    /// called with its serial.
    pub fn ensure_resident(
        &mut self,
        id: KernelId,
        binary_len: u32,
        clone_of: Option<KernelId>,
    ) -> Result<KernelLocation> {
        if binary_len == 0 {
            return Err(Error::NullPointer);
        }
        self.clock += 1;
        if let Some(index) = self.find(id) {
            self.hits = self.hits.saturating_add(1);
            self.stats.hits += 1;
            let clock = self.clock;
            let entry = &mut self.entries[index];
            entry.last_used = clock;
            entry.in_flight += 1;
            let (size, serial) = (entry.size, entry.serial);
            return Ok(KernelLocation {
                offset: self.binary_offset(index),
                size,
                hit: true,
                needs_upload: false,
                serial,
            });
        }

        self.misses = self.misses.saturating_add(1);
        self.stats.misses += 1;

        let head = clone_of
            .and_then(|h| self.find(h))
            .filter(|&h| self.entries[h].clone_type != CloneType::CloneEntry);

        let index = match head {
            Some(head_index) => {
                let head_serial = self.entries[head_index].serial;
                self.entries[head_index].in_flight += 1;
                let allocated = self.allocate(CLONE_ENTRY_SIZE);
                let head_index = self.find_serial(head_serial).ok_or(Error::InvalidParameter)?;
                self.entries[head_index].in_flight -= 1;
                let index = allocated?;
                let head_entry = &mut self.entries[head_index];
                head_entry.clone_count += 1;
                if head_entry.clone_type == CloneType::NoClone {
                    head_entry.clone_type = CloneType::HeadKernel;
                }
                let entry = &mut self.entries[index];
                entry.clone_type = CloneType::CloneEntry;
                entry.head = Some(head_index);
                index
            }
            None => {
                let index = self.allocate(pad(binary_len))?;
                if clone_of.is_some() {
                    self.entries[index].clone_type = CloneType::CloneAsHead;
                }
                index
            }
        };

        let serial = self.next_serial;
        self.next_serial += 1;
        let clock = self.clock;
        let entry = &mut self.entries[index];
        entry.kernel = Some(id);
        entry.last_used = clock;
        entry.in_flight = 1;
        entry.serial = serial;
        let size = entry.size;
        let needs_upload = entry.clone_type != CloneType::CloneEntry;
        log::debug!(
            "cm-hal: loaded {} at 0x{:x} ({} bytes{})",
            id,
            self.binary_offset(index),
            size,
            if needs_upload { "" } else { ", clone" }
        );
        Ok(KernelLocation {
            offset: self.binary_offset(index),
            size,
            hit: false,
            needs_upload,
            serial,
        })
    }

    /// Take another pin on an entry
    pub fn pin(&mut self, serial: u64) -> Result<()> {
        let index = self.find_serial(serial).ok_or(Error::InvalidParameter)?;
        self.entries[index].in_flight += 1;
        Ok(())
    }

    /// Drop a pin; a detached entry with no users is freed
    pub fn unpin(&mut self, serial: u64) {
        let Some(index) = self.find_serial(serial) else {
            return;
        };
        let entry = &mut self.entries[index];
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if entry.in_flight == 0 && entry.kernel.is_none() && entry.clone_count == 0 {
            self.release_entry(index);
        }
    }

    /// Forget a kernel
    ///
    /// Entries still in flight, or heads with live clones, are detached
    /// and freed once their last user goes.
    pub fn unregister(&mut self, id: KernelId) -> Result<()> {
        let index = self.find(id).ok_or(Error::InvalidParameter)?;
        let entry = &mut self.entries[index];
        if entry.in_flight > 0 || entry.clone_count > 0 {
            entry.kernel = None;
            return Ok(());
        }
        self.release_entry(index);
        Ok(())
    }

    /// Whether the hit/miss ratio calls for a full compaction
    pub fn should_compact(&self) -> bool {
        self.misses >= KERNEL_CACHE_MISS_THRESHOLD
            && self.hits < self.misses.saturating_mul(KERNEL_CACHE_HIT_TO_MISS_RATIO)
    }

    /// Evict every idle entry and reset the hit/miss counters
    pub fn compact(&mut self) {
        while let Some(index) = self.entries.iter().position(CacheEntry::evictable) {
            self.stats.evictions += 1;
            self.release_entry(index);
        }
        self.hits = 0;
        self.misses = 0;
        self.stats.compactions += 1;
        log::debug!("cm-hal: kernel cache compacted, {} bytes in use", self.used());
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    fn allocate(&mut self, size: u32) -> Result<usize> {
        if size > self.region_size {
            return Err(Error::InvalidParameter);
        }
        let mut compacted = false;
        loop {
            if let Some(index) = self
                .entries
                .iter()
                .position(|e| !e.is_allocated() && e.size >= size)
            {
                self.split(index, size);
                return Ok(index);
            }
            if !compacted && self.should_compact() {
                compacted = true;
                self.compact();
                continue;
            }
            let victim = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.evictable())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i)
                .ok_or(Error::ResourceExhausted)?;
            log::debug!("cm-hal: evicting {:?}", self.entries[victim].kernel);
            self.stats.evictions += 1;
            self.release_entry(victim);
        }
    }

    /// Mark `index` allocated with exactly `size` bytes
    fn split(&mut self, index: usize, size: u32) {
        let entry = &mut self.entries[index];
        entry.state = EntryState::Allocated;
        if entry.size > size {
            let rest = CacheEntry::free(entry.offset + size, entry.size - size);
            entry.size = size;
            self.entries.insert(index + 1, rest);
            self.shift_heads(index + 1, 1);
        }
    }

    /// Renumber head references at or past `from`
    fn shift_heads(&mut self, from: usize, delta: isize) {
        for entry in &mut self.entries {
            if let Some(head) = entry.head.as_mut() {
                if *head >= from {
                    *head = head.wrapping_add_signed(delta);
                }
            }
        }
    }

    fn remove(&mut self, index: usize) {
        self.entries.remove(index);
        self.shift_heads(index + 1, -1);
    }

    fn release_entry(&mut self, index: usize) {
        let mut head_to_free = None;
        if let (CloneType::CloneEntry, Some(head)) =
            (self.entries[index].clone_type, self.entries[index].head)
        {
            let head_entry = &mut self.entries[head];
            head_entry.clone_count = head_entry.clone_count.saturating_sub(1);
            if head_entry.clone_count == 0 {
                if head_entry.clone_type == CloneType::HeadKernel {
                    head_entry.clone_type = CloneType::NoClone;
                }
                if head_entry.kernel.is_none() && head_entry.in_flight == 0 {
                    head_to_free = Some(head);
                }
            }
        }

        let entry = &mut self.entries[index];
        let (offset, size) = (entry.offset, entry.size);
        *entry = CacheEntry::free(offset, size);

        if index + 1 < self.entries.len() && !self.entries[index + 1].is_allocated() {
            self.entries[index].size += self.entries[index + 1].size;
            self.remove(index + 1);
            head_to_free = head_to_free.map(|h| if h > index + 1 { h - 1 } else { h });
        }
        if index > 0 && !self.entries[index - 1].is_allocated() {
            self.entries[index - 1].size += self.entries[index].size;
            self.remove(index);
            head_to_free = head_to_free.map(|h| if h > index { h - 1 } else { h });
        }

        if let Some(head) = head_to_free {
            self.release_entry(head);
        }
    }

    // =========================================================================
    // Checks
    // =========================================================================

    /// Check layout and clone bookkeeping
    pub fn validate(&self) -> Result<()> {
        let mut expected = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.offset != expected || entry.size == 0 {
                return Err(Error::InvalidParameter);
            }
            expected += entry.size;
            if i > 0 && !entry.is_allocated() && !self.entries[i - 1].is_allocated() {
                return Err(Error::InvalidParameter);
            }
            if entry.clone_type == CloneType::CloneEntry {
                let head = entry
                    .head
                    .and_then(|h| self.entries.get(h))
                    .ok_or(Error::InvalidParameter)?;
                if !head.is_allocated()
                    || !matches!(head.clone_type, CloneType::HeadKernel | CloneType::CloneAsHead)
                {
                    return Err(Error::InvalidParameter);
                }
            }
            let clones = self
                .entries
                .iter()
                .filter(|e| e.clone_type == CloneType::CloneEntry && e.head == Some(i))
                .count() as u32;
            if clones != entry.clone_count {
                return Err(Error::InvalidParameter);
            }
        }
        if expected != self.region_size {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: u32 = 4096;

    fn id(n: u64) -> KernelId {
        KernelId::new(n)
    }

    #[test]
    fn test_hit_after_load() {
        let mut cache = KernelCache::new(REGION);
        let first = cache.ensure_resident(id(1), 300, None).unwrap();
        assert!(!first.hit && first.needs_upload);
        assert_eq!((first.offset, first.size), (0, 384));
        let second = cache.ensure_resident(id(1), 300, None).unwrap();
        assert!(second.hit && !second.needs_upload);
        assert_eq!(second.serial, first.serial);
        assert_eq!(cache.stats().hits, 1);
        cache.validate().unwrap();
    }

    #[test]
    fn test_clone_reports_head_offset() {
        let mut cache = KernelCache::new(REGION);
        cache.ensure_resident(id(1), 128, None).unwrap();
        let head = cache.ensure_resident(id(2), 256, None).unwrap();
        let clone = cache.ensure_resident(id(3), 256, Some(id(2))).unwrap();
        assert_eq!(clone.offset, head.offset);
        assert!(!clone.needs_upload);
        assert_eq!(clone.size, CLONE_ENTRY_SIZE);
        cache.validate().unwrap();

        // head absent: the clone carries its own binary
        let orphan = cache.ensure_resident(id(5), 256, Some(id(4))).unwrap();
        assert!(orphan.needs_upload);
        let idx = cache.find(id(5)).unwrap();
        assert_eq!(cache.entries()[idx].clone_type, CloneType::CloneAsHead);
    }

    #[test]
    fn test_clone_shift_keeps_heads() {
        let mut cache = KernelCache::new(REGION);
        let a = cache.ensure_resident(id(1), 256, None).unwrap();
        let head = cache.ensure_resident(id(2), 128, None).unwrap();
        let c1 = cache.ensure_resident(id(3), 128, Some(id(2))).unwrap();
        let b = cache.ensure_resident(id(4), 128, None).unwrap();
        let c2 = cache.ensure_resident(id(5), 128, Some(id(2))).unwrap();
        for s in [a.serial, head.serial, c1.serial, b.serial, c2.serial] {
            cache.unpin(s);
        }
        // free entries left of the head, forcing merges that shift indices
        cache.unregister(id(1)).unwrap();
        cache.validate().unwrap();
        cache.unregister(id(4)).unwrap();
        cache.validate().unwrap();
        // a fresh allocation splits the free span before the clones
        cache.ensure_resident(id(6), 64, None).unwrap();
        cache.validate().unwrap();
        assert_eq!(cache.entries()[2].kernel, Some(id(2)));
        let c = cache.find(id(5)).unwrap();
        assert_eq!(cache.binary_offset(c), head.offset);

        // unregistering the head detaches it until the clones go
        cache.unregister(id(2)).unwrap();
        assert!(!cache.contains(id(2)));
        assert_eq!(cache.find(id(3)).map(|i| cache.binary_offset(i)), Some(head.offset));
        cache.unregister(id(3)).unwrap();
        cache.validate().unwrap();
        cache.unregister(id(5)).unwrap();
        cache.validate().unwrap();
        assert_eq!(cache.used(), 128);
    }

    #[test]
    fn test_eviction_skips_pinned_and_heads() {
        let mut cache = KernelCache::new(1024);
        let a = cache.ensure_resident(id(1), 512, None).unwrap();
        let b = cache.ensure_resident(id(2), 384, None).unwrap();
        cache.unpin(b.serial);
        // a is pinned, so b is evicted
        let c = cache.ensure_resident(id(3), 512, None).unwrap();
        assert_eq!(c.offset, 512);
        assert!(!cache.contains(id(2)));
        // everything pinned: no room
        assert_eq!(
            cache.ensure_resident(id(4), 512, None),
            Err(Error::ResourceExhausted)
        );
        cache.unpin(a.serial);
        cache.unpin(c.serial);
        assert!(cache.ensure_resident(id(4), 512, None).is_ok());
        cache.validate().unwrap();
    }

    #[test]
    fn test_compaction_heuristic() {
        let mut cache = KernelCache::new(REGION);
        for n in 0..4 {
            let loc = cache.ensure_resident(id(n), 128, None).unwrap();
            cache.unpin(loc.serial);
        }
        assert!(cache.should_compact());
        cache.compact();
        assert!(!cache.should_compact());
        assert_eq!(cache.used(), 0);
        assert_eq!(cache.entries().len(), 1);
        assert_eq!(cache.stats().compactions, 1);
    }

    #[test]
    fn test_detached_in_flight_freed_on_unpin() {
        let mut cache = KernelCache::new(REGION);
        let loc = cache.ensure_resident(id(1), 128, None).unwrap();
        cache.unregister(id(1)).unwrap();
        assert_eq!(cache.used(), 128);
        cache.unpin(loc.serial);
        assert_eq!(cache.used(), 0);
        cache.validate().unwrap();
    }
}
