//! Fixed-capacity handle tables.

use alloc::vec::Vec;

use cm_core::{Error, Result};

/// Dense slot array with free markers
///
/// Handles are slot indices. A handle is valid between `insert` and
/// `remove`; the table never grows past the capacity it was created with.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
}

impl<T> HandleTable<T> {
    /// Create `capacity` free slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Slot count
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slot count
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether no slot is occupied
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Store in the first free slot
    pub fn insert(&mut self, value: T) -> Result<u32> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ResourceExhausted)?;
        self.slots[index] = Some(value);
        Ok(index as u32)
    }

    /// Entry behind a handle
    pub fn get(&self, index: u32) -> Result<&T> {
        self.slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidHandle)
    }

    /// Mutable entry behind a handle
    pub fn get_mut(&mut self, index: u32) -> Result<&mut T> {
        self.slots
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidHandle)
    }

    /// Free a slot
    pub fn remove(&mut self, index: u32) -> Result<T> {
        self.slots
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(Error::InvalidHandle)
    }

    /// Occupied entries with their handles
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as u32, v)))
    }

    /// Empty every slot, returning what was stored
    pub fn drain(&mut self) -> Vec<T> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}
