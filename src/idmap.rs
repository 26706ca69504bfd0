//! Identifier mapping tables.
//!
//! Mapping files translate per-location (local) identifiers into global
//! identifiers. A dense map can be used when the local identifiers are
//! consecutively numbered from 0 to N-1: slot `i` then holds the global id
//! for local id `i`. Otherwise a sparse map stores (local, global) pairs
//! sorted by local id and looks them up via binary search.

use std::cmp::Ordering;

use crate::error::{Result, TraceError};

/// Reserved "no identifier" value. Passes through lookups unchanged.
pub const NO_ID: u32 = u32::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdMapMode {
    Dense,
    Sparse,
}

#[derive(Debug, Clone)]
pub struct IdMap {
    mode: IdMapMode,
    items: Vec<u32>,
}

impl IdMap {
    pub fn new(mode: IdMapMode, capacity: usize) -> IdMap {
        // Each sparse entry occupies two slots
        let capacity = match mode {
            IdMapMode::Dense => capacity,
            IdMapMode::Sparse => capacity * 2,
        };
        IdMap {
            mode,
            items: Vec::with_capacity(capacity.max(1)),
        }
    }

    pub fn mode(&self) -> IdMapMode {
        self.mode
    }

    /// Adds a local-to-global mapping.
    ///
    /// Dense maps require local ids to arrive in the exact order 0, 1, 2,
    /// ...; a gap or repetition in that sequence is rejected so that a
    /// malformed trace cannot silently corrupt the table. Sparse maps keep
    /// the backing array pair-sorted at all times; re-adding an existing
    /// local id overwrites the paired global id in place.
    pub fn add(&mut self, local_id: u32, global_id: u32) -> Result<()> {
        match self.mode {
            IdMapMode::Dense => {
                if local_id as usize != self.items.len() {
                    return Err(TraceError::InvalidArgument(format!(
                        "dense id map requires consecutive local ids (got {}, expected {})",
                        local_id,
                        self.items.len()
                    )));
                }
                self.items.push(global_id);
            }
            IdMapMode::Sparse => match self.pair_search(local_id) {
                // In theory, this should never happen...
                Ok(slot) => self.items[slot + 1] = global_id,
                Err(slot) => {
                    self.items.splice(slot..slot, [local_id, global_id]);
                }
            },
        }
        Ok(())
    }

    /// Returns the global identifier for `local_id`, or [`NO_ID`] if the
    /// map holds no entry for it.
    pub fn get(&self, local_id: u32) -> u32 {
        if local_id == NO_ID {
            return NO_ID;
        }
        match self.mode {
            IdMapMode::Dense => self
                .items
                .get(local_id as usize)
                .copied()
                .unwrap_or(NO_ID),
            IdMapMode::Sparse => match self.pair_search(local_id) {
                Ok(slot) => self.items[slot + 1],
                Err(_) => NO_ID,
            },
        }
    }

    /// Raw backing data and entry count. For a dense map the count equals
    /// the number of entries; for a sparse map it is twice as much, since
    /// each entry consists of a local and a global identifier (in this
    /// order).
    pub fn data(&self) -> (&[u32], usize) {
        (&self.items, self.items.len())
    }

    /// Binary search over (local, global) pairs. Returns the even-aligned
    /// slot of the matching pair, or the even-aligned insertion slot.
    fn pair_search(&self, local_id: u32) -> std::result::Result<usize, usize> {
        debug_assert_eq!(self.mode, IdMapMode::Sparse);
        let mut left = 0isize;
        let mut right = (self.items.len() / 2) as isize - 1;
        while left <= right {
            let mid = (left + right) / 2;
            let slot = (mid * 2) as usize;
            match self.items[slot].cmp(&local_id) {
                Ordering::Less => left = mid + 1,
                Ordering::Greater => right = mid - 1,
                Ordering::Equal => return Ok(slot),
            }
        }
        Err((left * 2) as usize)
    }
}
