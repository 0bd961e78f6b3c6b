//! The free-slot selector: tracks unallocated slot indices and picks one
//! uniformly at random.
//!
//! Random selection (rather than LIFO reuse) spreads reuse across the whole
//! pool, so a use-after-free on a historical allocation keeps faulting for as
//! long as possible before its slot happens to be handed out again.

use rand::Rng;

/// Fixed-capacity set of free slot indices. Never grows past the capacity it
/// was created with; order is not meaningful.
pub struct FreeSet {
    indices: Vec<u32>,
}

impl FreeSet {
    /// A set holding every index in `0..slot_count`, as at pool init.
    pub fn with_all(slot_count: usize) -> Self {
        FreeSet {
            indices: (0..slot_count as u32).collect(),
        }
    }

    /// Remove and return a uniformly random free index, or None if the pool
    /// is exhausted.
    pub fn pick<R: Rng>(&mut self, rng: &mut R) -> Option<usize> {
        if self.indices.is_empty() {
            return None;
        }
        let at = rng.gen_range(0..self.indices.len());
        Some(self.indices.swap_remove(at) as usize)
    }

    /// Return an index to the set. Called only once quarantine has completed
    /// for the slot.
    pub fn release(&mut self, index: usize) {
        debug_assert!(!self.indices.contains(&(index as u32)));
        self.indices.push(index as u32);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}
