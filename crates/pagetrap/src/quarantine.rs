//! Quarantine: the delay between a slot's deallocation and its eligibility
//! for reuse.
//!
//! The page is already inaccessible by the time a slot enters quarantine;
//! holding the slot back merely keeps it out of the free set so a stale
//! pointer keeps faulting instead of landing on a freshly reallocated page.
//! The policy is one tunable: how many subsequent deallocations must pass
//! before a slot is released. Zero means immediate release. Release only ever
//! happens as part of a deallocate cycle, never in response to a fault.

use std::collections::VecDeque;

/// Bounded FIFO of quarantined slot indices.
pub struct Quarantine {
    held: VecDeque<u32>,
    limit: usize,
}

impl Quarantine {
    pub fn new(limit: usize) -> Self {
        // The capacity is only a hint; an absurd limit (reachable through
        // the environment) must neither overflow nor preallocate.
        Quarantine {
            held: VecDeque::with_capacity(limit.saturating_add(1).min(1024)),
            limit,
        }
    }

    /// Admit a freshly deallocated slot. Returns the slot (if any) that
    /// leaves quarantine as a consequence: with a limit of zero that is the
    /// slot just pushed, otherwise the oldest held slot once the limit is
    /// exceeded.
    pub fn push(&mut self, index: usize) -> Option<usize> {
        if self.limit == 0 {
            return Some(index);
        }
        self.held.push_back(index as u32);
        if self.held.len() > self.limit {
            self.held.pop_front().map(|i| i as usize)
        } else {
            None
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_releases_immediately() {
        let mut q = Quarantine::new(0);
        assert_eq!(q.push(3), Some(3));
        assert_eq!(q.push(1), Some(1));
        assert!(q.is_empty());
    }

    #[test]
    fn absurd_limit_is_accepted() {
        let mut q = Quarantine::new(usize::MAX);
        assert_eq!(q.push(0), None);
        assert_eq!(q.push(1), None);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn release_is_delayed_by_limit_deallocations() {
        let mut q = Quarantine::new(2);
        assert_eq!(q.push(0), None);
        assert_eq!(q.push(1), None);
        // The third deallocation pushes the first slot out, FIFO order.
        assert_eq!(q.push(2), Some(0));
        assert_eq!(q.push(3), Some(1));
        assert_eq!(q.len(), 2);
    }
}
