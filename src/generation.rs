// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{AtomicU64, Ordering};

/// Logical epoch used for deferred reclamation.
pub type Generation = u64;

/// Tracks the current write generation and the oldest generation still
/// visible to readers.
///
/// Writers publish a new generation after each `commit()`; entries removed
/// before that point stay readable until `reclaim_memory` passes their
/// stamped generation.
#[derive(Debug, Default)]
pub struct GenerationHandler {
    current: AtomicU64,
    oldest_used: AtomicU64,
}

impl GenerationHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Generation {
        self.current.load(Ordering::Acquire)
    }

    pub fn oldest_used(&self) -> Generation {
        self.oldest_used.load(Ordering::Acquire)
    }

    /// Advances the current generation, stamping everything held since the
    /// previous call.
    pub fn assign_generation(&self, gen: Generation) {
        self.current.store(gen, Ordering::Release);
    }

    /// Declares that no reader observes generations below `gen` anymore.
    pub fn reclaim_memory(&self, gen: Generation) {
        self.oldest_used.store(gen, Ordering::Release);
    }
}

/// Entries removed from a structure but possibly still referenced by
/// readers of older generations.
///
/// `hold` parks an entry, `assign_generation` stamps all parked entries
/// with the generation that made the removal visible, and `reclaim`
/// drops every entry whose stamp is below the oldest used generation.
#[derive(Debug)]
pub struct HoldList<T> {
    pending: Vec<T>,
    held: std::collections::VecDeque<(Generation, Vec<T>)>,
}

impl<T> Default for HoldList<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            held: std::collections::VecDeque::new(),
        }
    }
}

impl<T> HoldList<T> {
    pub fn hold(&mut self, entry: T) {
        self.pending.push(entry);
    }

    pub fn assign_generation(&mut self, gen: Generation) {
        if !self.pending.is_empty() {
            let batch = std::mem::take(&mut self.pending);
            self.held.push_back((gen, batch));
        }
    }

    /// Drops all batches stamped with a generation below `oldest_used_gen`.
    pub fn reclaim(&mut self, oldest_used_gen: Generation) {
        while let Some((gen, _)) = self.held.front() {
            if *gen < oldest_used_gen {
                self.held.pop_front();
            } else {
                break;
            }
        }
    }

    #[must_use]
    pub fn held_count(&self) -> usize {
        self.pending.len() + self.held.iter().map(|(_, b)| b.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn hold_list_reclaims_in_generation_order() {
        let mut hold = HoldList::default();
        hold.hold("a");
        hold.assign_generation(1);
        hold.hold("b");
        hold.assign_generation(2);
        assert_eq!(2, hold.held_count());

        hold.reclaim(2);
        assert_eq!(1, hold.held_count());

        hold.reclaim(3);
        assert_eq!(0, hold.held_count());
    }
}
