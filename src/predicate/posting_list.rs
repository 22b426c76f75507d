// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::predicate::{EntryRef, Interval, IntervalStore, IntervalWithBounds};
use std::collections::{BTreeMap, BTreeSet};

/// Sequential access to one posting list, whichever representation backs
/// it.
pub trait PostingIterator {
    fn valid(&self) -> bool;
    fn key(&self) -> u32;
    fn data(&self) -> EntryRef;
    fn linear_seek(&mut self, doc_id: u32);
}

/// Iterator over a btree posting list.
pub struct BtreeIterator<'a> {
    map: &'a BTreeMap<u32, EntryRef>,
    current: Option<(u32, EntryRef)>,
}

impl<'a> BtreeIterator<'a> {
    #[must_use]
    pub fn new(map: &'a BTreeMap<u32, EntryRef>) -> Self {
        Self {
            map,
            current: map.iter().next().map(|(k, v)| (*k, *v)),
        }
    }
}

impl PostingIterator for BtreeIterator<'_> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> u32 {
        self.current.map_or(u32::MAX, |(k, _)| k)
    }

    fn data(&self) -> EntryRef {
        self.current.map_or_else(EntryRef::invalid, |(_, v)| v)
    }

    fn linear_seek(&mut self, doc_id: u32) {
        self.current = self.map.range(doc_id..).next().map(|(k, v)| (*k, *v));
    }
}

/// Iterator over a dense posting vector; invalid slots are skipped.
pub struct VectorIterator<'a> {
    vector: &'a [EntryRef],
    pos: usize,
}

impl<'a> VectorIterator<'a> {
    #[must_use]
    pub fn new(vector: &'a [EntryRef]) -> Self {
        let mut iter = Self { vector, pos: 0 };
        iter.linear_seek(1);
        iter
    }
}

impl PostingIterator for VectorIterator<'_> {
    fn valid(&self) -> bool {
        self.pos < self.vector.len()
    }

    fn key(&self) -> u32 {
        // NOTE: Truncation is OK, vector positions are doc ids
        #[allow(clippy::cast_possible_truncation)]
        {
            self.pos as u32
        }
    }

    fn data(&self) -> EntryRef {
        self.vector
            .get(self.pos)
            .copied()
            .unwrap_or_else(EntryRef::invalid)
    }

    fn linear_seek(&mut self, doc_id: u32) {
        let mut pos = doc_id as usize;
        while let Some(posting) = self.vector.get(pos) {
            if posting.valid() {
                self.pos = pos;
                return;
            }
            pos += 1;
        }
        self.pos = self.vector.len();
    }
}

/// The matching-side view of one feature's postings: a doc-id cursor and,
/// per doc, a cursor over its intervals.
pub trait PredicatePostingList {
    /// Moves to the next document after the one supplied. Returns false
    /// when no doc ids remain.
    fn next(&mut self, doc_id: u32) -> bool;

    /// Moves to the next interval within the current doc. Returns false
    /// when the current doc has no more intervals.
    fn next_interval(&mut self) -> bool;

    fn get_interval(&self) -> u32;

    fn doc_id(&self) -> u32;
}

/// Plain interval posting list.
pub struct IntervalPostingList<'a, I: PostingIterator> {
    store: &'a IntervalStore,
    iterator: I,
    intervals: Vec<Interval>,
    pos: usize,
    doc_id: u32,
}

impl<'a, I: PostingIterator> IntervalPostingList<'a, I> {
    #[must_use]
    pub fn new(store: &'a IntervalStore, iterator: I) -> Self {
        Self {
            store,
            iterator,
            intervals: Vec::new(),
            pos: 0,
            doc_id: 0,
        }
    }
}

impl<I: PostingIterator> PredicatePostingList for IntervalPostingList<'_, I> {
    fn next(&mut self, doc_id: u32) -> bool {
        if !self.iterator.valid() {
            return false;
        }
        if self.iterator.key() <= doc_id {
            self.iterator.linear_seek(doc_id + 1);
            if !self.iterator.valid() {
                return false;
            }
        }
        self.store.get_into(self.iterator.data(), &mut self.intervals);
        self.pos = 0;
        self.doc_id = self.iterator.key();
        true
    }

    fn next_interval(&mut self) -> bool {
        if self.pos + 1 < self.intervals.len() {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn get_interval(&self) -> u32 {
        self.intervals.get(self.pos).map_or(0, |i| i.interval)
    }

    fn doc_id(&self) -> u32 {
        self.doc_id
    }
}

/// Bounds-filtered posting list for range-edge partitions; intervals whose
/// bounds reject the query-side value diff are skipped.
pub struct BoundsPostingList<'a, I: PostingIterator> {
    store: &'a IntervalStore,
    iterator: I,
    intervals: Vec<IntervalWithBounds>,
    pos: usize,
    value_diff: u32,
    doc_id: u32,
}

impl<'a, I: PostingIterator> BoundsPostingList<'a, I> {
    #[must_use]
    pub fn new(store: &'a IntervalStore, iterator: I, value_diff: u32) -> Self {
        Self {
            store,
            iterator,
            intervals: Vec::new(),
            pos: 0,
            value_diff,
            doc_id: 0,
        }
    }

    fn current_passes(&self) -> bool {
        self.intervals
            .get(self.pos)
            .is_some_and(|i| IntervalWithBounds::check_bounds(i.bounds, self.value_diff))
    }
}

impl<I: PostingIterator> PredicatePostingList for BoundsPostingList<'_, I> {
    fn next(&mut self, doc_id: u32) -> bool {
        if self.iterator.valid() && self.iterator.key() <= doc_id {
            self.iterator.linear_seek(doc_id + 1);
        }
        loop {
            if !self.iterator.valid() {
                return false;
            }
            self.store.get_into(self.iterator.data(), &mut self.intervals);
            self.pos = 0;
            if self.current_passes() || self.next_interval() {
                break;
            }
            let key = self.iterator.key();
            self.iterator.linear_seek(key + 1);
        }
        self.doc_id = self.iterator.key();
        true
    }

    fn next_interval(&mut self) -> bool {
        while self.pos + 1 < self.intervals.len() {
            self.pos += 1;
            if self.current_passes() {
                return true;
            }
        }
        false
    }

    fn get_interval(&self) -> u32 {
        self.intervals.get(self.pos).map_or(0, |i| i.interval)
    }

    fn doc_id(&self) -> u32 {
        self.doc_id
    }
}

/// Posting list that synthesizes the virtual intervals of the z-star
/// compressed encoding, which stores only transitions.
pub struct ZstarCompressedPostingList<'a, I: PostingIterator> {
    store: &'a IntervalStore,
    iterator: I,
    intervals: Vec<Interval>,
    pos: usize,
    interval: u32,
    prev_interval: u32,
    doc_id: u32,
}

impl<'a, I: PostingIterator> ZstarCompressedPostingList<'a, I> {
    #[must_use]
    pub fn new(store: &'a IntervalStore, iterator: I) -> Self {
        Self {
            store,
            iterator,
            intervals: Vec::new(),
            pos: 0,
            interval: 0,
            prev_interval: 0,
            doc_id: 0,
        }
    }
}

impl<I: PostingIterator> PredicatePostingList for ZstarCompressedPostingList<'_, I> {
    fn next(&mut self, doc_id: u32) -> bool {
        if self.iterator.valid() && self.iterator.key() <= doc_id {
            self.iterator.linear_seek(doc_id + 1);
        }
        if !self.iterator.valid() {
            return false;
        }
        self.store.get_into(self.iterator.data(), &mut self.intervals);
        self.pos = 0;
        self.doc_id = self.iterator.key();
        self.interval = self.intervals.first().map_or(0, |i| i.interval);
        self.prev_interval = self.interval;
        true
    }

    fn next_interval(&mut self) -> bool {
        let next_interval = self
            .intervals
            .get(self.pos + 1)
            .map_or(u32::MAX, |i| i.interval);

        if self.prev_interval != 0 {
            if next_interval & 0xffff_0000 == 0 {
                self.interval = (self.prev_interval >> 16) | (next_interval << 16);
                self.pos += 1;
            } else {
                let value = self.prev_interval >> 16;
                self.interval = ((value + 1) << 16) | value;
            }
            self.prev_interval = 0;
            true
        } else if next_interval != u32::MAX {
            self.pos += 1;
            self.interval = next_interval;
            self.prev_interval = next_interval;
            true
        } else {
            false
        }
    }

    fn get_interval(&self) -> u32 {
        self.interval
    }

    fn doc_id(&self) -> u32 {
        self.doc_id
    }
}

/// Posting list over the zero-constraint set; every doc reports the root
/// interval.
pub struct ZeroConstraintPostingList<'a> {
    docs: &'a BTreeSet<u32>,
    current: Option<u32>,
}

impl<'a> ZeroConstraintPostingList<'a> {
    #[must_use]
    pub fn new(docs: &'a BTreeSet<u32>) -> Self {
        Self {
            docs,
            current: docs.iter().next().copied(),
        }
    }
}

impl PredicatePostingList for ZeroConstraintPostingList<'_> {
    fn next(&mut self, doc_id: u32) -> bool {
        if let Some(current) = self.current {
            if current <= doc_id {
                self.current = self.docs.range(doc_id + 1..).next().copied();
            }
        }
        self.current.is_some()
    }

    fn next_interval(&mut self) -> bool {
        false
    }

    fn get_interval(&self) -> u32 {
        0x0001_0001
    }

    fn doc_id(&self) -> u32 {
        self.current.unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn store_with(intervals: &[Interval]) -> (IntervalStore, EntryRef) {
        let mut store = IntervalStore::new();
        let entry_ref = store.insert(intervals);
        (store, entry_ref)
    }

    #[test]
    fn interval_posting_list_walks_docs_and_intervals() {
        let (store, entry_ref) = store_with(&[Interval::new(1, 1), Interval::new(2, 2)]);
        let mut map = BTreeMap::new();
        map.insert(3, entry_ref);
        map.insert(7, entry_ref);

        let mut list = IntervalPostingList::new(&store, BtreeIterator::new(&map));
        assert!(list.next(0));
        assert_eq!(3, list.doc_id());
        assert_eq!(0x0001_0001, list.get_interval());
        assert!(list.next_interval());
        assert_eq!(0x0002_0002, list.get_interval());
        assert!(!list.next_interval());

        assert!(list.next(3));
        assert_eq!(7, list.doc_id());
        assert!(!list.next(7));
    }

    #[test]
    fn bounds_posting_list_filters_by_value_diff() {
        let mut store = IntervalStore::new();
        let passing = store.insert(&[IntervalWithBounds::new(0x0001_0001, (4 << 16) | 5)]);
        let failing = store.insert(&[IntervalWithBounds::new(0x0001_0001, (6 << 16) | 9)]);

        let mut map = BTreeMap::new();
        map.insert(1, passing);
        map.insert(2, failing);

        let mut list = BoundsPostingList::new(&store, BtreeIterator::new(&map), 4);
        assert!(list.next(0));
        assert_eq!(1, list.doc_id());
        // doc 2 is filtered out entirely
        assert!(!list.next(1));
    }

    #[test]
    fn zstar_synthesizes_intervals_from_transitions() {
        // One stored interval (6, 1): after the stored interval, the
        // follow-up is synthesized from the transition value.
        let (store, entry_ref) = store_with(&[Interval::from_raw(0x0006_0001)]);
        let mut map = BTreeMap::new();
        map.insert(1, entry_ref);

        let mut list = ZstarCompressedPostingList::new(&store, BtreeIterator::new(&map));
        assert!(list.next(0));
        assert_eq!(0x0006_0001, list.get_interval());
        assert!(list.next_interval());
        assert_eq!(0x0007_0006, list.get_interval());
        assert!(!list.next_interval());
    }

    #[test]
    fn zero_constraint_always_reports_root_interval() {
        let docs: BTreeSet<u32> = [2, 5].into_iter().collect();
        let mut list = ZeroConstraintPostingList::new(&docs);

        assert!(list.next(0));
        assert_eq!(2, list.doc_id());
        assert_eq!(0x0001_0001, list.get_interval());
        assert!(!list.next_interval());
        assert!(list.next(2));
        assert_eq!(5, list.doc_id());
        assert!(!list.next(5));
    }

    #[test]
    fn vector_iterator_skips_invalid_slots() {
        let vector = vec![
            EntryRef::invalid(),
            EntryRef::invalid(),
            EntryRef::from_raw(7),
            EntryRef::invalid(),
            EntryRef::from_raw(9),
        ];
        let mut iter = VectorIterator::new(&vector);
        assert!(iter.valid());
        assert_eq!(2, iter.key());
        iter.linear_seek(3);
        assert_eq!(4, iter.key());
        iter.linear_seek(5);
        assert!(!iter.valid());
    }
}
