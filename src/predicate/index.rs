// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use crate::generation::{Generation, GenerationHandler};
use crate::predicate::{
    BitVectorCache, DeserializeObserver, DocIdLimitProvider, DocumentFeaturesStore, EntryRef,
    Interval, IntervalStore, IntervalWithBounds, PopulateInterface, PostingDeserializer,
    PostingSerializer, PredicateTreeAnnotations, SimpleIndex, SimpleIndexConfig,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Feature name of plain z-star intervals.
pub const Z_STAR_ATTRIBUTE_NAME: &str = "z-star";

/// Feature name of the transition-compressed z-star encoding.
pub const Z_STAR_COMPRESSED_ATTRIBUTE_NAME: &str = "z-star-compressed";

/// Serialization version written by this crate.
pub const SERIALIZE_VERSION: u32 = 1;

#[derive(Debug, Default)]
struct DocIdLimit(AtomicU32);

impl DocIdLimitProvider for DocIdLimit {
    fn doc_id_limit(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    fn committed_doc_id_limit(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

struct IntervalSerializer<'a> {
    store: &'a IntervalStore,
}

impl PostingSerializer for IntervalSerializer<'_> {
    fn serialize<W: Write>(&self, posting: EntryRef, writer: &mut W) -> Result<(), EncodeError> {
        let intervals: Vec<Interval> = self.store.get(posting);
        // NOTE: Truncation is OK, entry sizes fit in u16
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(intervals.len() as u16)?;
        for interval in intervals {
            writer.write_u32::<BigEndian>(interval.interval)?;
        }
        Ok(())
    }
}

struct BoundsSerializer<'a> {
    store: &'a IntervalStore,
}

impl PostingSerializer for BoundsSerializer<'_> {
    fn serialize<W: Write>(&self, posting: EntryRef, writer: &mut W) -> Result<(), EncodeError> {
        let intervals: Vec<IntervalWithBounds> = self.store.get(posting);
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(intervals.len() as u16)?;
        for interval in intervals {
            writer.write_u32::<BigEndian>(interval.interval)?;
            writer.write_u32::<BigEndian>(interval.bounds)?;
        }
        Ok(())
    }
}

struct IntervalDeserializer<'a> {
    store: &'a mut IntervalStore,
}

impl PostingDeserializer for IntervalDeserializer<'_> {
    fn deserialize<R: Read>(&mut self, reader: &mut R) -> Result<EntryRef, DecodeError> {
        let size = reader.read_u16::<BigEndian>()?;
        let mut intervals = Vec::with_capacity(size as usize);
        for _ in 0..size {
            intervals.push(Interval::from_raw(reader.read_u32::<BigEndian>()?));
        }
        Ok(self.store.insert(&intervals))
    }
}

struct BoundsDeserializer<'a> {
    store: &'a mut IntervalStore,
}

impl PostingDeserializer for BoundsDeserializer<'_> {
    fn deserialize<R: Read>(&mut self, reader: &mut R) -> Result<EntryRef, DecodeError> {
        let size = reader.read_u16::<BigEndian>()?;
        let mut intervals = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let interval = reader.read_u32::<BigEndian>()?;
            let bounds = reader.read_u32::<BigEndian>()?;
            intervals.push(IntervalWithBounds::new(interval, bounds));
        }
        Ok(self.store.insert(&intervals))
    }
}

/// The boolean-constraint index: interval and bounds posting dictionaries,
/// the deduplicating interval store, the zero-constraint set, per-document
/// feature bookkeeping and the hot-feature bit-vector cache.
pub struct PredicateIndex {
    arity: u32,
    doc_id_limit: Arc<DocIdLimit>,
    interval_index: SimpleIndex,
    bounds_index: SimpleIndex,
    interval_store: IntervalStore,
    zero_constraint_docs: BTreeSet<u32>,
    features_store: DocumentFeaturesStore,
    cache: BitVectorCache,
    generation: GenerationHandler,
    // per-document match requirements: (min-feature, interval-range)
    doc_annotations: Vec<(u32, u16)>,
}

impl PredicateIndex {
    #[must_use]
    pub fn new(config: SimpleIndexConfig, arity: u32, doc_id_limit: u32) -> Self {
        let limit = Arc::new(DocIdLimit(AtomicU32::new(doc_id_limit)));
        let dyn_limit: Arc<dyn DocIdLimitProvider> = limit.clone();
        Self {
            arity,
            doc_id_limit: Arc::clone(&limit),
            interval_index: SimpleIndex::new(config, Arc::clone(&dyn_limit)),
            bounds_index: SimpleIndex::new(config, dyn_limit),
            interval_store: IntervalStore::new(),
            zero_constraint_docs: BTreeSet::new(),
            features_store: DocumentFeaturesStore::new(arity),
            cache: BitVectorCache::new(doc_id_limit),
            generation: GenerationHandler::new(),
            doc_annotations: Vec::new(),
        }
    }

    /// Records the per-document match requirements computed by annotation.
    pub fn set_document_annotations(&mut self, doc_id: u32, min_feature: u32, interval_range: u16) {
        if doc_id as usize >= self.doc_annotations.len() {
            self.doc_annotations
                .resize(doc_id as usize + 1, (0, 0));
        }
        if let Some(slot) = self.doc_annotations.get_mut(doc_id as usize) {
            *slot = (min_feature, interval_range);
        }
    }

    /// The min-feature and interval-range recorded for a document.
    #[must_use]
    pub fn document_annotations(&self, doc_id: u32) -> Option<(u32, u16)> {
        self.doc_annotations
            .get(doc_id as usize)
            .copied()
            .filter(|(_, range)| *range != 0)
    }

    #[must_use]
    pub fn arity(&self) -> u32 {
        self.arity
    }

    #[must_use]
    pub fn doc_id_limit(&self) -> u32 {
        self.doc_id_limit.doc_id_limit()
    }

    /// Indexes an annotated document.
    pub fn index_document(&mut self, doc_id: u32, annotations: &PredicateTreeAnnotations) {
        for (feature, intervals) in &annotations.interval_map {
            let entry_ref = self.interval_store.insert(intervals);
            debug_assert!(entry_ref.valid());
            self.interval_index.add_posting(*feature, doc_id, entry_ref);
            self.cache.set(*feature, doc_id, true);
        }
        for (feature, intervals) in &annotations.bounds_map {
            let entry_ref = self.interval_store.insert(intervals);
            debug_assert!(entry_ref.valid());
            self.bounds_index.add_posting(*feature, doc_id, entry_ref);
            self.cache.set(*feature, doc_id, true);
        }
        self.features_store.insert(annotations, doc_id);
        self.set_document_annotations(doc_id, annotations.min_feature, annotations.interval_range);
    }

    /// Indexes a document whose predicate has no positive constraint: it
    /// matches every query.
    pub fn index_empty_document(&mut self, doc_id: u32) {
        self.zero_constraint_docs.insert(doc_id);
    }

    /// Removes every trace of a document.
    pub fn remove_document(&mut self, doc_id: u32) {
        self.zero_constraint_docs.remove(&doc_id);

        let features = self.features_store.get(doc_id);
        if !features.is_empty() {
            for feature in features {
                let (entry_ref, existed) =
                    self.interval_index.remove_from_posting_list(feature, doc_id);
                if existed {
                    self.interval_store.remove(entry_ref);
                }
                let (entry_ref, existed) =
                    self.bounds_index.remove_from_posting_list(feature, doc_id);
                if existed {
                    self.interval_store.remove(entry_ref);
                }
            }
            self.cache.remove_index(doc_id);
        }
        self.features_store.remove(doc_id);
        if let Some(slot) = self.doc_annotations.get_mut(doc_id as usize) {
            *slot = (0, 0);
        }
    }

    pub fn commit(&mut self) {
        self.interval_index.commit();
        self.bounds_index.commit();
    }

    pub fn assign_generation(&mut self, current_gen: Generation) {
        self.interval_index.assign_generation(current_gen);
        self.bounds_index.assign_generation(current_gen);
        self.interval_store.assign_generation(current_gen);
        self.features_store.assign_generation(current_gen);
        self.generation.assign_generation(current_gen);
    }

    pub fn reclaim_memory(&mut self, oldest_used_gen: Generation) {
        self.interval_index.reclaim_memory(oldest_used_gen);
        self.bounds_index.reclaim_memory(oldest_used_gen);
        self.interval_store.reclaim_memory(oldest_used_gen);
        self.features_store.reclaim_memory(oldest_used_gen);
        self.generation.reclaim_memory(oldest_used_gen);
    }

    /// Doc ids carrying a feature, ascending.
    #[must_use]
    pub fn lookup(&self, key: u64) -> Option<Vec<u32>> {
        self.interval_index
            .lookup(key)
            .map(|postings| postings.keys().copied().collect())
    }

    /// The subset of keys with a hot bit vector; empty unless the combined
    /// counts clear the fill-ratio gate.
    #[must_use]
    pub fn lookup_cached_set(&self, keys_with_counts: &[(u64, u64)]) -> FxHashSet<u64> {
        self.cache.lookup_cached_set(keys_with_counts)
    }

    pub fn compute_count_vector(&self, keys: &FxHashSet<u64>, out: &mut [u8]) {
        self.cache.compute_count_vector(keys, out);
    }

    pub fn populate_if_needed(&self, doc_id_limit: u32) {
        if self.cache.needs_population() {
            self.cache.populate(doc_id_limit, self);
        }
    }

    pub fn require_cache_population(&self) {
        self.cache.require_population();
    }

    /// Adjusts structures to have space for the doc id.
    pub fn adjust_doc_id_limit(&self, doc_id: u32) {
        let limit = doc_id + 1;
        if limit > self.doc_id_limit.doc_id_limit() {
            self.doc_id_limit.0.store(limit, Ordering::Release);
            self.cache.adjust_doc_id_limit(limit);
        }
    }

    #[must_use]
    pub fn zero_constraint_docs(&self) -> &BTreeSet<u32> {
        &self.zero_constraint_docs
    }

    #[must_use]
    pub fn interval_index(&self) -> &SimpleIndex {
        &self.interval_index
    }

    #[must_use]
    pub fn bounds_index(&self) -> &SimpleIndex {
        &self.bounds_index
    }

    #[must_use]
    pub fn interval_store(&self) -> &IntervalStore {
        &self.interval_store
    }

    #[must_use]
    pub fn features_store(&self) -> &DocumentFeaturesStore {
        &self.features_store
    }

    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.features_store.serialize(writer)?;
        // NOTE: Truncation is OK, arity fits in u16
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.arity as u16)?;
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.zero_constraint_docs.len() as u32)?;
        for doc_id in &self.zero_constraint_docs {
            writer.write_u32::<BigEndian>(*doc_id)?;
        }
        self.interval_index.serialize(
            writer,
            &IntervalSerializer {
                store: &self.interval_store,
            },
        )?;
        self.bounds_index.serialize(
            writer,
            &BoundsSerializer {
                store: &self.interval_store,
            },
        )
    }

    pub fn deserialize<R: Read, O: DeserializeObserver>(
        reader: &mut R,
        config: SimpleIndexConfig,
        doc_id_limit: u32,
        observer: &mut O,
        version: u32,
    ) -> Result<Self, DecodeError> {
        let features_store = DocumentFeaturesStore::deserialize(reader)?;
        let arity = u32::from(reader.read_u16::<BigEndian>()?);

        let limit = Arc::new(DocIdLimit(AtomicU32::new(doc_id_limit)));
        let dyn_limit: Arc<dyn DocIdLimitProvider> = limit.clone();
        let mut interval_store = IntervalStore::new();
        let mut interval_index = SimpleIndex::new(
            config,
            Arc::clone(&dyn_limit),
        );
        let mut bounds_index = SimpleIndex::new(
            config,
            dyn_limit,
        );

        let zero_count = reader.read_u32::<BigEndian>()?;
        let mut zero_constraint_docs = BTreeSet::new();
        for _ in 0..zero_count {
            let raw_id = reader.read_u32::<BigEndian>()?;
            let doc_id = if version == 0 { raw_id >> 6 } else { raw_id };
            zero_constraint_docs.insert(doc_id);
            observer.notify_insert(0, doc_id, 0);
        }

        interval_index.deserialize(
            reader,
            &mut IntervalDeserializer {
                store: &mut interval_store,
            },
            observer,
            version,
        )?;
        bounds_index.deserialize(
            reader,
            &mut BoundsDeserializer {
                store: &mut interval_store,
            },
            observer,
            version,
        )?;

        let mut index = Self {
            arity,
            doc_id_limit: limit,
            interval_index,
            bounds_index,
            interval_store,
            zero_constraint_docs,
            features_store,
            cache: BitVectorCache::new(doc_id_limit),
            generation: GenerationHandler::new(),
            doc_annotations: Vec::new(),
        };
        index.commit();
        Ok(index)
    }

    /// Promotes dense posting lists; call once the doc-id limit is final.
    pub fn on_deserialization_completed(&mut self) {
        self.interval_index.promote_over_threshold_vectors();
        self.bounds_index.promote_over_threshold_vectors();
    }
}

impl PopulateInterface for PredicateIndex {
    fn lookup(&self, key: u64) -> Option<Vec<u32>> {
        Self::lookup(self, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{annotate, feature_hash, PredicateNode};
    use test_log::test;

    struct NullObserver;

    impl DeserializeObserver for NullObserver {
        fn notify_insert(&mut self, _key: u64, _doc_id: u32, _min_feature: u32) {}
    }

    fn indexed(doc_id: u32, tree: &PredicateNode, index: &mut PredicateIndex) {
        let annotations = annotate(tree, index.arity()).expect("annotation should not fail");
        index.index_document(doc_id, &annotations);
    }

    #[test]
    fn index_and_lookup() {
        let mut index = PredicateIndex::new(SimpleIndexConfig::default(), 8, 100);
        indexed(1, &PredicateNode::feature_set("color", &["red"]), &mut index);
        indexed(2, &PredicateNode::feature_set("color", &["red"]), &mut index);
        index.commit();

        let docs = index.lookup(feature_hash("color=red")).unwrap_or_default();
        assert_eq!(vec![1, 2], docs);
    }

    #[test]
    fn remove_document_clears_all_postings() {
        let mut index = PredicateIndex::new(SimpleIndexConfig::default(), 8, 100);
        let tree = PredicateNode::And(vec![
            PredicateNode::feature_set("color", &["red"]),
            PredicateNode::feature_range("year", 2020, 2020),
        ]);
        indexed(1, &tree, &mut index);
        index.commit();
        assert!(index.lookup(feature_hash("color=red")).is_some());

        index.remove_document(1);
        index.commit();
        assert!(index.lookup(feature_hash("color=red")).is_none());
        assert_eq!(0, index.bounds_index().key_count());
    }

    #[test]
    fn zero_constraint_documents() {
        let mut index = PredicateIndex::new(SimpleIndexConfig::default(), 8, 100);
        index.index_empty_document(42);
        assert!(index.zero_constraint_docs().contains(&42));

        index.remove_document(42);
        assert!(index.zero_constraint_docs().is_empty());
    }

    #[test]
    fn serde_roundtrip() -> Result<(), DecodeError> {
        let mut index = PredicateIndex::new(SimpleIndexConfig::default(), 8, 100);
        indexed(1, &PredicateNode::feature_set("color", &["red"]), &mut index);
        indexed(
            2,
            &PredicateNode::And(vec![
                PredicateNode::feature_set("color", &["blue"]),
                PredicateNode::feature_range("year", 2000, 2100),
            ]),
            &mut index,
        );
        index.index_empty_document(3);
        index.commit();

        let mut buf = Vec::new();
        index
            .serialize(&mut buf)
            .map_err(|EncodeError::Io(e)| DecodeError::Io(e))?;

        let mut decoded = PredicateIndex::deserialize(
            &mut &buf[..],
            SimpleIndexConfig::default(),
            100,
            &mut NullObserver,
            SERIALIZE_VERSION,
        )?;
        decoded.on_deserialization_completed();

        assert_eq!(8, decoded.arity());
        assert!(decoded.zero_constraint_docs().contains(&3));
        assert_eq!(
            index.lookup(feature_hash("color=red")),
            decoded.lookup(feature_hash("color=red"))
        );
        assert_eq!(
            index.lookup(feature_hash("color=blue")),
            decoded.lookup(feature_hash("color=blue"))
        );
        assert_eq!(index.features_store().get(2), decoded.features_store().get(2));
        Ok(())
    }
}
