// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use crate::generation::Generation;
use crate::predicate::EntryRef;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// Thresholds steering the hybrid btree/vector posting representation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimpleIndexConfig {
    /// Create vector posting list if doc frequency is above
    pub upper_docid_freq_threshold: f64,
    /// Remove vector posting list if doc frequency is below
    pub lower_docid_freq_threshold: f64,
    /// Threshold to create vector posting list
    pub upper_vector_size_threshold: usize,
    /// Threshold to remove vector posting list
    pub lower_vector_size_threshold: usize,
    /// How often to prune vectors as entries come and go
    pub vector_prune_frequency: usize,
    /// Use the vector in scans if doc frequency is above
    pub foreach_vector_threshold: f64,
}

impl Default for SimpleIndexConfig {
    fn default() -> Self {
        const UPPER_DOCID_FREQ: f64 = 0.40;
        const UPPER_VECTOR_SIZE: usize = 10_000;
        Self {
            upper_docid_freq_threshold: UPPER_DOCID_FREQ,
            lower_docid_freq_threshold: 0.8 * UPPER_DOCID_FREQ,
            upper_vector_size_threshold: UPPER_VECTOR_SIZE,
            // NOTE: Truncation is exact for the default value
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            lower_vector_size_threshold: (0.8 * UPPER_VECTOR_SIZE as f64) as usize,
            vector_prune_frequency: 20_000,
            foreach_vector_threshold: 0.25,
        }
    }
}

/// Doc-id address space as seen by the index.
pub trait DocIdLimitProvider: Send + Sync {
    fn doc_id_limit(&self) -> u32;
    fn committed_doc_id_limit(&self) -> u32;
}

/// Serializes a posting payload.
pub trait PostingSerializer {
    fn serialize<W: Write>(&self, posting: EntryRef, writer: &mut W) -> Result<(), EncodeError>;
}

/// Deserializes a posting payload.
pub trait PostingDeserializer {
    fn deserialize<R: Read>(&mut self, reader: &mut R) -> Result<EntryRef, DecodeError>;
}

/// Observes deserialized `{key, doc id}` pairs, carrying the v0 packed
/// min-feature where present.
pub trait DeserializeObserver {
    fn notify_insert(&mut self, key: u64, doc_id: u32, min_feature: u32);
}

/// A dictionary of keys with posting lists of doc ids.
///
/// Every key has a btree posting list; hot keys additionally carry a dense
/// vector indexed by doc id, promoted and demoted by the configured size
/// and density thresholds.
pub struct SimpleIndex {
    dictionary: BTreeMap<u64, BTreeMap<u32, EntryRef>>,
    vectors: BTreeMap<u64, Vec<EntryRef>>,
    insert_remove_counter: usize,
    config: SimpleIndexConfig,
    limit_provider: Arc<dyn DocIdLimitProvider>,
}

impl SimpleIndex {
    #[must_use]
    pub fn new(config: SimpleIndexConfig, limit_provider: Arc<dyn DocIdLimitProvider>) -> Self {
        Self {
            dictionary: BTreeMap::new(),
            vectors: BTreeMap::new(),
            insert_remove_counter: 0,
            config,
            limit_provider,
        }
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.dictionary.len()
    }

    fn document_ratio(&self, document_count: usize, doc_id_limit: u32) -> f64 {
        let denominator = doc_id_limit.max(2) - 1;
        // NOTE: Precision loss is fine for a threshold ratio
        #[allow(clippy::cast_precision_loss)]
        {
            document_count as f64 / f64::from(denominator)
        }
    }

    fn should_create_vector(&self, size: usize, ratio: f64) -> bool {
        size >= self.config.upper_vector_size_threshold
            && ratio >= self.config.upper_docid_freq_threshold
    }

    fn should_remove_vector(&self, size: usize, ratio: f64) -> bool {
        size < self.config.lower_vector_size_threshold
            || ratio < self.config.lower_docid_freq_threshold
    }

    /// Adds or replaces a posting. Replacing is the idempotent-update path.
    pub fn add_posting(&mut self, key: u64, doc_id: u32, posting: EntryRef) {
        self.dictionary
            .entry(key)
            .or_default()
            .insert(doc_id, posting);

        if self.vectors.contains_key(&key) {
            if let Some(vector) = self.vectors.get_mut(&key) {
                if vector.len() <= doc_id as usize {
                    vector.resize(doc_id as usize + 1, EntryRef::invalid());
                }
                if let Some(slot) = vector.get_mut(doc_id as usize) {
                    *slot = posting;
                }
            }
        } else {
            self.create_vector_if_over_threshold(key);
        }
        self.bump_and_prune();
    }

    /// Removes one posting, dropping the dictionary entry when it was the
    /// last. Returns the removed payload.
    pub fn remove_from_posting_list(&mut self, key: u64, doc_id: u32) -> (EntryRef, bool) {
        let Some(btree) = self.dictionary.get_mut(&key) else {
            return (EntryRef::invalid(), false);
        };
        let Some(posting) = btree.remove(&doc_id) else {
            return (EntryRef::invalid(), false);
        };
        if btree.is_empty() {
            self.dictionary.remove(&key);
        }

        if self.vectors.contains_key(&key) && !self.remove_vector_if_below_threshold(key) {
            if let Some(slot) = self
                .vectors
                .get_mut(&key)
                .and_then(|v| v.get_mut(doc_id as usize))
            {
                *slot = EntryRef::invalid();
            }
        }
        self.bump_and_prune();
        (posting, true)
    }

    fn bump_and_prune(&mut self) {
        self.insert_remove_counter += 1;
        if self.insert_remove_counter % self.config.vector_prune_frequency != 0 {
            return;
        }
        let keys: Vec<u64> = self.vectors.keys().copied().collect();
        for key in keys {
            self.remove_vector_if_below_threshold(key);
        }
    }

    fn create_vector_if_over_threshold(&mut self, key: u64) {
        let doc_id_limit = self.limit_provider.doc_id_limit();
        let Some(btree) = self.dictionary.get(&key) else {
            return;
        };
        let size = btree.len();
        let ratio = self.document_ratio(size, doc_id_limit);
        if !self.should_create_vector(size, ratio) {
            return;
        }

        let mut vector = vec![EntryRef::invalid(); doc_id_limit as usize];
        for (doc_id, posting) in btree {
            if let Some(slot) = vector.get_mut(*doc_id as usize) {
                *slot = *posting;
            }
        }
        log::debug!(
            "Created vector for key {key:016x} with length {} ({size} documents, ratio {ratio:.3})",
            vector.len(),
        );
        self.vectors.insert(key, vector);
    }

    fn remove_vector_if_below_threshold(&mut self, key: u64) -> bool {
        let size = self.dictionary.get(&key).map_or(0, BTreeMap::len);
        let ratio = self.document_ratio(size, self.limit_provider.doc_id_limit());
        if self.should_remove_vector(size, ratio) {
            if let Some(vector) = self.vectors.remove(&key) {
                log::debug!(
                    "Removed vector for key {key:016x} with length {} ({size} documents, ratio {ratio:.3})",
                    vector.len(),
                );
            }
            return true;
        }
        false
    }

    /// Promotes every qualifying key; call after deserialization once the
    /// doc-id limit is known.
    pub fn promote_over_threshold_vectors(&mut self) {
        let keys: Vec<u64> = self.dictionary.keys().copied().collect();
        for key in keys {
            if !self.vectors.contains_key(&key) {
                self.create_vector_if_over_threshold(key);
            }
        }
    }

    #[must_use]
    pub fn lookup(&self, key: u64) -> Option<&BTreeMap<u32, EntryRef>> {
        self.dictionary.get(&key)
    }

    #[must_use]
    pub fn posting_list_size(&self, key: u64) -> usize {
        self.dictionary.get(&key).map_or(0, BTreeMap::len)
    }

    /// The dense representation for a key, truncated to the committed
    /// doc-id limit.
    #[must_use]
    pub fn vector_posting_list(&self, key: u64) -> Option<&[EntryRef]> {
        let vector = self.vectors.get(&key)?;
        let committed = self.limit_provider.committed_doc_id_limit() as usize;
        Some(vector.get(..vector.len().min(committed)).unwrap_or(vector))
    }

    /// Walks all doc ids of a key; the vector is preferred when dense
    /// enough.
    pub fn foreach_frozen_key<F: FnMut(u32)>(&self, key: u64, mut func: F) {
        let size = self.posting_list_size(key);
        let ratio = self.document_ratio(size, self.limit_provider.doc_id_limit());
        if ratio > self.config.foreach_vector_threshold {
            if let Some(vector) = self.vector_posting_list(key) {
                for (doc_id, posting) in vector.iter().enumerate().skip(1) {
                    if posting.valid() {
                        // NOTE: Truncation is OK, doc ids fit in u32
                        #[allow(clippy::cast_possible_truncation)]
                        func(doc_id as u32);
                    }
                }
                return;
            }
        }
        if let Some(btree) = self.dictionary.get(&key) {
            for doc_id in btree.keys() {
                func(*doc_id);
            }
        }
    }

    pub fn commit(&mut self) {}

    pub fn assign_generation(&mut self, _current_gen: Generation) {}

    pub fn reclaim_memory(&mut self, _oldest_used_gen: Generation) {}

    /// Format: key count, then per key the posting count, the key and the
    /// `(doc id, payload)` pairs.
    pub fn serialize<W: Write, S: PostingSerializer>(
        &self,
        writer: &mut W,
        serializer: &S,
    ) -> Result<(), EncodeError> {
        // NOTE: Truncation is OK, counts stay far below u32::MAX
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.dictionary.len() as u32)?;
        for (key, postings) in &self.dictionary {
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32::<BigEndian>(postings.len() as u32)?;
            if postings.is_empty() {
                continue;
            }
            writer.write_u64::<BigEndian>(*key)?;
            for (doc_id, posting) in postings {
                writer.write_u32::<BigEndian>(*doc_id)?;
                serializer.serialize(*posting, writer)?;
            }
        }
        Ok(())
    }

    /// Version 0 packs the min-feature into the low 6 bits of each doc id;
    /// version 1 and later store doc ids verbatim.
    pub fn deserialize<R: Read, D: PostingDeserializer, O: DeserializeObserver>(
        &mut self,
        reader: &mut R,
        deserializer: &mut D,
        observer: &mut O,
        version: u32,
    ) -> Result<(), DecodeError> {
        let key_count = reader.read_u32::<BigEndian>()?;
        for _ in 0..key_count {
            let posting_count = reader.read_u32::<BigEndian>()?;
            if posting_count == 0 {
                continue;
            }
            let key = reader.read_u64::<BigEndian>()?;
            let mut postings = BTreeMap::new();
            for _ in 0..posting_count {
                let raw_id = reader.read_u32::<BigEndian>()?;
                let doc_id = if version == 0 {
                    let k = raw_id & 0x3f;
                    let min_feature = if k == 0 { k } else { k + 1 };
                    observer.notify_insert(key, raw_id >> 6, min_feature);
                    raw_id >> 6
                } else {
                    // min-feature is stored in a separate structure now
                    observer.notify_insert(key, raw_id, 0);
                    raw_id
                };
                postings.insert(doc_id, deserializer.deserialize(reader)?);
            }
            self.dictionary.insert(key, postings);
        }
        self.commit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_log::test;

    struct FixedLimit(AtomicU32);

    impl DocIdLimitProvider for FixedLimit {
        fn doc_id_limit(&self) -> u32 {
            self.0.load(Ordering::Relaxed)
        }

        fn committed_doc_id_limit(&self) -> u32 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn small_config() -> SimpleIndexConfig {
        SimpleIndexConfig {
            upper_docid_freq_threshold: 0.4,
            lower_docid_freq_threshold: 0.32,
            upper_vector_size_threshold: 10,
            lower_vector_size_threshold: 8,
            vector_prune_frequency: 1,
            foreach_vector_threshold: 0.25,
        }
    }

    #[test]
    fn add_lookup_remove() {
        let limit = Arc::new(FixedLimit(AtomicU32::new(100)));
        let mut index = SimpleIndex::new(SimpleIndexConfig::default(), limit);

        index.add_posting(7, 3, EntryRef::from_raw(33));
        index.add_posting(7, 5, EntryRef::from_raw(55));

        assert_eq!(2, index.posting_list_size(7));

        let (posting, existed) = index.remove_from_posting_list(7, 3);
        assert!(existed);
        assert_eq!(33, posting.raw());

        let (_, existed) = index.remove_from_posting_list(7, 3);
        assert!(!existed);

        index.remove_from_posting_list(7, 5);
        assert!(index.lookup(7).is_none());
    }

    #[test]
    fn promotes_then_demotes_vector() {
        let limit = Arc::new(FixedLimit(AtomicU32::new(25)));
        let mut index = SimpleIndex::new(small_config(), limit);

        // 11 docs of 25: ratio 0.44 >= 0.4, size 11 >= 10
        for doc_id in 1..=11 {
            index.add_posting(1, doc_id, EntryRef::from_raw(doc_id));
        }
        assert!(index.vector_posting_list(1).is_some());

        // dropping to 7 docs: ratio 7/24 < 0.32
        for doc_id in 1..=4 {
            index.remove_from_posting_list(1, doc_id);
        }
        assert!(index.vector_posting_list(1).is_none());
    }

    #[test]
    fn foreach_visits_every_doc() {
        let limit = Arc::new(FixedLimit(AtomicU32::new(25)));
        let mut index = SimpleIndex::new(small_config(), limit);
        for doc_id in [2, 4, 9] {
            index.add_posting(5, doc_id, EntryRef::from_raw(1));
        }

        let mut seen = Vec::new();
        index.foreach_frozen_key(5, |doc_id| seen.push(doc_id));
        assert_eq!(vec![2, 4, 9], seen);
    }

    struct RawSerializer;

    impl PostingSerializer for RawSerializer {
        fn serialize<W: Write>(
            &self,
            posting: EntryRef,
            writer: &mut W,
        ) -> Result<(), EncodeError> {
            writer.write_u32::<BigEndian>(posting.raw())?;
            Ok(())
        }
    }

    struct RawDeserializer;

    impl PostingDeserializer for RawDeserializer {
        fn deserialize<R: Read>(&mut self, reader: &mut R) -> Result<EntryRef, DecodeError> {
            Ok(EntryRef::from_raw(reader.read_u32::<BigEndian>()?))
        }
    }

    struct CollectingObserver(Vec<(u64, u32, u32)>);

    impl DeserializeObserver for CollectingObserver {
        fn notify_insert(&mut self, key: u64, doc_id: u32, min_feature: u32) {
            self.0.push((key, doc_id, min_feature));
        }
    }

    #[test]
    fn serde_roundtrip_v1() -> Result<(), DecodeError> {
        let limit: Arc<dyn DocIdLimitProvider> = Arc::new(FixedLimit(AtomicU32::new(100)));
        let mut index = SimpleIndex::new(SimpleIndexConfig::default(), Arc::clone(&limit));
        index.add_posting(11, 1, EntryRef::from_raw(100));
        index.add_posting(11, 2, EntryRef::from_raw(200));
        index.add_posting(22, 9, EntryRef::from_raw(900));

        let mut buf = Vec::new();
        index
            .serialize(&mut buf, &RawSerializer)
            .map_err(|EncodeError::Io(e)| DecodeError::Io(e))?;

        let mut decoded = SimpleIndex::new(SimpleIndexConfig::default(), limit);
        let mut observer = CollectingObserver(Vec::new());
        decoded.deserialize(&mut &buf[..], &mut RawDeserializer, &mut observer, 1)?;

        assert_eq!(2, decoded.posting_list_size(11));
        assert_eq!(1, decoded.posting_list_size(22));
        assert!(observer.0.contains(&(22, 9, 0)));
        Ok(())
    }

    #[test]
    fn v0_unpacks_min_feature_from_doc_id() -> Result<(), DecodeError> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(1).ok();
        buf.write_u32::<BigEndian>(1).ok();
        buf.write_u64::<BigEndian>(77).ok();
        // doc 5 with k = 3 packed into the low 6 bits
        buf.write_u32::<BigEndian>((5 << 6) | 3).ok();
        buf.write_u32::<BigEndian>(123).ok();

        let limit = Arc::new(FixedLimit(AtomicU32::new(100)));
        let mut index = SimpleIndex::new(SimpleIndexConfig::default(), limit);
        let mut observer = CollectingObserver(Vec::new());
        index.deserialize(&mut &buf[..], &mut RawDeserializer, &mut observer, 0)?;

        assert_eq!(vec![(77, 5, 4)], observer.0);
        assert_eq!(1, index.posting_list_size(77));
        Ok(())
    }
}
