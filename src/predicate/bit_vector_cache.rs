// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

// Bit vectors only pay off when the candidate keys cover a reasonable
// share of the corpus.
const THRESHOLD_USE_BIT_VECTOR_CACHE: f64 = 0.1;

/// Plain bit vector indexed by doc id.
#[derive(Clone, Debug, Default)]
pub struct BitVec {
    bits: Vec<u64>,
    len: u32,
}

impl BitVec {
    #[must_use]
    pub fn with_len(len: u32) -> Self {
        Self {
            bits: vec![0; (len as usize).div_ceil(64)],
            len,
        }
    }

    pub fn set(&mut self, index: u32, value: bool) {
        if index >= self.len {
            return;
        }
        let Some(word) = self.bits.get_mut(index as usize / 64) else {
            return;
        };
        let mask = 1u64 << (index % 64);
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    #[must_use]
    pub fn get(&self, index: u32) -> bool {
        self.bits
            .get(index as usize / 64)
            .is_some_and(|word| word & (1 << (index % 64)) != 0)
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn resize(&mut self, len: u32) {
        self.bits.resize((len as usize).div_ceil(64), 0);
        self.len = len;
    }
}

/// Supplies doc ids per feature when the cache populates itself.
pub trait PopulateInterface {
    /// Doc ids carrying the feature, ascending; `None` for unknown keys.
    fn lookup(&self, key: u64) -> Option<Vec<u32>>;
}

/// Caches a bit vector per hot feature.
///
/// Keys become known through `lookup_cached_set`; `populate` then builds
/// vectors for them, and writers keep the vectors current.
pub struct BitVectorCache {
    doc_id_limit: AtomicU32,
    need_population: AtomicBool,
    known_keys: RwLock<FxHashSet<u64>>,
    vectors: RwLock<FxHashMap<u64, BitVec>>,
}

impl Default for BitVectorCache {
    fn default() -> Self {
        Self::new(1)
    }
}

impl BitVectorCache {
    #[must_use]
    pub fn new(doc_id_limit: u32) -> Self {
        Self {
            doc_id_limit: AtomicU32::new(doc_id_limit),
            need_population: AtomicBool::new(false),
            known_keys: RwLock::new(FxHashSet::default()),
            vectors: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn require_population(&self) {
        self.need_population.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn needs_population(&self) -> bool {
        self.need_population.load(Ordering::Acquire)
    }

    /// Updates one bit in an already-cached vector.
    pub fn set(&self, key: u64, doc_id: u32, value: bool) {
        if let Ok(mut vectors) = self.vectors.write() {
            if let Some(vector) = vectors.get_mut(&key) {
                if doc_id >= vector.len() {
                    vector.resize(doc_id + 1);
                }
                vector.set(doc_id, value);
            }
        }
    }

    /// Clears the doc from every cached vector.
    pub fn remove_index(&self, doc_id: u32) {
        if let Ok(mut vectors) = self.vectors.write() {
            for vector in vectors.values_mut() {
                vector.set(doc_id, false);
            }
        }
    }

    /// The subset of candidate keys with a hot vector, or the empty set
    /// when the combined count falls below the fill-ratio gate.
    #[must_use]
    pub fn lookup_cached_set(&self, keys_with_counts: &[(u64, u64)]) -> FxHashSet<u64> {
        if let Ok(mut known) = self.known_keys.write() {
            for (key, _) in keys_with_counts {
                if known.insert(*key) {
                    self.require_population();
                }
            }
        }

        let mut cached = FxHashSet::default();
        let mut total_count = 0u64;
        if let Ok(vectors) = self.vectors.read() {
            for (key, count) in keys_with_counts {
                if vectors.contains_key(key) {
                    cached.insert(*key);
                    total_count += count;
                }
            }
        }

        // NOTE: Precision loss is fine for a threshold ratio
        #[allow(clippy::cast_precision_loss)]
        let fill_ratio =
            total_count as f64 / f64::from(self.doc_id_limit.load(Ordering::Acquire).max(1));
        if fill_ratio < THRESHOLD_USE_BIT_VECTOR_CACHE {
            cached.clear();
        }
        cached
    }

    /// Builds vectors for all known keys.
    pub fn populate(&self, doc_id_limit: u32, source: &dyn PopulateInterface) {
        self.doc_id_limit.store(doc_id_limit, Ordering::Release);
        let keys: Vec<u64> = match self.known_keys.read() {
            Ok(known) => known.iter().copied().collect(),
            Err(_) => return,
        };

        let mut fresh = FxHashMap::default();
        for key in keys {
            if let Some(doc_ids) = source.lookup(key) {
                let mut vector = BitVec::with_len(doc_id_limit);
                for doc_id in doc_ids {
                    vector.set(doc_id, true);
                }
                fresh.insert(key, vector);
            }
        }

        if let Ok(mut vectors) = self.vectors.write() {
            *vectors = fresh;
        }
        self.need_population.store(false, Ordering::Release);
    }

    /// Per-doc count of how many of the given keys are set.
    pub fn compute_count_vector(&self, keys: &FxHashSet<u64>, out: &mut [u8]) {
        out.fill(0);
        let Ok(vectors) = self.vectors.read() else {
            return;
        };
        for key in keys {
            if let Some(vector) = vectors.get(key) {
                for (doc_id, count) in out.iter_mut().enumerate() {
                    // NOTE: Truncation is OK, doc ids fit in u32
                    #[allow(clippy::cast_possible_truncation)]
                    if vector.get(doc_id as u32) {
                        *count = count.saturating_add(1);
                    }
                }
            }
        }
    }

    /// Grows cached vectors to cover the new doc id space.
    pub fn adjust_doc_id_limit(&self, doc_id_limit: u32) {
        let previous = self.doc_id_limit.swap(doc_id_limit, Ordering::AcqRel);
        if doc_id_limit <= previous {
            return;
        }
        if let Ok(mut vectors) = self.vectors.write() {
            for vector in vectors.values_mut() {
                vector.resize(doc_id_limit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    struct FixedSource(FxHashMap<u64, Vec<u32>>);

    impl PopulateInterface for FixedSource {
        fn lookup(&self, key: u64) -> Option<Vec<u32>> {
            self.0.get(&key).cloned()
        }
    }

    #[test]
    fn populates_known_keys() {
        let cache = BitVectorCache::new(10);
        // register the key as a candidate
        assert!(cache.lookup_cached_set(&[(7, 5)]).is_empty());
        assert!(cache.needs_population());

        let mut docs = FxHashMap::default();
        docs.insert(7u64, vec![1, 3]);
        cache.populate(10, &FixedSource(docs));

        let cached = cache.lookup_cached_set(&[(7, 5)]);
        assert!(cached.contains(&7));

        let mut counts = vec![0u8; 10];
        cache.compute_count_vector(&cached, &mut counts);
        assert_eq!(1, counts[1]);
        assert_eq!(0, counts[2]);
        assert_eq!(1, counts[3]);
    }

    #[test]
    fn low_fill_ratio_disables_cache() {
        let cache = BitVectorCache::new(1000);
        cache.lookup_cached_set(&[(7, 5)]);
        let mut docs = FxHashMap::default();
        docs.insert(7u64, vec![1]);
        cache.populate(1000, &FixedSource(docs));

        // 5 / 1000 < 0.1
        assert!(cache.lookup_cached_set(&[(7, 5)]).is_empty());
        // 200 / 1000 >= 0.1
        assert!(!cache.lookup_cached_set(&[(7, 200)]).is_empty());
    }

    #[test]
    fn removing_a_doc_clears_its_bits() {
        let cache = BitVectorCache::new(10);
        cache.lookup_cached_set(&[(1, 9)]);
        let mut docs = FxHashMap::default();
        docs.insert(1u64, vec![4]);
        cache.populate(10, &FixedSource(docs));

        cache.remove_index(4);
        let cached = cache.lookup_cached_set(&[(1, 9)]);
        let mut counts = vec![0u8; 10];
        cache.compute_count_vector(&cached, &mut counts);
        assert_eq!(0, counts[4]);
    }
}
