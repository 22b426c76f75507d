// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use crate::generation::{Generation, HoldList};
use crate::predicate::range_expander::expand_range;
use crate::predicate::tree::PredicateTreeAnnotations;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::io::{Read, Write};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Range {
    label_ref: u32,
    from: i64,
    to: i64,
}

#[derive(Clone, Debug, Default)]
struct DocRefs {
    features: Option<Vec<u64>>,
    ranges: Option<Vec<Range>>,
}

impl DocRefs {
    fn is_empty(&self) -> bool {
        self.features.is_none() && self.ranges.is_none()
    }
}

/// Tracks the `{feature id, doc id}` pairs fed into the posting
/// dictionaries, so removing a document can find every posting again.
///
/// Range features are stored as `(label, from, to)` with interned labels
/// and re-expanded to their partition hashes on lookup.
#[derive(Debug, Default)]
pub struct DocumentFeaturesStore {
    refs: Vec<DocRefs>,
    labels: Vec<String>,
    label_index: BTreeMap<String, u32>,
    arity: u32,
    hold: HoldList<Vec<u64>>,
}

impl DocumentFeaturesStore {
    #[must_use]
    pub fn new(arity: u32) -> Self {
        Self {
            arity,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arity(&self) -> u32 {
        self.arity
    }

    fn intern_label(&mut self, label: &str) -> u32 {
        if let Some(&label_ref) = self.label_index.get(label) {
            return label_ref;
        }
        // NOTE: Truncation is OK, label counts stay far below u32::MAX
        #[allow(clippy::cast_possible_truncation)]
        let label_ref = self.labels.len() as u32;
        self.labels.push(label.to_string());
        self.label_index.insert(label.to_string(), label_ref);
        label_ref
    }

    pub fn insert(&mut self, annotations: &PredicateTreeAnnotations, doc_id: u32) {
        debug_assert!(doc_id != 0);
        if doc_id as usize >= self.refs.len() {
            self.refs.resize(doc_id as usize + 1, DocRefs::default());
        }

        if !annotations.features.is_empty() {
            let Some(entry) = self.refs.get_mut(doc_id as usize) else {
                return;
            };
            entry
                .features
                .get_or_insert_with(Vec::new)
                .extend_from_slice(&annotations.features);
        }

        if !annotations.range_features.is_empty() {
            let mut ranges = Vec::with_capacity(annotations.range_features.len());
            for range in &annotations.range_features {
                let label_ref = self.intern_label(&range.label);
                ranges.push(Range {
                    label_ref,
                    from: range.from,
                    to: range.to,
                });
            }
            if let Some(entry) = self.refs.get_mut(doc_id as usize) {
                entry.ranges.get_or_insert_with(Vec::new).extend(ranges);
            }
        }
    }

    /// All feature hashes of a document, ranges expanded back to their
    /// partition hashes.
    #[must_use]
    pub fn get(&self, doc_id: u32) -> FxHashSet<u64> {
        let mut features = FxHashSet::default();
        let Some(entry) = self.refs.get(doc_id as usize) else {
            return features;
        };

        if let Some(doc_features) = &entry.features {
            features.extend(doc_features.iter().copied());
        }
        if let Some(ranges) = &entry.ranges {
            let mut expanded = Vec::new();
            for range in ranges {
                if let Some(label) = self.labels.get(range.label_ref as usize) {
                    expand_range(label, range.from, range.to, self.arity, &mut expanded);
                }
            }
            features.extend(expanded);
        }
        features
    }

    pub fn remove(&mut self, doc_id: u32) {
        let Some(entry) = self.refs.get_mut(doc_id as usize) else {
            return;
        };
        if let Some(features) = entry.features.take() {
            self.hold.hold(features);
        }
        entry.ranges = None;
    }

    pub fn assign_generation(&mut self, current_gen: Generation) {
        self.hold.assign_generation(current_gen);
    }

    pub fn reclaim_memory(&mut self, oldest_used_gen: Generation) {
        self.hold.reclaim(oldest_used_gen);
    }

    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Truncation is OK, all counts stay far below u32::MAX
        #[allow(clippy::cast_possible_truncation)]
        {
            writer.write_u16::<BigEndian>(self.arity as u16)?;

            // labels actually referenced by ranges, in first-use order
            let mut used: Vec<u32> = Vec::new();
            for entry in &self.refs {
                if let Some(ranges) = &entry.ranges {
                    for range in ranges {
                        if !used.contains(&range.label_ref) {
                            used.push(range.label_ref);
                        }
                    }
                }
            }

            writer.write_u32::<BigEndian>(used.len() as u32)?;
            for label_ref in &used {
                let label = self
                    .labels
                    .get(*label_ref as usize)
                    .map_or("", String::as_str);
                writer.write_u32::<BigEndian>(label.len() as u32)?;
                writer.write_all(label.as_bytes())?;
            }

            let range_docs = self
                .refs
                .iter()
                .filter(|e| e.ranges.is_some())
                .count() as u32;
            writer.write_u32::<BigEndian>(range_docs)?;
            for (doc_id, entry) in self.refs.iter().enumerate() {
                let Some(ranges) = &entry.ranges else { continue };
                writer.write_u32::<BigEndian>(doc_id as u32)?;
                writer.write_u32::<BigEndian>(ranges.len() as u32)?;
                for range in ranges {
                    let word_index = used
                        .iter()
                        .position(|r| *r == range.label_ref)
                        .unwrap_or_default() as u32;
                    writer.write_u32::<BigEndian>(word_index)?;
                    writer.write_i64::<BigEndian>(range.from)?;
                    writer.write_i64::<BigEndian>(range.to)?;
                }
            }

            let feature_docs = self
                .refs
                .iter()
                .filter(|e| e.features.is_some())
                .count() as u32;
            writer.write_u32::<BigEndian>(feature_docs)?;
            for (doc_id, entry) in self.refs.iter().enumerate() {
                let Some(features) = &entry.features else { continue };
                writer.write_u32::<BigEndian>(doc_id as u32)?;
                writer.write_u32::<BigEndian>(features.len() as u32)?;
                for feature in features {
                    writer.write_u64::<BigEndian>(*feature)?;
                }
            }
        }
        Ok(())
    }

    pub fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let arity = u32::from(reader.read_u16::<BigEndian>()?);
        let mut store = Self::new(arity);

        let word_count = reader.read_u32::<BigEndian>()?;
        let mut word_refs = Vec::with_capacity(word_count as usize);
        for _ in 0..word_count {
            let len = reader.read_u32::<BigEndian>()? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            let label = String::from_utf8(buf)?;
            word_refs.push(store.intern_label(&label));
        }

        let range_docs = reader.read_u32::<BigEndian>()?;
        for _ in 0..range_docs {
            let doc_id = reader.read_u32::<BigEndian>()?;
            let range_count = reader.read_u32::<BigEndian>()?;
            if doc_id as usize >= store.refs.len() {
                store
                    .refs
                    .resize(doc_id as usize + 1, DocRefs::default());
            }
            let mut ranges = Vec::with_capacity(range_count as usize);
            for _ in 0..range_count {
                let word_index = reader.read_u32::<BigEndian>()?;
                let from = reader.read_i64::<BigEndian>()?;
                let to = reader.read_i64::<BigEndian>()?;
                let label_ref = word_refs
                    .get(word_index as usize)
                    .copied()
                    .ok_or(DecodeError::InvalidHeader("DocumentFeaturesStore"))?;
                ranges.push(Range {
                    label_ref,
                    from,
                    to,
                });
            }
            if let Some(entry) = store.refs.get_mut(doc_id as usize) {
                entry.ranges = Some(ranges);
            }
        }

        let feature_docs = reader.read_u32::<BigEndian>()?;
        for _ in 0..feature_docs {
            let doc_id = reader.read_u32::<BigEndian>()?;
            let feature_count = reader.read_u32::<BigEndian>()?;
            if doc_id as usize >= store.refs.len() {
                store
                    .refs
                    .resize(doc_id as usize + 1, DocRefs::default());
            }
            let mut features = Vec::with_capacity(feature_count as usize);
            for _ in 0..feature_count {
                features.push(reader.read_u64::<BigEndian>()?);
            }
            if let Some(entry) = store.refs.get_mut(doc_id as usize) {
                entry.features = Some(features);
            }
        }

        Ok(store)
    }

    #[must_use]
    pub fn memory_usage(&self) -> usize {
        let mut usage = self.refs.capacity() * std::mem::size_of::<DocRefs>();
        for entry in &self.refs {
            if !entry.is_empty() {
                usage += entry.features.as_ref().map_or(0, |f| f.len() * 8);
                usage += entry
                    .ranges
                    .as_ref()
                    .map_or(0, |r| r.len() * std::mem::size_of::<Range>());
            }
        }
        usage
    }
}
