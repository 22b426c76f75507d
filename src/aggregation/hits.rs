// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::aggregation::AggregationOps;
use crate::coding::{
    decode_bytes, decode_string, encode_bytes, encode_string, DecodeError, EncodeError,
};
use crate::expression::{ExecutionInput, ResultNode};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{Read, Write};
use std::sync::Arc;

const CLASS_FS_HIT: u32 = 150;
const CLASS_VDS_HIT: u32 = 151;

/// Twelve-byte global document id.
pub type GlobalId = [u8; 12];

/// Produces summary blobs for id-carrying hits.
pub trait SummaryGenerator: Send + Sync {
    fn fill_summary(&self, lid: u32, summary_class: &str) -> Vec<u8>;
}

/// A lid-based hit from the match pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct FsHit {
    rank: f64,
    path: u32,
    doc_id: u32,
    global_id: Option<GlobalId>,
    distribution_key: i32,
}

impl FsHit {
    #[must_use]
    pub fn new(doc_id: u32, rank: f64) -> Self {
        Self {
            rank,
            path: 0,
            doc_id,
            global_id: None,
            distribution_key: -1,
        }
    }

    #[must_use]
    pub fn rank(&self) -> f64 {
        self.rank
    }

    #[must_use]
    pub fn doc_id(&self) -> u32 {
        self.doc_id
    }

    #[must_use]
    pub fn global_id(&self) -> Option<&GlobalId> {
        self.global_id.as_ref()
    }

    pub fn set_global_id(&mut self, global_id: GlobalId) {
        self.global_id = Some(global_id);
    }

    #[must_use]
    pub fn with_distribution_key(mut self, key: i32) -> Self {
        self.distribution_key = key;
        self
    }
}

impl Eq for FsHit {}

// Better hits order first: descending rank, doc id breaks ties.
impl Ord for FsHit {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rank
            .total_cmp(&self.rank)
            .then_with(|| self.doc_id.cmp(&other.doc_id))
    }
}

impl PartialOrd for FsHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An id-plus-summary hit from the streaming pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct VdsHit {
    rank: f64,
    doc_id: String,
    summary: Vec<u8>,
}

impl VdsHit {
    #[must_use]
    pub fn new(doc_id: impl Into<String>, rank: f64) -> Self {
        Self {
            rank,
            doc_id: doc_id.into(),
            summary: Vec::new(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> f64 {
        self.rank
    }

    #[must_use]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    #[must_use]
    pub fn summary(&self) -> &[u8] {
        &self.summary
    }

    pub fn set_summary(&mut self, summary: Vec<u8>) {
        self.summary = summary;
    }
}

impl Eq for VdsHit {}

impl Ord for VdsHit {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rank
            .total_cmp(&self.rank)
            .then_with(|| self.doc_id.cmp(&other.doc_id))
    }
}

impl PartialOrd for VdsHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded top-K lists of both hit forms; both may coexist.
///
/// The heap root is the currently-worst retained hit, so insertion beyond
/// capacity is a peek, pop and push.
#[derive(Clone, Debug, Default)]
pub struct HitList {
    fs_hits: BinaryHeap<FsHit>,
    vds_hits: BinaryHeap<VdsHit>,
}

impl PartialEq for HitList {
    fn eq(&self, other: &Self) -> bool {
        self.sorted_fs_hits() == other.sorted_fs_hits()
            && self.sorted_vds_hits() == other.sorted_vds_hits()
    }
}

impl HitList {
    #[must_use]
    pub fn len(&self) -> usize {
        self.fs_hits.len() + self.vds_hits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fs_hits.is_empty() && self.vds_hits.is_empty()
    }

    pub fn add_fs_hit(&mut self, hit: FsHit, max_hits: u32) {
        if self.fs_hits.len() < max_hits as usize {
            self.fs_hits.push(hit);
        } else if let Some(worst) = self.fs_hits.peek() {
            if hit.cmp(worst) == Ordering::Less {
                self.fs_hits.pop();
                self.fs_hits.push(hit);
            }
        }
    }

    pub fn add_vds_hit(&mut self, hit: VdsHit, max_hits: u32) {
        if self.vds_hits.len() < max_hits as usize {
            self.vds_hits.push(hit);
        } else if let Some(worst) = self.vds_hits.peek() {
            if hit.cmp(worst) == Ordering::Less {
                self.vds_hits.pop();
                self.vds_hits.push(hit);
            }
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.fs_hits.extend(other.fs_hits.iter().cloned());
        self.vds_hits.extend(other.vds_hits.iter().cloned());
    }

    /// Sorts both contributions and truncates to the hit budget.
    pub fn post_merge(&mut self, max_hits: u32) {
        let mut fs = std::mem::take(&mut self.fs_hits).into_sorted_vec();
        fs.truncate(max_hits as usize);
        self.fs_hits = BinaryHeap::from(fs);

        let mut vds = std::mem::take(&mut self.vds_hits).into_sorted_vec();
        vds.truncate(max_hits as usize);
        self.vds_hits = BinaryHeap::from(vds);
    }

    pub fn clear(&mut self) {
        self.fs_hits.clear();
        self.vds_hits.clear();
    }

    /// Best-first order.
    #[must_use]
    pub fn sorted_fs_hits(&self) -> Vec<FsHit> {
        self.fs_hits.clone().into_sorted_vec()
    }

    /// Best-first order.
    #[must_use]
    pub fn sorted_vds_hits(&self) -> Vec<VdsHit> {
        self.vds_hits.clone().into_sorted_vec()
    }

    /// The best rank over both lists.
    #[must_use]
    pub fn best_rank(&self) -> Option<f64> {
        let fs = self.fs_hits.iter().min().map(|h| h.rank);
        let vds = self.vds_hits.iter().min().map(|h| h.rank);
        match (fs, vds) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn fs_hits_mut(&mut self) -> Vec<FsHit> {
        std::mem::take(&mut self.fs_hits).into_vec()
    }

    pub(crate) fn set_fs_hits(&mut self, hits: Vec<FsHit>) {
        self.fs_hits = BinaryHeap::from(hits);
    }

    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Truncation is OK, hit lists are bounded
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.len() as u32)?;
        for hit in &self.fs_hits {
            writer.write_u32::<BigEndian>(CLASS_FS_HIT)?;
            writer.write_u64::<BigEndian>(hit.rank.to_bits())?;
            writer.write_u32::<BigEndian>(hit.path)?;
            writer.write_u32::<BigEndian>(hit.doc_id)?;
            match &hit.global_id {
                Some(gid) => {
                    writer.write_u8(1)?;
                    writer.write_all(gid)?;
                }
                None => writer.write_u8(0)?,
            }
            writer.write_i32::<BigEndian>(hit.distribution_key)?;
        }
        for hit in &self.vds_hits {
            writer.write_u32::<BigEndian>(CLASS_VDS_HIT)?;
            writer.write_u64::<BigEndian>(hit.rank.to_bits())?;
            encode_string(writer, &hit.doc_id)?;
            encode_bytes(writer, &hit.summary)?;
        }
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let count = reader.read_u32::<BigEndian>()?;
        let mut list = Self::default();
        for _ in 0..count {
            let class_id = reader.read_u32::<BigEndian>()?;
            match class_id {
                CLASS_FS_HIT => {
                    let rank = f64::from_bits(reader.read_u64::<BigEndian>()?);
                    let path = reader.read_u32::<BigEndian>()?;
                    let doc_id = reader.read_u32::<BigEndian>()?;
                    let global_id = if reader.read_u8()? != 0 {
                        let mut gid = [0u8; 12];
                        reader.read_exact(&mut gid)?;
                        Some(gid)
                    } else {
                        None
                    };
                    let distribution_key = reader.read_i32::<BigEndian>()?;
                    list.fs_hits.push(FsHit {
                        rank,
                        path,
                        doc_id,
                        global_id,
                        distribution_key,
                    });
                }
                CLASS_VDS_HIT => {
                    let rank = f64::from_bits(reader.read_u64::<BigEndian>()?);
                    let doc_id = decode_string(reader)?;
                    let summary = decode_bytes(reader)?;
                    list.vds_hits.push(VdsHit {
                        rank,
                        doc_id,
                        summary,
                    });
                }
                tag => return Err(DecodeError::InvalidTag(("Hit", tag))),
            }
        }
        Ok(list)
    }
}

/// Bounded top-K hit collector.
#[derive(Clone)]
pub struct HitsResult {
    summary_class: String,
    max_hits: u32,
    hits: HitList,
    is_ordered: bool,
    summary_generator: Option<Arc<dyn SummaryGenerator>>,
}

impl Default for HitsResult {
    fn default() -> Self {
        Self {
            summary_class: "default".into(),
            max_hits: u32::MAX,
            hits: HitList::default(),
            is_ordered: false,
            summary_generator: None,
        }
    }
}

impl std::fmt::Debug for HitsResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HitsResult")
            .field("summary_class", &self.summary_class)
            .field("max_hits", &self.max_hits)
            .field("hits", &self.hits.len())
            .field("is_ordered", &self.is_ordered)
            .finish()
    }
}

impl PartialEq for HitsResult {
    fn eq(&self, other: &Self) -> bool {
        self.summary_class == other.summary_class
            && self.max_hits == other.max_hits
            && self.hits == other.hits
    }
}

impl HitsResult {
    #[must_use]
    pub fn new(max_hits: u32) -> Self {
        let mut result = Self::default();
        result.set_max_hits(max_hits);
        result
    }

    /// Zero means unbounded.
    pub fn set_max_hits(&mut self, max_hits: u32) {
        self.max_hits = if max_hits == 0 { u32::MAX } else { max_hits };
    }

    #[must_use]
    pub fn max_hits(&self) -> u32 {
        self.max_hits
    }

    pub fn set_summary_class(&mut self, summary_class: impl Into<String>) {
        self.summary_class = summary_class.into();
    }

    pub fn set_summary_generator(&mut self, generator: Arc<dyn SummaryGenerator>) {
        self.summary_generator = Some(generator);
    }

    pub fn set_ordered(&mut self, ordered: bool) {
        self.is_ordered = ordered;
    }

    #[must_use]
    pub fn hits(&self) -> &HitList {
        &self.hits
    }

    pub fn hits_mut(&mut self) -> &mut HitList {
        &mut self.hits
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.hits.merge(&other.hits);
    }

    pub(crate) fn encode_state<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        encode_string(writer, &self.summary_class)?;
        writer.write_u32::<BigEndian>(self.max_hits)?;
        self.hits.encode_into(writer)
    }

    pub(crate) fn decode_state<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let summary_class = decode_string(reader)?;
        let max_hits = reader.read_u32::<BigEndian>()?;
        let hits = HitList::decode_from(reader)?;
        let mut result = Self {
            summary_class,
            max_hits,
            hits,
            is_ordered: false,
            summary_generator: None,
        };
        if result.max_hits == 0 {
            result.max_hits = u32::MAX;
        }
        Ok(result)
    }
}

impl AggregationOps for HitsResult {
    fn prepare(&mut self, _sample: &ResultNode, _use_for_init: bool) {}

    fn on_aggregate(
        &mut self,
        _value: &ResultNode,
        input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        // In ordered mode the input stream is rank-sorted, so a full list
        // cannot improve anymore.
        if self.is_ordered && self.hits.len() >= self.max_hits as usize {
            return Ok(());
        }

        match (input.document_id, &self.summary_generator) {
            (Some(document_id), Some(generator)) => {
                let mut hit = VdsHit::new(document_id, input.rank);
                hit.set_summary(generator.fill_summary(input.doc_id, &self.summary_class));
                self.hits.add_vds_hit(hit, self.max_hits);
            }
            _ => {
                self.hits
                    .add_fs_hit(FsHit::new(input.doc_id, input.rank), self.max_hits);
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.hits.clear();
    }

    fn post_merge(&mut self) {
        self.hits.post_merge(self.max_hits);
    }

    fn rank(&self) -> ResultNode {
        ResultNode::Float(self.hits.best_rank().unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn top_k_by_rank() {
        let mut result = HitsResult::new(3);
        for (doc_id, rank) in [(1, 0.9), (2, 0.8), (3, 0.7), (4, 0.95), (5, 0.6), (6, 0.85)] {
            result
                .on_aggregate(&ResultNode::Integer(0), &ExecutionInput::new(doc_id, rank))
                .expect("cannot fail");
        }

        let ranks: Vec<f64> = result.hits().sorted_fs_hits().iter().map(FsHit::rank).collect();
        assert_eq!(vec![0.95, 0.9, 0.85], ranks);
    }

    #[test]
    fn zero_max_hits_means_unbounded() {
        let result = HitsResult::new(0);
        assert_eq!(u32::MAX, result.max_hits());
    }

    #[test]
    fn post_merge_truncates_concatenation() {
        let mut a = HitsResult::new(2);
        let mut b = HitsResult::new(2);
        for (doc_id, rank) in [(1, 0.5), (2, 0.9)] {
            a.on_aggregate(&ResultNode::Integer(0), &ExecutionInput::new(doc_id, rank))
                .expect("cannot fail");
        }
        for (doc_id, rank) in [(3, 0.7), (4, 0.2)] {
            b.on_aggregate(&ResultNode::Integer(0), &ExecutionInput::new(doc_id, rank))
                .expect("cannot fail");
        }

        a.merge(&b);
        a.post_merge();

        let docs: Vec<u32> = a.hits().sorted_fs_hits().iter().map(FsHit::doc_id).collect();
        assert_eq!(vec![2, 3], docs);
    }

    #[test]
    fn ordered_mode_stops_collecting_when_full() {
        let mut result = HitsResult::new(1);
        result.set_ordered(true);
        for (doc_id, rank) in [(1, 0.9), (2, 0.8)] {
            result
                .on_aggregate(&ResultNode::Integer(0), &ExecutionInput::new(doc_id, rank))
                .expect("cannot fail");
        }
        assert_eq!(1, result.hits().len());
        assert_eq!(Some(0.9), result.hits().best_rank());
    }
}
