// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeSet;
use std::io::{Read, Write};

/// Bucket-index bits of the dense representation.
pub const PRECISION: u32 = 10;

/// Number of dense buckets (2^PRECISION).
pub const BUCKET_COUNT: usize = 1 << PRECISION;

// A sparse entry is a raw 4-byte hash, a dense bucket is one byte.
// Promotion happens once the sparse set would outgrow the dense array.
const SPARSE_LIMIT: usize = BUCKET_COUNT / 4;

const SKETCH_TAG_SPARSE: u32 = 0;
const SKETCH_TAG_NORMAL: u32 = 1;

/// Sparse representation: the set of raw hashes seen so far.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseSketch {
    hashes: BTreeSet<u32>,
}

impl SparseSketch {
    /// Returns 1 if the hash was new, used as the rank delta.
    fn aggregate(&mut self, hash: u32) -> u32 {
        u32::from(self.hashes.insert(hash))
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Dense representation: one max-rank byte per bucket.
#[derive(Clone)]
pub struct NormalSketch {
    bucket: Box<[u8; BUCKET_COUNT]>,
}

impl Default for NormalSketch {
    fn default() -> Self {
        Self {
            bucket: Box::new([0; BUCKET_COUNT]),
        }
    }
}

impl std::fmt::Debug for NormalSketch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NormalSketch(sum={})", self.bucket_sum())
    }
}

impl PartialEq for NormalSketch {
    fn eq(&self, other: &Self) -> bool {
        self.bucket[..] == other.bucket[..]
    }
}

impl Eq for NormalSketch {}

impl NormalSketch {
    // Bucket index from the low PRECISION bits, rank from the position of
    // the first set bit of the remaining ones.
    fn split(hash: u32) -> (usize, u8) {
        let index = (hash as usize) & (BUCKET_COUNT - 1);
        let rest = hash >> PRECISION;
        // NOTE: Truncation is OK, the rank is at most 32 - PRECISION + 1
        #[allow(clippy::cast_possible_truncation)]
        let rank = (rest.trailing_zeros().min(32 - PRECISION) + 1) as u8;
        (index, rank)
    }

    /// Updates one bucket, returning the increase of the bucket sum.
    fn aggregate(&mut self, hash: u32) -> u32 {
        let (index, rank) = Self::split(hash);

        // NOTE: index is masked to BUCKET_COUNT
        #[allow(clippy::indexing_slicing)]
        let slot = &mut self.bucket[index];

        if rank > *slot {
            let delta = u32::from(rank - *slot);
            *slot = rank;
            delta
        } else {
            0
        }
    }

    fn merge(&mut self, other: &Self) -> u32 {
        let mut delta = 0;
        for (mine, theirs) in self.bucket.iter_mut().zip(other.bucket.iter()) {
            if *theirs > *mine {
                delta += u32::from(*theirs - *mine);
                *mine = *theirs;
            }
        }
        delta
    }

    pub fn bucket_sum(&self) -> u32 {
        self.bucket.iter().map(|b| u32::from(*b)).sum()
    }
}

/// Either representation of the HLL state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sketch {
    Sparse(SparseSketch),
    Normal(NormalSketch),
}

impl Default for Sketch {
    fn default() -> Self {
        Self::Sparse(SparseSketch::default())
    }
}

/// HyperLogLog cardinality sketch with precision 10.
///
/// Stays sparse (a set of raw hashes) until promotion pays off, then
/// switches to 1024 max-rank buckets. `aggregate` returns the increase of
/// the maintained bucket sum; the aggregation engine uses that delta to
/// keep a monotonic rank proxy without re-estimating.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HyperLogLog {
    sketch: Sketch,
}

impl HyperLogLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sketch(&self) -> &Sketch {
        &self.sketch
    }

    /// Feeds one hash, returning the rank delta.
    pub fn aggregate(&mut self, hash: u32) -> u32 {
        let delta = match &mut self.sketch {
            Sketch::Sparse(sparse) => sparse.aggregate(hash),
            Sketch::Normal(normal) => normal.aggregate(hash),
        };
        self.promote_if_needed();
        delta
    }

    /// Merges another sketch into this one. Commutative and associative.
    pub fn merge(&mut self, other: &Self) {
        match &other.sketch {
            Sketch::Sparse(theirs) => match &mut self.sketch {
                Sketch::Sparse(mine) => {
                    mine.hashes.extend(theirs.hashes.iter().copied());
                }
                Sketch::Normal(mine) => {
                    for hash in &theirs.hashes {
                        mine.aggregate(*hash);
                    }
                }
            },
            Sketch::Normal(theirs) => {
                let replacement = match &mut self.sketch {
                    Sketch::Normal(mine) => {
                        mine.merge(theirs);
                        None
                    }
                    Sketch::Sparse(mine) => {
                        let mut normal = theirs.clone();
                        for hash in &mine.hashes {
                            normal.aggregate(*hash);
                        }
                        Some(normal)
                    }
                };
                if let Some(normal) = replacement {
                    self.sketch = Sketch::Normal(normal);
                }
            }
        }
        self.promote_if_needed();
    }

    /// The maintained bucket sum (sparse: distinct hash count).
    #[must_use]
    pub fn bucket_sum(&self) -> u32 {
        match &self.sketch {
            // NOTE: Truncation is OK, the sparse set is capped at SPARSE_LIMIT
            #[allow(clippy::cast_possible_truncation)]
            Sketch::Sparse(sparse) => sparse.len() as u32,
            Sketch::Normal(normal) => normal.bucket_sum(),
        }
    }

    /// Bias-corrected cardinality estimate.
    #[must_use]
    pub fn estimate(&self) -> f64 {
        match &self.sketch {
            // NOTE: f64 holds every u32 exactly
            #[allow(clippy::cast_precision_loss)]
            Sketch::Sparse(sparse) => sparse.len() as f64,
            Sketch::Normal(normal) => {
                #[allow(clippy::cast_precision_loss)]
                let m = BUCKET_COUNT as f64;
                let alpha = 0.7213 / (1.0 + 1.079 / m);

                let mut sum = 0.0;
                let mut zeros = 0u32;
                for b in normal.bucket.iter() {
                    sum += (-f64::from(i32::from(*b))).exp2();
                    if *b == 0 {
                        zeros += 1;
                    }
                }
                let raw = alpha * m * m / sum;

                if raw <= 2.5 * m && zeros > 0 {
                    // linear counting for the low range
                    m * (m / f64::from(zeros)).ln()
                } else {
                    raw
                }
            }
        }
    }

    fn promote_if_needed(&mut self) {
        let promote = matches!(&self.sketch, Sketch::Sparse(sparse) if sparse.len() > SPARSE_LIMIT);
        if !promote {
            return;
        }
        let mut normal = NormalSketch::default();
        if let Sketch::Sparse(sparse) = &self.sketch {
            for hash in &sparse.hashes {
                normal.aggregate(*hash);
            }
        }
        self.sketch = Sketch::Normal(normal);
    }
}

impl Encode for HyperLogLog {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match &self.sketch {
            Sketch::Sparse(sparse) => {
                writer.write_u32::<BigEndian>(SKETCH_TAG_SPARSE)?;

                // NOTE: Truncation is OK, the sparse set is capped at SPARSE_LIMIT
                #[allow(clippy::cast_possible_truncation)]
                writer.write_u32::<BigEndian>(sparse.hashes.len() as u32)?;

                for hash in &sparse.hashes {
                    writer.write_u32::<BigEndian>(*hash)?;
                }
            }
            Sketch::Normal(normal) => {
                writer.write_u32::<BigEndian>(SKETCH_TAG_NORMAL)?;
                writer.write_all(&normal.bucket[..])?;
            }
        }
        Ok(())
    }
}

impl Decode for HyperLogLog {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u32::<BigEndian>()?;

        match tag {
            SKETCH_TAG_SPARSE => {
                let count = reader.read_u32::<BigEndian>()?;
                let mut hashes = BTreeSet::new();
                for _ in 0..count {
                    hashes.insert(reader.read_u32::<BigEndian>()?);
                }
                Ok(Self {
                    sketch: Sketch::Sparse(SparseSketch { hashes }),
                })
            }
            SKETCH_TAG_NORMAL => {
                let mut normal = NormalSketch::default();
                reader.read_exact(&mut normal.bucket[..])?;
                Ok(Self {
                    sketch: Sketch::Normal(normal),
                })
            }
            tag => Err(DecodeError::InvalidTag(("Sketch", tag))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn sparse_counts_distinct_hashes() {
        let mut hll = HyperLogLog::new();
        assert_eq!(1, hll.aggregate(7));
        assert_eq!(0, hll.aggregate(7));
        assert_eq!(1, hll.aggregate(8));
        assert_eq!(2, hll.bucket_sum());
    }

    #[test]
    fn promotes_to_normal() {
        let mut hll = HyperLogLog::new();
        for i in 0..=SPARSE_LIMIT as u32 {
            hll.aggregate(i.wrapping_mul(0x9e37_79b9));
        }
        assert!(matches!(hll.sketch(), Sketch::Normal(_)));
    }

    #[test]
    fn merge_equals_individual_aggregation() {
        let mut a = HyperLogLog::new();
        let mut b = HyperLogLog::new();
        let mut both = HyperLogLog::new();

        for i in 0u32..2000 {
            let hash = i.wrapping_mul(0x85eb_ca6b) ^ (i << 13);
            if i % 2 == 0 {
                a.aggregate(hash);
            } else {
                b.aggregate(hash);
            }
            both.aggregate(hash);
        }

        a.merge(&b);
        assert_eq!(both, a);
    }

    #[test]
    fn serde_roundtrip() -> Result<(), DecodeError> {
        let mut hll = HyperLogLog::new();
        for i in 0u32..5000 {
            hll.aggregate(i.wrapping_mul(0xc2b2_ae35));
        }

        let bytes = hll.encode_into_vec();
        let decoded = HyperLogLog::decode_from(&mut &bytes[..])?;
        assert_eq!(hll, decoded);

        Ok(())
    }
}
