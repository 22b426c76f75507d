// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::DecodeError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use varint_rs::{VarintReader, VarintWriter};

const DEFAULT_K: u16 = 200;

/// KLL rank sketch over f64 values.
///
/// Items enter the level-0 buffer with weight 1; a full level is sorted and
/// every other survivor moves one level up, doubling its weight. The
/// compaction offset alternates deterministically, so two sketches fed the
/// same value sequence are identical.
#[derive(Clone, Debug, PartialEq)]
pub struct KllSketch {
    k: u16,
    n: u64,
    min: f64,
    max: f64,
    compactions: u64,
    levels: Vec<Vec<f64>>,
}

impl Default for KllSketch {
    fn default() -> Self {
        Self::with_k(DEFAULT_K)
    }
}

impl KllSketch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_k(k: u16) -> Self {
        Self {
            k: k.max(8),
            n: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            compactions: 0,
            levels: vec![Vec::new()],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.n
    }

    pub fn update(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.n += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        // NOTE: level 0 always exists
        #[allow(clippy::indexing_slicing)]
        self.levels[0].push(value);
        self.compress();
    }

    /// Merges another sketch. Approximation error composes, exact content
    /// equality across merge orders is not guaranteed.
    pub fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        self.n += other.n;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);

        while self.levels.len() < other.levels.len() {
            self.levels.push(Vec::new());
        }
        for (mine, theirs) in self.levels.iter_mut().zip(other.levels.iter()) {
            mine.extend_from_slice(theirs);
        }
        self.compress();
    }

    /// Returns the approximate `q`-quantile, `q` in [0, 1].
    #[must_use]
    pub fn quantile(&self, q: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        if q <= 0.0 {
            return self.min;
        }
        if q >= 1.0 {
            return self.max;
        }

        let mut weighted: Vec<(f64, u64)> = Vec::new();
        for (level, items) in self.levels.iter().enumerate() {
            let weight = 1u64 << level;
            weighted.extend(items.iter().map(|v| (*v, weight)));
        }
        weighted.sort_by(|a, b| a.0.total_cmp(&b.0));

        // NOTE: n is far below 2^53
        #[allow(clippy::cast_precision_loss)]
        let target = q * self.n as f64;
        let mut cumulative = 0u64;
        for (value, weight) in &weighted {
            cumulative += weight;
            #[allow(clippy::cast_precision_loss)]
            if cumulative as f64 >= target {
                return *value;
            }
        }
        self.max
    }

    fn capacity(&self, level: usize) -> usize {
        let depth = self.levels.len();
        // NOTE: level < depth by construction
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let cap = (f64::from(self.k) * (2.0f64 / 3.0).powi((depth - 1 - level) as i32)).ceil() as usize;
        cap.max(2)
    }

    fn compress(&mut self) {
        let mut level = 0;
        while level < self.levels.len() {
            if self.level_len(level) > self.capacity(level) {
                self.compact(level);
            }
            level += 1;
        }
    }

    fn level_len(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, Vec::len)
    }

    fn compact(&mut self, level: usize) {
        if level + 1 == self.levels.len() {
            self.levels.push(Vec::new());
        }

        // NOTE: both levels exist after the push above
        #[allow(clippy::indexing_slicing)]
        let mut items = std::mem::take(&mut self.levels[level]);
        items.sort_by(f64::total_cmp);

        // An odd leftover stays at the current level, keeping the total
        // weight of the sketch equal to n.
        if items.len() % 2 == 1 {
            if let Some(leftover) = items.pop() {
                #[allow(clippy::indexing_slicing)]
                self.levels[level].push(leftover);
            }
        }

        let offset = (self.compactions & 1) as usize;
        self.compactions += 1;

        let survivors: Vec<f64> = items.iter().skip(offset).step_by(2).copied().collect();

        #[allow(clippy::indexing_slicing)]
        self.levels[level + 1].extend_from_slice(&survivors);
    }

    /// Self-describing byte format: varint framing, big-endian value bits.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();

        // writes into a Vec cannot fail
        buf.write_u32_varint(u32::from(self.k)).expect("cannot fail");
        buf.write_u64_varint(self.n).expect("cannot fail");
        buf.write_u64_varint(self.compactions).expect("cannot fail");
        buf.write_u64::<BigEndian>(self.min.to_bits())
            .expect("cannot fail");
        buf.write_u64::<BigEndian>(self.max.to_bits())
            .expect("cannot fail");

        // NOTE: Truncation is OK, level count grows logarithmically
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u32_varint(self.levels.len() as u32)
            .expect("cannot fail");

        for level in &self.levels {
            #[allow(clippy::cast_possible_truncation)]
            buf.write_u32_varint(level.len() as u32).expect("cannot fail");
            for value in level {
                buf.write_u64::<BigEndian>(value.to_bits())
                    .expect("cannot fail");
            }
        }
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = std::io::Cursor::new(bytes);

        let k = reader.read_u32_varint()?;
        let n = reader.read_u64_varint()?;
        let compactions = reader.read_u64_varint()?;
        let min = f64::from_bits(reader.read_u64::<BigEndian>()?);
        let max = f64::from_bits(reader.read_u64::<BigEndian>()?);

        let level_count = reader.read_u32_varint()?;
        let mut levels = Vec::with_capacity(level_count as usize);
        for _ in 0..level_count {
            let len = reader.read_u32_varint()?;
            let mut level = Vec::with_capacity(len as usize);
            for _ in 0..len {
                level.push(f64::from_bits(reader.read_u64::<BigEndian>()?));
            }
            levels.push(level);
        }
        if levels.is_empty() {
            levels.push(Vec::new());
        }

        // NOTE: Truncation is OK, k was written from a u16
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            k: k as u16,
            n,
            min,
            max,
            compactions,
            levels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn exact_for_small_inputs() {
        let mut sketch = KllSketch::new();
        for i in 1..=100 {
            sketch.update(f64::from(i));
        }
        assert_eq!(100, sketch.len());
        assert!((sketch.quantile(0.5) - 50.0).abs() <= 1.0);
        assert!((sketch.quantile(0.0) - 1.0).abs() < f64::EPSILON);
        assert!((sketch.quantile(1.0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deterministic_for_same_input() {
        let mut a = KllSketch::new();
        let mut b = KllSketch::new();
        for i in 0..10_000 {
            let v = f64::from(i % 997);
            a.update(v);
            b.update(v);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn approximate_median_over_large_input() {
        let mut sketch = KllSketch::new();
        for i in 0..100_000 {
            sketch.update(f64::from(i));
        }
        let median = sketch.quantile(0.5);
        assert!((median - 50_000.0).abs() < 5_000.0, "median was {median}");
    }

    #[test]
    fn merge_combines_counts() {
        let mut a = KllSketch::new();
        let mut b = KllSketch::new();
        for i in 0..1000 {
            a.update(f64::from(i));
            b.update(f64::from(i + 1000));
        }
        a.merge(&b);
        assert_eq!(2000, a.len());
        let q = a.quantile(0.5);
        assert!((q - 1000.0).abs() < 200.0, "q was {q}");
    }

    #[test]
    fn serde_roundtrip() -> Result<(), DecodeError> {
        let mut sketch = KllSketch::new();
        for i in 0..5000 {
            sketch.update(f64::from(i) * 0.25);
        }
        let bytes = sketch.serialize();
        let decoded = KllSketch::deserialize(&bytes)?;
        assert_eq!(sketch, decoded);
        Ok(())
    }
}
