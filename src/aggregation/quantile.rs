// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::aggregation::AggregationOps;
use crate::coding::{decode_bytes, encode_bytes, DecodeError, EncodeError};
use crate::expression::{ExecutionInput, ResultNode};
use crate::sketch::KllSketch;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Collects values into a KLL sketch and reports the requested quantiles.
///
/// Quantiles never participate in ranking, the rank is a constant zero.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuantileResult {
    quantiles: Vec<f64>,
    // Leave a byte to make it easier to change the sketch in the future.
    extension: u8,
    sketch: KllSketch,
}

impl QuantileResult {
    #[must_use]
    pub fn new(quantiles: Vec<f64>) -> Self {
        Self {
            quantiles,
            extension: 0,
            sketch: KllSketch::new(),
        }
    }

    #[must_use]
    pub fn quantiles(&self) -> &[f64] {
        &self.quantiles
    }

    pub fn set_quantiles(&mut self, quantiles: Vec<f64>) {
        self.quantiles = quantiles;
    }

    #[must_use]
    pub fn sketch(&self) -> &KllSketch {
        &self.sketch
    }

    /// `(quantile, value)` pairs for the requested quantiles.
    #[must_use]
    pub fn quantile_results(&self) -> Vec<(f64, f64)> {
        self.quantiles
            .iter()
            .map(|q| {
                let value = if self.sketch.is_empty() {
                    0.0
                } else {
                    self.sketch.quantile(*q)
                };
                (*q, value)
            })
            .collect()
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.sketch.merge(&other.sketch);
    }

    pub(crate) fn encode_state<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Truncation is OK, a handful of quantiles is requested
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.quantiles.len() as u32)?;
        for q in &self.quantiles {
            writer.write_u64::<BigEndian>(q.to_bits())?;
        }
        writer.write_u8(self.extension)?;
        encode_bytes(writer, &self.sketch.serialize())?;
        Ok(())
    }

    pub(crate) fn decode_state<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let count = reader.read_u32::<BigEndian>()?;
        let mut quantiles = Vec::with_capacity(count as usize);
        for _ in 0..count {
            quantiles.push(f64::from_bits(reader.read_u64::<BigEndian>()?));
        }
        let extension = reader.read_u8()?;
        let sketch = KllSketch::deserialize(&decode_bytes(reader)?)?;
        Ok(Self {
            quantiles,
            extension,
            sketch,
        })
    }
}

impl AggregationOps for QuantileResult {
    fn prepare(&mut self, _sample: &ResultNode, _use_for_init: bool) {}

    fn on_aggregate(
        &mut self,
        value: &ResultNode,
        _input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        if let ResultNode::Vector(v) = value {
            for element in v.iter() {
                self.sketch.update(element.as_float());
            }
        } else {
            self.sketch.update(value.as_float());
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.sketch = KllSketch::new();
    }

    fn rank(&self) -> ResultNode {
        ResultNode::Float(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn reports_requested_quantiles() {
        let mut result = QuantileResult::new(vec![0.0, 0.5, 1.0]);
        for i in 1..=99 {
            result
                .on_aggregate(&ResultNode::Integer(i), &ExecutionInput::new(0, 0.0))
                .expect("cannot fail");
        }
        let results = result.quantile_results();
        assert_eq!(3, results.len());
        assert!((results[0].1 - 1.0).abs() < f64::EPSILON);
        assert!((results[1].1 - 50.0).abs() <= 2.0);
        assert!((results[2].1 - 99.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_sketch_reports_zero() {
        let result = QuantileResult::new(vec![0.5]);
        assert_eq!(vec![(0.5, 0.0)], result.quantile_results());
    }
}
