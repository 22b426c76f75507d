// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::aggregation::AggregationOps;
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::expression::{ExecutionInput, ResultNode};
use crate::sketch::HyperLogLog;
use std::io::{Read, Write};
use xxhash_rust::xxh3::xxh3_64_with_seed;

const HASH_SEED: u64 = 42;

/// Estimates the number of unique values of an expression.
///
/// Keeps the raw sketch; estimation happens downstream. The maintained
/// bucket sum acts as a monotonic rank proxy, giving almost the same
/// ordering as the actual estimates without re-estimating per document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExpressionCountResult {
    hll: HyperLogLog,
    rank: i64,
}

impl ExpressionCountResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sketch(&self) -> &HyperLogLog {
        &self.hll
    }

    /// Bias-corrected estimate of the distinct count.
    #[must_use]
    pub fn estimate(&self) -> f64 {
        self.hll.estimate()
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.hll.merge(&other.hll);
        self.rank = i64::from(self.hll.bucket_sum());
    }

    fn fold_value(&mut self, value: &ResultNode) {
        let hash = value.hash();
        // NOTE: Truncation is the point, the sketch consumes 32-bit hashes
        #[allow(clippy::cast_possible_truncation)]
        let hash32 = xxh3_64_with_seed(&hash.to_le_bytes(), HASH_SEED) as u32;
        self.rank += i64::from(self.hll.aggregate(hash32));
    }

    pub(crate) fn encode_state<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.hll.encode_into(writer)
    }

    pub(crate) fn decode_state<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let hll = HyperLogLog::decode_from(reader)?;
        let rank = i64::from(hll.bucket_sum());
        Ok(Self { hll, rank })
    }
}

impl AggregationOps for ExpressionCountResult {
    fn prepare(&mut self, _sample: &ResultNode, _use_for_init: bool) {}

    fn on_aggregate(
        &mut self,
        value: &ResultNode,
        _input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        if let ResultNode::Vector(v) = value {
            for element in v.iter() {
                self.fold_value(&element);
            }
        } else {
            self.fold_value(value);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.hll = HyperLogLog::new();
        self.rank = 0;
    }

    fn rank(&self) -> ResultNode {
        ResultNode::Integer(self.rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn rank_grows_with_distinct_values() {
        let mut result = ExpressionCountResult::new();
        let mut previous = 0;
        for i in 0..100 {
            result
                .on_aggregate(
                    &ResultNode::Integer(i),
                    &ExecutionInput::new(0, 0.0),
                )
                .expect("cannot fail");
            let rank = result.rank().as_integer();
            assert!(rank >= previous);
            previous = rank;
        }
        assert!(previous > 0);
    }

    #[test]
    fn merge_rank_equals_bucket_sum_of_union() {
        let mut a = ExpressionCountResult::new();
        let mut b = ExpressionCountResult::new();
        for i in 0..500 {
            let value = ResultNode::Integer(i);
            if i % 2 == 0 {
                a.on_aggregate(&value, &ExecutionInput::new(0, 0.0))
                    .expect("cannot fail");
            } else {
                b.on_aggregate(&value, &ExecutionInput::new(0, 0.0))
                    .expect("cannot fail");
            }
        }
        a.merge(&b);
        assert_eq!(i64::from(a.sketch().bucket_sum()), a.rank().as_integer());
    }
}
