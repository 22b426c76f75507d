// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::aggregation::{ExpressionCountResult, HitsResult, QuantileResult};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::expression::{ExecutionInput, ExpressionNode, ExpressionTree, ResultNode};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use enum_dispatch::enum_dispatch;
use std::io::{Read, Write};

pub(crate) const CLASS_COUNT: u32 = 128;
pub(crate) const CLASS_SUM: u32 = 129;
pub(crate) const CLASS_MIN: u32 = 130;
pub(crate) const CLASS_MAX: u32 = 131;
pub(crate) const CLASS_AVERAGE: u32 = 132;
pub(crate) const CLASS_XOR: u32 = 133;
pub(crate) const CLASS_STDDEV: u32 = 134;
pub(crate) const CLASS_EXPRESSION_COUNT: u32 = 135;
pub(crate) const CLASS_QUANTILE: u32 = 136;
pub(crate) const CLASS_HITS: u32 = 137;

/// Operations shared by every accumulator variant.
#[enum_dispatch]
pub trait AggregationOps {
    /// Adapts the accumulator to the kind of the first observed sample.
    fn prepare(&mut self, sample: &ResultNode, use_for_init: bool);

    /// Folds one executed expression value into the accumulator.
    fn on_aggregate(&mut self, value: &ResultNode, input: &ExecutionInput<'_>)
        -> crate::Result<()>;

    /// Clears the accumulator, keeping its adapted kind.
    fn reset(&mut self);

    /// Hook that runs after all merges on a level completed.
    fn post_merge(&mut self) {}

    /// The current rank value of the accumulator.
    fn rank(&self) -> ResultNode;
}

fn is_ready(accumulator: &ResultNode, sample: &ResultNode) -> bool {
    accumulator.class_id() == sample.create_base_type().class_id()
}

/// Counts aggregated values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CountResult {
    count: u64,
}

impl CountResult {
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn with_count(count: u64) -> Self {
        Self { count }
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
    }
}

impl AggregationOps for CountResult {
    fn prepare(&mut self, _sample: &ResultNode, _use_for_init: bool) {}

    fn on_aggregate(
        &mut self,
        value: &ResultNode,
        _input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        if let ResultNode::Vector(v) = value {
            self.count += v.len() as u64;
        } else {
            self.count += 1;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn rank(&self) -> ResultNode {
        // NOTE: counts stay far below i64::MAX
        #[allow(clippy::cast_possible_wrap)]
        ResultNode::Integer(self.count as i64)
    }
}

/// Sums aggregated values, vector inputs flatten per element.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SumResult {
    sum: ResultNode,
}

impl SumResult {
    #[must_use]
    pub fn sum(&self) -> &ResultNode {
        &self.sum
    }

    pub fn sum_mut(&mut self) -> &mut ResultNode {
        &mut self.sum
    }

    fn merge(&mut self, other: &Self) {
        self.sum.add(&other.sum);
    }
}

impl AggregationOps for SumResult {
    fn prepare(&mut self, sample: &ResultNode, use_for_init: bool) {
        if is_ready(&self.sum, sample) {
            return;
        }
        self.sum = sample.create_base_type();
        if use_for_init {
            self.sum.set(sample);
        }
    }

    fn on_aggregate(
        &mut self,
        value: &ResultNode,
        _input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        if let ResultNode::Vector(v) = value {
            v.flatten_sum(&mut self.sum);
        } else {
            self.sum.add(value);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.sum = self.sum.create_base_type();
    }

    fn rank(&self) -> ResultNode {
        self.sum.clone()
    }
}

/// Tracks the minimum, initialized to max-of-type so the first compare wins.
#[derive(Clone, Debug, PartialEq)]
pub struct MinResult {
    min: ResultNode,
}

impl Default for MinResult {
    fn default() -> Self {
        let mut min = ResultNode::Integer(0);
        min.set_max();
        Self { min }
    }
}

impl MinResult {
    #[must_use]
    pub fn min(&self) -> &ResultNode {
        &self.min
    }

    pub fn min_mut(&mut self) -> &mut ResultNode {
        &mut self.min
    }

    fn merge(&mut self, other: &Self) {
        self.min.min_op(&other.min);
    }
}

impl AggregationOps for MinResult {
    fn prepare(&mut self, sample: &ResultNode, use_for_init: bool) {
        if is_ready(&self.min, sample) {
            return;
        }
        self.min = sample.create_base_type();
        if use_for_init {
            self.min.set(sample);
        } else {
            self.min.set_max();
        }
    }

    fn on_aggregate(
        &mut self,
        value: &ResultNode,
        _input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        if let ResultNode::Vector(v) = value {
            v.flatten_min(&mut self.min);
        } else {
            self.min.min_op(value);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.min = self.min.create_base_type();
        self.min.set_max();
    }

    fn rank(&self) -> ResultNode {
        self.min.clone()
    }
}

/// Tracks the maximum, initialized to min-of-type.
#[derive(Clone, Debug, PartialEq)]
pub struct MaxResult {
    max: ResultNode,
}

impl Default for MaxResult {
    fn default() -> Self {
        let mut max = ResultNode::Integer(0);
        max.set_min();
        Self { max }
    }
}

impl MaxResult {
    #[must_use]
    pub fn max(&self) -> &ResultNode {
        &self.max
    }

    pub fn max_mut(&mut self) -> &mut ResultNode {
        &mut self.max
    }

    fn merge(&mut self, other: &Self) {
        self.max.max_op(&other.max);
    }
}

impl AggregationOps for MaxResult {
    fn prepare(&mut self, sample: &ResultNode, use_for_init: bool) {
        if is_ready(&self.max, sample) {
            return;
        }
        self.max = sample.create_base_type();
        if use_for_init {
            self.max.set(sample);
        } else {
            self.max.set_min();
        }
    }

    fn on_aggregate(
        &mut self,
        value: &ResultNode,
        _input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        if let ResultNode::Vector(v) = value {
            v.flatten_max(&mut self.max);
        } else {
            self.max.max_op(value);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.max = self.max.create_base_type();
        self.max.set_min();
    }

    fn rank(&self) -> ResultNode {
        self.max.clone()
    }
}

/// Sum plus count; the rank divides on demand (integer sums divide with
/// integer semantics).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AverageResult {
    sum: ResultNode,
    count: u64,
}

impl AverageResult {
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn sum(&self) -> &ResultNode {
        &self.sum
    }

    fn merge(&mut self, other: &Self) {
        self.sum.add(&other.sum);
        self.count += other.count;
    }
}

impl AggregationOps for AverageResult {
    fn prepare(&mut self, sample: &ResultNode, use_for_init: bool) {
        if is_ready(&self.sum, sample) {
            return;
        }
        self.sum = sample.create_base_type();
        if use_for_init {
            self.sum.set(sample);
        }
    }

    fn on_aggregate(
        &mut self,
        value: &ResultNode,
        _input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        if let ResultNode::Vector(v) = value {
            v.flatten_sum(&mut self.sum);
            self.count += v.len() as u64;
        } else {
            self.sum.add(value);
            self.count += 1;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.sum = self.sum.create_base_type();
        self.count = 0;
    }

    fn rank(&self) -> ResultNode {
        let mut average = self.sum.clone();
        if self.count > 0 {
            average.divide(self.count);
        } else {
            average = average.create_base_type();
        }
        average
    }
}

/// Xors aggregated values into a 64-bit accumulator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct XorResult {
    xor: i64,
}

impl XorResult {
    #[must_use]
    pub fn xor(&self) -> i64 {
        self.xor
    }

    fn merge(&mut self, other: &Self) {
        self.xor ^= other.xor;
    }
}

impl AggregationOps for XorResult {
    fn prepare(&mut self, _sample: &ResultNode, _use_for_init: bool) {}

    fn on_aggregate(
        &mut self,
        value: &ResultNode,
        _input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        let mut accum = ResultNode::Integer(self.xor);
        if let ResultNode::Vector(v) = value {
            for element in v.iter() {
                accum.xor_op(&element);
            }
        } else {
            accum.xor_op(value);
        }
        self.xor = accum.as_integer();
        Ok(())
    }

    fn reset(&mut self) {
        self.xor = 0;
    }

    fn rank(&self) -> ResultNode {
        ResultNode::Integer(self.xor)
    }
}

/// Population standard deviation from count, sum and sum of squares.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StandardDeviationResult {
    count: u64,
    sum: f64,
    sum_of_squares: f64,
}

impl StandardDeviationResult {
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[must_use]
    pub fn sum_of_squares(&self) -> f64 {
        self.sum_of_squares
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_of_squares += other.sum_of_squares;
    }
}

impl AggregationOps for StandardDeviationResult {
    fn prepare(&mut self, _sample: &ResultNode, _use_for_init: bool) {}

    fn on_aggregate(
        &mut self,
        value: &ResultNode,
        _input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        if let ResultNode::Vector(v) = value {
            let mut sum = ResultNode::Float(self.sum);
            v.flatten_sum(&mut sum);
            self.sum = sum.as_float();
            v.flatten_sum_of_squares(&mut self.sum_of_squares);
            self.count += v.len() as u64;
        } else {
            let f = value.as_float();
            self.sum += f;
            self.sum_of_squares += f * f;
            self.count += 1;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.count = 0;
        self.sum = 0.0;
        self.sum_of_squares = 0.0;
    }

    fn rank(&self) -> ResultNode {
        if self.count == 0 {
            return ResultNode::Float(0.0);
        }
        // NOTE: counts stay far below 2^53
        #[allow(clippy::cast_precision_loss)]
        let count = self.count as f64;
        let variance = (self.sum_of_squares - self.sum * self.sum / count) / count;
        ResultNode::Float(variance.max(0.0).sqrt())
    }
}

/// One accumulator variant with its state.
#[enum_dispatch(AggregationOps)]
#[derive(Clone, Debug, PartialEq)]
pub enum AggregationResultVariant {
    Count(CountResult),
    Sum(SumResult),
    Min(MinResult),
    Max(MaxResult),
    Average(AverageResult),
    Xor(XorResult),
    StandardDeviation(StandardDeviationResult),
    ExpressionCount(ExpressionCountResult),
    Quantile(QuantileResult),
    Hits(HitsResult),
}

impl AggregationResultVariant {
    #[must_use]
    pub fn class_id(&self) -> u32 {
        match self {
            Self::Count(_) => CLASS_COUNT,
            Self::Sum(_) => CLASS_SUM,
            Self::Min(_) => CLASS_MIN,
            Self::Max(_) => CLASS_MAX,
            Self::Average(_) => CLASS_AVERAGE,
            Self::Xor(_) => CLASS_XOR,
            Self::StandardDeviation(_) => CLASS_STDDEV,
            Self::ExpressionCount(_) => CLASS_EXPRESSION_COUNT,
            Self::Quantile(_) => CLASS_QUANTILE,
            Self::Hits(_) => CLASS_HITS,
        }
    }
}

/// One aggregator attached to a grouping level: an expression tree feeding
/// an accumulator variant, plus an opaque client tag.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregationResult {
    expression: ExpressionTree,
    tag: i32,
    variant: AggregationResultVariant,
}

impl AggregationResult {
    #[must_use]
    pub fn new(variant: AggregationResultVariant) -> Self {
        Self {
            expression: ExpressionTree::default(),
            tag: -1,
            variant,
        }
    }

    #[must_use]
    pub fn with_expression(mut self, root: ExpressionNode) -> Self {
        self.expression = ExpressionTree::new(root);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: i32) -> Self {
        self.tag = tag;
        self
    }

    #[must_use]
    pub fn tag(&self) -> i32 {
        self.tag
    }

    #[must_use]
    pub fn variant(&self) -> &AggregationResultVariant {
        &self.variant
    }

    pub fn variant_mut(&mut self) -> &mut AggregationResultVariant {
        &mut self.variant
    }

    #[must_use]
    pub fn expression(&self) -> &ExpressionTree {
        &self.expression
    }

    pub fn expression_mut(&mut self) -> &mut ExpressionTree {
        &mut self.expression
    }

    pub fn set_expression_root(&mut self, root: ExpressionNode) {
        self.expression = ExpressionTree::new(root);
    }

    /// Executes the expression for the input and folds the value in.
    pub fn aggregate(&mut self, input: &ExecutionInput<'_>) -> crate::Result<()> {
        self.expression.execute(input)?;
        let value = self.expression.result();
        self.variant.prepare(value, false);
        self.variant.on_aggregate(value, input)
    }

    /// Merges a same-variant result. Mismatched variants are a protocol
    /// violation.
    pub fn merge(&mut self, other: &Self) -> crate::Result<()> {
        use AggregationResultVariant as V;
        match (&mut self.variant, &other.variant) {
            (V::Count(a), V::Count(b)) => a.merge(b),
            (V::Sum(a), V::Sum(b)) => a.merge(b),
            (V::Min(a), V::Min(b)) => a.merge(b),
            (V::Max(a), V::Max(b)) => a.merge(b),
            (V::Average(a), V::Average(b)) => a.merge(b),
            (V::Xor(a), V::Xor(b)) => a.merge(b),
            (V::StandardDeviation(a), V::StandardDeviation(b)) => a.merge(b),
            (V::ExpressionCount(a), V::ExpressionCount(b)) => a.merge(b),
            (V::Quantile(a), V::Quantile(b)) => a.merge(b),
            (V::Hits(a), V::Hits(b)) => a.merge(b),
            _ => return Err(crate::Error::VariantMismatch),
        }
        Ok(())
    }

    pub fn post_merge(&mut self) {
        self.variant.post_merge();
    }

    pub fn reset(&mut self) {
        self.variant.reset();
    }

    #[must_use]
    pub fn rank(&self) -> ResultNode {
        self.variant.rank()
    }
}

impl Encode for AggregationResult {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.variant.class_id())?;
        self.expression.encode_into(writer)?;
        writer.write_i32::<BigEndian>(self.tag)?;

        use AggregationResultVariant as V;
        match &self.variant {
            V::Count(v) => writer.write_u64::<BigEndian>(v.count)?,
            V::Sum(v) => v.sum.encode_into(writer)?,
            V::Min(v) => v.min.encode_into(writer)?,
            V::Max(v) => v.max.encode_into(writer)?,
            V::Average(v) => {
                writer.write_u64::<BigEndian>(v.count)?;
                v.sum.encode_into(writer)?;
            }
            V::Xor(v) => writer.write_i64::<BigEndian>(v.xor)?,
            V::StandardDeviation(v) => {
                writer.write_u64::<BigEndian>(v.count)?;
                writer.write_u64::<BigEndian>(v.sum.to_bits())?;
                writer.write_u64::<BigEndian>(v.sum_of_squares.to_bits())?;
            }
            V::ExpressionCount(v) => v.encode_state(writer)?,
            V::Quantile(v) => v.encode_state(writer)?,
            V::Hits(v) => v.encode_state(writer)?,
        }
        Ok(())
    }
}

impl Decode for AggregationResult {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let class_id = reader.read_u32::<BigEndian>()?;
        let expression = ExpressionTree::decode_from(reader)?;
        let tag = reader.read_i32::<BigEndian>()?;

        let variant = match class_id {
            CLASS_COUNT => AggregationResultVariant::Count(CountResult {
                count: reader.read_u64::<BigEndian>()?,
            }),
            CLASS_SUM => AggregationResultVariant::Sum(SumResult {
                sum: ResultNode::decode_from(reader)?,
            }),
            CLASS_MIN => AggregationResultVariant::Min(MinResult {
                min: ResultNode::decode_from(reader)?,
            }),
            CLASS_MAX => AggregationResultVariant::Max(MaxResult {
                max: ResultNode::decode_from(reader)?,
            }),
            CLASS_AVERAGE => {
                let count = reader.read_u64::<BigEndian>()?;
                let sum = ResultNode::decode_from(reader)?;
                AggregationResultVariant::Average(AverageResult { sum, count })
            }
            CLASS_XOR => AggregationResultVariant::Xor(XorResult {
                xor: reader.read_i64::<BigEndian>()?,
            }),
            CLASS_STDDEV => {
                let count = reader.read_u64::<BigEndian>()?;
                let sum = f64::from_bits(reader.read_u64::<BigEndian>()?);
                let sum_of_squares = f64::from_bits(reader.read_u64::<BigEndian>()?);
                AggregationResultVariant::StandardDeviation(StandardDeviationResult {
                    count,
                    sum,
                    sum_of_squares,
                })
            }
            CLASS_EXPRESSION_COUNT => {
                AggregationResultVariant::ExpressionCount(ExpressionCountResult::decode_state(reader)?)
            }
            CLASS_QUANTILE => {
                AggregationResultVariant::Quantile(QuantileResult::decode_state(reader)?)
            }
            CLASS_HITS => AggregationResultVariant::Hits(HitsResult::decode_state(reader)?),
            tag => return Err(DecodeError::InvalidTag(("AggregationResult", tag))),
        };

        Ok(Self {
            expression,
            tag,
            variant,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{ConstantNode, DocIdNode};
    use test_log::test;

    fn aggregate_values(result: &mut AggregationResult, values: &[ResultNode]) {
        for value in values {
            result.set_expression_root(ExpressionNode::Constant(ConstantNode::new(value.clone())));
            result
                .aggregate(&ExecutionInput::new(1, 0.0))
                .expect("aggregation should not fail");
        }
    }

    #[test]
    fn count_counts_vector_elements() {
        let mut count = AggregationResult::new(AggregationResultVariant::Count(CountResult::default()));
        aggregate_values(
            &mut count,
            &[
                ResultNode::Integer(1),
                ResultNode::Vector(crate::expression::ResultNodeVector::Integer(vec![7, 8, 9])),
            ],
        );
        assert_eq!(ResultNode::Integer(4), count.rank());
    }

    #[test]
    fn sum_adapts_to_float_sample() {
        let mut sum = AggregationResult::new(AggregationResultVariant::Sum(SumResult::default()));
        aggregate_values(&mut sum, &[ResultNode::Float(1.5), ResultNode::Float(2.0)]);
        assert_eq!(ResultNode::Float(3.5), sum.rank());
    }

    #[test]
    fn min_first_compare_always_wins() {
        let mut min = AggregationResult::new(AggregationResultVariant::Min(MinResult::default()));
        aggregate_values(&mut min, &[ResultNode::Integer(42)]);
        assert_eq!(ResultNode::Integer(42), min.rank());
    }

    #[test]
    fn merge_of_disjoint_averages_matches_union() {
        let values: Vec<ResultNode> = (1..=10).map(ResultNode::Integer).collect();

        let mut left =
            AggregationResult::new(AggregationResultVariant::Average(AverageResult::default()));
        let mut right =
            AggregationResult::new(AggregationResultVariant::Average(AverageResult::default()));
        let mut union =
            AggregationResult::new(AggregationResultVariant::Average(AverageResult::default()));

        aggregate_values(&mut left, &values[..5]);
        aggregate_values(&mut right, &values[5..]);
        aggregate_values(&mut union, &values);

        left.merge(&right).expect("same variant");
        assert_eq!(union.rank(), left.rank());
    }

    #[test]
    fn variant_mismatch_is_rejected() {
        let mut count = AggregationResult::new(AggregationResultVariant::Count(CountResult::default()));
        let xor = AggregationResult::new(AggregationResultVariant::Xor(XorResult::default()));
        assert!(matches!(
            count.merge(&xor),
            Err(crate::Error::VariantMismatch)
        ));
    }

    #[test]
    fn serde_roundtrip() -> Result<(), DecodeError> {
        let mut stddev = AggregationResult::new(AggregationResultVariant::StandardDeviation(
            StandardDeviationResult::default(),
        ))
        .with_expression(ExpressionNode::DocId(DocIdNode::default()))
        .with_tag(7);

        for doc_id in [1, 2, 3, 10] {
            stddev
                .aggregate(&ExecutionInput::new(doc_id, 0.0))
                .expect("aggregation should not fail");
        }

        let bytes = stddev.encode_into_vec();
        let decoded = AggregationResult::decode_from(&mut &bytes[..])?;
        assert_eq!(stddev, decoded);

        Ok(())
    }
}
