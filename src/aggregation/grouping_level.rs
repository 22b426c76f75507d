// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::aggregation::{AggregationResult, Group};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::expression::{ExpressionNode, ExpressionTree};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Per-level grouping parameters: how documents classify, how many groups
/// may exist, and the prototype instantiated for each new child.
#[derive(Clone, Debug)]
pub struct GroupingLevel {
    max_groups: i64,
    precision: i64,
    is_ordered: bool,
    frozen: bool,
    classify: ExpressionTree,
    collect: Group,
}

// Equality ignores the per-pass role flags installed by `prepare`.
impl PartialEq for GroupingLevel {
    fn eq(&self, other: &Self) -> bool {
        self.max_groups == other.max_groups
            && self.precision == other.precision
            && self.classify == other.classify
            && self.collect == other.collect
    }
}

impl Default for GroupingLevel {
    fn default() -> Self {
        Self {
            max_groups: -1,
            precision: -1,
            is_ordered: false,
            frozen: false,
            classify: ExpressionTree::default(),
            collect: Group::new(),
        }
    }
}

impl GroupingLevel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hard result cap; raises the soft cap when it would fall below.
    #[must_use]
    pub fn with_max_groups(mut self, max_groups: i64) -> Self {
        self.max_groups = max_groups;
        if max_groups == -1 || max_groups > self.precision {
            self.precision = max_groups;
        }
        self
    }

    /// Soft cap used while collecting; must be at least `max_groups`.
    #[must_use]
    pub fn with_precision(mut self, precision: i64) -> Self {
        self.precision = precision;
        self
    }

    #[must_use]
    pub fn with_expression(mut self, root: ExpressionNode) -> Self {
        self.classify = ExpressionTree::new(root);
        self
    }

    #[must_use]
    pub fn with_result(mut self, result: AggregationResult) -> Self {
        self.collect.value_mut().add_result(result);
        self
    }

    #[must_use]
    pub fn with_aggregation_result(mut self, result: AggregationResult) -> Self {
        self.collect.value_mut().add_aggregation_result(result);
        self
    }

    #[must_use]
    pub fn with_order_by(mut self, expr: ExpressionNode, ascending: bool) -> Self {
        self.collect.value_mut().add_order_by(expr, ascending);
        self
    }

    #[must_use]
    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    #[must_use]
    pub fn max_groups(&self) -> i64 {
        self.max_groups
    }

    #[must_use]
    pub fn precision(&self) -> i64 {
        self.precision
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// In ordered mode a level stops growing once the soft cap is reached.
    #[must_use]
    pub fn allow_more_groups(&self, size: usize) -> bool {
        // NOTE: Sign loss is guarded, negative precision means unlimited
        #[allow(clippy::cast_sign_loss)]
        {
            !self.frozen && (!self.is_ordered || self.precision < 0 || size < self.precision as usize)
        }
    }

    #[must_use]
    pub fn expression(&self) -> &ExpressionTree {
        &self.classify
    }

    pub fn expression_mut(&mut self) -> &mut ExpressionTree {
        &mut self.classify
    }

    #[must_use]
    pub fn group_prototype(&self) -> &Group {
        &self.collect
    }

    pub fn group_prototype_mut(&mut self) -> &mut Group {
        &mut self.collect
    }

    #[must_use]
    pub fn need_resort(&self) -> bool {
        self.collect.need_resort()
    }

    /// Locks the level's role for one aggregation pass.
    pub(crate) fn prepare(&mut self, level: u32, first_level: u32, is_ordered: bool) {
        self.is_ordered = is_ordered;
        self.frozen = level < first_level;
        self.classify.prepare(false);
    }
}

impl Encode for GroupingLevel {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_i64::<BigEndian>(self.max_groups)?;
        writer.write_i64::<BigEndian>(self.precision)?;
        self.classify.encode_into(writer)?;
        self.collect.encode_into(writer)
    }
}

impl Decode for GroupingLevel {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let max_groups = reader.read_i64::<BigEndian>()?;
        let precision = reader.read_i64::<BigEndian>()?;
        let classify = ExpressionTree::decode_from(reader)?;
        let collect = Group::decode_from(reader)?;
        Ok(Self {
            max_groups,
            precision,
            is_ordered: false,
            frozen: false,
            classify,
            collect,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn max_groups_raises_precision() {
        let level = GroupingLevel::new().with_precision(2).with_max_groups(10);
        assert_eq!(10, level.precision());
    }

    #[test]
    fn ordered_level_stops_at_precision() {
        let mut level = GroupingLevel::new().with_max_groups(2);
        level.prepare(0, 0, true);
        assert!(level.allow_more_groups(1));
        assert!(!level.allow_more_groups(2));

        let mut unordered = GroupingLevel::new().with_max_groups(2);
        unordered.prepare(0, 0, false);
        assert!(unordered.allow_more_groups(5));
    }

    #[test]
    fn frozen_level_never_grows() {
        let mut level = GroupingLevel::new().with_max_groups(10);
        level.prepare(0, 1, false);
        assert!(level.is_frozen());
        assert!(!level.allow_more_groups(0));
    }
}
