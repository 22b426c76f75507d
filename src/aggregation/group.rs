// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::aggregation::{AggregationResult, GroupingLevel};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::expression::{
    AggregationRefNode, ExecutionInput, ExpressionNode, ExpressionNodeOps, ResultNode,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::io::{Read, Write};

const MAX_AGGR: usize = 15;
const MAX_EXPR: usize = 15;
const MAX_ORDER_BY: usize = 7;

/// The collectors and expressions stored by one group.
///
/// Aggregation results and the order-by expressions referencing them live
/// in two arrays; order-by entries are signed 1-based indices into the
/// expression array, the sign encoding direction. The child hash map only
/// exists between `pre_aggregate` and `post_aggregate`.
#[derive(Clone, Debug, Default)]
pub struct GroupValue {
    results: Vec<AggregationResult>,
    exprs: Vec<ExpressionNode>,
    order_by: Vec<i8>,
    children: Vec<Box<Group>>,
    child_map: Option<FxHashMap<ResultNode, usize>>,
    tag: u32,
}

impl PartialEq for GroupValue {
    fn eq(&self, other: &Self) -> bool {
        self.results == other.results
            && self.exprs == other.exprs
            && self.order_by == other.order_by
            && self.children == other.children
            && self.tag == other.tag
    }
}

impl GroupValue {
    pub fn add_aggregation_result(&mut self, result: AggregationResult) {
        assert!(self.results.len() < MAX_AGGR);
        self.results.push(result);
    }

    pub fn add_expression(&mut self, expr: ExpressionNode) {
        assert!(self.exprs.len() < MAX_EXPR);
        self.exprs.push(expr);
    }

    /// Adds an aggregation result plus the expression-side reference to it.
    pub fn add_result(&mut self, result: AggregationResult) {
        self.add_aggregation_result(result);
        // NOTE: Truncation is OK, results are capped at MAX_AGGR
        #[allow(clippy::cast_possible_truncation)]
        self.add_expression(ExpressionNode::AggregationRef(AggregationRefNode::new(
            (self.results.len() - 1) as u32,
        )));
    }

    pub fn add_order_by(&mut self, expr: ExpressionNode, ascending: bool) {
        assert!(self.order_by.len() < MAX_ORDER_BY);
        self.add_expression(expr);
        // NOTE: Truncation is OK, expressions are capped at MAX_EXPR
        #[allow(clippy::cast_possible_truncation)]
        let index = self.exprs.len() as i8;
        self.order_by.push(if ascending { index } else { -index });
    }

    #[must_use]
    pub fn aggregation_results(&self) -> &[AggregationResult] {
        &self.results
    }

    pub fn aggregation_results_mut(&mut self) -> &mut [AggregationResult] {
        &mut self.results
    }

    #[must_use]
    pub fn order_by(&self) -> &[i8] {
        &self.order_by
    }

    pub(crate) fn collect(&mut self, input: &ExecutionInput<'_>) -> crate::Result<()> {
        for result in &mut self.results {
            result.aggregate(input)?;
        }
        Ok(())
    }

    fn rebuild_child_map(&mut self) {
        let mut map = FxHashMap::default();
        for (i, child) in self.children.iter().enumerate() {
            if let Some(id) = child.id() {
                map.insert(id.clone(), i);
            }
        }
        self.child_map = Some(map);
    }

    /// Finds or creates the child for a classifier value, returning its
    /// index. `None` when the level refuses new groups.
    pub(crate) fn group_single(
        &mut self,
        select: &ResultNode,
        rank: f64,
        level: &GroupingLevel,
    ) -> Option<usize> {
        if self.child_map.is_none() {
            self.rebuild_child_map();
        }
        let Some(map) = self.child_map.as_mut() else {
            return None;
        };

        if let Some(&idx) = map.get(select) {
            if !level.is_frozen() {
                if let Some(child) = self.children.get_mut(idx) {
                    child.update_rank(rank);
                }
            }
            Some(idx)
        } else if level.allow_more_groups(map.len()) {
            let mut child = Box::new(level.group_prototype().clone());
            child.set_id(select.clone());
            child.set_rank(rank);
            self.children.push(child);
            let idx = self.children.len() - 1;
            map.insert(select.clone(), idx);
            Some(idx)
        } else {
            None
        }
    }

    pub(crate) fn child_mut(&mut self, idx: usize) -> Option<&mut Group> {
        self.children.get_mut(idx).map(|c| &mut **c)
    }

    pub(crate) fn pre_aggregate(&mut self) {
        for child in &mut self.children {
            child.pre_aggregate();
        }
        self.rebuild_child_map();
    }

    pub(crate) fn post_aggregate(&mut self) {
        self.child_map = None;
        for child in &mut self.children {
            child.post_aggregate();
        }
    }

    /// Binds aggregation refs to the current rank values and runs every
    /// expression.
    pub(crate) fn execute_order_by(&mut self) -> crate::Result<()> {
        let ranks: Vec<ResultNode> = self.results.iter().map(AggregationResult::rank).collect();
        let input = ExecutionInput::new(0, 0.0);
        for expr in &mut self.exprs {
            expr.bind_aggregation_refs(&ranks);
            expr.prepare(false);
            expr.execute(&input)?;
        }
        Ok(())
    }

    /// Lexicographic order-by tuple comparison with per-entry sign.
    fn cmp_order_by(&self, rhs: &Self) -> Ordering {
        for entry in &self.order_by {
            let idx = (entry.unsigned_abs() as usize) - 1;
            let (Some(mine), Some(theirs)) = (self.exprs.get(idx), rhs.exprs.get(idx)) else {
                continue;
            };
            let mut diff = mine.result().cmp(theirs.result());
            if *entry < 0 {
                diff = diff.reverse();
            }
            if diff != Ordering::Equal {
                return diff;
            }
        }
        Ordering::Equal
    }

    pub(crate) fn merge_collectors(&mut self, rhs: &Self) -> crate::Result<()> {
        for (mine, theirs) in self.results.iter_mut().zip(rhs.results.iter()) {
            mine.merge(theirs)?;
        }
        Ok(())
    }

    /// Two-way merges the id-sorted child lists, combining equal ids.
    fn merge_children(
        &mut self,
        levels: &[GroupingLevel],
        first_level: u32,
        current: u32,
        rhs: Self,
    ) -> crate::Result<()> {
        let mine = std::mem::take(&mut self.children);
        let theirs = rhs.children;

        let mut merged = Vec::with_capacity(mine.len() + theirs.len());
        let mut px = mine.into_iter();
        let mut py = theirs.into_iter();
        let mut a = px.next();
        let mut b = py.next();

        loop {
            match (a.take(), b.take()) {
                (Some(mut ga), Some(gb)) => match ga.cmp_id(&gb) {
                    Ordering::Equal => {
                        ga.merge(levels, first_level, current + 1, *gb)?;
                        merged.push(ga);
                        a = px.next();
                        b = py.next();
                    }
                    Ordering::Less => {
                        merged.push(ga);
                        a = px.next();
                        b = Some(gb);
                    }
                    Ordering::Greater => {
                        merged.push(gb);
                        a = Some(ga);
                        b = py.next();
                    }
                },
                (Some(ga), None) => {
                    merged.push(ga);
                    a = px.next();
                }
                (None, Some(gb)) => {
                    merged.push(gb);
                    b = py.next();
                }
                (None, None) => break,
            }
        }

        self.children = merged;
        self.child_map = None;
        Ok(())
    }

    /// Copies the other side's children as fresh prototype instances.
    fn merge_level(&mut self, prototype: &Group, rhs: &Self) {
        for child in &rhs.children {
            let mut group = Box::new(prototype.clone());
            group.partial_copy(child);
            self.children.push(group);
        }
    }

    fn merge_partial_children(
        &mut self,
        levels: &[GroupingLevel],
        first_level: u32,
        last_level: u32,
        current: u32,
        rhs: &Self,
    ) -> crate::Result<()> {
        // Both lists are ordered by group id
        let mut px = 0;
        let mut py = 0;
        while px < self.children.len() && py < rhs.children.len() {
            let (Some(a), Some(b)) = (self.children.get_mut(px), rhs.children.get(py)) else {
                break;
            };
            match a.cmp_id(b) {
                Ordering::Less => px += 1,
                Ordering::Greater => py += 1,
                Ordering::Equal => {
                    a.merge_partial(levels, first_level, last_level, current + 1, b)?;
                    px += 1;
                    py += 1;
                }
            }
        }
        Ok(())
    }

    fn prune_children(&mut self, rhs: &Self, last_level: u32, current: u32) {
        let mine = std::mem::take(&mut self.children);
        let mut kept = Vec::with_capacity(rhs.children.len());

        let mut py = 0;
        for mut child in mine {
            while py < rhs.children.len() {
                let Some(other) = rhs.children.get(py) else {
                    break;
                };
                match other.cmp_id(&child) {
                    Ordering::Less => py += 1,
                    Ordering::Equal => {
                        child.prune(other, last_level, current + 1);
                        kept.push(child);
                        py += 1;
                        break;
                    }
                    Ordering::Greater => break,
                }
            }
        }

        self.children = kept;
        self.child_map = None;
    }

    fn post_merge(
        &mut self,
        levels: &[GroupingLevel],
        first_level: u32,
        current: u32,
    ) -> crate::Result<()> {
        let frozen = current < first_level;
        if !frozen {
            for result in &mut self.results {
                result.post_merge();
            }
        }

        let Some(level) = levels.get(current as usize) else {
            return Ok(());
        };

        for child in &mut self.children {
            child.value.execute_order_by()?;
        }

        let max_groups = level.max_groups();
        // NOTE: Sign loss is guarded, negative means unlimited
        #[allow(clippy::cast_sign_loss)]
        if max_groups >= 0 && self.children.len() > max_groups as usize {
            self.children.sort_by(|a, b| a.cmp_rank(b));
            self.children.truncate(max_groups as usize);
        }

        for child in &mut self.children {
            child.post_merge(levels, first_level, current + 1)?;
        }
        Ok(())
    }

    fn sort_by_id(&mut self) {
        self.children.sort_by(|a, b| a.cmp_id(b));
        for child in &mut self.children {
            child.sort_by_id();
        }
    }

    fn need_resort(&self) -> bool {
        !self.order_by.is_empty() || self.children.iter().any(|c| c.need_resort())
    }

    fn is_id_ordered(&self) -> bool {
        self.children
            .windows(2)
            .all(|pair| match (pair.first(), pair.get(1)) {
                (Some(a), Some(b)) => a.cmp_id(b) == Ordering::Less,
                _ => true,
            })
    }
}

impl Encode for GroupValue {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Truncation is OK, all arrays are small by construction
        #[allow(clippy::cast_possible_truncation)]
        {
            writer.write_u32::<BigEndian>(self.order_by.len() as u32)?;
            for entry in &self.order_by {
                writer.write_i32::<BigEndian>(i32::from(*entry))?;
            }
            writer.write_u32::<BigEndian>(self.results.len() as u32)?;
            for result in &self.results {
                result.encode_into(writer)?;
            }
            writer.write_u32::<BigEndian>(self.exprs.len() as u32)?;
            for expr in &self.exprs {
                expr.encode_into(writer)?;
            }
            writer.write_u32::<BigEndian>(self.children.len() as u32)?;
            for child in &self.children {
                child.encode_into(writer)?;
            }
        }
        writer.write_u32::<BigEndian>(self.tag)?;
        Ok(())
    }
}

impl Decode for GroupValue {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut value = Self::default();

        let order_by_count = reader.read_u32::<BigEndian>()?;
        for _ in 0..order_by_count {
            let entry = reader.read_i32::<BigEndian>()?;
            // NOTE: Truncation is OK, entries are within ±MAX_EXPR
            #[allow(clippy::cast_possible_truncation)]
            value.order_by.push(entry as i8);
        }

        let aggr_count = reader.read_u32::<BigEndian>()?;
        for _ in 0..aggr_count {
            value.results.push(AggregationResult::decode_from(reader)?);
        }

        let expr_count = reader.read_u32::<BigEndian>()?;
        for _ in 0..expr_count {
            value.exprs.push(ExpressionNode::decode_from(reader)?);
        }

        let child_count = reader.read_u32::<BigEndian>()?;
        for _ in 0..child_count {
            value.children.push(Box::new(Group::decode_from(reader)?));
        }

        value.tag = reader.read_u32::<BigEndian>()?;
        Ok(value)
    }
}

/// A node in the grouping tree: an identifying value, a rank and the
/// group's collectors and children.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Group {
    id: Option<ResultNode>,
    rank: f64,
    value: GroupValue,
}

impl Group {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn id(&self) -> Option<&ResultNode> {
        self.id.as_ref()
    }

    pub fn set_id(&mut self, id: ResultNode) {
        self.id = Some(id);
    }

    #[must_use]
    pub fn with_id(mut self, id: ResultNode) -> Self {
        self.set_id(id);
        self
    }

    #[must_use]
    pub fn rank(&self) -> f64 {
        self.rank
    }

    /// NaN ranks normalize to negative infinity.
    pub fn set_rank(&mut self, rank: f64) {
        self.rank = if rank.is_nan() { f64::NEG_INFINITY } else { rank };
    }

    pub fn update_rank(&mut self, rank: f64) {
        if !rank.is_nan() && rank > self.rank {
            self.rank = rank;
        }
    }

    #[must_use]
    pub fn with_aggregation_result(mut self, result: AggregationResult) -> Self {
        self.value.add_aggregation_result(result);
        self
    }

    /// Adds an aggregation result and an expression reference to it.
    #[must_use]
    pub fn with_result(mut self, result: AggregationResult) -> Self {
        self.value.add_result(result);
        self
    }

    #[must_use]
    pub fn with_order_by(mut self, expr: ExpressionNode, ascending: bool) -> Self {
        self.value.add_order_by(expr, ascending);
        self
    }

    #[must_use]
    pub fn with_child(mut self, child: Self) -> Self {
        self.value.children.push(Box::new(child));
        self
    }

    #[must_use]
    pub fn value(&self) -> &GroupValue {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut GroupValue {
        &mut self.value
    }

    pub fn children(&self) -> impl Iterator<Item = &Self> {
        self.value.children.iter().map(|c| &**c)
    }

    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut Self> {
        self.value.children.iter_mut().map(|c| &mut **c)
    }

    #[must_use]
    pub fn children_len(&self) -> usize {
        self.value.children.len()
    }

    #[must_use]
    pub fn child(&self, idx: usize) -> Option<&Self> {
        self.value.children.get(idx).map(|c| &**c)
    }

    /// Finds the child with the given id, relying on nothing but equality.
    #[must_use]
    pub fn find_child(&self, id: &ResultNode) -> Option<&Self> {
        self.children().find(|c| c.id() == Some(id))
    }

    #[must_use]
    pub fn cmp_id(&self, rhs: &Self) -> Ordering {
        match (&self.id, &rhs.id) {
            (Some(a), Some(b)) => a.cmp(b),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        }
    }

    /// Order-by tuple first, then rank descending.
    #[must_use]
    pub fn cmp_rank(&self, rhs: &Self) -> Ordering {
        match self.value.cmp_order_by(&rhs.value) {
            Ordering::Equal => rhs.rank.total_cmp(&self.rank),
            diff => diff,
        }
    }

    pub(crate) fn aggregate(
        &mut self,
        levels: &mut [GroupingLevel],
        first_level: u32,
        last_level: u32,
        current: u32,
        input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        if current >= first_level {
            self.value.collect(input)?;
        }
        if (current as usize) < levels.len() {
            self.group_next(levels, first_level, last_level, current, input)?;
        }
        Ok(())
    }

    fn group_next(
        &mut self,
        levels: &mut [GroupingLevel],
        first_level: u32,
        last_level: u32,
        current: u32,
        input: &ExecutionInput<'_>,
    ) -> crate::Result<()> {
        let select = {
            let Some(level) = levels.get_mut(current as usize) else {
                return Ok(());
            };
            level.expression_mut().execute(input)?;
            level.expression().result().clone()
        };

        let scalars: Vec<ResultNode> = match select {
            ResultNode::Vector(ref v) => v.iter().collect(),
            scalar => vec![scalar],
        };

        let do_next = current < last_level;
        for scalar in scalars {
            let child_idx = match levels.get(current as usize) {
                Some(level) => self.value.group_single(&scalar, input.rank, level),
                None => None,
            };
            if let (Some(idx), true) = (child_idx, do_next) {
                if let Some(child) = self.value.child_mut(idx) {
                    child.aggregate(levels, first_level, last_level, current + 1, input)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn pre_aggregate(&mut self) {
        self.value.pre_aggregate();
    }

    pub(crate) fn post_aggregate(&mut self) {
        self.value.post_aggregate();
    }

    /// Merges another tree, combining equal-id children and keeping the
    /// children unique to either side.
    pub(crate) fn merge(
        &mut self,
        levels: &[GroupingLevel],
        first_level: u32,
        current: u32,
        rhs: Self,
    ) -> crate::Result<()> {
        let frozen = current < first_level;
        self.rank = self.rank.max(rhs.rank);
        if !frozen {
            self.value.merge_collectors(&rhs.value)?;
        }
        self.value
            .merge_children(levels, first_level, current, rhs.value)
    }

    /// Merges only children present on both sides within the level window.
    pub(crate) fn merge_partial(
        &mut self,
        levels: &[GroupingLevel],
        first_level: u32,
        last_level: u32,
        current: u32,
        rhs: &Self,
    ) -> crate::Result<()> {
        let frozen = current < first_level;
        if !frozen {
            self.value.merge_collectors(&rhs.value)?;
            self.value.execute_order_by()?;

            // At this level, we must create a copy of the other nodes children.
            if current >= last_level {
                if let Some(level) = levels.get(current as usize) {
                    self.value.merge_level(level.group_prototype(), &rhs.value);
                }
                return Ok(());
            }
        }
        self.value
            .merge_partial_children(levels, first_level, last_level, current, &rhs.value)
    }

    /// Keeps only the children found in the other tree.
    pub(crate) fn prune(&mut self, rhs: &Self, last_level: u32, current: u32) {
        if current >= last_level {
            return;
        }
        self.value.prune_children(&rhs.value, last_level, current);
    }

    pub(crate) fn post_merge(
        &mut self,
        levels: &[GroupingLevel],
        first_level: u32,
        current: u32,
    ) -> crate::Result<()> {
        self.value.post_merge(levels, first_level, current)
    }

    pub(crate) fn sort_by_id(&mut self) {
        self.value.sort_by_id();
    }

    #[must_use]
    pub fn need_resort(&self) -> bool {
        self.value.need_resort()
    }

    fn partial_copy(&mut self, rhs: &Self) {
        self.id.clone_from(&rhs.id);
        self.rank = rhs.rank;
        self.value.results.clone_from(&rhs.value.results);
        self.value.exprs.clone_from(&rhs.value.exprs);
    }
}

impl Encode for Group {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        debug_assert!(self.value.is_id_ordered());
        match &self.id {
            None => writer.write_u32::<BigEndian>(0)?,
            Some(id) => id.encode_into(writer)?,
        }
        writer.write_u64::<BigEndian>(self.rank.to_bits())?;
        self.value.encode_into(writer)
    }
}

impl Decode for Group {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let class_id = reader.read_u32::<BigEndian>()?;
        let id = if class_id == 0 {
            None
        } else {
            Some(ResultNode::decode_payload(class_id, reader)?)
        };
        let rank = f64::from_bits(reader.read_u64::<BigEndian>()?);
        let value = GroupValue::decode_from(reader)?;
        let group = Self { id, rank, value };
        debug_assert!(group.value.is_id_ordered());
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggregationResultVariant, CountResult};
    use test_log::test;

    fn count_group() -> Group {
        Group::new().with_aggregation_result(AggregationResult::new(
            AggregationResultVariant::Count(CountResult::default()),
        ))
    }

    #[test]
    fn rank_normalizes_nan() {
        let mut group = Group::new();
        group.set_rank(f64::NAN);
        assert_eq!(f64::NEG_INFINITY, group.rank());
    }

    #[test]
    fn merge_combines_equal_ids_and_keeps_unique_children() -> crate::Result<()> {
        let mut left = Group::new()
            .with_child(count_group().with_id(ResultNode::Integer(1)))
            .with_child(count_group().with_id(ResultNode::Integer(3)));
        let right = Group::new()
            .with_child(count_group().with_id(ResultNode::Integer(2)))
            .with_child(count_group().with_id(ResultNode::Integer(3)));

        left.merge(&[], 0, 0, right)?;

        let ids: Vec<i64> = left
            .children()
            .filter_map(|c| c.id().map(ResultNode::as_integer))
            .collect();
        assert_eq!(vec![1, 2, 3], ids);
        Ok(())
    }

    #[test]
    fn serde_roundtrip() -> Result<(), DecodeError> {
        let group = Group::new()
            .with_id(ResultNode::String("root".into()))
            .with_aggregation_result(AggregationResult::new(AggregationResultVariant::Count(
                CountResult::with_count(7),
            )))
            .with_child(
                Group::new()
                    .with_id(ResultNode::Integer(0))
                    .with_aggregation_result(AggregationResult::new(
                        AggregationResultVariant::Count(CountResult::with_count(2)),
                    )),
            )
            .with_child(
                Group::new()
                    .with_id(ResultNode::Integer(1))
                    .with_aggregation_result(AggregationResult::new(
                        AggregationResultVariant::Count(CountResult::with_count(5)),
                    )),
            );

        let bytes = group.encode_into_vec();
        let decoded = Group::decode_from(&mut &bytes[..])?;
        assert_eq!(group, decoded);
        Ok(())
    }
}
