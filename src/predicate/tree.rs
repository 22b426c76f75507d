// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::predicate::hash::feature_hash;
use crate::predicate::index::Z_STAR_COMPRESSED_ATTRIBUTE_NAME;
use crate::predicate::range_expander::partition_range;
use crate::predicate::{Interval, IntervalWithBounds, MAX_INTERVAL, MIN_INTERVAL};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// A boolean-constraint expression attached to a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PredicateNode {
    And(Vec<PredicateNode>),
    Or(Vec<PredicateNode>),
    Not(Box<PredicateNode>),
    FeatureSet {
        label: String,
        values: Vec<String>,
    },
    FeatureRange {
        label: String,
        from: i64,
        to: i64,
    },
}

impl PredicateNode {
    #[must_use]
    pub fn feature_set(label: impl Into<String>, values: &[&str]) -> Self {
        Self::FeatureSet {
            label: label.into(),
            values: values.iter().map(|v| (*v).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn feature_range(label: impl Into<String>, from: i64, to: i64) -> Self {
        Self::FeatureRange {
            label: label.into(),
            from,
            to,
        }
    }
}

/// A range feature stored verbatim for later re-expansion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeFeature {
    pub label: String,
    pub from: i64,
    pub to: i64,
}

/// The per-document product of predicate-tree annotation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PredicateTreeAnnotations {
    pub min_feature: u32,
    pub interval_range: u16,
    pub interval_map: FxHashMap<u64, Vec<Interval>>,
    pub bounds_map: FxHashMap<u64, Vec<IntervalWithBounds>>,
    pub features: Vec<u64>,
    pub range_features: Vec<RangeFeature>,
}

/// Builds a path from the root of a tree, to be able to describe a given
/// position in the tree.
#[derive(Default)]
struct TreeCrumbs {
    buffer: String,
}

impl TreeCrumbs {
    fn set_child(&mut self, number: usize, delimiter: char) {
        self.buffer.push(delimiter);
        self.buffer.push_str(&number.to_string());
    }

    fn resize(&mut self, len: usize) {
        self.buffer.truncate(len);
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn crumb(&self) -> String {
        self.buffer.clone()
    }
}

// Conjunctions and disjunctions swap roles under negation.
#[derive(Copy, Clone, PartialEq, Eq)]
enum EffectiveType {
    And,
    Or,
    Not,
    FeatureSet,
    FeatureRange,
}

fn effective_type(node: &PredicateNode, negated: bool) -> EffectiveType {
    match node {
        PredicateNode::And(_) => {
            if negated {
                EffectiveType::Or
            } else {
                EffectiveType::And
            }
        }
        PredicateNode::Or(_) => {
            if negated {
                EffectiveType::And
            } else {
                EffectiveType::Or
            }
        }
        PredicateNode::Not(_) => EffectiveType::Not,
        PredicateNode::FeatureSet { .. } => EffectiveType::FeatureSet,
        PredicateNode::FeatureRange { .. } => EffectiveType::FeatureRange,
    }
}

fn children_of(node: &PredicateNode) -> &[PredicateNode] {
    match node {
        PredicateNode::And(children) | PredicateNode::Or(children) => children,
        _ => &[],
    }
}

/// Finds the min-feature value and the per-position sizes used when
/// assigning intervals.
struct TreeAnalyzer {
    key_counts: FxHashMap<String, u32>,
    size_map: BTreeMap<String, u32>,
    has_not: bool,
    negated: bool,
    crumbs: TreeCrumbs,
    size: u32,
}

impl TreeAnalyzer {
    fn new() -> Self {
        Self {
            key_counts: FxHashMap::default(),
            size_map: BTreeMap::new(),
            has_not: false,
            negated: false,
            crumbs: TreeCrumbs::default(),
            size: 0,
        }
    }

    fn traverse(&mut self, node: &PredicateNode) {
        match effective_type(node, self.negated) {
            EffectiveType::Not => {
                if let PredicateNode::Not(child) = node {
                    self.negated = !self.negated;
                    self.traverse(child);
                    self.negated = !self.negated;
                }
            }
            EffectiveType::And => {
                let crumb_len = self.crumbs.len();
                let mut size = 0;
                for (i, child) in children_of(node).iter().enumerate() {
                    self.crumbs.set_child(i, 'a');
                    self.traverse(child);
                    size += self.size;
                    self.size_map.insert(self.crumbs.crumb(), self.size);
                    self.crumbs.resize(crumb_len);
                }
                self.size = size;
            }
            EffectiveType::Or => {
                let crumb_len = self.crumbs.len();
                let mut size = 0;
                for (i, child) in children_of(node).iter().enumerate() {
                    self.crumbs.set_child(i, 'o');
                    self.traverse(child);
                    size += self.size;
                    self.crumbs.resize(crumb_len);
                }
                self.size = size;
            }
            EffectiveType::FeatureSet => {
                if self.negated {
                    self.size = 2;
                    self.has_not = true;
                } else {
                    self.size = 1;
                    if let PredicateNode::FeatureSet { label, values } = node {
                        for value in values {
                            *self
                                .key_counts
                                .entry(format!("{label}={value}"))
                                .or_insert(0) += 1;
                        }
                    }
                }
            }
            EffectiveType::FeatureRange => {
                if self.negated {
                    self.size = 2;
                    self.has_not = true;
                } else {
                    self.size = 1;
                    if let PredicateNode::FeatureRange { label, .. } = node {
                        *self.key_counts.entry(label.clone()).or_insert(0) += 1;
                    }
                }
            }
        }
    }

    fn find_min_feature(&mut self, node: &PredicateNode) -> f32 {
        match effective_type(node, self.negated) {
            EffectiveType::And => {
                // sum of children
                children_of(node)
                    .iter()
                    .map(|c| self.find_min_feature(c))
                    .sum()
            }
            EffectiveType::Or => {
                // min of children
                let min = children_of(node)
                    .iter()
                    .map(|c| self.find_min_feature(c))
                    .fold(f32::INFINITY, f32::min);
                if min.is_finite() {
                    min
                } else {
                    0.0
                }
            }
            EffectiveType::Not => {
                if let PredicateNode::Not(child) = node {
                    self.negated = !self.negated;
                    let min = self.find_min_feature(child);
                    self.negated = !self.negated;
                    min
                } else {
                    0.0
                }
            }
            EffectiveType::FeatureSet => {
                if self.negated {
                    return 0.0;
                }
                let PredicateNode::FeatureSet { label, values } = node else {
                    return 0.0;
                };
                let mut min_feature = 1.0f32;
                for value in values {
                    let count = self
                        .key_counts
                        .get(&format!("{label}={value}"))
                        .copied()
                        .unwrap_or(1);
                    // NOTE: Precision loss is fine for small counts
                    #[allow(clippy::cast_precision_loss)]
                    {
                        min_feature = min_feature.min(1.0 / count as f32);
                    }
                }
                min_feature
            }
            EffectiveType::FeatureRange => {
                if self.negated {
                    return 0.0;
                }
                let PredicateNode::FeatureRange { label, .. } = node else {
                    return 0.0;
                };
                let count = self.key_counts.get(label).copied().unwrap_or(1);
                #[allow(clippy::cast_precision_loss)]
                {
                    1.0 / count as f32
                }
            }
        }
    }
}

/// Assigns interval markers to the analyzed tree.
struct TreeAnnotator<'a> {
    begin: u32,
    end: u32,
    left_weight: u32,
    negated: bool,
    final_range_used: bool,
    size_map: &'a BTreeMap<String, u32>,
    crumbs: TreeCrumbs,
    interval_range: u16,
    z_star_hash: u64,
    arity: u32,
    result: &'a mut PredicateTreeAnnotations,
}

impl TreeAnnotator<'_> {
    fn make_marker(begin: u32, end: u32) -> Interval {
        Interval::new(begin, end)
    }

    fn c_end(&mut self) -> u32 {
        if !self.final_range_used && self.end == u32::from(self.interval_range) {
            self.final_range_used = true;
            return u32::from(self.interval_range) - 1;
        }
        self.left_weight + 1
    }

    fn add_z_star_interval_if_negated(&mut self, c_end: u32) {
        if !self.negated {
            return;
        }
        if !self.result.interval_map.contains_key(&self.z_star_hash) {
            self.result.features.push(self.z_star_hash);
        }
        let intervals = self
            .result
            .interval_map
            .entry(self.z_star_hash)
            .or_default();
        intervals.push(Self::make_marker(c_end, self.begin - 1));
        if self.end - c_end != 1 {
            intervals.push(Self::make_marker(0, self.end));
        }
        self.left_weight += 1;
    }

    fn assign(&mut self, node: &PredicateNode) {
        match effective_type(node, self.negated) {
            EffectiveType::And => {
                let crumb_len = self.crumbs.len();
                let children = children_of(node);
                let mut curr = self.begin;
                let begin = self.begin;
                let end = self.end;
                for (i, child) in children.iter().enumerate() {
                    self.crumbs.set_child(i, 'a');
                    if i == children.len() - 1 {
                        self.begin = curr;
                        self.end = end;
                        self.assign(child);
                    } else if i == 0 {
                        let child_size =
                            self.size_map.get(&self.crumbs.crumb()).copied().unwrap_or(1);
                        let next = self.left_weight + child_size + 1;
                        self.begin = curr;
                        self.end = next - 1;
                        self.assign(child);
                        curr = next;
                    } else {
                        let child_size =
                            self.size_map.get(&self.crumbs.crumb()).copied().unwrap_or(1);
                        let next = curr + child_size;
                        self.begin = curr;
                        self.end = next - 1;
                        self.assign(child);
                        curr = next;
                    }
                    self.crumbs.resize(crumb_len);
                }
                self.begin = begin;
            }
            EffectiveType::Or => {
                // All OR children share the parent's interval
                let crumb_len = self.crumbs.len();
                for (i, child) in children_of(node).iter().enumerate() {
                    self.crumbs.set_child(i, 'o');
                    self.assign(child);
                    self.crumbs.resize(crumb_len);
                }
            }
            EffectiveType::Not => {
                if let PredicateNode::Not(child) = node {
                    self.negated = !self.negated;
                    self.assign(child);
                    self.negated = !self.negated;
                }
            }
            EffectiveType::FeatureSet => {
                let c_end = if self.negated { self.c_end() } else { 0 };
                if let PredicateNode::FeatureSet { label, values } = node {
                    let end = if self.negated { c_end } else { self.end };
                    for value in values {
                        let hash = feature_hash(&format!("{label}={value}"));
                        if !self.result.interval_map.contains_key(&hash) {
                            self.result.features.push(hash);
                        }
                        self.result
                            .interval_map
                            .entry(hash)
                            .or_default()
                            .push(Self::make_marker(self.begin, end));
                    }
                }
                self.add_z_star_interval_if_negated(c_end);
                self.left_weight += 1;
            }
            EffectiveType::FeatureRange => {
                let c_end = if self.negated { self.c_end() } else { 0 };
                if let PredicateNode::FeatureRange { label, from, to } = node {
                    let end = if self.negated { c_end } else { self.end };
                    let parts = partition_range(label, *from, *to, self.arity);
                    for hash in &parts.partitions {
                        self.result
                            .interval_map
                            .entry(*hash)
                            .or_default()
                            .push(Self::make_marker(self.begin, end));
                    }
                    for edge in &parts.edges {
                        self.result
                            .bounds_map
                            .entry(edge.hash)
                            .or_default()
                            .push(IntervalWithBounds::new(
                                Self::make_marker(self.begin, end).interval,
                                edge.bounds,
                            ));
                    }
                    if parts.hash_count() < 3 {
                        // three features takes more space than one stored range
                        self.result.features.extend(&parts.partitions);
                        self.result.features.extend(parts.edges.iter().map(|e| e.hash));
                    } else {
                        self.result.range_features.push(RangeFeature {
                            label: label.clone(),
                            from: *from,
                            to: *to,
                        });
                    }
                }
                self.add_z_star_interval_if_negated(c_end);
                self.left_weight += 1;
            }
        }
    }
}

/// Annotates a predicate tree with the intervals, features and bounds the
/// index stores for interval-algorithm matching.
pub fn annotate(tree: &PredicateNode, arity: u32) -> crate::Result<PredicateTreeAnnotations> {
    let mut analyzer = TreeAnalyzer::new();
    analyzer.traverse(tree);
    let min = analyzer.find_min_feature(tree);
    let min_feature = (min + if analyzer.has_not { 1.0 } else { 0.0 }).ceil();
    let size = analyzer.size;

    if size == 0 || size > u32::from(MAX_INTERVAL) {
        return Err(crate::Error::Corruption(format!(
            "predicate tree size {size} outside [1, {MAX_INTERVAL}]"
        )));
    }
    // NOTE: Truncation guarded above
    #[allow(clippy::cast_possible_truncation)]
    let interval_range = size as u16;

    // NOTE: min_feature is a small non-negative count
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let min_feature = min_feature as u32;

    let mut result = PredicateTreeAnnotations {
        min_feature,
        interval_range,
        ..PredicateTreeAnnotations::default()
    };

    let mut annotator = TreeAnnotator {
        begin: MIN_INTERVAL,
        end: u32::from(interval_range),
        left_weight: 0,
        negated: false,
        final_range_used: false,
        size_map: &analyzer.size_map,
        crumbs: TreeCrumbs::default(),
        interval_range,
        z_star_hash: feature_hash(Z_STAR_COMPRESSED_ATTRIBUTE_NAME),
        arity,
        result: &mut result,
    };
    annotator.assign(tree);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn single_feature_spans_whole_range() -> crate::Result<()> {
        let tree = PredicateNode::feature_set("color", &["red"]);
        let annotations = annotate(&tree, 8)?;

        assert_eq!(1, annotations.min_feature);
        assert_eq!(1, annotations.interval_range);
        let intervals = &annotations.interval_map[&feature_hash("color=red")];
        assert_eq!(vec![Interval::new(1, 1)], *intervals);
        Ok(())
    }

    #[test]
    fn conjunction_partitions_left_to_right() -> crate::Result<()> {
        let tree = PredicateNode::And(vec![
            PredicateNode::feature_set("a", &["x"]),
            PredicateNode::feature_set("b", &["y"]),
        ]);
        let annotations = annotate(&tree, 8)?;

        assert_eq!(2, annotations.min_feature);
        assert_eq!(2, annotations.interval_range);
        assert_eq!(
            vec![Interval::new(1, 1)],
            annotations.interval_map[&feature_hash("a=x")]
        );
        assert_eq!(
            vec![Interval::new(2, 2)],
            annotations.interval_map[&feature_hash("b=y")]
        );
        Ok(())
    }

    #[test]
    fn disjunction_children_share_parent_interval() -> crate::Result<()> {
        let tree = PredicateNode::Or(vec![
            PredicateNode::feature_set("a", &["x"]),
            PredicateNode::feature_set("b", &["y"]),
        ]);
        let annotations = annotate(&tree, 8)?;

        assert_eq!(1, annotations.min_feature);
        assert_eq!(2, annotations.interval_range);
        assert_eq!(
            vec![Interval::new(1, 2)],
            annotations.interval_map[&feature_hash("a=x")]
        );
        assert_eq!(
            vec![Interval::new(1, 2)],
            annotations.interval_map[&feature_hash("b=y")]
        );
        Ok(())
    }

    #[test]
    fn negation_emits_z_star_and_bumps_min_feature() -> crate::Result<()> {
        let tree = PredicateNode::And(vec![
            PredicateNode::feature_set("a", &["x"]),
            PredicateNode::Not(Box::new(PredicateNode::feature_set("b", &["y"]))),
        ]);
        let annotations = annotate(&tree, 8)?;

        // one for a=x, plus the not-bump
        assert_eq!(2, annotations.min_feature);
        assert_eq!(3, annotations.interval_range);

        let z_star = feature_hash(Z_STAR_COMPRESSED_ATTRIBUTE_NAME);
        assert!(annotations.interval_map.contains_key(&z_star));
        assert!(annotations.features.contains(&z_star));
        Ok(())
    }

    #[test]
    fn small_range_inlines_features() -> crate::Result<()> {
        let tree = PredicateNode::feature_range("year", 2020, 2020);
        let annotations = annotate(&tree, 8)?;

        // a point range is a single edge partition, below the range-feature
        // threshold
        assert!(annotations.range_features.is_empty());
        assert_eq!(1, annotations.features.len());
        assert_eq!(1, annotations.bounds_map.len());
        Ok(())
    }

    #[test]
    fn wide_range_stores_range_feature() -> crate::Result<()> {
        let tree = PredicateNode::feature_range("year", 2000, 2100);
        let annotations = annotate(&tree, 8)?;

        assert_eq!(
            vec![RangeFeature {
                label: "year".into(),
                from: 2000,
                to: 2100
            }],
            annotations.range_features
        );
        assert!(annotations.features.is_empty());
        Ok(())
    }
}
