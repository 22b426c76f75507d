// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::predicate::hash::{feature_hash, feature_hash_pair};
use crate::predicate::range_expander::edge_partition_hash;
use crate::predicate::{
    BoundsPostingList, BtreeIterator, IntervalPostingList, PredicateIndex, PredicatePostingList,
    ZstarCompressedPostingList, Z_STAR_COMPRESSED_ATTRIBUTE_NAME,
};
use rustc_hash::FxHashSet;

// Query-side partition levels probed above the base arity. Larger
// partitions than this never appear on documents in practice.
const MAX_PARTITION_LEVELS: u32 = 14;

/// The assignment a query presents to the index: concrete `label=value`
/// features plus point values checked against range terms.
#[derive(Clone, Debug, Default)]
pub struct PredicateQuery {
    features: Vec<(String, String)>,
    range_features: Vec<(String, i64)>,
}

impl PredicateQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_feature(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.features.push((label.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_range_feature(mut self, label: impl Into<String>, value: i64) -> Self {
        self.range_features.push((label.into(), value));
        self
    }
}

// Lookup keys derived from one query-side range value: the edge partition
// with its diff, and the enclosing full partitions per level.
struct RangeKeys {
    edge_hash: u64,
    value_diff: u32,
    partition_hashes: Vec<u64>,
}

fn range_keys(label: &str, value: i64, arity: u32) -> RangeKeys {
    let negative = value < 0;
    let magnitude = value.unsigned_abs();
    let arity64 = u64::from(arity);

    let part_start = magnitude - magnitude % arity64;
    // NOTE: Truncation is OK, diffs stay below the arity
    #[allow(clippy::cast_possible_truncation)]
    let value_diff = (magnitude - part_start) as u32;

    let mut partition_hashes = Vec::new();
    let mut size = arity64;
    for _ in 0..MAX_PARTITION_LEVELS {
        let from = (magnitude / size) * size;
        let to = from + size - 1;
        let hash = if negative {
            feature_hash(&format!("{label}=-{to}-{from}"))
        } else {
            feature_hash(&format!("{label}={from}-{to}"))
        };
        partition_hashes.push(hash);
        let Some(next) = size.checked_mul(arity64) else {
            break;
        };
        size = next;
    }

    RangeKeys {
        edge_hash: edge_partition_hash(label, part_start, negative),
        value_diff,
        partition_hashes,
    }
}

/// Reference evaluator for the interval algorithm.
///
/// Builds the posting-list stack for a query and checks, per candidate
/// document, that the matched intervals chain gap-free from position 1 to
/// the document's interval range. Negated documents participate through
/// the z-star posting list.
pub struct PredicateSearch<'a> {
    index: &'a PredicateIndex,
}

impl<'a> PredicateSearch<'a> {
    #[must_use]
    pub fn new(index: &'a PredicateIndex) -> Self {
        Self { index }
    }

    fn posting_lists_for(
        &self,
        query: &PredicateQuery,
    ) -> Vec<Box<dyn PredicatePostingList + 'a>> {
        let mut lists: Vec<Box<dyn PredicatePostingList + 'a>> = Vec::new();
        let store = self.index.interval_store();

        let mut interval_keys: Vec<u64> = query
            .features
            .iter()
            .map(|(label, value)| feature_hash_pair(label, value))
            .collect();

        for (label, value) in &query.range_features {
            let keys = range_keys(label, *value, self.index.arity());
            interval_keys.extend(keys.partition_hashes);

            if let Some(postings) = self.index.bounds_index().lookup(keys.edge_hash) {
                lists.push(Box::new(BoundsPostingList::new(
                    store,
                    BtreeIterator::new(postings),
                    keys.value_diff,
                )));
            }
        }

        for key in interval_keys {
            if let Some(postings) = self.index.interval_index().lookup(key) {
                lists.push(Box::new(IntervalPostingList::new(
                    store,
                    BtreeIterator::new(postings),
                )));
            }
        }

        let z_star = feature_hash(Z_STAR_COMPRESSED_ATTRIBUTE_NAME);
        if let Some(postings) = self.index.interval_index().lookup(z_star) {
            lists.push(Box::new(ZstarCompressedPostingList::new(
                store,
                BtreeIterator::new(postings),
            )));
        }

        lists
    }

    /// True when the document's predicate is satisfied by the query
    /// assignment.
    #[must_use]
    pub fn matches(&self, doc_id: u32, query: &PredicateQuery) -> bool {
        if self.index.zero_constraint_docs().contains(&doc_id) {
            return true;
        }
        let Some((min_feature, interval_range)) = self.index.document_annotations(doc_id) else {
            return false;
        };

        let mut intervals: Vec<u32> = Vec::new();
        let mut matched_features = 0u32;
        for mut list in self.posting_lists_for(query) {
            if !list.next(doc_id.saturating_sub(1)) || list.doc_id() != doc_id {
                continue;
            }
            matched_features += 1;
            intervals.push(list.get_interval());
            while list.next_interval() {
                intervals.push(list.get_interval());
            }
        }

        if matched_features < min_feature {
            return false;
        }
        chain_covers(&mut intervals, u32::from(interval_range))
    }

    /// All currently-indexed doc ids matching the query, ascending.
    #[must_use]
    pub fn search(&self, query: &PredicateQuery) -> Vec<u32> {
        let mut candidates: FxHashSet<u32> = self
            .index
            .zero_constraint_docs()
            .iter()
            .copied()
            .collect();

        for mut list in self.posting_lists_for(query) {
            let mut cursor = 0;
            while list.next(cursor) {
                candidates.insert(list.doc_id());
                cursor = list.doc_id();
            }
        }

        let mut matches: Vec<u32> = candidates
            .into_iter()
            .filter(|doc_id| self.matches(*doc_id, query))
            .collect();
        matches.sort_unstable();
        matches
    }
}

// The interval algorithm's acceptance check: sorted by begin, the matched
// intervals must chain 1 → 2 → … → range without gaps.
fn chain_covers(intervals: &mut [u32], interval_range: u32) -> bool {
    intervals.sort_unstable_by_key(|i| i >> 16);

    let mut reached = FxHashSet::default();
    reached.insert(0u32);
    for interval in intervals.iter() {
        let begin = interval >> 16;
        let end = interval & 0xffff;
        if begin > 0 && reached.contains(&(begin - 1)) {
            reached.insert(end);
        }
    }
    reached.contains(&interval_range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{annotate, PredicateNode, SimpleIndexConfig};
    use test_log::test;

    fn index_with(docs: &[(u32, PredicateNode)]) -> PredicateIndex {
        let mut index = PredicateIndex::new(SimpleIndexConfig::default(), 8, 100);
        for (doc_id, tree) in docs {
            let annotations = annotate(tree, index.arity()).expect("annotation should not fail");
            index.index_document(*doc_id, &annotations);
        }
        index.commit();
        index
    }

    #[test]
    fn conjunction_of_set_and_range() {
        let index = index_with(&[(
            1,
            PredicateNode::And(vec![
                PredicateNode::feature_set("label", &["red"]),
                PredicateNode::feature_range("year", 2020, 2020),
            ]),
        )]);
        let search = PredicateSearch::new(&index);

        let matching = PredicateQuery::new()
            .with_feature("label", "red")
            .with_range_feature("year", 2020);
        assert!(search.matches(1, &matching));
        assert_eq!(vec![1], search.search(&matching));

        let wrong_year = PredicateQuery::new()
            .with_feature("label", "red")
            .with_range_feature("year", 2021);
        assert!(!search.matches(1, &wrong_year));
        assert!(search.search(&wrong_year).is_empty());

        let missing_range = PredicateQuery::new().with_feature("label", "red");
        assert!(!search.matches(1, &missing_range));
    }

    #[test]
    fn disjunction_matches_either_side() {
        let index = index_with(&[(
            7,
            PredicateNode::Or(vec![
                PredicateNode::feature_set("color", &["red"]),
                PredicateNode::feature_set("color", &["blue"]),
            ]),
        )]);
        let search = PredicateSearch::new(&index);

        assert!(search.matches(7, &PredicateQuery::new().with_feature("color", "red")));
        assert!(search.matches(7, &PredicateQuery::new().with_feature("color", "blue")));
        assert!(!search.matches(7, &PredicateQuery::new().with_feature("color", "green")));
    }

    #[test]
    fn zero_constraint_matches_everything() {
        let mut index = PredicateIndex::new(SimpleIndexConfig::default(), 8, 100);
        index.index_empty_document(9);
        let search = PredicateSearch::new(&index);

        assert!(search.matches(9, &PredicateQuery::new().with_feature("any", "thing")));
        assert_eq!(vec![9], search.search(&PredicateQuery::new()));
    }

    #[test]
    fn wide_range_with_stored_range_feature() {
        let index = index_with(&[(
            3,
            PredicateNode::feature_range("year", 2000, 2100),
        )]);
        let search = PredicateSearch::new(&index);

        assert!(search.matches(3, &PredicateQuery::new().with_range_feature("year", 2050)));
        assert!(!search.matches(3, &PredicateQuery::new().with_range_feature("year", 2101)));
    }

    #[test]
    fn removed_documents_stop_matching() {
        let mut index = PredicateIndex::new(SimpleIndexConfig::default(), 8, 100);
        let tree = PredicateNode::feature_set("color", &["red"]);
        let annotations = annotate(&tree, 8).expect("annotation should not fail");
        index.index_document(4, &annotations);
        index.commit();

        {
            let search = PredicateSearch::new(&index);
            assert!(search.matches(4, &PredicateQuery::new().with_feature("color", "red")));
        }

        index.remove_document(4);
        index.commit();
        let search = PredicateSearch::new(&index);
        assert!(!search.matches(4, &PredicateQuery::new().with_feature("color", "red")));
    }
}
