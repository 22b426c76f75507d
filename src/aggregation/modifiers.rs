// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::aggregation::{
    AggregationResult, AggregationResultVariant, GlobalId, Group, Grouping,
};
use crate::expression::{AttributeSource, ResultNode};

/// Resolves local doc ids into global document ids.
pub trait GlobalIdResolver {
    fn global_id(&self, lid: u32) -> Option<GlobalId>;
}

/// Rewrites enum-typed group ids and aggregation accumulators into their
/// string form for transport.
///
/// A group at depth `d` was produced by the classifier of level `d - 1`,
/// so its enum ids resolve through that level's attribute.
pub fn normalize_enums(grouping: &mut Grouping, attributes: &dyn AttributeSource) {
    let attribute_names: Vec<Option<String>> = grouping
        .levels()
        .iter()
        .map(|level| {
            level
                .expression()
                .root()
                .attribute_name()
                .map(str::to_string)
        })
        .collect();

    normalize_group(grouping.root_mut(), &attribute_names, 0, attributes);
}

fn normalize_group(
    group: &mut Group,
    attribute_names: &[Option<String>],
    level: usize,
    attributes: &dyn AttributeSource,
) {
    for result in group.value_mut().aggregation_results_mut() {
        normalize_result(result, attributes);
    }

    for child in group.children_mut() {
        if let Some(ResultNode::Enum(enum_id)) = child.id() {
            if let Some(Some(attribute)) = attribute_names.get(level) {
                if let Some(string) = attributes.enum_string(attribute, *enum_id) {
                    child.set_id(ResultNode::String(string));
                }
            }
        }
        normalize_group(child, attribute_names, level + 1, attributes);
    }
}

fn normalize_result(result: &mut AggregationResult, attributes: &dyn AttributeSource) {
    let Some(attribute) = result
        .expression()
        .root()
        .attribute_name()
        .map(str::to_string)
    else {
        return;
    };

    let rewrite = |value: &mut ResultNode| {
        if let ResultNode::Enum(enum_id) = value {
            if let Some(string) = attributes.enum_string(&attribute, *enum_id) {
                *value = ResultNode::String(string);
            }
        }
    };

    match result.variant_mut() {
        AggregationResultVariant::Min(v) => rewrite(v.min_mut()),
        AggregationResultVariant::Max(v) => rewrite(v.max_mut()),
        AggregationResultVariant::Sum(v) => rewrite(v.sum_mut()),
        _ => {}
    }
}

/// Rewrites lid-based hits into global-id form via the injected resolver.
pub fn convert_to_global_id(grouping: &mut Grouping, resolver: &dyn GlobalIdResolver) {
    convert_group(grouping.root_mut(), resolver);
}

fn convert_group(group: &mut Group, resolver: &dyn GlobalIdResolver) {
    for result in group.value_mut().aggregation_results_mut() {
        if let AggregationResultVariant::Hits(hits) = result.variant_mut() {
            let mut fs_hits = hits.hits_mut().fs_hits_mut();
            for hit in &mut fs_hits {
                if let Some(gid) = resolver.global_id(hit.doc_id()) {
                    hit.set_global_id(gid);
                }
            }
            hits.hits_mut().set_fs_hits(fs_hits);
        }
    }
    for child in group.children_mut() {
        convert_group(child, resolver);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{GroupingLevel, RankedHit};
    use crate::expression::{AttributeNode, ExpressionNode};
    use rustc_hash::FxHashMap;
    use test_log::test;

    struct TestAttributes {
        values: FxHashMap<u32, ResultNode>,
        enums: FxHashMap<u64, String>,
    }

    impl AttributeSource for TestAttributes {
        fn value(&self, _attribute: &str, doc_id: u32) -> Option<ResultNode> {
            self.values.get(&doc_id).cloned()
        }

        fn enum_string(&self, _attribute: &str, enum_id: u64) -> Option<String> {
            self.enums.get(&enum_id).cloned()
        }
    }

    #[test]
    fn enum_group_ids_become_strings() -> crate::Result<()> {
        let mut values = FxHashMap::default();
        values.insert(1, ResultNode::Enum(10));
        values.insert(2, ResultNode::Enum(11));
        let mut enums = FxHashMap::default();
        enums.insert(10, "red".to_string());
        enums.insert(11, "blue".to_string());
        let attributes = TestAttributes { values, enums };

        let mut grouping = Grouping::new().with_last_level(1).with_level(
            GroupingLevel::new()
                .with_expression(ExpressionNode::Attribute(AttributeNode::new("color"))),
        );

        let hits = [RankedHit::new(1, 0.0), RankedHit::new(2, 0.0)];
        grouping.aggregate(&hits, Some(&attributes as &dyn AttributeSource))?;

        let ids: Vec<String> = grouping
            .root()
            .children()
            .filter_map(|c| match c.id() {
                Some(ResultNode::String(s)) => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(vec!["blue".to_string(), "red".to_string()], ids);
        Ok(())
    }
}
