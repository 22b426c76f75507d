use grist::aggregation::{
    AggregationResult, AggregationResultVariant, AverageResult, CountResult,
    ExpressionCountResult, Group, Grouping, GroupingLevel, HitsResult, MaxResult, MinResult,
    RankedHit, StandardDeviationResult, SumResult, XorResult,
};
use grist::expression::{
    ConstantNode, DocIdNode, ExpressionNode, ModuloNode, RankNode, ResultNode,
};
use grist::{Decode, Encode};
use rand::prelude::*;

fn modulo_classifier(modulus: i64) -> ExpressionNode {
    ExpressionNode::Modulo(ModuloNode::new(
        ExpressionNode::DocId(DocIdNode::default()),
        ExpressionNode::Constant(ConstantNode::new(ResultNode::Integer(modulus))),
    ))
}

fn doc_id_count() -> AggregationResult {
    AggregationResult::new(AggregationResultVariant::Count(CountResult::default()))
        .with_expression(ExpressionNode::DocId(DocIdNode::default()))
}

// Feed doc ids [1..5] with rank 0.0, classifier docId mod 2, two count
// aggregators: the root gets children 0 (count 2) and 1 (count 3).
#[test_log::test]
fn count_aggregation_over_modulo_groups() -> grist::Result<()> {
    let mut grouping = Grouping::new().with_last_level(1).with_level(
        GroupingLevel::new()
            .with_expression(modulo_classifier(2))
            .with_aggregation_result(doc_id_count())
            .with_aggregation_result(doc_id_count()),
    );

    let hits: Vec<RankedHit> = (1..=5).map(|doc_id| RankedHit::new(doc_id, 0.0)).collect();
    grouping.aggregate(&hits, None)?;

    let root = grouping.root();
    assert_eq!(2, root.children_len());

    let even = root
        .find_child(&ResultNode::Integer(0))
        .expect("group for id 0");
    let odd = root
        .find_child(&ResultNode::Integer(1))
        .expect("group for id 1");

    for group in [even, odd] {
        assert_eq!(2, group.value().aggregation_results().len());
    }
    assert_eq!(
        ResultNode::Integer(2),
        even.value().aggregation_results()[0].rank()
    );
    assert_eq!(
        ResultNode::Integer(3),
        odd.value().aggregation_results()[1].rank()
    );
    Ok(())
}

// maxHits = 3 over a pre-ranked stream: collection stops once the list is
// full, keeping the three best ranks. The unordered pop-push path is
// covered by the hit-list unit tests.
#[test_log::test]
fn top_k_hits_over_ranked_stream() -> grist::Result<()> {
    let hits_result = AggregationResult::new(AggregationResultVariant::Hits(HitsResult::new(3)))
        .with_expression(ExpressionNode::Rank(RankNode::default()));

    let mut grouping = Grouping::new()
        .with_top_n(100)
        .with_last_level(0)
        .with_root(Group::new().with_aggregation_result(hits_result));

    let ranks = [0.95, 0.9, 0.85, 0.8, 0.7, 0.6];
    let hits: Vec<RankedHit> = ranks
        .iter()
        .enumerate()
        .map(|(i, rank)| RankedHit::new(i as u32 + 1, *rank))
        .collect();
    grouping.aggregate(&hits, None)?;

    let result = &grouping.root().value().aggregation_results()[0];
    let AggregationResultVariant::Hits(hits) = result.variant() else {
        panic!("expected hits variant");
    };
    let sorted: Vec<f64> = hits.hits().sorted_fs_hits().iter().map(|h| h.rank()).collect();
    assert_eq!(vec![0.95, 0.9, 0.85], sorted);
    Ok(())
}

// 1,000,000 distinct values into an HLL with 2^10 buckets: estimate
// within ±5%.
#[test_log::test]
fn hyperloglog_estimates_a_million_distinct_values() {
    let mut result = ExpressionCountResult::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..1_000_000u32 {
        let value = ResultNode::Integer(rng.random());
        use grist::aggregation::AggregationOps;
        result
            .on_aggregate(&value, &grist::expression::ExecutionInput::new(0, 0.0))
            .expect("aggregation cannot fail");
    }

    let estimate = result.estimate();
    let error = (estimate - 1_000_000.0).abs() / 1_000_000.0;
    assert!(error < 0.05, "estimate {estimate} is off by {error}");
}

fn variant_fixtures() -> Vec<AggregationResultVariant> {
    vec![
        AggregationResultVariant::Count(CountResult::default()),
        AggregationResultVariant::Sum(SumResult::default()),
        AggregationResultVariant::Min(MinResult::default()),
        AggregationResultVariant::Max(MaxResult::default()),
        AggregationResultVariant::Average(AverageResult::default()),
        AggregationResultVariant::Xor(XorResult::default()),
        AggregationResultVariant::StandardDeviation(StandardDeviationResult::default()),
        AggregationResultVariant::ExpressionCount(ExpressionCountResult::default()),
    ]
}

fn build(variant: &AggregationResultVariant, samples: &[i64]) -> AggregationResult {
    let mut result = AggregationResult::new(variant.clone());
    for sample in samples {
        result.set_expression_root(ExpressionNode::Constant(ConstantNode::new(
            ResultNode::Integer(*sample),
        )));
        result
            .aggregate(&grist::expression::ExecutionInput::new(1, 0.0))
            .expect("aggregation cannot fail");
    }
    result
}

fn ranks_close(a: &ResultNode, b: &ResultNode) -> bool {
    match (a, b) {
        (ResultNode::Float(x), ResultNode::Float(y)) => (x - y).abs() < 1e-9,
        _ => a == b,
    }
}

// merge(build(A), build(B)).rank == build(A ⊎ B).rank, and merge is
// commutative.
#[test_log::test]
fn merge_of_disjoint_samples_equals_union() {
    let mut rng = StdRng::seed_from_u64(42);
    for variant in variant_fixtures() {
        let left_samples: Vec<i64> = (0..100).map(|_| rng.random_range(-1000..1000)).collect();
        let right_samples: Vec<i64> = (0..80).map(|_| rng.random_range(-1000..1000)).collect();
        let union_samples: Vec<i64> = left_samples
            .iter()
            .chain(right_samples.iter())
            .copied()
            .collect();

        let mut forward = build(&variant, &left_samples);
        forward
            .merge(&build(&variant, &right_samples))
            .expect("same variant");

        let mut backward = build(&variant, &right_samples);
        backward
            .merge(&build(&variant, &left_samples))
            .expect("same variant");

        let union = build(&variant, &union_samples);
        assert!(
            ranks_close(&forward.rank(), &union.rank()),
            "merge != union for {variant:?}"
        );
        assert!(
            ranks_close(&forward.rank(), &backward.rank()),
            "merge not commutative for {variant:?}"
        );
    }
}

// Peer shards aggregate disjoint doc ranges; after merge the counts match
// single-node aggregation.
#[test_log::test]
fn shard_merge_equals_single_node_aggregation() -> grist::Result<()> {
    let make_grouping = || {
        Grouping::new().with_last_level(1).with_level(
            GroupingLevel::new()
                .with_expression(modulo_classifier(4))
                .with_aggregation_result(doc_id_count()),
        )
    };

    let mut left = make_grouping();
    let mut right = make_grouping();
    let mut reference = make_grouping();

    let left_hits: Vec<RankedHit> = (1..=40).map(|d| RankedHit::new(d, 0.0)).collect();
    let right_hits: Vec<RankedHit> = (41..=100).map(|d| RankedHit::new(d, 0.0)).collect();
    let all_hits: Vec<RankedHit> = (1..=100).map(|d| RankedHit::new(d, 0.0)).collect();

    left.aggregate(&left_hits, None)?;
    right.aggregate(&right_hits, None)?;
    reference.aggregate(&all_hits, None)?;

    left.merge(right)?;
    left.post_merge()?;
    left.sort_by_id();

    for remainder in 0..4i64 {
        let merged = left
            .root()
            .find_child(&ResultNode::Integer(remainder))
            .expect("merged group");
        let expected = reference
            .root()
            .find_child(&ResultNode::Integer(remainder))
            .expect("reference group");
        assert_eq!(
            expected.value().aggregation_results()[0].rank(),
            merged.value().aggregation_results()[0].rank()
        );
    }
    Ok(())
}

// With maxGroups = M, post-merge keeps the top M children by rank.
#[test_log::test]
fn post_merge_retains_top_groups_by_rank() -> grist::Result<()> {
    let mut grouping = Grouping::new().with_last_level(1).with_level(
        GroupingLevel::new()
            .with_max_groups(3)
            .with_precision(10)
            .with_expression(modulo_classifier(10))
            .with_aggregation_result(doc_id_count()),
    );

    // doc id d gets rank d as f64: groups 7, 8, 9 carry the best ranks
    let hits: Vec<RankedHit> = (1..=10)
        .map(|d| RankedHit::new(d, f64::from(d)))
        .collect();
    grouping.aggregate(&hits, None)?;

    assert_eq!(3, grouping.root().children_len());
    let mut ids: Vec<i64> = grouping
        .root()
        .children()
        .filter_map(|c| c.id().map(ResultNode::as_integer))
        .collect();
    ids.sort_unstable();
    assert_eq!(vec![0, 8, 9], ids);
    Ok(())
}

#[test_log::test]
fn grouping_request_serde_roundtrip() -> grist::Result<()> {
    let mut grouping = Grouping::new()
        .with_id(11)
        .with_top_n(1000)
        .with_last_level(1)
        .with_level(
            GroupingLevel::new()
                .with_max_groups(5)
                .with_expression(modulo_classifier(3))
                .with_aggregation_result(doc_id_count())
                .with_aggregation_result(
                    AggregationResult::new(AggregationResultVariant::Sum(SumResult::default()))
                        .with_expression(ExpressionNode::DocId(DocIdNode::default())),
                ),
        );

    let hits: Vec<RankedHit> = (1..=20).map(|d| RankedHit::new(d, 0.5)).collect();
    grouping.aggregate(&hits, None)?;

    let bytes = grouping.encode_into_vec();
    let decoded = Grouping::decode_from(&mut &bytes[..]).map_err(grist::Error::Decode)?;
    assert_eq!(grouping, decoded);
    Ok(())
}

// NaN document ranks normalize to -inf on group ranks.
#[test_log::test]
fn nan_rank_normalizes() -> grist::Result<()> {
    let mut grouping = Grouping::new().with_last_level(1).with_level(
        GroupingLevel::new()
            .with_expression(modulo_classifier(2))
            .with_aggregation_result(doc_id_count()),
    );
    grouping.aggregate(&[RankedHit::new(1, f64::NAN)], None)?;

    let group = grouping
        .root()
        .find_child(&ResultNode::Integer(1))
        .expect("group");
    assert_eq!(f64::NEG_INFINITY, group.rank());
    Ok(())
}
