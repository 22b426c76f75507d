use grist::predicate::{
    annotate, feature_hash, Interval, IntervalStore, PredicateIndex, PredicateNode,
    PredicateQuery, PredicateSearch, SimpleIndexConfig,
};
use rand::prelude::*;
use rustc_hash::FxHashMap;

fn indexed(index: &mut PredicateIndex, doc_id: u32, tree: &PredicateNode) {
    let annotations = annotate(tree, index.arity()).expect("annotation should not fail");
    index.index_document(doc_id, &annotations);
}

// Annotate doc 1 with `label=red AND year ∈ [2020, 2020]`: the query
// {label=red, year=2020} matches, {label=red, year=2021} does not.
#[test_log::test]
fn conjunction_with_range_edge() {
    let mut index = PredicateIndex::new(SimpleIndexConfig::default(), 8, 100);
    indexed(
        &mut index,
        1,
        &PredicateNode::And(vec![
            PredicateNode::feature_set("label", &["red"]),
            PredicateNode::feature_range("year", 2020, 2020),
        ]),
    );
    index.commit();

    let search = PredicateSearch::new(&index);
    assert!(search.matches(
        1,
        &PredicateQuery::new()
            .with_feature("label", "red")
            .with_range_feature("year", 2020)
    ));
    assert!(!search.matches(
        1,
        &PredicateQuery::new()
            .with_feature("label", "red")
            .with_range_feature("year", 2021)
    ));
}

// After any sequence of index/remove, lookup(f) returns exactly the doc
// ids whose current annotation carries f.
#[test_log::test]
fn lookup_tracks_random_index_and_remove_sequences() {
    let labels = ["a", "b", "c", "d"];
    let mut rng = StdRng::seed_from_u64(7);
    let mut index = PredicateIndex::new(SimpleIndexConfig::default(), 8, 1000);
    let mut expected: FxHashMap<u64, Vec<u32>> = FxHashMap::default();
    let mut live: FxHashMap<u32, u64> = FxHashMap::default();

    for round in 0..500u32 {
        let doc_id = rng.random_range(1..200u32);
        if live.contains_key(&doc_id) && rng.random_bool(0.4) {
            index.remove_document(doc_id);
            if let Some(feature) = live.remove(&doc_id) {
                if let Some(docs) = expected.get_mut(&feature) {
                    docs.retain(|d| *d != doc_id);
                }
            }
        } else {
            if live.contains_key(&doc_id) {
                // re-index replaces the previous annotation
                index.remove_document(doc_id);
                if let Some(feature) = live.remove(&doc_id) {
                    if let Some(docs) = expected.get_mut(&feature) {
                        docs.retain(|d| *d != doc_id);
                    }
                }
            }
            let label = labels[(round as usize) % labels.len()];
            let value = format!("v{}", rng.random_range(0..5));
            indexed(
                &mut index,
                doc_id,
                &PredicateNode::feature_set(label, &[value.as_str()]),
            );
            let feature = feature_hash(&format!("{label}={value}"));
            expected.entry(feature).or_default().push(doc_id);
            live.insert(doc_id, feature);
        }
    }
    index.commit();

    for (feature, docs) in &mut expected {
        docs.sort_unstable();
        let looked_up = index.lookup(*feature).unwrap_or_default();
        assert_eq!(*docs, looked_up, "feature {feature:016x}");
    }
}

// get(insert(xs)) == xs and identical inputs share a ref.
#[test_log::test]
fn interval_store_roundtrip_random_inputs() {
    let mut rng = StdRng::seed_from_u64(99);
    let mut store = IntervalStore::new();
    let mut inserted: Vec<(grist::predicate::EntryRef, Vec<Interval>)> = Vec::new();

    for _ in 0..300 {
        let len = rng.random_range(1..20usize);
        let intervals: Vec<Interval> = (0..len)
            .map(|_| {
                let begin = rng.random_range(1..100u32);
                let end = rng.random_range(begin..=100u32);
                Interval::new(begin, end)
            })
            .collect();
        let entry_ref = store.insert(&intervals);
        assert_eq!(intervals, store.get::<Interval>(entry_ref));
        inserted.push((entry_ref, intervals));
    }

    for (entry_ref, intervals) in &inserted {
        assert_eq!(*entry_ref, store.insert(intervals));
    }
}

// With upperVectorSizeThreshold=10 and docIdLimit=25, 11 docs promote the
// posting list to a vector; dropping to 7 demotes it again.
#[test_log::test]
fn posting_representation_follows_density() {
    let config = SimpleIndexConfig {
        upper_docid_freq_threshold: 0.4,
        lower_docid_freq_threshold: 0.32,
        upper_vector_size_threshold: 10,
        lower_vector_size_threshold: 8,
        vector_prune_frequency: 1,
        foreach_vector_threshold: 0.25,
    };
    let mut index = PredicateIndex::new(config, 8, 25);
    let tree = PredicateNode::feature_set("label", &["hot"]);
    for doc_id in 1..=11 {
        indexed(&mut index, doc_id, &tree);
    }
    index.commit();

    let key = feature_hash("label=hot");
    assert!(index.interval_index().vector_posting_list(key).is_some());

    for doc_id in 1..=4 {
        index.remove_document(doc_id);
    }
    index.commit();
    assert!(index.interval_index().vector_posting_list(key).is_none());
    assert_eq!(vec![5, 6, 7, 8, 9, 10, 11], index.lookup(key).unwrap_or_default());
}

// Matching is stable across epoch boundaries.
#[test_log::test]
fn generations_reclaim_after_removal() {
    let mut index = PredicateIndex::new(SimpleIndexConfig::default(), 8, 100);
    indexed(&mut index, 1, &PredicateNode::feature_set("color", &["red"]));
    indexed(&mut index, 2, &PredicateNode::feature_set("color", &["red"]));
    index.commit();
    index.assign_generation(1);

    index.remove_document(1);
    index.commit();
    index.assign_generation(2);
    index.reclaim_memory(2);

    assert_eq!(vec![2], index.lookup(feature_hash("color=red")).unwrap_or_default());
}
