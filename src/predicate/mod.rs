// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! In-memory boolean-constraint index using the interval algorithm.
//!
//! Documents are tagged with predicate trees; the [`annotate`] pass turns a
//! tree into interval-marked features, [`PredicateIndex`] stores them, and
//! the posting-list iterators replay the intervals for matching.

mod bit_vector_cache;
mod features_store;
mod hash;
mod index;
mod interval;
mod interval_store;
mod posting_list;
mod range_expander;
mod search;
mod simple_index;
mod tree;

pub use bit_vector_cache::{BitVec, BitVectorCache, PopulateInterface};
pub use features_store::DocumentFeaturesStore;
pub use hash::feature_hash;
pub use index::{
    PredicateIndex, SERIALIZE_VERSION, Z_STAR_ATTRIBUTE_NAME, Z_STAR_COMPRESSED_ATTRIBUTE_NAME,
};
pub use interval::{Interval, IntervalEntry, IntervalWithBounds, MAX_INTERVAL, MIN_INTERVAL};
pub use interval_store::{EntryRef, IntervalStore};
pub use posting_list::{
    BoundsPostingList, BtreeIterator, IntervalPostingList, PostingIterator, PredicatePostingList,
    VectorIterator, ZeroConstraintPostingList, ZstarCompressedPostingList,
};
pub use range_expander::{expand_range, partition_range, EdgePartition, RangePartitions};
pub use search::{PredicateQuery, PredicateSearch};
pub use simple_index::{
    DeserializeObserver, DocIdLimitProvider, PostingDeserializer, PostingSerializer, SimpleIndex,
    SimpleIndexConfig,
};
pub use tree::{annotate, PredicateNode, PredicateTreeAnnotations, RangeFeature};
