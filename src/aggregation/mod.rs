// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The recursive, mergeable grouping-aggregation engine.
//!
//! A [`Grouping`] request classifies a stream of ranked documents into a
//! multi-level tree of [`Group`]s, each carrying a set of mergeable
//! accumulators ([`AggregationResult`]). Shards aggregate independently;
//! results merge pairwise and a post-merge pass orders and truncates each
//! level.

mod expression_count;
mod group;
mod grouping;
mod grouping_level;
mod hits;
mod modifiers;
mod quantile;
mod result;

pub use expression_count::ExpressionCountResult;
pub use group::{Group, GroupValue};
pub use grouping::{Clock, Grouping, RankedHit, SteadyClock};
pub use grouping_level::GroupingLevel;
pub use hits::{FsHit, GlobalId, HitList, HitsResult, SummaryGenerator, VdsHit};
pub use modifiers::{convert_to_global_id, normalize_enums, GlobalIdResolver};
pub use quantile::QuantileResult;
pub use result::{
    AggregationOps, AggregationResult, AggregationResultVariant, AverageResult, CountResult,
    MaxResult, MinResult, StandardDeviationResult, SumResult, XorResult,
};
