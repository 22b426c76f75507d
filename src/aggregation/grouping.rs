// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::aggregation::{normalize_enums, AggregationResultVariant, Group, GroupingLevel};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::expression::{AttributeSource, ExecutionInput};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;

/// Clock consulted between hits for deadline enforcement.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SteadyClock;

impl Clock for SteadyClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One ranked document entering aggregation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RankedHit {
    pub doc_id: u32,
    pub rank: f64,
}

impl RankedHit {
    #[must_use]
    pub fn new(doc_id: u32, rank: f64) -> Self {
        Self { doc_id, rank }
    }
}

/// A top-level grouping request: the level list, the mutation window, the
/// document budget and the root of the grouping tree.
#[derive(Clone)]
pub struct Grouping {
    id: u32,
    valid: bool,
    all: bool,
    top_n: i64,
    first_level: u32,
    last_level: u32,
    levels: Vec<GroupingLevel>,
    root: Group,
    clock: Option<Arc<dyn Clock>>,
    time_of_doom: Option<Instant>,
}

impl std::fmt::Debug for Grouping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grouping")
            .field("id", &self.id)
            .field("valid", &self.valid)
            .field("all", &self.all)
            .field("top_n", &self.top_n)
            .field("first_level", &self.first_level)
            .field("last_level", &self.last_level)
            .field("levels", &self.levels.len())
            .finish()
    }
}

impl PartialEq for Grouping {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.valid == other.valid
            && self.all == other.all
            && self.top_n == other.top_n
            && self.first_level == other.first_level
            && self.last_level == other.last_level
            && self.levels == other.levels
            && self.root == other.root
    }
}

impl Default for Grouping {
    fn default() -> Self {
        Self {
            id: 0,
            valid: true,
            all: false,
            top_n: -1,
            first_level: 0,
            last_level: 0,
            levels: Vec::new(),
            root: Group::new(),
            clock: None,
            time_of_doom: None,
        }
    }
}

impl Grouping {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Streaming only: group every document, not just hits.
    #[must_use]
    pub fn with_all(mut self, all: bool) -> Self {
        self.all = all;
        self
    }

    /// Max documents to consume; negative means unbounded.
    #[must_use]
    pub fn with_top_n(mut self, top_n: i64) -> Self {
        self.top_n = top_n;
        self
    }

    #[must_use]
    pub fn with_first_level(mut self, level: u32) -> Self {
        self.first_level = level;
        self
    }

    #[must_use]
    pub fn with_last_level(mut self, level: u32) -> Self {
        self.last_level = level;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: GroupingLevel) -> Self {
        self.levels.push(level);
        self
    }

    #[must_use]
    pub fn with_root(mut self, root: Group) -> Self {
        self.root = root;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, clock: Arc<dyn Clock>, time_of_doom: Instant) -> Self {
        self.clock = Some(clock);
        self.time_of_doom = Some(time_of_doom);
        self
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    #[must_use]
    pub fn all(&self) -> bool {
        self.all
    }

    #[must_use]
    pub fn top_n(&self) -> i64 {
        self.top_n
    }

    #[must_use]
    pub fn first_level(&self) -> u32 {
        self.first_level
    }

    #[must_use]
    pub fn last_level(&self) -> u32 {
        self.last_level
    }

    #[must_use]
    pub fn levels(&self) -> &[GroupingLevel] {
        &self.levels
    }

    pub fn levels_mut(&mut self) -> &mut [GroupingLevel] {
        &mut self.levels
    }

    #[must_use]
    pub fn root(&self) -> &Group {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }

    fn max_n(&self, n: usize) -> usize {
        if self.top_n < 0 {
            n
        } else {
            // NOTE: Sign loss is guarded above
            #[allow(clippy::cast_sign_loss)]
            n.min(self.top_n as usize)
        }
    }

    fn has_expired(&self) -> bool {
        match (&self.clock, self.time_of_doom) {
            (Some(clock), Some(doom)) => clock.now() > doom,
            _ => false,
        }
    }

    /// True when the hit stream must be fully consumed before any hit-list
    /// cutoff may apply.
    #[must_use]
    pub fn need_resort(&self) -> bool {
        let resort =
            self.root.need_resort() || self.levels.iter().any(GroupingLevel::need_resort);
        resort && self.top_n <= 0
    }

    /// Installs the per-level groupers and the transient child maps.
    pub fn pre_aggregate(&mut self, is_ordered: bool) {
        for (i, level) in self.levels.iter_mut().enumerate() {
            // NOTE: Truncation is OK, level counts are tiny
            #[allow(clippy::cast_possible_truncation)]
            level.prepare(i as u32, self.first_level, is_ordered);
        }
        self.root.pre_aggregate();
        if is_ordered {
            set_hits_ordered(&mut self.root);
            for level in &mut self.levels {
                set_hits_ordered(level.group_prototype_mut());
            }
        }
    }

    /// Drops the transient child maps.
    pub fn post_aggregate(&mut self) {
        self.root.post_aggregate();
    }

    /// Feeds a single ranked document through classification.
    pub fn aggregate_one(
        &mut self,
        doc_id: u32,
        rank: f64,
        attributes: Option<&dyn AttributeSource>,
    ) -> crate::Result<()> {
        let mut input = ExecutionInput::new(doc_id, rank);
        if let Some(attributes) = attributes {
            input = input.with_attributes(attributes);
        }
        self.root
            .aggregate(&mut self.levels, self.first_level, self.last_level, 0, &input)
    }

    /// Aggregates a pre-ranked hit array, honoring `top_n` and the
    /// deadline. Returns `DeadlineExceeded` when aggregation stopped
    /// early; the produced groups then cover a prefix of the stream.
    pub fn aggregate(
        &mut self,
        hits: &[RankedHit],
        attributes: Option<&dyn AttributeSource>,
    ) -> crate::Result<()> {
        let is_ordered = !self.need_resort();
        self.pre_aggregate(is_ordered);

        let mut expired = false;
        for hit in hits.iter().take(self.max_n(hits.len())) {
            if self.has_expired() {
                expired = true;
                break;
            }
            self.aggregate_one(hit.doc_id, hit.rank, attributes)?;
        }

        self.post_process(attributes)?;
        if expired {
            return Err(crate::Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Aggregates a doc id range with rank zero (streaming "all" mode).
    pub fn aggregate_range(
        &mut self,
        from: u32,
        to: u32,
        attributes: Option<&dyn AttributeSource>,
    ) -> crate::Result<()> {
        self.pre_aggregate(false);
        if to > from {
            let max = self.max_n((to - from) as usize);
            for doc_id in from..from + u32::try_from(max).unwrap_or(u32::MAX) {
                self.aggregate_one(doc_id, 0.0, attributes)?;
            }
        }
        self.post_process(attributes)
    }

    /// Post-aggregation pipeline: drop maps, post-merge, enum
    /// normalization, canonical id order.
    pub fn post_process(&mut self, attributes: Option<&dyn AttributeSource>) -> crate::Result<()> {
        self.post_aggregate();
        self.post_merge()?;
        if let Some(attributes) = attributes {
            normalize_enums(self, attributes);
        }
        self.sort_by_id();
        Ok(())
    }

    /// Merges a peer shard's result, consuming it.
    pub fn merge(&mut self, rhs: Self) -> crate::Result<()> {
        self.root
            .merge(&self.levels, self.first_level, 0, rhs.root)
    }

    /// Merges only groups present on both sides within the level window.
    pub fn merge_partial(&mut self, rhs: &Self) -> crate::Result<()> {
        self.root.merge_partial(
            &self.levels,
            self.first_level,
            self.last_level,
            0,
            &rhs.root,
        )
    }

    /// Keeps only groups found in the other tree.
    pub fn prune(&mut self, rhs: &Self) {
        self.root.prune(&rhs.root, rhs.last_level, 0);
    }

    /// Executes order-by expressions, orders every level and truncates to
    /// the level's hard cap.
    pub fn post_merge(&mut self) -> crate::Result<()> {
        self.root.post_merge(&self.levels, self.first_level, 0)
    }

    /// Canonical transmission order.
    pub fn sort_by_id(&mut self) {
        self.root.sort_by_id();
    }
}

fn set_hits_ordered(group: &mut Group) {
    for result in group.value_mut().aggregation_results_mut() {
        if let AggregationResultVariant::Hits(hits) = result.variant_mut() {
            hits.set_ordered(true);
        }
    }
    for child in group.children_mut() {
        set_hits_ordered(child);
    }
}

impl Encode for Grouping {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.id)?;
        writer.write_u8(u8::from(self.valid))?;
        writer.write_u8(u8::from(self.all))?;
        writer.write_i64::<BigEndian>(self.top_n)?;
        writer.write_u32::<BigEndian>(self.first_level)?;
        writer.write_u32::<BigEndian>(self.last_level)?;
        // NOTE: Truncation is OK, level counts are tiny
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.levels.len() as u32)?;
        for level in &self.levels {
            level.encode_into(writer)?;
        }
        self.root.encode_into(writer)
    }
}

impl Decode for Grouping {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let id = reader.read_u32::<BigEndian>()?;
        let valid = reader.read_u8()? != 0;
        let all = reader.read_u8()? != 0;
        let top_n = reader.read_i64::<BigEndian>()?;
        let first_level = reader.read_u32::<BigEndian>()?;
        let last_level = reader.read_u32::<BigEndian>()?;
        let level_count = reader.read_u32::<BigEndian>()?;
        let mut levels = Vec::with_capacity(level_count as usize);
        for _ in 0..level_count {
            levels.push(GroupingLevel::decode_from(reader)?);
        }
        let root = Group::decode_from(reader)?;
        Ok(Self {
            id,
            valid,
            all,
            top_n,
            first_level,
            last_level,
            levels,
            root,
            clock: None,
            time_of_doom: None,
        })
    }
}
