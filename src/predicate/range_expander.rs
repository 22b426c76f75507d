// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::predicate::hash::feature_hash;

/// An edge partition of a range: the partition label hash plus the bounds
/// payload documents store for query-side diff filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgePartition {
    pub hash: u64,
    pub bounds: u32,
}

/// Document-side partitioning of one range term.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangePartitions {
    pub partitions: Vec<u64>,
    pub edges: Vec<EdgePartition>,
}

impl RangePartitions {
    #[must_use]
    pub fn hash_count(&self) -> usize {
        self.partitions.len() + self.edges.len()
    }

    pub fn all_hashes(&self, out: &mut Vec<u64>) {
        out.extend_from_slice(&self.partitions);
        out.extend(self.edges.iter().map(|e| e.hash));
    }
}

fn sep(negative: bool) -> &'static str {
    if negative {
        "=-"
    } else {
        "="
    }
}

/// Hash of the edge partition starting at `value`.
pub(crate) fn edge_partition_hash(label: &str, value: u64, negative: bool) -> u64 {
    feature_hash(&format!("{label}{}{value}", sep(negative)))
}

fn add_partitions(
    label: &str,
    part: u64,
    part_size: u64,
    first: u32,
    last: u32,
    negative: bool,
    out: &mut Vec<u64>,
) {
    for i in first..last {
        let mut from = (part + u64::from(i)) * part_size;
        let mut to = from + part_size - 1;
        if negative {
            std::mem::swap(&mut to, &mut from);
        }
        out.push(feature_hash(&format!("{label}{}{from}-{to}", sep(negative))));
    }
}

fn make_partitions(
    label: &str,
    from: u64,
    to: u64,
    step_size: u64,
    arity: u64,
    negative: bool,
    out: &mut Vec<u64>,
) {
    // NOTE: Remainders fit in u32, arity does
    #[allow(clippy::cast_possible_truncation)]
    let from_remainder = (from % arity) as u32;
    #[allow(clippy::cast_possible_truncation)]
    let to_remainder = (to % arity) as u32;
    let next_from = from - u64::from(from_remainder);
    let next_to = to - u64::from(to_remainder);

    if next_from == next_to {
        add_partitions(
            label,
            next_from,
            step_size,
            from_remainder,
            to_remainder,
            negative,
            out,
        );
    } else {
        let mut from = from;
        if from_remainder > 0 {
            // NOTE: arity fits in u32
            #[allow(clippy::cast_possible_truncation)]
            add_partitions(
                label,
                next_from,
                step_size,
                from_remainder,
                arity as u32,
                negative,
                out,
            );
            from = next_from + arity;
        }
        add_partitions(label, next_to, step_size, 0, to_remainder, negative, out);
        make_partitions(
            label,
            from / arity,
            to / arity,
            step_size * arity,
            arity,
            negative,
            out,
        );
    }
}

fn partition_range_hashes(
    label: &str,
    from: u64,
    to: u64,
    arity: u32,
    negative: bool,
    out: &mut Vec<u64>,
) {
    let arity = u64::from(arity);
    let from_remainder = from % arity;
    // operate on exclusive upper bound.
    let to_remainder = (to + 1) % arity;
    let from_val = from - from_remainder;
    let to_val = to.wrapping_sub(to_remainder);

    if from_val == to_val.wrapping_add(1) {
        out.push(edge_partition_hash(label, from_val, negative));
        return;
    }

    let mut from_val = from_val;
    if from_remainder != 0 {
        out.push(edge_partition_hash(label, from_val, negative));
        from_val += arity;
    }
    if to_remainder != 0 {
        out.push(edge_partition_hash(label, to_val.wrapping_add(1), negative));
    }
    make_partitions(
        label,
        from_val / arity,
        (to_val - (arity - 1)) / arity + 1,
        arity,
        arity,
        negative,
        out,
    );
}

/// Expands a range into all partition and edge-partition hashes. Used when
/// documents are removed, re-deriving the keys an annotation produced.
pub fn expand_range(label: &str, from: i64, to: i64, arity: u32, out: &mut Vec<u64>) {
    if from < 0 {
        if to < 0 {
            // Special case for to==-1. -X-0 means the same as -X-1,
            // but is more efficient.
            let lo = if to == -1 { 0 } else { to.unsigned_abs() };
            partition_range_hashes(label, lo, from.unsigned_abs(), arity, true, out);
        } else {
            partition_range_hashes(label, 0, from.unsigned_abs(), arity, true, out);
            // NOTE: Sign loss is guarded, to >= 0 here
            #[allow(clippy::cast_sign_loss)]
            partition_range_hashes(label, 0, to as u64, arity, false, out);
        }
    } else {
        // NOTE: Sign loss is guarded, both ends >= 0 here
        #[allow(clippy::cast_sign_loss)]
        partition_range_hashes(label, from as u64, to as u64, arity, false, out);
    }
}

fn partition_range_with_bounds(
    label: &str,
    from: u64,
    to: u64,
    arity: u32,
    negative: bool,
    out: &mut RangePartitions,
) {
    let arity = u64::from(arity);
    let from_remainder = from % arity;
    let to_remainder = (to + 1) % arity;
    let from_val = from - from_remainder;
    let to_val = to.wrapping_sub(to_remainder);

    if from_val == to_val.wrapping_add(1) {
        // both ends fall in one partition: a [lo, hi) diff window
        #[allow(clippy::cast_possible_truncation)]
        let lo = (from - from_val) as u32;
        #[allow(clippy::cast_possible_truncation)]
        let hi = (to - from_val + 1) as u32;
        out.edges.push(EdgePartition {
            hash: edge_partition_hash(label, from_val, negative),
            bounds: (lo << 16) | hi,
        });
        return;
    }

    let mut from_val = from_val;
    if from_remainder != 0 {
        #[allow(clippy::cast_possible_truncation)]
        let diff = (from - from_val) as u32;
        out.edges.push(EdgePartition {
            hash: edge_partition_hash(label, from_val, negative),
            bounds: 0x8000_0000 | diff,
        });
        from_val += arity;
    }
    if to_remainder != 0 {
        let part_start = to_val.wrapping_add(1);
        #[allow(clippy::cast_possible_truncation)]
        let diff = (to - part_start + 1) as u32;
        out.edges.push(EdgePartition {
            hash: edge_partition_hash(label, part_start, negative),
            bounds: 0x4000_0000 | diff,
        });
    }
    // NOTE: arity fits in u32
    #[allow(clippy::cast_possible_truncation)]
    make_partitions(
        label,
        from_val / arity,
        (to_val - (arity - 1)) / arity + 1,
        arity,
        arity as u64,
        negative,
        &mut out.partitions,
    );
}

/// Document-side partitioning with bounds payloads for the edges.
#[must_use]
pub fn partition_range(label: &str, from: i64, to: i64, arity: u32) -> RangePartitions {
    let mut result = RangePartitions::default();
    if from < 0 {
        if to < 0 {
            let lo = if to == -1 { 0 } else { to.unsigned_abs() };
            partition_range_with_bounds(label, lo, from.unsigned_abs(), arity, true, &mut result);
        } else {
            partition_range_with_bounds(label, 0, from.unsigned_abs(), arity, true, &mut result);
            // NOTE: Sign loss is guarded, to >= 0 here
            #[allow(clippy::cast_sign_loss)]
            partition_range_with_bounds(label, 0, to as u64, arity, false, &mut result);
        }
    } else {
        // NOTE: Sign loss is guarded, both ends >= 0 here
        #[allow(clippy::cast_sign_loss)]
        partition_range_with_bounds(label, from as u64, to as u64, arity, false, &mut result);
    }
    result
}
