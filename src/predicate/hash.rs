// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use xxhash_rust::xxh3::xxh3_64;

/// 64-bit hash of a predicate feature string, typically `label=value` or a
/// range-partition label. Only in-process stability matters; serialized
/// indexes carry the hashes, not the strings.
#[must_use]
pub fn feature_hash(feature: &str) -> u64 {
    xxh3_64(feature.as_bytes())
}

/// Hash of a `label=value` feature.
#[must_use]
pub fn feature_hash_pair(label: &str, value: &str) -> u64 {
    feature_hash(&format!("{label}={value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn pair_matches_joined_form() {
        assert_eq!(feature_hash("color=red"), feature_hash_pair("color", "red"));
        assert_ne!(feature_hash("color=red"), feature_hash_pair("color", "blue"));
    }
}
