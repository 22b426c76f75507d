// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::translog::encoding::{Compression, Encoding};

/// Per-domain tuning knobs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DomainConfig {
    encoding: Encoding,
    compression_level: i32,
    fsync_on_commit: bool,
    part_size_limit: u64,
    chunk_size_limit: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            compression_level: 9,
            fsync_on_commit: false,
            part_size_limit: 256 * 1024 * 1024,
            chunk_size_limit: 256 * 1024,
        }
    }
}

impl DomainConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the deprecated `none` compression.
    pub fn with_encoding(mut self, encoding: Encoding) -> crate::Result<Self> {
        if encoding.compression() == Compression::None {
            return Err(crate::Error::InvalidConfig(
                "compression 'none' is not usable for domains",
            ));
        }
        self.encoding = encoding;
        Ok(self)
    }

    #[must_use]
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level.clamp(1, 22);
        self
    }

    #[must_use]
    pub fn with_fsync_on_commit(mut self, fsync: bool) -> Self {
        self.fsync_on_commit = fsync;
        self
    }

    #[must_use]
    pub fn with_part_size_limit(mut self, limit: u64) -> Self {
        self.part_size_limit = limit;
        self
    }

    #[must_use]
    pub fn with_chunk_size_limit(mut self, limit: usize) -> Self {
        self.chunk_size_limit = limit;
        self
    }

    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    #[must_use]
    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    #[must_use]
    pub fn fsync_on_commit(&self) -> bool {
        self.fsync_on_commit
    }

    #[must_use]
    pub fn part_size_limit(&self) -> u64 {
        self.part_size_limit
    }

    #[must_use]
    pub fn chunk_size_limit(&self) -> usize {
        self.chunk_size_limit
    }
}
