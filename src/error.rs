// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    translog::encoding::Compression,
};

/// Represents errors that can occur in the engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(Compression),

    /// Invalid checksum value (got, expected)
    InvalidChecksum((u32, u32)),

    /// Serial numbers must be strictly increasing (last, next)
    SerialOrder((u64, u64)),

    /// On-disk state is damaged beyond the legal zero-filled tail
    Corruption(String),

    /// Unknown domain name
    DomainNotFound(String),

    /// Unknown session id
    SessionNotFound(i32),

    /// Two aggregation results of different variants cannot merge
    VariantMismatch,

    /// A grouping request observed a past deadline
    DeadlineExceeded,

    /// Rejected configuration value
    InvalidConfig(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GristError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Crate result
pub type Result<T> = std::result::Result<T, Error>;
