// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::DecodeError;

/// CRC flavor of a chunk, stored in the low nibble of the encoding byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Crc {
    /// No checksum; only legal for the all-zero tail of a crashed file.
    None,

    /// Standard CRC-32 over the payload.
    CcittCrc32,

    /// Low 32 bits of XXH64 seeded with 0.
    Xxh64,
}

impl Crc {
    fn from_nibble(nibble: u8) -> Result<Self, DecodeError> {
        match nibble {
            0 => Ok(Self::None),
            1 => Ok(Self::CcittCrc32),
            2 => Ok(Self::Xxh64),
            tag => Err(DecodeError::InvalidTag(("Crc", u32::from(tag)))),
        }
    }

    fn nibble(self) -> u8 {
        match self {
            Self::None => 0,
            Self::CcittCrc32 => 1,
            Self::Xxh64 => 2,
        }
    }
}

/// Compression flavor of a chunk, stored in the high nibble.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compression {
    /// Single raw entry; deprecated and rejected for writes.
    None,

    /// Multiple entries, stored raw behind the uncompressed-length prefix.
    NoneMulti,

    /// LZ4 block compression.
    Lz4,

    /// Zstandard compression.
    Zstd,
}

impl Compression {
    fn from_nibble(nibble: u8) -> Result<Self, DecodeError> {
        match nibble {
            0 => Ok(Self::None),
            1 => Ok(Self::NoneMulti),
            2 => Ok(Self::Lz4),
            3 => Ok(Self::Zstd),
            tag => Err(DecodeError::InvalidTag(("Compression", u32::from(tag)))),
        }
    }

    fn nibble(self) -> u8 {
        match self {
            Self::None => 0,
            Self::NoneMulti => 1,
            Self::Lz4 => 2,
            Self::Zstd => 3,
        }
    }
}

/// One byte describing how a chunk is checked and compressed:
/// `crc | (compression << 4)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Encoding {
    crc: Crc,
    compression: Compression,
}

impl Default for Encoding {
    fn default() -> Self {
        Self::new(Crc::Xxh64, Compression::Zstd)
    }
}

impl Encoding {
    #[must_use]
    pub fn new(crc: Crc, compression: Compression) -> Self {
        Self { crc, compression }
    }

    pub fn from_raw(raw: u8) -> Result<Self, DecodeError> {
        Ok(Self {
            crc: Crc::from_nibble(raw & 0x0f)?,
            compression: Compression::from_nibble((raw >> 4) & 0x0f)?,
        })
    }

    #[must_use]
    pub fn raw(self) -> u8 {
        self.crc.nibble() | (self.compression.nibble() << 4)
    }

    #[must_use]
    pub fn crc(self) -> Crc {
        self.crc
    }

    #[must_use]
    pub fn compression(self) -> Compression {
        self.compression
    }

    /// Computes the configured checksum over a buffer.
    #[must_use]
    pub fn calc_crc(crc: Crc, buf: &[u8]) -> u32 {
        match crc {
            Crc::None => 0,
            Crc::CcittCrc32 => crc32fast::hash(buf),
            // NOTE: Truncation is the format: the low 32 bits of XXH64
            #[allow(clippy::cast_possible_truncation)]
            Crc::Xxh64 => xxhash_rust::xxh64::xxh64(buf, 0) as u32,
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "crc={:?} compression={:?}", self.crc, self.compression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn raw_byte_roundtrip() -> Result<(), DecodeError> {
        for crc in [Crc::None, Crc::CcittCrc32, Crc::Xxh64] {
            for compression in [
                Compression::None,
                Compression::NoneMulti,
                Compression::Lz4,
                Compression::Zstd,
            ] {
                let encoding = Encoding::new(crc, compression);
                assert_eq!(encoding, Encoding::from_raw(encoding.raw())?);
            }
        }
        Ok(())
    }

    #[test]
    fn default_is_xxh64_zstd() {
        let encoding = Encoding::default();
        assert_eq!(Crc::Xxh64, encoding.crc());
        assert_eq!(Compression::Zstd, encoding.compression());
        assert_eq!(0x32, encoding.raw());
    }

    #[test]
    fn crcs_differ_per_kind() {
        let buf = b"payload bytes";
        let ccitt = Encoding::calc_crc(Crc::CcittCrc32, buf);
        let xxh = Encoding::calc_crc(Crc::Xxh64, buf);
        assert_ne!(ccitt, xxh);
        assert_eq!(ccitt, Encoding::calc_crc(Crc::CcittCrc32, buf));
    }
}
