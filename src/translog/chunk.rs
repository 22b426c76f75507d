// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::slice::Slice;
use crate::translog::common::{Entry, SerialNumRange};
use crate::translog::encoding::{Compression, Crc, Encoding};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// On-disk frame: encoding byte, big-endian length, payload, CRC trailer.
/// The length covers payload plus CRC.
pub const CHUNK_HEADER_LEN: usize = 5;

const CRC_LEN: usize = 4;

/// A batch of entries on its way into or out of a frame.
#[derive(Debug, Default)]
pub struct Chunk {
    entries: Vec<Entry>,
}

impl Chunk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    #[must_use]
    pub fn into_entries(self) -> Vec<Entry> {
        self.entries
    }

    #[must_use]
    pub fn range(&self) -> SerialNumRange {
        match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) => SerialNumRange::new(first.serial(), last.serial()),
            _ => SerialNumRange::default(),
        }
    }

    fn serialize_entries(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            entry.serialize(&mut buf);
        }
        buf
    }

    /// Encodes the chunk into its full on-disk frame.
    ///
    /// The deprecated `none` compression is rejected for writes.
    pub fn encode(&self, encoding: Encoding, compression_level: i32) -> crate::Result<Vec<u8>> {
        let raw = self.serialize_entries();

        let payload = match encoding.compression() {
            Compression::None => {
                return Err(crate::Error::InvalidConfig(
                    "compression 'none' is rejected for writes",
                ))
            }
            Compression::NoneMulti => {
                let mut body = Vec::with_capacity(4 + raw.len());
                // NOTE: Truncation is OK, chunks stay far below 4 GiB
                #[allow(clippy::cast_possible_truncation)]
                body.write_u32::<BigEndian>(raw.len() as u32)
                    .map_err(crate::Error::Io)?;
                body.extend_from_slice(&raw);
                body
            }
            Compression::Lz4 => {
                let compressed = lz4_flex::compress(&raw);
                let mut body = Vec::with_capacity(4 + compressed.len());
                #[allow(clippy::cast_possible_truncation)]
                body.write_u32::<BigEndian>(raw.len() as u32)
                    .map_err(crate::Error::Io)?;
                body.extend_from_slice(&compressed);
                body
            }
            Compression::Zstd => {
                let compressed =
                    zstd::bulk::compress(&raw, compression_level).map_err(crate::Error::Io)?;
                let mut body = Vec::with_capacity(4 + compressed.len());
                #[allow(clippy::cast_possible_truncation)]
                body.write_u32::<BigEndian>(raw.len() as u32)
                    .map_err(crate::Error::Io)?;
                body.extend_from_slice(&compressed);
                body
            }
        };

        let crc = Encoding::calc_crc(encoding.crc(), &payload);

        let mut frame = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len() + CRC_LEN);
        frame.push(encoding.raw());
        // NOTE: Truncation is OK, chunks stay far below 4 GiB
        #[allow(clippy::cast_possible_truncation)]
        frame
            .write_u32::<BigEndian>((payload.len() + CRC_LEN) as u32)
            .map_err(crate::Error::Io)?;
        frame.extend_from_slice(&payload);
        frame
            .write_u32::<BigEndian>(crc)
            .map_err(crate::Error::Io)?;
        Ok(frame)
    }

    /// Decodes the body of a frame (everything after the 5-byte header),
    /// verifying the CRC before any entry parsing.
    pub fn decode(encoding: Encoding, body: &[u8]) -> crate::Result<Self> {
        if body.len() < 2 * CRC_LEN {
            return Err(crate::Error::Corruption(format!(
                "not even room for the crc and length, only {} bytes left",
                body.len()
            )));
        }

        let (payload, crc_bytes) = body.split_at(body.len() - CRC_LEN);
        let mut crc_reader = crc_bytes;
        let stored_crc = crc_reader
            .read_u32::<BigEndian>()
            .map_err(crate::Error::Io)?;
        if encoding.crc() != Crc::None {
            let computed = Encoding::calc_crc(encoding.crc(), payload);
            if computed != stored_crc {
                return Err(crate::Error::InvalidChecksum((computed, stored_crc)));
            }
        }

        let raw: Vec<u8> = match encoding.compression() {
            Compression::None => payload.to_vec(),
            Compression::NoneMulti => {
                let mut reader = payload;
                let len = reader.read_u32::<BigEndian>().map_err(crate::Error::Io)? as usize;
                reader.get(..len).map(<[u8]>::to_vec).ok_or_else(|| {
                    crate::Error::Corruption("uncompressed length beyond payload".into())
                })?
            }
            Compression::Lz4 => {
                let mut reader = payload;
                let len = reader.read_u32::<BigEndian>().map_err(crate::Error::Io)? as usize;
                lz4_flex::decompress(reader, len)
                    .map_err(|_| crate::Error::Decompress(Compression::Lz4))?
            }
            Compression::Zstd => {
                let mut reader = payload;
                let len = reader.read_u32::<BigEndian>().map_err(crate::Error::Io)? as usize;
                zstd::bulk::decompress(reader, len)
                    .map_err(|_| crate::Error::Decompress(Compression::Zstd))?
            }
        };

        let mut chunk = Self::new();
        let mut reader = raw.as_slice();
        let mut last_serial = None;
        while !reader.is_empty() {
            let entry = Entry::deserialize(&mut reader)?;
            if let Some(last) = last_serial {
                if entry.serial() <= last {
                    return Err(crate::Error::SerialOrder((last, entry.serial())));
                }
            }
            last_serial = Some(entry.serial());
            chunk.add(entry);
        }
        Ok(chunk)
    }
}

/// A completely encoded chunk ready to be persisted: the frame bytes plus
/// the range and entry count it covers.
#[derive(Clone, Debug)]
pub struct SerializedChunk {
    data: Slice,
    range: SerialNumRange,
    num_entries: usize,
}

impl SerializedChunk {
    pub fn from_chunk(
        chunk: &Chunk,
        encoding: Encoding,
        compression_level: i32,
    ) -> crate::Result<Self> {
        let range = chunk.range();
        let num_entries = chunk.entries().len();
        let data = chunk.encode(encoding, compression_level)?;
        Ok(Self {
            data: Slice::from(data),
            range,
            num_entries,
        })
    }

    #[must_use]
    pub fn data(&self) -> &Slice {
        &self.data
    }

    #[must_use]
    pub fn range(&self) -> SerialNumRange {
        self.range
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample_chunk() -> Chunk {
        let mut chunk = Chunk::new();
        chunk.add(Entry::new(1, 10, b"first".to_vec()));
        chunk.add(Entry::new(2, 10, b"second".to_vec()));
        chunk.add(Entry::new(5, 11, vec![0u8; 64]));
        chunk
    }

    fn roundtrip(encoding: Encoding) -> crate::Result<()> {
        let chunk = sample_chunk();
        let frame = chunk.encode(encoding, 3)?;

        assert_eq!(encoding.raw(), frame[0]);
        let body = &frame[CHUNK_HEADER_LEN..];
        let decoded = Chunk::decode(encoding, body)?;
        assert_eq!(chunk.entries(), decoded.entries());
        Ok(())
    }

    #[test]
    fn roundtrip_none_multi() -> crate::Result<()> {
        roundtrip(Encoding::new(Crc::Xxh64, Compression::NoneMulti))
    }

    #[test]
    fn roundtrip_lz4() -> crate::Result<()> {
        roundtrip(Encoding::new(Crc::Xxh64, Compression::Lz4))
    }

    #[test]
    fn roundtrip_zstd() -> crate::Result<()> {
        roundtrip(Encoding::new(Crc::Xxh64, Compression::Zstd))
    }

    #[test]
    fn roundtrip_ccitt_crc32() -> crate::Result<()> {
        roundtrip(Encoding::new(Crc::CcittCrc32, Compression::NoneMulti))
    }

    #[test]
    fn write_with_none_compression_is_rejected() {
        let chunk = sample_chunk();
        let result = chunk.encode(Encoding::new(Crc::Xxh64, Compression::None), 3);
        assert!(matches!(result, Err(crate::Error::InvalidConfig(_))));
    }

    #[test]
    fn bit_flip_is_detected() -> crate::Result<()> {
        let encoding = Encoding::new(Crc::Xxh64, Compression::NoneMulti);
        let chunk = sample_chunk();
        let frame = chunk.encode(encoding, 3)?;

        for bit in 0..8 {
            let mut corrupted = frame.clone();
            // flip one bit somewhere in the payload
            corrupted[CHUNK_HEADER_LEN + 7] ^= 1 << bit;
            let result = Chunk::decode(encoding, &corrupted[CHUNK_HEADER_LEN..]);
            assert!(matches!(result, Err(crate::Error::InvalidChecksum(_))));
        }
        Ok(())
    }

    #[test]
    fn decode_rejects_out_of_order_serials() -> crate::Result<()> {
        let encoding = Encoding::new(Crc::Xxh64, Compression::NoneMulti);
        let mut chunk = Chunk::new();
        chunk.add(Entry::new(5, 0, vec![]));
        chunk.add(Entry::new(3, 0, vec![]));
        let frame = chunk.encode(encoding, 3)?;

        let result = Chunk::decode(encoding, &frame[CHUNK_HEADER_LEN..]);
        assert!(matches!(result, Err(crate::Error::SerialOrder(_))));
        Ok(())
    }
}
