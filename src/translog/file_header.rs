// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const MAGIC_BYTES: [u8; 4] = [b'T', b'L', b'G', 1];

/// Key-value tag block written at the start of every part file.
///
/// Layout: magic, total header length, tag count, then length-prefixed
/// key/value strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileHeader {
    tags: Vec<(String, String)>,
}

impl FileHeader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.push((key.into(), value.into()));
    }

    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Writes the header, returning its on-disk length.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> crate::Result<u32> {
        let mut body = Vec::new();
        // NOTE: Truncation is OK, headers are tiny
        #[allow(clippy::cast_possible_truncation)]
        {
            body.write_u32::<BigEndian>(self.tags.len() as u32)
                .map_err(crate::Error::Io)?;
            for (key, value) in &self.tags {
                body.write_u32::<BigEndian>(key.len() as u32)
                    .map_err(crate::Error::Io)?;
                body.extend_from_slice(key.as_bytes());
                body.write_u32::<BigEndian>(value.len() as u32)
                    .map_err(crate::Error::Io)?;
                body.extend_from_slice(value.as_bytes());
            }
        }

        // NOTE: Truncation is OK, headers are tiny
        #[allow(clippy::cast_possible_truncation)]
        let total_len = (MAGIC_BYTES.len() + 4 + body.len()) as u32;
        writer.write_all(&MAGIC_BYTES).map_err(crate::Error::Io)?;
        writer
            .write_u32::<BigEndian>(total_len)
            .map_err(crate::Error::Io)?;
        writer.write_all(&body).map_err(crate::Error::Io)?;
        Ok(total_len)
    }

    /// Reads and validates a header, returning it with its length.
    pub fn read_from<R: Read>(reader: &mut R) -> crate::Result<(Self, u32)> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic).map_err(crate::Error::Io)?;
        if magic != MAGIC_BYTES {
            return Err(crate::Error::Corruption("bad file header magic".into()));
        }

        let total_len = reader.read_u32::<BigEndian>().map_err(crate::Error::Io)?;
        let tag_count = reader.read_u32::<BigEndian>().map_err(crate::Error::Io)?;

        let mut header = Self::new();
        for _ in 0..tag_count {
            let key_len = reader.read_u32::<BigEndian>().map_err(crate::Error::Io)? as usize;
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key).map_err(crate::Error::Io)?;
            let value_len = reader.read_u32::<BigEndian>().map_err(crate::Error::Io)? as usize;
            let mut value = vec![0u8; value_len];
            reader.read_exact(&mut value).map_err(crate::Error::Io)?;
            header.tags.push((
                String::from_utf8(key)
                    .map_err(|_| crate::Error::Corruption("header key not utf-8".into()))?,
                String::from_utf8(value)
                    .map_err(|_| crate::Error::Corruption("header value not utf-8".into()))?,
            ));
        }
        Ok((header, total_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn header_roundtrip() -> crate::Result<()> {
        let mut header = FileHeader::new();
        header.put_tag("desc", "transaction log domain part file");
        header.put_tag("domain", "music");

        let mut buf = Vec::new();
        let written_len = header.write_to(&mut buf)?;
        assert_eq!(written_len as usize, buf.len());

        let (decoded, read_len) = FileHeader::read_from(&mut buf.as_slice())?;
        assert_eq!(header, decoded);
        assert_eq!(written_len, read_len);
        assert_eq!(Some("music"), decoded.tag("domain"));
        Ok(())
    }

    #[test]
    fn bad_magic_is_corruption() {
        let buf = vec![0u8; 16];
        let result = FileHeader::read_from(&mut buf.as_slice());
        assert!(matches!(result, Err(crate::Error::Corruption(_))));
    }
}
