// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::slice::Slice;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::sync::Arc;

/// Monotonically non-decreasing op id within a domain.
pub type SerialNum = u64;

/// Type tag of a log entry, opaque to the log itself.
pub type EntryType = u32;

/// Inclusive serial range; empty when `from > to`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SerialNumRange {
    from: SerialNum,
    to: SerialNum,
}

impl SerialNumRange {
    #[must_use]
    pub fn new(from: SerialNum, to: SerialNum) -> Self {
        Self { from, to }
    }

    /// An empty range positioned at `from`.
    #[must_use]
    pub fn empty_at(from: SerialNum) -> Self {
        Self {
            from,
            to: from.saturating_sub(1),
        }
    }

    #[must_use]
    pub fn from(&self) -> SerialNum {
        self.from
    }

    #[must_use]
    pub fn to(&self) -> SerialNum {
        self.to
    }

    pub fn set_from(&mut self, from: SerialNum) {
        self.from = from;
    }

    pub fn set_to(&mut self, to: SerialNum) {
        self.to = to;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }

    #[must_use]
    pub fn contains(&self, serial: SerialNum) -> bool {
        self.from <= serial && serial <= self.to
    }

    #[must_use]
    pub fn contains_range(&self, other: &Self) -> bool {
        self.from <= other.from && other.to <= self.to
    }
}

/// One serialized operation: serial, type tag and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    serial: SerialNum,
    entry_type: EntryType,
    data: Slice,
}

impl Entry {
    #[must_use]
    pub fn new(serial: SerialNum, entry_type: EntryType, data: impl Into<Slice>) -> Self {
        Self {
            serial,
            entry_type,
            data: data.into(),
        }
    }

    #[must_use]
    pub fn serial(&self) -> SerialNum {
        self.serial
    }

    #[must_use]
    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    #[must_use]
    pub fn data(&self) -> &Slice {
        &self.data
    }

    /// On-wire size: serial, type, length, payload.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        8 + 4 + 4 + self.data.len()
    }

    pub(crate) fn serialize(&self, buf: &mut Vec<u8>) {
        // writes into a Vec cannot fail
        let _ = buf.write_u64::<BigEndian>(self.serial);
        let _ = buf.write_u32::<BigEndian>(self.entry_type);
        // NOTE: Truncation is OK, entries stay far below 4 GiB
        #[allow(clippy::cast_possible_truncation)]
        let _ = buf.write_u32::<BigEndian>(self.data.len() as u32);
        buf.extend_from_slice(&self.data);
    }

    pub(crate) fn deserialize(reader: &mut &[u8]) -> crate::Result<Self> {
        let serial = reader.read_u64::<BigEndian>().map_err(crate::Error::Io)?;
        let entry_type = reader.read_u32::<BigEndian>().map_err(crate::Error::Io)?;
        let len = reader.read_u32::<BigEndian>().map_err(crate::Error::Io)? as usize;
        if reader.len() < len {
            return Err(crate::Error::Corruption(format!(
                "entry payload truncated: wanted {len} bytes, had {}",
                reader.len()
            )));
        }
        let (data, rest) = reader.split_at(len);
        let entry = Self {
            serial,
            entry_type,
            data: Slice::from(data),
        };
        *reader = rest;
        Ok(entry)
    }
}

/// An ordered batch of log entries backed by one byte buffer.
///
/// Appends enforce strictly increasing serials; the range and count are
/// tracked alongside.
#[derive(Debug, Default)]
pub struct Packet {
    count: usize,
    range: SerialNumRange,
    buf: Vec<u8>,
}

impl Packet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(reserved: usize) -> Self {
        Self {
            count: 0,
            range: SerialNumRange::default(),
            buf: Vec::with_capacity(reserved),
        }
    }

    /// Parses and validates a serialized packet.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let mut packet = Self::with_capacity(bytes.len());
        let mut reader = bytes;
        while !reader.is_empty() {
            let entry = Entry::deserialize(&mut reader)?;
            packet.add(&entry)?;
        }
        Ok(packet)
    }

    /// Appends an entry; its serial must exceed the current range.
    pub fn add(&mut self, entry: &Entry) -> crate::Result<()> {
        if self.count > 0 && self.range.to() >= entry.serial() {
            return Err(crate::Error::SerialOrder((self.range.to(), entry.serial())));
        }
        if self.buf.is_empty() {
            self.range.set_from(entry.serial());
        }
        entry.serialize(&mut self.buf);
        self.count += 1;
        self.range.set_to(entry.serial());
        Ok(())
    }

    /// Appends a whole packet; ranges must not overlap.
    pub fn merge(&mut self, packet: &Self) -> crate::Result<()> {
        if packet.is_empty() {
            return Ok(());
        }
        if self.count > 0 && self.range.to() >= packet.range().from() {
            return Err(crate::Error::SerialOrder((
                self.range.to(),
                packet.range().from(),
            )));
        }
        if self.buf.is_empty() {
            self.range.set_from(packet.range().from());
        }
        self.count += packet.count;
        self.range.set_to(packet.range().to());
        self.buf.extend_from_slice(&packet.buf);
        Ok(())
    }

    #[must_use]
    pub fn range(&self) -> SerialNumRange {
        self.range
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Decodes the contained entries.
    pub fn entries(&self) -> crate::Result<Vec<Entry>> {
        let mut entries = Vec::with_capacity(self.count);
        let mut reader = self.buf.as_slice();
        while !reader.is_empty() {
            entries.push(Entry::deserialize(&mut reader)?);
        }
        Ok(entries)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.count = 0;
        self.range = SerialNumRange::default();
    }
}

/// Outcome delivered to commit callbacks; a failed commit shares one
/// error across the whole batch.
pub type CommitOutcome = Result<(), Arc<crate::Error>>;

/// Callback resolved once the entries are durably committed (or the
/// commit failed).
pub type DoneCallback = Box<dyn FnOnce(CommitOutcome) + Send>;

/// The accumulating commit batch: a packet plus the callbacks to resolve
/// when it lands on disk.
#[derive(Default)]
pub struct CommitChunk {
    packet: Packet,
    callbacks: Vec<DoneCallback>,
    on_commit_done: Option<DoneCallback>,
}

impl CommitChunk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh chunk inheriting postponed callbacks, used when handing
    /// the previous batch to the committer so callers still see
    /// exactly-once completion.
    #[must_use]
    pub fn with_postponed(callbacks: Vec<DoneCallback>) -> Self {
        Self {
            packet: Packet::new(),
            callbacks,
            on_commit_done: None,
        }
    }

    pub fn add(&mut self, packet: &Packet, on_done: DoneCallback) -> crate::Result<()> {
        self.packet.merge(packet)?;
        self.callbacks.push(on_done);
        Ok(())
    }

    #[must_use]
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.packet.is_empty()
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.packet.size_bytes()
    }

    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    pub fn set_commit_done_callback(&mut self, on_done: DoneCallback) {
        self.on_commit_done = Some(on_done);
    }

    pub(crate) fn into_parts(self) -> (Packet, Vec<DoneCallback>) {
        let mut callbacks = self.callbacks;
        if let Some(on_done) = self.on_commit_done {
            callbacks.push(on_done);
        }
        (self.packet, callbacks)
    }

    pub(crate) fn steal_callbacks(&mut self) -> Vec<DoneCallback> {
        std::mem::take(&mut self.callbacks)
    }
}
