// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::translog::chunk::{Chunk, SerializedChunk, CHUNK_HEADER_LEN};
use crate::translog::common::{Packet, SerialNum, SerialNumRange};
use crate::translog::encoding::{Crc, Encoding};
use crate::translog::file_header::FileHeader;
use byteorder::{BigEndian, ReadBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

// Visits accumulate roughly this many bytes per packet before handing
// control back to the session.
pub(crate) const TARGET_PACKET_SIZE: usize = 0x3f000;

// A zero-filled tail longer than this is not a crash artifact.
const MAX_ZERO_TAIL: u64 = 0x0010_0000;

#[derive(Copy, Clone, Debug)]
struct SkipInfo {
    serial: SerialNum,
    pos: u64,
}

#[derive(Debug, Default)]
struct WriteState {
    written_serial: SerialNum,
    synced_serial: SerialNum,
}

enum FrameRead {
    Eof,
    Partial,
    Frame { encoding_raw: u8, body: Vec<u8> },
}

fn read_frame<R: Read>(reader: &mut R) -> crate::Result<FrameRead> {
    let mut header = [0u8; CHUNK_HEADER_LEN];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader
            .read(header.get_mut(filled..).unwrap_or(&mut []))
            .map_err(crate::Error::Io)?;
        if n == 0 {
            return Ok(if filled == 0 {
                FrameRead::Eof
            } else {
                FrameRead::Partial
            });
        }
        filled += n;
    }

    let encoding_raw = header[0];
    let len = (&mut &header[1..]).read_u32::<BigEndian>().map_err(crate::Error::Io)?;
    if encoding_raw == 0 && len == 0 {
        // looks like a zero-filled extent
        return Ok(FrameRead::Partial);
    }

    let mut body = vec![0u8; len as usize];
    let mut filled = 0;
    while filled < body.len() {
        let n = reader
            .read(body.get_mut(filled..).unwrap_or(&mut []))
            .map_err(crate::Error::Io)?;
        if n == 0 {
            return Ok(FrameRead::Partial);
        }
        filled += n;
    }
    Ok(FrameRead::Frame { encoding_raw, body })
}

fn decode_frame(encoding_raw: u8, body: &[u8]) -> crate::Result<Chunk> {
    let encoding = Encoding::from_raw(encoding_raw).map_err(crate::Error::Decode)?;
    if encoding.crc() == Crc::None {
        return Err(crate::Error::Corruption(format!(
            "unexpected encoding byte 0x{encoding_raw:02x} with non-zero length"
        )));
    }
    Chunk::decode(encoding, body)
}

/// Read cursor of one visit over this part.
pub struct PartReader {
    reader: BufReader<File>,
}

/// A single append-only log file holding a contiguous serial range.
///
/// Serials strictly increase across the file; the skip list maps first
/// serials to file offsets for seeking visitors.
pub struct DomainPart {
    file_name: PathBuf,
    file: Mutex<Option<File>>,
    range_from: AtomicU64,
    range_to: AtomicU64,
    num_entries: AtomicU64,
    byte_size: AtomicU64,
    skip_list: Mutex<Vec<SkipInfo>>,
    header_len: u32,
    write_state: Mutex<WriteState>,
}

impl DomainPart {
    #[must_use]
    pub fn file_name(name: &str, dir: &Path, first_serial: SerialNum) -> PathBuf {
        dir.join(format!("{name}-{first_serial:016}"))
    }

    /// Opens or creates the part for `first_serial`, scanning any existing
    /// content to rebuild the skip list. A zero-filled tail is truncated;
    /// other damage raises corruption.
    pub fn open(
        name: &str,
        dir: &Path,
        first_serial: SerialNum,
        allow_truncate: bool,
    ) -> crate::Result<Self> {
        let file_name = Self::file_name(name, dir, first_serial);
        let mut part = Self {
            file_name: file_name.clone(),
            file: Mutex::new(None),
            range_from: AtomicU64::new(first_serial),
            range_to: AtomicU64::new(first_serial.saturating_sub(1)),
            num_entries: AtomicU64::new(0),
            byte_size: AtomicU64::new(0),
            skip_list: Mutex::new(Vec::new()),
            header_len: 0,
            write_state: Mutex::new(WriteState::default()),
        };

        if file_name.exists() {
            part.scan_existing(allow_truncate)?;
        } else {
            part.create_fresh(name)?;
        }

        {
            let mut state = part.write_state.lock().map_err(|_| poisoned())?;
            state.written_serial = part.range().to();
            state.synced_serial = state.written_serial;
        }
        Ok(part)
    }

    fn create_fresh(&mut self, name: &str) -> crate::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.file_name)
            .map_err(crate::Error::Io)?;

        let mut header = FileHeader::new();
        header.put_tag("desc", "Transaction log domain part file");
        header.put_tag("domain", name);
        self.header_len = header.write_to(&mut file)?;
        file.sync_all().map_err(crate::Error::Io)?;

        self.byte_size
            .store(u64::from(self.header_len), Ordering::Release);
        *self.file.lock().map_err(|_| poisoned())? = Some(file);
        Ok(())
    }

    fn scan_existing(&mut self, allow_truncate: bool) -> crate::Result<()> {
        let file = File::open(&self.file_name).map_err(crate::Error::Io)?;
        let file_size = file.metadata().map_err(crate::Error::Io)?.len();
        let mut reader = BufReader::new(file);

        let header_len = match FileHeader::read_from(&mut reader) {
            Ok((_, len)) => len,
            Err(_) if file_size == 0 || allow_truncate => {
                // header missing or truncated, drop everything
                log::warn!(
                    "Truncating '{}' with unreadable header ({file_size} bytes)",
                    self.file_name.display()
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&self.file_name)
                    .map_err(crate::Error::Io)?;
                file.set_len(0).map_err(crate::Error::Io)?;
                drop(file);
                let name = self.domain_name_from_file();
                return self.create_fresh(&name);
            }
            Err(e) => return Err(e),
        };
        self.header_len = header_len;

        let mut pos = u64::from(header_len);
        let mut last_good = pos;
        loop {
            match read_frame(&mut reader)? {
                FrameRead::Eof => break,
                FrameRead::Partial => {
                    self.handle_bad_tail(last_good, file_size)?;
                    break;
                }
                FrameRead::Frame { encoding_raw, body } => {
                    let chunk = match decode_frame(encoding_raw, &body) {
                        Ok(chunk) => chunk,
                        Err(crate::Error::Corruption(_) | crate::Error::InvalidChecksum(_)) => {
                            self.handle_bad_tail(last_good, file_size)?;
                            break;
                        }
                        Err(e) => return Err(e),
                    };
                    let range = chunk.range();
                    if !chunk.entries().is_empty() {
                        if pos == u64::from(header_len) {
                            self.range_from.store(range.from(), Ordering::Relaxed);
                        }
                        self.range_to.store(range.to(), Ordering::Relaxed);
                        self.num_entries
                            .fetch_add(chunk.entries().len() as u64, Ordering::Relaxed);
                        self.skip_list
                            .lock()
                            .map_err(|_| poisoned())?
                            .push(SkipInfo {
                                serial: range.from(),
                                pos,
                            });
                    }
                    pos += (CHUNK_HEADER_LEN + body.len()) as u64;
                    last_good = pos;
                }
            }
        }
        drop(reader);

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.file_name)
            .map_err(crate::Error::Io)?;
        file.seek(SeekFrom::Start(last_good)).map_err(crate::Error::Io)?;
        self.byte_size.store(last_good, Ordering::Release);
        *self.file.lock().map_err(|_| poisoned())? = Some(file);
        Ok(())
    }

    fn domain_name_from_file(&self) -> String {
        self.file_name
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.rsplit_once('-'))
            .map_or_else(String::new, |(name, _)| name.to_string())
    }

    // A tail beyond the last valid chunk is legal only when it is
    // zero-filled (a crashed zero-extended write); anything else refuses
    // to start.
    fn handle_bad_tail(&self, last_good: u64, file_size: u64) -> crate::Result<()> {
        let rest = file_size.saturating_sub(last_good);
        if rest > MAX_ZERO_TAIL {
            return Err(crate::Error::Corruption(format!(
                "'{}' has {rest} trailing bytes past offset {last_good}",
                self.file_name.display()
            )));
        }

        let mut file = File::open(&self.file_name).map_err(crate::Error::Io)?;
        file.seek(SeekFrom::Start(last_good)).map_err(crate::Error::Io)?;
        let mut tail = Vec::with_capacity(rest as usize);
        file.read_to_end(&mut tail).map_err(crate::Error::Io)?;
        if tail.iter().any(|b| *b != 0) {
            return Err(crate::Error::Corruption(format!(
                "'{}' has a non-zero tail past offset {last_good}",
                self.file_name.display()
            )));
        }

        log::warn!(
            "Truncating '{}' to {last_good}, dropping {rest} zero bytes",
            self.file_name.display()
        );
        let file = OpenOptions::new()
            .write(true)
            .open(&self.file_name)
            .map_err(crate::Error::Io)?;
        file.set_len(last_good).map_err(crate::Error::Io)?;
        file.sync_all().map_err(crate::Error::Io)?;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.file_name
    }

    #[must_use]
    pub fn range(&self) -> SerialNumRange {
        SerialNumRange::new(
            self.range_from.load(Ordering::Relaxed),
            self.range_to.load(Ordering::Relaxed),
        )
    }

    #[must_use]
    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.byte_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn synced_serial(&self) -> SerialNum {
        self.write_state
            .lock()
            .map_or(0, |state| state.synced_serial)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.file.lock().map_or(true, |file| file.is_none())
    }

    /// Appends one serialized chunk, extending the skip list. On a failed
    /// write the position rewinds to the last known-good offset and syncs
    /// before the error surfaces.
    pub fn commit(&self, serialized: &SerializedChunk) -> crate::Result<()> {
        let range = serialized.range();
        let first_pos = self.byte_size();
        debug_assert!(self.range().to() < range.to());

        {
            let mut guard = self.file.lock().map_err(|_| poisoned())?;
            let Some(file) = guard.as_mut() else {
                return Err(crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "part is closed",
                )));
            };

            let mut state = self.write_state.lock().map_err(|_| poisoned())?;
            if let Err(e) = file.write_all(serialized.data()) {
                log::error!(
                    "Failed writing entries [{}, {}] to '{}': {e}. Rewind to {first_pos}.",
                    range.from(),
                    range.to(),
                    self.file_name.display()
                );
                let _ = file.set_len(first_pos);
                let _ = file.seek(SeekFrom::Start(first_pos));
                let _ = file.sync_all();
                return Err(crate::Error::Io(e));
            }
            state.written_serial = range.to();
        }

        self.num_entries
            .fetch_add(serialized.num_entries() as u64, Ordering::Relaxed);
        self.range_to.store(range.to(), Ordering::Relaxed);
        if self.range_from.load(Ordering::Relaxed) == 0 {
            self.range_from.store(range.from(), Ordering::Relaxed);
        }
        self.skip_list
            .lock()
            .map_err(|_| poisoned())?
            .push(SkipInfo {
                serial: range.from(),
                pos: first_pos,
            });
        self.byte_size
            .fetch_add(serialized.data().len() as u64, Ordering::Release);

        log::debug!(
            "Wrote chunk with {} bytes, range [{}, {}]",
            serialized.data().len(),
            range.from(),
            range.to()
        );
        Ok(())
    }

    /// Fsyncs and advances the synced serial to what was written before
    /// the sync started.
    pub fn sync(&self) -> crate::Result<()> {
        let sync_serial = self
            .write_state
            .lock()
            .map_err(|_| poisoned())?
            .written_serial;

        {
            let guard = self.file.lock().map_err(|_| poisoned())?;
            if let Some(file) = guard.as_ref() {
                file.sync_all().map_err(crate::Error::Io)?;
            }
        }

        let mut state = self.write_state.lock().map_err(|_| poisoned())?;
        if state.synced_serial < sync_serial {
            state.synced_serial = sync_serial;
        }
        Ok(())
    }

    /// Syncs and closes the append handle; the part becomes read-only.
    pub fn close(&self) -> crate::Result<()> {
        let mut guard = self.file.lock().map_err(|_| poisoned())?;
        if let Some(file) = guard.take() {
            file.sync_all().map_err(crate::Error::Io)?;
        }
        let mut state = self.write_state.lock().map_err(|_| poisoned())?;
        state.synced_serial = state.written_serial;
        Ok(())
    }

    /// Deletes the file when fully covered by `to`, otherwise advances the
    /// logical start.
    pub fn erase(&self, to: SerialNum) -> crate::Result<()> {
        if to > self.range().to() {
            self.close()?;
            std::fs::remove_file(&self.file_name).map_err(crate::Error::Io)?;
        } else if to > self.range_from.load(Ordering::Relaxed) {
            self.range_from.store(to, Ordering::Relaxed);
        }
        Ok(())
    }

    fn open_and_find(&self, from: SerialNum) -> crate::Result<PartReader> {
        let file = File::open(&self.file_name).map_err(crate::Error::Io)?;
        let mut reader = BufReader::new(file);

        let mut pos = u64::from(self.header_len);
        for skip in self.skip_list.lock().map_err(|_| poisoned())?.iter() {
            if skip.serial > from {
                break;
            }
            pos = skip.pos;
        }
        reader.seek(SeekFrom::Start(pos)).map_err(crate::Error::Io)?;
        Ok(PartReader { reader })
    }

    /// Reads the next batch of entries within `range` into `packet`,
    /// advancing `range.from`. Returns false once the part is exhausted.
    pub fn visit(
        &self,
        cursor: &mut Option<PartReader>,
        range: &mut SerialNumRange,
        packet: &mut Packet,
    ) -> crate::Result<bool> {
        if cursor.is_none() {
            *cursor = Some(self.open_and_find(range.from() + 1)?);
        }
        let Some(part_reader) = cursor.as_mut() else {
            return Ok(false);
        };

        packet.clear();
        loop {
            if packet.size_bytes() >= TARGET_PACKET_SIZE || packet.range().to() >= range.to() {
                break;
            }
            match read_frame(&mut part_reader.reader)? {
                FrameRead::Eof => break,
                FrameRead::Partial => {
                    return Err(crate::Error::Corruption(format!(
                        "short read while visiting '{}'",
                        self.file_name.display()
                    )))
                }
                FrameRead::Frame { encoding_raw, body } => {
                    let chunk = decode_frame(encoding_raw, &body)?;
                    for entry in chunk.into_entries() {
                        if range.from() < entry.serial() && entry.serial() <= range.to() {
                            packet.add(&entry)?;
                        }
                    }
                }
            }
        }

        if !packet.is_empty() {
            range.set_from(packet.range().to());
        }
        Ok(!packet.is_empty())
    }
}

fn poisoned() -> crate::Error {
    crate::Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "lock poisoned",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translog::common::Entry;
    use crate::translog::config::DomainConfig;
    use test_log::test;

    fn serialized(entries: &[(u64, &[u8])]) -> SerializedChunk {
        let mut chunk = Chunk::new();
        for (serial, data) in entries {
            chunk.add(Entry::new(*serial, 0, data.to_vec()));
        }
        let config = DomainConfig::default();
        SerializedChunk::from_chunk(&chunk, config.encoding(), config.compression_level())
            .expect("encoding should not fail")
    }

    #[test]
    fn append_and_reopen() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let part = DomainPart::open("d", dir.path(), 0, false)?;
            part.commit(&serialized(&[(1, b"a"), (2, b"b")]))?;
            part.commit(&serialized(&[(3, b"c")]))?;
            part.sync()?;
            assert_eq!(3, part.num_entries());
        }

        let part = DomainPart::open("d", dir.path(), 0, false)?;
        assert_eq!(3, part.num_entries());
        assert_eq!(SerialNumRange::new(1, 3), part.range());
        Ok(())
    }

    #[test]
    fn visit_filters_by_range() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let part = DomainPart::open("d", dir.path(), 0, false)?;
        part.commit(&serialized(&[(1, b"a"), (2, b"b"), (3, b"c")]))?;

        let mut cursor = None;
        let mut range = SerialNumRange::new(1, 3);
        let mut packet = Packet::new();
        assert!(part.visit(&mut cursor, &mut range, &mut packet)?);

        let serials: Vec<u64> = packet.entries()?.iter().map(Entry::serial).collect();
        assert_eq!(vec![2, 3], serials);
        assert!(!part.visit(&mut cursor, &mut range, &mut packet)?);
        Ok(())
    }

    #[test]
    fn zero_tail_is_truncated_on_reopen() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let good_size;
        {
            let part = DomainPart::open("d", dir.path(), 0, false)?;
            part.commit(&serialized(&[(1, b"a")]))?;
            part.commit(&serialized(&[(2, b"b")]))?;
            part.commit(&serialized(&[(3, b"c")]))?;
            part.sync()?;
            good_size = part.byte_size();
        }

        let path = DomainPart::file_name("d", dir.path(), 0);
        {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(&vec![0u8; 4608])?;
        }

        let part = DomainPart::open("d", dir.path(), 0, false)?;
        assert_eq!(3, part.num_entries());
        assert_eq!(good_size, part.byte_size());

        // appending continues after the truncated tail
        part.commit(&serialized(&[(4, b"d")]))?;
        assert_eq!(4, part.num_entries());
        Ok(())
    }

    #[test]
    fn non_zero_tail_is_corruption() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let part = DomainPart::open("d", dir.path(), 0, false)?;
            part.commit(&serialized(&[(1, b"a")]))?;
        }

        let path = DomainPart::file_name("d", dir.path(), 0);
        {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(&[0u8, 0, 0, 0, 0, 0xde, 0xad])?;
        }

        let result = DomainPart::open("d", dir.path(), 0, false);
        assert!(matches!(result, Err(crate::Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn erase_deletes_fully_covered_part() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let part = DomainPart::open("d", dir.path(), 0, false)?;
        part.commit(&serialized(&[(1, b"a"), (2, b"b")]))?;

        part.erase(2)?;
        assert_eq!(2, part.range().from());

        part.erase(3)?;
        assert!(!DomainPart::file_name("d", dir.path(), 0).exists());
        Ok(())
    }
}
