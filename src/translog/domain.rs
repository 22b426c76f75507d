// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::translog::chunk::{Chunk, SerializedChunk};
use crate::translog::common::{
    CommitChunk, CommitOutcome, DoneCallback, Packet, SerialNum, SerialNumRange,
};
use crate::translog::config::DomainConfig;
use crate::translog::domain_part::DomainPart;
use crate::translog::session::{Destination, Session};
use crossbeam_skiplist::SkipMap;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Status of one part file.
#[derive(Clone, Debug)]
pub struct PartInfo {
    pub range: SerialNumRange,
    pub num_entries: u64,
    pub byte_size: u64,
    pub file: PathBuf,
}

/// Aggregate status of a domain.
#[derive(Clone, Debug, Default)]
pub struct DomainInfo {
    pub range: SerialNumRange,
    pub num_entries: u64,
    pub byte_size: u64,
    pub parts: Vec<PartInfo>,
}

struct SerializedJob {
    result: crate::Result<Option<SerializedChunk>>,
    callbacks: Vec<DoneCallback>,
}

enum CommitterTask {
    Chunk(mpsc::Receiver<SerializedJob>),
    Sync(Option<DoneCallback>),
    Shutdown,
}

// State shared between the domain handle, its committer thread and its
// visit sessions.
pub(crate) struct DomainShared {
    name: String,
    dir: PathBuf,
    config: Mutex<DomainConfig>,
    parts: SkipMap<SerialNum, Arc<DomainPart>>,
    sessions: Mutex<BTreeMap<i32, Arc<Session>>>,
    marked_deleted: AtomicBool,
}

impl DomainShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// The part holding `serial`, or the first one after it.
    pub(crate) fn find_part(&self, serial: SerialNum) -> Option<Arc<DomainPart>> {
        if let Some(entry) = self.parts.upper_bound(Bound::Included(&serial)) {
            if entry.value().range().to() > serial {
                return Some(Arc::clone(entry.value()));
            }
        }
        self.parts
            .lower_bound(Bound::Excluded(&serial))
            .map(|entry| Arc::clone(entry.value()))
    }

    fn active_part(&self) -> Option<Arc<DomainPart>> {
        self.parts.back().map(|entry| Arc::clone(entry.value()))
    }

    fn clean_sessions(&self) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        sessions.retain(|_, session| !session.in_sync() && !session.finished());
    }

    fn rotate_if_needed(&self, next_serial: SerialNum) -> crate::Result<Arc<DomainPart>> {
        let Some(active) = self.active_part() else {
            return Err(crate::Error::Corruption("domain has no parts".into()));
        };
        let part_size_limit = self
            .config
            .lock()
            .map_or(u64::MAX, |config| config.part_size_limit());
        if active.byte_size() <= part_size_limit {
            return Ok(active);
        }

        active.sync()?;
        active.close()?;
        let part = Arc::new(DomainPart::open(&self.name, &self.dir, next_serial, false)?);
        self.parts.insert(next_serial, Arc::clone(&part));
        Ok(part)
    }

    fn do_commit(&self, serialized: &SerializedChunk) -> crate::Result<()> {
        let part = self.rotate_if_needed(serialized.range().from())?;
        part.commit(serialized)?;
        let fsync = self
            .config
            .lock()
            .map_or(false, |config| config.fsync_on_commit());
        if fsync {
            part.sync()?;
        }
        self.clean_sessions();
        log::debug!(
            "Committed {} entries and {} bytes to domain '{}'",
            serialized.num_entries(),
            serialized.data().len(),
            self.name
        );
        Ok(())
    }
}

struct CurrentChunk {
    chunk: CommitChunk,
    last_serial: SerialNum,
}

/// A named, ordered log stream: an ordered collection of parts, a
/// strictly-ordered commit pipeline and the visit sessions replaying it.
///
/// Appends accumulate into the current commit chunk under the chunk lock;
/// full chunks serialize on a worker thread and land on disk through a
/// dedicated single-threaded committer, so the on-disk serial order is
/// exactly the append order.
pub struct Domain {
    shared: Arc<DomainShared>,
    current: Mutex<CurrentChunk>,
    committer_tx: mpsc::Sender<CommitterTask>,
    committer: Mutex<Option<std::thread::JoinHandle<()>>>,
    session_id: AtomicI32,
}

impl Domain {
    /// Opens (or creates) the domain under `base_dir`, scanning existing
    /// part files.
    pub fn open(name: &str, base_dir: &Path, config: DomainConfig) -> crate::Result<Self> {
        let dir = base_dir.join(name);
        std::fs::create_dir_all(&dir).map_err(crate::Error::Io)?;

        let part_serials = scan_dir(name, &dir)?;
        let parts = SkipMap::new();
        let last = part_serials.last().copied();
        for serial in &part_serials {
            // only the open tail may carry a truncatable crash artifact
            let is_last = Some(*serial) == last;
            let part = Arc::new(DomainPart::open(name, &dir, *serial, is_last)?);
            parts.insert(*serial, part);
        }
        if parts.is_empty() {
            let part = Arc::new(DomainPart::open(name, &dir, 0, false)?);
            parts.insert(0, part);
        }

        let last_serial = parts
            .back()
            .map_or(0, |entry| entry.value().range().to());

        let shared = Arc::new(DomainShared {
            name: name.to_string(),
            dir,
            config: Mutex::new(config),
            parts,
            sessions: Mutex::new(BTreeMap::new()),
            marked_deleted: AtomicBool::new(false),
        });

        let (committer_tx, committer_rx) = mpsc::channel();
        let committer_shared = Arc::clone(&shared);
        let committer = std::thread::Builder::new()
            .name(format!("translog-committer-{name}"))
            .spawn(move || committer_loop(&committer_shared, &committer_rx))
            .map_err(crate::Error::Io)?;

        Ok(Self {
            shared,
            current: Mutex::new(CurrentChunk {
                chunk: CommitChunk::new(),
                last_serial,
            }),
            committer_tx,
            committer: Mutex::new(Some(committer)),
            session_id: AtomicI32::new(1),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn set_config(&self, config: DomainConfig) {
        if let Ok(mut guard) = self.shared.config.lock() {
            *guard = config;
        }
    }

    #[must_use]
    pub fn is_marked_deleted(&self) -> bool {
        self.shared.marked_deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.shared.marked_deleted.store(true, Ordering::Release);
    }

    /// First serial covered by the log.
    #[must_use]
    pub fn begin(&self) -> SerialNum {
        self.shared
            .parts
            .front()
            .map_or(0, |entry| entry.value().range().from())
    }

    /// Last serial ever accepted.
    #[must_use]
    pub fn end(&self) -> SerialNum {
        self.shared
            .parts
            .back()
            .map_or(0, |entry| entry.value().range().to())
    }

    #[must_use]
    pub fn num_entries(&self) -> u64 {
        self.shared
            .parts
            .iter()
            .map(|entry| entry.value().num_entries())
            .sum()
    }

    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.shared
            .parts
            .iter()
            .map(|entry| entry.value().byte_size())
            .sum()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().map_or(0, |sessions| sessions.len())
    }

    #[must_use]
    pub fn info(&self) -> DomainInfo {
        let mut info = DomainInfo {
            range: SerialNumRange::new(self.begin(), self.end()),
            num_entries: self.num_entries(),
            byte_size: self.byte_size(),
            parts: Vec::new(),
        };
        for entry in self.shared.parts.iter() {
            let part = entry.value();
            info.parts.push(PartInfo {
                range: part.range(),
                num_entries: part.num_entries(),
                byte_size: part.byte_size(),
                file: part.path().to_path_buf(),
            });
        }
        info
    }

    /// Highest serial known to be durable.
    #[must_use]
    pub fn synced_serial(&self) -> SerialNum {
        let mut iter = self.shared.parts.iter().rev();
        let Some(last) = iter.next() else { return 0 };
        let synced = last.value().synced_serial();
        if synced == 0 {
            if let Some(prev) = iter.next() {
                return prev.value().synced_serial();
            }
        }
        synced
    }

    /// Queues a packet into the current commit chunk. The packet's first
    /// serial must exceed everything accepted before.
    pub fn append(&self, packet: &Packet, done: DoneCallback) -> crate::Result<()> {
        let mut current = self.current.lock().map_err(|_| poisoned())?;
        if current.last_serial >= packet.range().from() {
            return Err(crate::Error::SerialOrder((
                current.last_serial,
                packet.range().from(),
            )));
        }
        current.last_serial = packet.range().to();
        current.chunk.add(packet, done)?;

        let limit = self
            .shared
            .config
            .lock()
            .map_or(usize::MAX, |config| config.chunk_size_limit());
        if current.chunk.size_bytes() > limit {
            self.commit_and_transfer_responses(&mut current)?;
        }
        Ok(())
    }

    /// Explicitly drains the current chunk.
    pub fn start_commit(&self, on_done: Option<DoneCallback>) -> crate::Result<()> {
        let mut current = self.current.lock().map_err(|_| poisoned())?;
        if current.chunk.is_empty() {
            if let Some(on_done) = on_done {
                on_done(Ok(()));
            }
            return Ok(());
        }
        let mut completed = std::mem::take(&mut current.chunk);
        if let Some(on_done) = on_done {
            completed.set_commit_done_callback(on_done);
        }
        self.commit_chunk(completed)
    }

    // Hands the full chunk to the pipeline; its callbacks transfer into
    // the fresh chunk so callers see exactly-once completion.
    fn commit_and_transfer_responses(&self, current: &mut CurrentChunk) -> crate::Result<()> {
        let mut completed = std::mem::take(&mut current.chunk);
        current.chunk = CommitChunk::with_postponed(completed.steal_callbacks());
        self.commit_chunk(completed)
    }

    // Serialization happens on a worker thread; the committer receives a
    // per-chunk channel in submission order, which pins the on-disk order.
    fn commit_chunk(&self, completed: CommitChunk) -> crate::Result<()> {
        let (packet, callbacks) = completed.into_parts();
        if packet.is_empty() && callbacks.is_empty() {
            return Ok(());
        }

        let (job_tx, job_rx) = mpsc::channel();
        if packet.is_empty() {
            let _ = job_tx.send(SerializedJob {
                result: Ok(None),
                callbacks,
            });
        } else {
            let (encoding, level) = self
                .shared
                .config
                .lock()
                .map_or((Default::default(), 9), |config| {
                    (config.encoding(), config.compression_level())
                });
            std::thread::spawn(move || {
                let result = serialize_packet(&packet, encoding, level).map(Some);
                let _ = job_tx.send(SerializedJob { result, callbacks });
            });
        }

        self.committer_tx
            .send(CommitterTask::Chunk(job_rx))
            .map_err(|_| {
                crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "committer is gone",
                ))
            })
    }

    /// Drains the current chunk and schedules an fsync on the committer.
    pub fn trigger_sync_now(&self, after_sync: Option<DoneCallback>) -> crate::Result<()> {
        {
            let mut current = self.current.lock().map_err(|_| poisoned())?;
            if !current.chunk.is_empty() {
                self.commit_and_transfer_responses(&mut current)?;
            }
        }
        self.committer_tx
            .send(CommitterTask::Sync(after_sync))
            .map_err(|_| {
                crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "committer is gone",
                ))
            })
    }

    /// Erases whole parts below `to`; the newest part is never fully
    /// removed, only logically advanced.
    pub fn erase(&self, to: SerialNum) -> crate::Result<()> {
        while self.shared.parts.len() > 1 {
            let Some(front) = self.shared.parts.front() else {
                break;
            };
            if front.value().range().to() >= to {
                break;
            }
            let part = Arc::clone(front.value());
            front.remove();
            part.erase(to)?;
        }
        if let Some(front) = self.shared.parts.front() {
            if front.value().range().to() >= to {
                front.value().erase(to)?;
            }
        }
        Ok(())
    }

    /// Registers a visitor session over `(from, to]` and returns its id.
    pub fn visit(&self, from: SerialNum, to: SerialNum, destination: Box<dyn Destination>) -> i32 {
        self.shared.clean_sessions();
        let id = self.session_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(
            id,
            SerialNumRange::new(from, to),
            Arc::clone(&self.shared),
            destination,
        );
        if let Ok(mut sessions) = self.shared.sessions.lock() {
            sessions.insert(id, session);
        }
        id
    }

    /// Starts the session's visit task. Returns 0 when accepted.
    pub fn start_session(&self, session_id: i32) -> i32 {
        let session = match self.shared.sessions.lock() {
            Ok(sessions) => sessions.get(&session_id).cloned(),
            Err(_) => None,
        };
        let Some(session) = session else { return -1 };

        session.start_visit();
        let spawned = std::thread::Builder::new()
            .name(format!("translog-visit-{}", self.shared.name))
            .spawn(move || session.visit_only());
        if spawned.is_err() {
            if let Ok(mut sessions) = self.shared.sessions.lock() {
                sessions.remove(&session_id);
            }
            return -1;
        }
        0
    }

    /// Closes a session, polling while its visit task still runs.
    pub fn close_session(&self, session_id: i32) -> i32 {
        {
            let Ok(sessions) = self.shared.sessions.lock() else {
                return -1;
            };
            if !sessions.contains_key(&session_id) {
                return -1;
            }
        }
        loop {
            std::thread::sleep(Duration::from_millis(10));
            let Ok(mut sessions) = self.shared.sessions.lock() else {
                return -1;
            };
            match sessions.get(&session_id) {
                Some(session) if session.is_visit_running() => {}
                Some(_) => {
                    sessions.remove(&session_id);
                    return 0;
                }
                None => return 0,
            }
        }
    }

    /// The lowest serial any non-in-sync visitor still needs.
    #[must_use]
    pub fn find_oldest_active_visit(&self) -> SerialNum {
        let Ok(sessions) = self.shared.sessions.lock() else {
            return SerialNum::MAX;
        };
        sessions
            .values()
            .filter(|session| !session.in_sync())
            .map(|session| session.range().from())
            .min()
            .unwrap_or(SerialNum::MAX)
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        if let Ok(mut current) = self.current.lock() {
            let completed = std::mem::take(&mut current.chunk);
            let _ = self.commit_chunk(completed);
        }
        let _ = self.committer_tx.send(CommitterTask::Shutdown);
        if let Ok(mut guard) = self.committer.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
        if let Ok(mut sessions) = self.shared.sessions.lock() {
            sessions.clear();
        }
    }
}

fn serialize_packet(
    packet: &Packet,
    encoding: crate::translog::encoding::Encoding,
    level: i32,
) -> crate::Result<SerializedChunk> {
    let mut chunk = Chunk::new();
    for entry in packet.entries()? {
        chunk.add(entry);
    }
    SerializedChunk::from_chunk(&chunk, encoding, level)
}

fn committer_loop(shared: &Arc<DomainShared>, rx: &mpsc::Receiver<CommitterTask>) {
    while let Ok(task) = rx.recv() {
        match task {
            CommitterTask::Chunk(job_rx) => {
                let Ok(job) = job_rx.recv() else { continue };
                let outcome: CommitOutcome = match job.result {
                    Ok(Some(serialized)) => {
                        shared.do_commit(&serialized).map_err(Arc::new)
                    }
                    Ok(None) => Ok(()),
                    Err(e) => Err(Arc::new(e)),
                };
                if let Err(e) = &outcome {
                    log::error!(
                        "Commit failed in domain '{}', aborting {} callbacks: {e}",
                        shared.name,
                        job.callbacks.len()
                    );
                }
                for callback in job.callbacks {
                    callback(outcome.clone());
                }
            }
            CommitterTask::Sync(after_sync) => {
                let result = match shared.active_part() {
                    Some(part) => part.sync().map_err(Arc::new),
                    None => Ok(()),
                };
                if let Some(after_sync) = after_sync {
                    after_sync(result);
                }
            }
            CommitterTask::Shutdown => break,
        }
    }
}

fn scan_dir(name: &str, dir: &Path) -> crate::Result<Vec<SerialNum>> {
    let mut serials = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(crate::Error::Io)? {
        let entry = entry.map_err(crate::Error::Io)?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(suffix) = file_name
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('-'))
        else {
            continue;
        };
        let Ok(serial) = suffix.parse::<SerialNum>() else {
            continue;
        };
        // only accept exact zero-padded names
        if file_name == format!("{name}-{serial:016}") {
            serials.push(serial);
        }
    }
    serials.sort_unstable();
    Ok(serials)
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
    use test_log::test;

    fn packet(serials: &[u64]) -> Packet {
        let mut packet = Packet::new();
        for serial in serials {
            packet
                .add(&Entry::new(*serial, 1, vec![0u8; 64]))
                .expect("monotonic serials");
        }
        packet
    }

    fn append_sync(domain: &Domain, serials: &[u64]) -> crate::Result<()> {
        let (tx, rx) = mpsc::channel();
        domain.append(&packet(serials), Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }))?;
        domain.start_commit(None)?;
        rx.recv()
            .map_err(|_| crate::Error::Corruption("callback dropped".into()))?
            .map_err(|e| crate::Error::Corruption(e.to_string()))
    }

    #[test]
    fn append_then_reopen() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let domain = Domain::open("music", dir.path(), DomainConfig::default())?;
            append_sync(&domain, &[100, 101, 102])?;
            assert_eq!(100, domain.begin());
            assert_eq!(102, domain.end());
            assert_eq!(3, domain.num_entries());
        }

        let domain = Domain::open("music", dir.path(), DomainConfig::default())?;
        assert_eq!(100, domain.begin());
        assert_eq!(102, domain.end());
        assert_eq!(3, domain.num_entries());
        Ok(())
    }

    #[test]
    fn append_rejects_stale_serials() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let domain = Domain::open("d", dir.path(), DomainConfig::default())?;
        append_sync(&domain, &[10])?;

        let result = domain.append(&packet(&[10]), Box::new(|_| {}));
        assert!(matches!(result, Err(crate::Error::SerialOrder((10, 10)))));
        Ok(())
    }

    #[test]
    fn part_rotation_by_size() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = DomainConfig::default().with_part_size_limit(512);
        let domain = Domain::open("d", dir.path(), config)?;

        for i in 0..20u64 {
            append_sync(&domain, &[i * 3 + 1, i * 3 + 2])?;
        }
        assert!(domain.info().parts.len() > 1);
        assert_eq!(40, domain.num_entries());
        Ok(())
    }

    #[test]
    fn erase_keeps_newest_part() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = DomainConfig::default().with_part_size_limit(256);
        let domain = Domain::open("d", dir.path(), config)?;
        for i in 1..=10u64 {
            append_sync(&domain, &[i])?;
        }
        let parts_before = domain.info().parts.len();
        assert!(parts_before > 1);

        domain.erase(domain.end())?;
        assert!(!domain.info().parts.is_empty());
        assert_eq!(domain.end(), domain.info().range.to());
        Ok(())
    }

    #[test]
    fn synced_serial_advances_on_sync() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let domain = Domain::open("d", dir.path(), DomainConfig::default())?;
        append_sync(&domain, &[1, 2, 3])?;

        let (tx, rx) = mpsc::channel();
        domain.trigger_sync_now(Some(Box::new(move |outcome| {
            let _ = tx.send(outcome);
        })))?;
        rx.recv()
            .map_err(|_| crate::Error::Corruption("sync callback dropped".into()))?
            .map_err(|e| crate::Error::Corruption(e.to_string()))?;

        assert_eq!(3, domain.synced_serial());
        Ok(())
    }
}
