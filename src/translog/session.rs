// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::translog::common::{Packet, SerialNumRange};
use crate::translog::domain::DomainShared;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The subscriber end of a visit: packets and the end-of-visit marker are
/// pushed here.
pub trait Destination: Send {
    /// Delivers a packet; false stops the visit.
    fn send(&mut self, session_id: i32, domain: &str, packet: Packet) -> bool;

    /// Signals that the visitor reached the domain tail.
    fn send_done(&mut self, session_id: i32, domain: &str) -> bool;

    /// False once the subscriber went away.
    fn connected(&self) -> bool;

    fn ok(&self) -> bool;
}

/// A visitor over one domain: a serial-range cursor and a destination.
///
/// ```text
/// [Created] --run--> [Visiting] --eof--> [InSync] --closed--> [Finished]
///                       |                   |
///                       +--- destination lost ---> [Finished]
/// ```
pub struct Session {
    id: i32,
    range: Mutex<SerialNumRange>,
    domain: Arc<DomainShared>,
    destination: Mutex<Box<dyn Destination>>,
    visit_running: AtomicBool,
    in_sync: AtomicBool,
    finished: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        id: i32,
        range: SerialNumRange,
        domain: Arc<DomainShared>,
        destination: Box<dyn Destination>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            range: Mutex::new(range),
            domain,
            destination: Mutex::new(destination),
            visit_running: AtomicBool::new(false),
            in_sync: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// The cursor: `from` advances as packets are delivered.
    #[must_use]
    pub fn range(&self) -> SerialNumRange {
        self.range.lock().map_or_else(
            |_| SerialNumRange::default(),
            |range| *range,
        )
    }

    #[must_use]
    pub fn in_sync(&self) -> bool {
        self.in_sync.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
            || !self
                .destination
                .lock()
                .map_or(false, |destination| destination.connected())
    }

    #[must_use]
    pub fn is_visit_running(&self) -> bool {
        self.visit_running.load(Ordering::Acquire)
    }

    pub(crate) fn start_visit(&self) {
        debug_assert!(!self.is_visit_running());
        self.visit_running.store(true, Ordering::Release);
    }

    /// The visit task: replay the range, send the EOF marker, finish.
    pub(crate) fn visit_only(&self) {
        if let Err(e) = self.visit() {
            log::error!(
                "[{}] : visit of ({}, {}] failed: {e}",
                self.id,
                self.range().from(),
                self.range().to()
            );
        }
        self.send_done();
        self.finalize();
        self.visit_running.store(false, Ordering::Release);
    }

    fn visit(&self) -> crate::Result<()> {
        log::debug!(
            "[{}] : Visiting {} - {}",
            self.id,
            self.range().from(),
            self.range().to()
        );

        loop {
            let range = self.range();
            if range.from() >= range.to() {
                break;
            }
            // Must re-find the part per round: erase may retire parts and
            // commit may rotate to new ones while we read.
            let Some(part) = self.domain.find_part(range.from()) else {
                break;
            };
            // The range is snapshotted up front: entries committed while we
            // read are picked up by the next round, never jumped over.
            let part_range = part.range();
            if part_range.from() > range.to() {
                break;
            }

            let mut cursor = None;
            let mut packet = Packet::new();
            let mut more = true;
            while self.ok() && more {
                let mut range = self.range();
                if range.from() >= range.to() {
                    break;
                }
                more = part.visit(&mut cursor, &mut range, &mut packet)?;
                if let Ok(mut guard) = self.range.lock() {
                    *guard = range;
                }
                if !packet.is_empty() {
                    let delivery = std::mem::take(&mut packet);
                    if !self.send(delivery) {
                        return Ok(());
                    }
                }
            }

            // Nothing more in this part, force the switch to the next one.
            let range = self.range();
            if range.from() < part_range.to() {
                if let Ok(mut guard) = self.range.lock() {
                    guard.set_from(part_range.to().min(range.to()));
                }
            }
        }

        log::debug!(
            "[{}] : Done visiting, {} - {}",
            self.id,
            self.range().from(),
            self.range().to()
        );
        Ok(())
    }

    fn ok(&self) -> bool {
        self.destination
            .lock()
            .map_or(false, |destination| destination.ok())
    }

    fn send(&self, packet: Packet) -> bool {
        self.destination.lock().map_or(false, |mut destination| {
            destination.send(self.id, self.domain.name(), packet)
        })
    }

    fn send_done(&self) {
        if let Ok(mut destination) = self.destination.lock() {
            destination.send_done(self.id, self.domain.name());
        }
        self.in_sync.store(true, Ordering::Release);
    }

    fn finalize(&self) {
        if !self.ok() {
            log::error!(
                "[{}] : Error in visitor ({} - {}), stopping.",
                self.id,
                self.range().from(),
                self.range().to()
            );
        }
        self.finished.store(true, Ordering::Release);
    }
}
