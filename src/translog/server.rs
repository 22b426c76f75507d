// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::translog::common::{Packet, SerialNum};
use crate::translog::config::DomainConfig;
use crate::translog::domain::{Domain, DomainInfo};
use crate::translog::session::Destination;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::Duration;

const SYNC_RETRY: Duration = Duration::from_millis(50);

/// Façade over many domains.
///
/// Integer returns follow the wire convention: `0` is OK, positive values
/// are method-specific codes (session id, busy-retry), negative values
/// are errors. The on-disk domain index is `<name>/<name>.domains`, one
/// domain per line.
pub struct TransLogServer {
    name: String,
    base_dir: PathBuf,
    config: DomainConfig,
    domains: RwLock<BTreeMap<String, Arc<Domain>>>,
    // serializes domain creation/deletion including the index file
    file_lock: Mutex<()>,
}

impl TransLogServer {
    /// Opens the server, loading every domain listed in the index file.
    pub fn open(name: &str, base_dir: &Path, config: DomainConfig) -> crate::Result<Self> {
        let server = Self {
            name: name.to_string(),
            base_dir: base_dir.to_path_buf(),
            config,
            domains: RwLock::new(BTreeMap::new()),
            file_lock: Mutex::new(()),
        };
        std::fs::create_dir_all(server.dir()).map_err(crate::Error::Io)?;

        if let Ok(list) = std::fs::read_to_string(server.domain_list_file()) {
            for domain_name in list.lines().filter(|l| !l.is_empty()) {
                match Domain::open(domain_name, &server.dir(), server.config) {
                    Ok(domain) => {
                        if let Ok(mut domains) = server.domains.write() {
                            domains.insert(domain_name.to_string(), Arc::new(domain));
                        }
                    }
                    Err(e) => {
                        log::warn!("Failed opening domain '{domain_name}' on startup: {e}");
                    }
                }
            }
        }
        Ok(server)
    }

    fn dir(&self) -> PathBuf {
        self.base_dir.join(&self.name)
    }

    fn domain_list_file(&self) -> PathBuf {
        self.dir().join(format!("{}.domains", self.name))
    }

    fn find_domain(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains
            .read()
            .ok()
            .and_then(|domains| domains.get(name).cloned())
    }

    #[must_use]
    pub fn domain_names(&self) -> Vec<String> {
        self.domains
            .read()
            .map_or_else(|_| Vec::new(), |domains| domains.keys().cloned().collect())
    }

    #[must_use]
    pub fn domain_stats(&self) -> BTreeMap<String, DomainInfo> {
        self.domains.read().map_or_else(
            |_| BTreeMap::new(),
            |domains| {
                domains
                    .iter()
                    .map(|(name, domain)| (name.clone(), domain.info()))
                    .collect()
            },
        )
    }

    /// Creates a domain and appends it to the on-disk index.
    pub fn create_domain(&self, name: &str) -> i32 {
        let _guard = self.file_lock.lock();
        if self.find_domain(name).is_some() {
            return 0;
        }
        log::debug!("createDomain({name})");

        match Domain::open(name, &self.dir(), self.config) {
            Ok(domain) => {
                if let Ok(mut domains) = self.domains.write() {
                    domains.insert(name.to_string(), Arc::new(domain));
                }
                let appended = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.domain_list_file())
                    .and_then(|mut file| writeln!(file, "{name}"));
                if let Err(e) = appended {
                    log::warn!("Failed extending domain index with '{name}': {e}");
                    return -1;
                }
                0
            }
            Err(e) => {
                log::warn!("Failed creating domain '{name}': {e}");
                -1
            }
        }
    }

    /// Deletes a domain; refused while it has active sessions.
    pub fn delete_domain(&self, name: &str) -> (i32, String) {
        let _guard = self.file_lock.lock();
        log::debug!("deleteDomain({name})");

        let domain = self.find_domain(name);
        if let Some(domain) = &domain {
            if domain.session_count() > 0 {
                let msg = format!("Domain '{name}' is open. Can not delete open domains.");
                log::warn!("{msg}");
                return (-2, msg);
            }
            domain.mark_deleted();
            if let Ok(mut domains) = self.domains.write() {
                domains.remove(name);
            }
        }

        if let Err(e) = std::fs::remove_dir_all(self.dir().join(name)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                let msg = format!("Failed deleting domain '{name}': {e}");
                log::warn!("{msg}");
                return (-1, msg);
            }
        }
        if let Err(e) = self.rewrite_domain_list() {
            let msg = format!("Failed rewriting domain index after deleting '{name}': {e}");
            log::warn!("{msg}");
            return (-1, msg);
        }
        (0, "ok".into())
    }

    // Atomic rewrite: temp file in the same directory, then persist.
    fn rewrite_domain_list(&self) -> crate::Result<()> {
        let dir = self.dir();
        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(crate::Error::Io)?;
        for name in self.domain_names() {
            writeln!(temp, "{name}").map_err(crate::Error::Io)?;
        }
        temp.flush().map_err(crate::Error::Io)?;
        temp.as_file_mut().sync_all().map_err(crate::Error::Io)?;
        temp.persist(self.domain_list_file())
            .map_err(|e| crate::Error::Io(e.error))?;
        Ok(())
    }

    /// Existence check.
    pub fn open_domain(&self, name: &str) -> i32 {
        if self.find_domain(name).is_some() {
            0
        } else {
            -1
        }
    }

    /// Newline-separated domain names.
    pub fn list_domains(&self) -> (i32, String) {
        let mut list = String::new();
        for name in self.domain_names() {
            list.push_str(&name);
            list.push('\n');
        }
        (0, list)
    }

    /// `(result, begin, end, count)` for a domain.
    pub fn domain_status(&self, name: &str) -> (i32, u64, u64, u64) {
        match self.find_domain(name) {
            Some(domain) => (0, domain.begin(), domain.end(), domain.num_entries()),
            None => (-1, 0, 0, 0),
        }
    }

    /// Decodes and synchronously commits a serialized packet.
    pub fn domain_commit(&self, name: &str, packet_bytes: &[u8]) -> (i32, String) {
        let Some(domain) = self.find_domain(name) else {
            return (-1, format!("Could not find domain {name}"));
        };
        log::debug!("domainCommit({name})({})", packet_bytes.len());

        let packet = match Packet::from_bytes(packet_bytes) {
            Ok(packet) => packet,
            Err(e) => return (-2, format!("Exception during commit on {name} : {e}")),
        };

        let (tx, rx) = mpsc::channel();
        let queued = domain.append(
            &packet,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        if let Err(e) = queued {
            return (-2, format!("Exception during commit on {name} : {e}"));
        }
        if let Err(e) = domain.start_commit(None) {
            return (-2, format!("Exception during commit on {name} : {e}"));
        }
        match rx.recv() {
            Ok(Ok(())) => (0, "ok".into()),
            Ok(Err(e)) => (-2, format!("Exception during commit on {name} : {e}")),
            Err(_) => (-2, format!("Commit pipeline of {name} went away")),
        }
    }

    /// Erases up to `to`, unless an active visitor still needs the range.
    pub fn domain_prune(&self, name: &str, to: SerialNum) -> i32 {
        let Some(domain) = self.find_domain(name) else {
            return -1;
        };
        let oldest_active = domain.find_oldest_active_visit();
        if oldest_active < to {
            return 1;
        }
        match domain.erase(to) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    }

    /// Creates a visitor session over `(from, to]`; returns its id.
    pub fn domain_visit(
        &self,
        name: &str,
        from: SerialNum,
        to: SerialNum,
        destination: Box<dyn Destination>,
    ) -> i32 {
        let Some(domain) = self.find_domain(name) else {
            return -1;
        };
        log::debug!("domainVisit({name}, {from}, {to})");
        domain.visit(from, to, destination)
    }

    /// Starts the session's visit task.
    pub fn domain_session_run(&self, name: &str, session_id: i32) -> i32 {
        let Some(domain) = self.find_domain(name) else {
            return -1;
        };
        domain.start_session(session_id)
    }

    /// Closes a session; `1` means busy, retry.
    pub fn domain_session_close(&self, name: &str, session_id: i32) -> i32 {
        let Some(domain) = self.find_domain(name) else {
            return -1;
        };
        let result = domain.close_session(session_id);
        log::debug!("domainSessionClose({name}, {session_id}) = {result}");
        result
    }

    /// Blocks until the domain synced past `sync_to`, retrying the fsync
    /// on an interval. Returns `(0, synced_serial)`.
    pub fn domain_sync(&self, name: &str, sync_to: SerialNum) -> (i32, u64) {
        let Some(domain) = self.find_domain(name) else {
            return (0, 0);
        };
        log::debug!("domainSync({name}, {sync_to})");

        loop {
            let synced = domain.synced_serial();
            if domain.is_marked_deleted() || synced >= sync_to {
                return (0, synced);
            }
            if domain.trigger_sync_now(None).is_err() {
                return (0, synced);
            }
            std::thread::sleep(SYNC_RETRY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translog::common::Entry;
    use test_log::test;

    #[test]
    fn create_list_delete_domains() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let server = TransLogServer::open("tls", dir.path(), DomainConfig::default())?;

        assert_eq!(0, server.create_domain("music"));
        assert_eq!(0, server.create_domain("books"));
        assert_eq!(0, server.open_domain("music"));
        assert_eq!(-1, server.open_domain("missing"));

        let (code, list) = server.list_domains();
        assert_eq!(0, code);
        assert_eq!("books\nmusic\n", list);

        let (code, _) = server.delete_domain("books");
        assert_eq!(0, code);
        assert_eq!(-1, server.open_domain("books"));
        Ok(())
    }

    #[test]
    fn domains_survive_server_restart() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let server = TransLogServer::open("tls", dir.path(), DomainConfig::default())?;
            server.create_domain("music");

            let mut packet = Packet::new();
            packet.add(&Entry::new(1, 0, b"op".to_vec()))?;
            let (code, message) = server.domain_commit("music", packet.bytes());
            assert_eq!(0, code, "{message}");
        }

        let server = TransLogServer::open("tls", dir.path(), DomainConfig::default())?;
        let (code, begin, end, count) = server.domain_status("music");
        assert_eq!((0, 1, 1, 1), (code, begin, end, count));
        Ok(())
    }
}
