use grist::translog::{
    Destination, DomainConfig, Entry, Packet, SerialNum, TransLogServer,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CollectorState {
    entries: Vec<(SerialNum, Vec<u8>)>,
    done: bool,
}

#[derive(Clone, Default)]
struct Collector {
    state: Arc<Mutex<CollectorState>>,
}

impl Collector {
    fn wait_done(&self) -> Vec<(SerialNum, Vec<u8>)> {
        for _ in 0..500 {
            {
                let state = self.state.lock().unwrap();
                if state.done {
                    return state.entries.clone();
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("visitor did not finish in time");
    }
}

impl Destination for Collector {
    fn send(&mut self, _session_id: i32, _domain: &str, packet: Packet) -> bool {
        let mut state = self.state.lock().unwrap();
        for entry in packet.entries().expect("visited packets are well-formed") {
            state.entries.push((entry.serial(), entry.data().to_vec()));
        }
        true
    }

    fn send_done(&mut self, _session_id: i32, _domain: &str) -> bool {
        self.state.lock().unwrap().done = true;
        true
    }

    fn connected(&self) -> bool {
        true
    }

    fn ok(&self) -> bool {
        true
    }
}

fn packet_with(serials: &[SerialNum], payload_len: usize) -> Packet {
    let mut packet = Packet::new();
    for serial in serials {
        packet
            .add(&Entry::new(*serial, 1, vec![*serial as u8; payload_len]))
            .expect("strictly increasing serials");
    }
    packet
}

fn visit_all(server: &TransLogServer, domain: &str, from: u64, to: u64) -> Vec<(u64, Vec<u8>)> {
    let collector = Collector::default();
    let session = server.domain_visit(domain, from, to, Box::new(collector.clone()));
    assert!(session > 0);
    assert_eq!(0, server.domain_session_run(domain, session));
    let entries = collector.wait_done();
    server.domain_session_close(domain, session);
    entries
}

#[test_log::test]
fn server_roundtrip() -> grist::Result<()> {
    let folder = tempfile::tempdir()?;
    let server = TransLogServer::open("tls", folder.path(), DomainConfig::default())?;

    assert_eq!(0, server.create_domain("d"));

    let packet = packet_with(&[100, 101, 102], 64);
    let (code, message) = server.domain_commit("d", packet.bytes());
    assert_eq!(0, code, "{message}");

    let (code, begin, end, count) = server.domain_status("d");
    assert_eq!(0, code);
    assert_eq!((100, 102, 3), (begin, end, count));

    let entries = visit_all(&server, "d", 99, 102);
    let serials: Vec<u64> = entries.iter().map(|(serial, _)| *serial).collect();
    assert_eq!(vec![100, 101, 102], serials);

    let (code, synced_to) = server.domain_sync("d", 102);
    assert_eq!(0, code);
    assert_eq!(102, synced_to);
    Ok(())
}

#[test_log::test]
fn visit_yields_append_order() -> grist::Result<()> {
    let folder = tempfile::tempdir()?;
    let server = TransLogServer::open("tls", folder.path(), DomainConfig::default())?;
    server.create_domain("d");

    // many packets with gaps in the serial space
    let mut expected = Vec::new();
    let mut serial = 1u64;
    for batch in 0..50u64 {
        let serials: Vec<u64> = (0..=(batch % 3)).map(|i| serial + i).collect();
        serial += 5;
        let packet = packet_with(&serials, 16);
        expected.extend(serials);
        let (code, message) = server.domain_commit("d", packet.bytes());
        assert_eq!(0, code, "{message}");
    }

    let entries = visit_all(&server, "d", 0, u64::MAX);
    let serials: Vec<u64> = entries.iter().map(|(serial, _)| *serial).collect();
    assert_eq!(expected, serials);
    Ok(())
}

#[test_log::test]
fn visit_sub_range_filters_entries() -> grist::Result<()> {
    let folder = tempfile::tempdir()?;
    let server = TransLogServer::open("tls", folder.path(), DomainConfig::default())?;
    server.create_domain("d");

    for serial in 1..=20u64 {
        let (code, _) = server.domain_commit("d", packet_with(&[serial], 8).bytes());
        assert_eq!(0, code);
    }

    // (5, 15]: entries following `from`, up to and including `to`
    let entries = visit_all(&server, "d", 5, 15);
    let serials: Vec<u64> = entries.iter().map(|(serial, _)| *serial).collect();
    assert_eq!((6..=15).collect::<Vec<u64>>(), serials);
    Ok(())
}

#[test_log::test]
fn prune_is_blocked_by_active_visitors_and_erases_otherwise() -> grist::Result<()> {
    let folder = tempfile::tempdir()?;
    let config = DomainConfig::default().with_part_size_limit(256);
    let server = TransLogServer::open("tls", folder.path(), config)?;
    server.create_domain("d");

    for serial in 1..=30u64 {
        let (code, _) = server.domain_commit("d", packet_with(&[serial], 64).bytes());
        assert_eq!(0, code);
    }

    // a registered but not-yet-synced visitor holds serial 1
    let collector = Collector::default();
    let session = server.domain_visit("d", 0, 30, Box::new(collector.clone()));
    assert!(session > 0);
    assert_eq!(1, server.domain_prune("d", 20));

    // drain the visitor, then prune goes through
    assert_eq!(0, server.domain_session_run("d", session));
    collector.wait_done();
    assert_eq!(0, server.domain_prune("d", 20));
    server.domain_session_close("d", session);

    let (code, begin, end, _) = server.domain_status("d");
    assert_eq!(0, code);
    assert!(begin >= 20 || begin > 1, "begin was {begin}");
    assert_eq!(30, end);
    Ok(())
}

#[test_log::test]
fn concurrent_visitor_sees_a_prefix_of_the_write_history() -> grist::Result<()> {
    let folder = tempfile::tempdir()?;
    let server = Arc::new(TransLogServer::open(
        "tls",
        folder.path(),
        DomainConfig::default(),
    )?);
    server.create_domain("d");

    for serial in 1..=10u64 {
        let (code, _) = server.domain_commit("d", packet_with(&[serial], 8).bytes());
        assert_eq!(0, code);
    }

    // writer keeps appending while the visitor drains
    let writer = {
        let server = Arc::clone(&server);
        std::thread::spawn(move || {
            for serial in 11..=60u64 {
                let (code, _) = server.domain_commit("d", packet_with(&[serial], 8).bytes());
                assert_eq!(0, code);
            }
        })
    };

    let entries = visit_all(&server, "d", 0, u64::MAX);
    writer.join().expect("writer thread");

    let serials: Vec<u64> = entries.iter().map(|(serial, _)| *serial).collect();
    assert!(serials.len() >= 10);
    let prefix: Vec<u64> = (1..=serials.len() as u64).collect();
    assert_eq!(prefix, serials);
    Ok(())
}
