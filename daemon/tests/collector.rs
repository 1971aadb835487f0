//! End-to-end checks over a loopback listener: a daemon on its own
//! thread, real TCP clients, shutdown through the control handle.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use telemd_common::config::Config;
use telemd_daemon::decoder::LineDecoder;
use telemd_daemon::reactor::{Daemon, Handle};

/// Give the reactor time to process what was just sent.
const SETTLE: Duration = Duration::from_millis(400);

fn collector(cfg: Config) -> (SocketAddr, Handle, thread::JoinHandle<()>) {
    let mut daemon = Daemon::new(cfg, LineDecoder).unwrap();
    let addr = daemon.local_addr();
    let handle = daemon.handle();
    let thread = thread::spawn(move || daemon.run().unwrap());
    (addr, handle, thread)
}

fn loopback_config() -> Config {
    Config {
        telemetry_ip: Some("127.0.0.1".into()),
        telemetry_port: Some(0),
        ..Config::default()
    }
}

fn read_records(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

/// True once the remote end has closed the connection.
fn reaches_eof(stream: &mut TcpStream) -> bool {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 16];
    matches!(stream.read(&mut buf), Ok(0))
}

#[test]
fn records_flow_from_peer_to_msglog_file() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        telemetry_max_peers: Some(2),
        telemetry_msglog_file: Some(format!("{}/$peer_src_ip.log", dir.path().display())),
        ..loopback_config()
    };
    let (addr, handle, thread) = collector(cfg);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"{\"ifIndex\": 7}\n").unwrap();
    thread::sleep(SETTLE);

    handle.shutdown();
    thread.join().unwrap();

    let records = read_records(&dir.path().join("127.0.0.1.log"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["event_type"], "log");
    assert_eq!(records[0]["seq"], 1);
    assert_eq!(records[0]["telemetry_node"], "127.0.0.1");
    assert_eq!(records[0]["telemetry_data"]["ifIndex"], 7);
}

#[test]
fn partial_records_are_carried_across_reads() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        telemetry_msglog_file: Some(format!("{}/$peer_src_ip.log", dir.path().display())),
        ..loopback_config()
    };
    let (addr, handle, thread) = collector(cfg);

    let mut client = TcpStream::connect(addr).unwrap();
    // First segment carries no terminator; the record completes in the
    // second one.
    client.write_all(b"{\"half\":").unwrap();
    thread::sleep(SETTLE);
    client.write_all(b" true}\nplain\n").unwrap();
    thread::sleep(SETTLE);

    handle.shutdown();
    thread.join().unwrap();

    let records = read_records(&dir.path().join("127.0.0.1.log"));
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["telemetry_data"]["half"], true);
    assert_eq!(records[1]["telemetry_data"], "plain");
}

#[test]
fn surplus_connection_is_closed_and_count_stays_put() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        telemetry_max_peers: Some(1),
        telemetry_msglog_file: Some(format!("{}/$peer_src_ip.log", dir.path().display())),
        ..loopback_config()
    };
    let (addr, handle, thread) = collector(cfg);

    let mut first = TcpStream::connect(addr).unwrap();
    thread::sleep(SETTLE);

    // The table is full: the second connection is briefly accepted, then
    // dropped without consuming a slot.
    let mut second = TcpStream::connect(addr).unwrap();
    assert!(reaches_eof(&mut second));

    // The established peer is still being serviced.
    first.write_all(b"\"still here\"\n").unwrap();
    thread::sleep(SETTLE);

    handle.shutdown();
    thread.join().unwrap();

    let records = read_records(&dir.path().join("127.0.0.1.log"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["telemetry_data"], "still here");
}

#[test]
fn acl_rejects_sources_outside_the_allow_list() {
    let dir = tempfile::tempdir().unwrap();
    let allow = dir.path().join("allow");
    std::fs::write(&allow, "10.0.0.0/8\n").unwrap();

    let cfg = Config {
        telemetry_allow_file: Some(allow),
        telemetry_msglog_file: Some(format!("{}/$peer_src_ip.log", dir.path().display())),
        ..loopback_config()
    };
    let (addr, handle, thread) = collector(cfg);

    // 127.0.0.1 is not in 10.0.0.0/8: briefly accepted, then closed; no
    // slot is consumed and no record is emitted.
    let mut client = TcpStream::connect(addr).unwrap();
    assert!(reaches_eof(&mut client));

    handle.shutdown();
    thread.join().unwrap();

    assert!(!dir.path().join("127.0.0.1.log").exists());
}

#[test]
fn empty_allow_file_admits_every_source() {
    let dir = tempfile::tempdir().unwrap();
    let allow = dir.path().join("allow");
    std::fs::write(&allow, "# no entries yet\n\n").unwrap();

    let cfg = Config {
        telemetry_allow_file: Some(allow),
        telemetry_msglog_file: Some(format!("{}/$peer_src_ip.log", dir.path().display())),
        ..loopback_config()
    };
    let (addr, handle, thread) = collector(cfg);

    // A configured but entry-less allow file gates nothing.
    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"\"admitted\"\n").unwrap();
    thread::sleep(SETTLE);

    handle.shutdown();
    thread.join().unwrap();

    let records = read_records(&dir.path().join("127.0.0.1.log"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["telemetry_data"], "admitted");
}

#[test]
fn peer_disconnect_frees_the_slot_for_reuse() {
    let cfg = Config {
        telemetry_max_peers: Some(1),
        ..loopback_config()
    };
    let (addr, handle, thread) = collector(cfg);

    let client = TcpStream::connect(addr).unwrap();
    thread::sleep(SETTLE);
    drop(client);
    thread::sleep(SETTLE);

    // The only slot was freed by the disconnect; a new peer takes it.
    let mut replacement = TcpStream::connect(addr).unwrap();
    thread::sleep(SETTLE);
    replacement.write_all(b"x\n").unwrap();
    thread::sleep(SETTLE);

    handle.shutdown();
    thread.join().unwrap();
}

#[test]
fn reload_keeps_appending_to_the_same_file() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        telemetry_msglog_file: Some(format!("{}/$peer_src_ip.log", dir.path().display())),
        ..loopback_config()
    };
    let (addr, handle, thread) = collector(cfg);

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"\"before\"\n").unwrap();
    thread::sleep(SETTLE);

    handle.reload();
    thread::sleep(SETTLE);

    client.write_all(b"\"after\"\n").unwrap();
    thread::sleep(SETTLE);

    handle.shutdown();
    thread.join().unwrap();

    let records = read_records(&dir.path().join("127.0.0.1.log"));
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["telemetry_data"], "before");
    assert_eq!(records[1]["telemetry_data"], "after");
    assert_eq!(records[1]["seq"], 2);
}

#[test]
fn conflicting_msglog_backends_fail_initialization() {
    let cfg = Config {
        telemetry_msglog_file: Some("/tmp/a.log".into()),
        telemetry_msglog_kafka_topic: Some("t".into()),
        ..loopback_config()
    };
    assert!(Daemon::new(cfg, LineDecoder).is_err());
}

#[test]
fn zero_dump_refresh_time_disables_the_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        telemetry_dump_file: Some(format!("{}/$peer_src_ip-dump.json", dir.path().display())),
        telemetry_dump_refresh_time: Some(0),
        ..loopback_config()
    };
    // Initialization succeeds; dumps are simply off.
    let (addr, handle, thread) = collector(cfg);

    let _client = TcpStream::connect(addr).unwrap();
    thread::sleep(SETTLE);

    handle.shutdown();
    thread.join().unwrap();

    assert!(!dir.path().join("127.0.0.1-dump.json").exists());
}
