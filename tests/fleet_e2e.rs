//! End-to-end exercises over loopback: real UDP dispatch loops with the
//! synthetic camera, driven by the fleet client or a bare socket speaking
//! the wire protocol.
//!
//! Multi-server cases bind each daemon to its own 127.0.0.x address with a
//! shared port, which Linux allows without configuration. Discovery uses
//! the 127.0.0.0/24 broadcast address, delivered locally to a wildcard
//! bind.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use camfleet::camera::SyntheticCamera;
use camfleet::client::FleetClient;
use camfleet::config::{ClientConfig, ServerConfig};
use camfleet::protocol::VERSION;
use camfleet::server::CameraServer;
use camfleet::transfer::{TransferLog, TransferStatus};

struct ServerGuard {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ServerGuard {
    fn spawn(bind: SocketAddr) -> Self {
        let config = ServerConfig { bind, ..ServerConfig::default() };
        let mut server = CameraServer::new(&config, Box::new(SyntheticCamera::new())).unwrap();
        let shutdown = server.shutdown_handle();
        let handle = std::thread::spawn(move || {
            let _ = server.run();
        });
        Self { shutdown, handle: Some(handle) }
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn test_client(port: u16, timeout_ms: u64, output: &Path) -> FleetClient {
    let config = ClientConfig {
        network: "127.0.0.0/24".parse().unwrap(),
        port,
        bind: "127.0.0.1:0".parse().unwrap(),
        timeout: Duration::from_millis(timeout_ms),
        output: output.to_path_buf(),
        ..ClientConfig::default()
    };
    FleetClient::new(config).unwrap()
}

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(127, 0, 0, last)
}

#[test]
fn test_broadcast_discovery() {
    let port = free_udp_port();
    let _server = ServerGuard::spawn(format!("0.0.0.0:{port}").parse().unwrap());
    let dir = tempfile::tempdir().unwrap();
    let mut client = test_client(port, 3000, dir.path());

    let found = client.find(1).unwrap();
    assert_eq!(found, vec![ip(1)]);
    assert_eq!(client.servers(), vec![ip(1)]);
}

#[test]
fn test_add_verifies_and_rejects_duplicates() {
    let port = free_udp_port();
    let _server = ServerGuard::spawn(SocketAddr::new(ip(2).into(), port));
    let dir = tempfile::tempdir().unwrap();
    let mut client = test_client(port, 2000, dir.path());

    client.add(ip(2)).unwrap();
    assert!(client.add(ip(2)).is_err(), "duplicate definition must fail");
    assert_eq!(client.servers(), vec![ip(2)]);

    client.remove(ip(2)).unwrap();
    assert!(client.servers().is_empty());
}

#[test]
fn test_uniform_configuration_and_status() {
    let port = free_udp_port();
    let _s1 = ServerGuard::spawn(SocketAddr::new(ip(2).into(), port));
    let _s2 = ServerGuard::spawn(SocketAddr::new(ip(3).into(), port));
    let dir = tempfile::tempdir().unwrap();
    let mut client = test_client(port, 2000, dir.path());
    client.add(ip(2)).unwrap();
    client.add(ip(3)).unwrap();
    let both = [ip(2), ip(3)];

    let outcome = client.resolution(640, 480, Some(&both)).unwrap();
    assert!(outcome.fully_ok());

    let status = client.status(Some(&both)).unwrap();
    assert!(status.fully_ok());
    for report in status.ok.values() {
        assert_eq!((report.width, report.height), (640, 480));
        assert_eq!(report.images, 0);
    }

    // out-of-range argument: both servers answer ERROR, state untouched
    let bad = client.levels(200, 0, 0, 0, Some(&both)).unwrap();
    assert!(bad.ok.is_empty());
    assert_eq!(bad.failed.len(), 2);
    for reason in bad.failed.values() {
        assert!(reason.contains("brightness"), "{reason}");
    }
    let status = client.status(Some(&both)).unwrap();
    for report in status.ok.values() {
        assert_eq!(report.brightness, 50);
    }
}

#[test]
fn test_synchronised_capture() {
    let port = free_udp_port();
    let _s1 = ServerGuard::spawn(SocketAddr::new(ip(4).into(), port));
    let _s2 = ServerGuard::spawn(SocketAddr::new(ip(5).into(), port));
    let dir = tempfile::tempdir().unwrap();
    let mut client = test_client(port, 3000, dir.path());
    client.add(ip(4)).unwrap();
    client.add(ip(5)).unwrap();
    let both = [ip(4), ip(5)];

    let outcome = client.capture(1, false, Some(0.3), Some(&both)).unwrap();
    assert!(outcome.fully_ok(), "{:?}", outcome.failed);

    let listing = client.list(Some(&both)).unwrap();
    assert!(listing.fully_ok());
    let images_a = &listing.ok[&ip(4)];
    let images_b = &listing.ok[&ip(5)];
    assert_eq!(images_a.len(), 1);
    assert_eq!(images_b.len(), 1);
    assert_eq!(images_a[0].index, 0);
    assert_eq!(images_b[0].index, 0);

    // both waited for the same wall-clock target
    let drift = (images_a[0].timestamp - images_b[0].timestamp).abs();
    assert!(drift < 0.1, "capture timestamps drifted {drift:.3}s apart");
}

#[test]
fn test_capture_sync_in_past_is_rejected() {
    let port = free_udp_port();
    let _server = ServerGuard::spawn(SocketAddr::new(ip(6).into(), port));
    let dir = tempfile::tempdir().unwrap();
    let mut client = test_client(port, 2000, dir.path());
    client.add(ip(6)).unwrap();

    let outcome = client.capture(1, false, Some(-5.0), Some(&[ip(6)])).unwrap();
    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.failed[&ip(6)].contains("sync time in past"));
}

#[test]
fn test_download_and_clear() {
    let port = free_udp_port();
    let _server = ServerGuard::spawn(SocketAddr::new(ip(1).into(), port));
    let dir = tempfile::tempdir().unwrap();
    let mut client = test_client(port, 3000, dir.path());
    client.add(ip(1)).unwrap();
    let target = [ip(1)];

    client.capture(2, false, None, Some(&target)).unwrap();
    let listing = client.list(Some(&target)).unwrap();
    let images = listing.ok[&ip(1)].clone();
    assert_eq!(images.len(), 2);

    // low-level single-image fetch leaves the store untouched
    let mut sink: Vec<u8> = Vec::new();
    let bytes = client.send(ip(1), 0, &mut sink).unwrap();
    assert_eq!(bytes, images[0].size);
    assert_eq!(sink.len() as u64, images[0].size);
    assert_eq!(&sink[..2], &[0xFF, 0xD8]);
    let listing = client.list(Some(&target)).unwrap();
    assert_eq!(listing.ok[&ip(1)].len(), 2);

    // high-level download fetches everything, then clears the server
    let outcome = client.download(Some(&target), None).unwrap();
    assert!(outcome.fully_ok(), "{:?}", outcome.failed);
    let paths = &outcome.ok[&ip(1)];
    assert_eq!(paths.len(), 2);
    for (path, image) in paths.iter().zip(&images) {
        let data = std::fs::read(path).unwrap();
        assert_eq!(data.len() as u64, image.size);
    }

    let listing = client.list(Some(&target)).unwrap();
    assert!(listing.ok[&ip(1)].is_empty(), "store should be cleared");

    let entries = TransferLog::new(dir.path()).read_log().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == TransferStatus::Completed));
}

#[test]
fn test_send_with_invalid_index_fails_cleanly() {
    let port = free_udp_port();
    let _server = ServerGuard::spawn(SocketAddr::new(ip(1).into(), port));
    let dir = tempfile::tempdir().unwrap();
    let mut client = test_client(port, 2000, dir.path());
    client.add(ip(1)).unwrap();

    let mut sink: Vec<u8> = Vec::new();
    let result = client.send(ip(1), 5, &mut sink);
    assert!(result.is_err());
    assert!(sink.is_empty(), "failed transfer must not touch the sink");
}

#[test]
fn test_partial_failure_keeps_fleet_usable() {
    let port = free_udp_port();
    let _s1 = ServerGuard::spawn(SocketAddr::new(ip(7).into(), port));
    let _s2 = ServerGuard::spawn(SocketAddr::new(ip(8).into(), port));
    let doomed = ServerGuard::spawn(SocketAddr::new(ip(9).into(), port));
    let dir = tempfile::tempdir().unwrap();
    let mut client = test_client(port, 1000, dir.path());
    client.add(ip(7)).unwrap();
    client.add(ip(8)).unwrap();
    client.add(ip(9)).unwrap();

    drop(doomed); // unplug one server after it joined the fleet

    let all = [ip(7), ip(8), ip(9)];
    let outcome = client.status(Some(&all)).unwrap();
    assert_eq!(outcome.ok.len(), 2);
    assert_eq!(outcome.failed.len(), 1);
    assert!(outcome.failed[&ip(9)].contains("no response"));

    // the surviving sessions keep working
    let capture = client.capture(1, false, None, Some(&[ip(7), ip(8)])).unwrap();
    assert!(capture.fully_ok(), "{:?}", capture.failed);
}

// ---------------------------------------------------------------------
// Bare-socket protocol exercises
// ---------------------------------------------------------------------

struct RawClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl RawClient {
    fn new(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(800)))
            .unwrap();
        Self { socket, server }
    }

    fn send(&self, frame: &str) {
        self.socket.send_to(frame.as_bytes(), self.server).unwrap();
    }

    fn recv(&self) -> Option<String> {
        let mut buf = [0u8; 2048];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => Some(String::from_utf8(buf[..len].to_vec()).unwrap()),
            Err(_) => None,
        }
    }

    /// Receive frames until one starts with `prefix`, discarding stray
    /// retransmissions of earlier responses.
    fn recv_matching(&self, prefix: &str) -> Option<String> {
        for _ in 0..10 {
            match self.recv() {
                Some(frame) if frame.starts_with(prefix) => return Some(frame),
                Some(_) => continue,
                None => return None,
            }
        }
        None
    }

    /// Receive and discard frames for `window`.
    fn drain(&self, window: Duration) {
        let end = std::time::Instant::now() + window;
        while std::time::Instant::now() < end {
            let _ = self.recv();
        }
    }
}

#[test]
fn test_server_retries_response_until_acked() {
    let port = free_udp_port();
    let _server = ServerGuard::spawn(SocketAddr::new(ip(1).into(), port));
    let raw = RawClient::new(SocketAddr::new(ip(1).into(), port));

    raw.send("1 HELLO 1000.0");
    let first = raw.recv().unwrap();
    assert_eq!(first, format!("1 OK\nVERSION {VERSION}"));

    // no ACK sent: the response must come around again
    let retry = raw.recv().expect("expected a retransmission");
    assert_eq!(retry, first);

    // after the ACK the retries stop within one retry interval
    raw.send("1 ACK");
    raw.drain(Duration::from_millis(500));
    assert!(raw.recv().is_none(), "server kept retrying after ACK");
}

#[test]
fn test_duplicate_command_returns_cached_response() {
    let port = free_udp_port();
    let _server = ServerGuard::spawn(SocketAddr::new(ip(1).into(), port));
    let raw = RawClient::new(SocketAddr::new(ip(1).into(), port));

    raw.send("1 HELLO 1000.0");
    raw.recv().unwrap();
    raw.send("1 ACK");

    raw.send("2 CAPTURE");
    let first = raw.recv_matching("2 ").unwrap();
    assert_eq!(first, "2 OK");
    raw.send("2 ACK");

    // replayed command: identical cached frame, no second capture
    raw.send("2 CAPTURE");
    assert_eq!(raw.recv_matching("2 ").unwrap(), first);
    raw.send("2 ACK");
    raw.drain(Duration::from_millis(500));

    raw.send("3 LIST");
    let listing = raw.recv_matching("3 ").unwrap();
    raw.send("3 ACK");
    let image_lines = listing.lines().filter(|l| l.starts_with("IMAGE")).count();
    assert_eq!(image_lines, 1, "duplicate CAPTURE must not run twice: {listing:?}");
}

#[test]
fn test_stale_hello_and_stale_sequences_ignored() {
    let port = free_udp_port();
    let _server = ServerGuard::spawn(SocketAddr::new(ip(1).into(), port));
    let raw = RawClient::new(SocketAddr::new(ip(1).into(), port));

    raw.send("50 HELLO 2000.0");
    assert!(raw.recv().unwrap().starts_with("50 OK"));
    raw.send("50 ACK");
    raw.drain(Duration::from_millis(500));

    // HELLO with an older timestamp: silently dropped
    raw.send("7 HELLO 1500.0");
    assert!(raw.recv().is_none());

    // sequence numbers at or below the session base stay dead
    raw.send("40 STATUS");
    assert!(raw.recv().is_none());

    raw.send("51 STATUS");
    let reply = raw.recv_matching("51 ").unwrap();
    assert!(reply.starts_with("51 OK"), "{reply:?}");
    raw.send("51 ACK");
}

#[test]
fn test_malformed_frames_get_error_responses() {
    let port = free_udp_port();
    let _server = ServerGuard::spawn(SocketAddr::new(ip(1).into(), port));
    let raw = RawClient::new(SocketAddr::new(ip(1).into(), port));

    raw.send("9 FOO");
    let reply = raw.recv().unwrap();
    assert!(reply.starts_with("9 ERROR\n"), "{reply:?}");
    assert!(reply.contains("unknown command FOO"));
    raw.send("9 ACK");
}
