//! Transport: the broadcast-capable UDP endpoint both sides talk through,
//! the deadline queue driving retransmissions, and the TCP side-channel
//! that carries image payloads.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::Rng;

use crate::protocol::{timing, MAX_DATAGRAM};

/// Randomised gap before the next repeat of a transmission. Uniform jitter
/// keeps a fleet's retries from colliding.
pub fn retry_jitter() -> Duration {
    let min = timing::RETRY_MIN.as_secs_f64();
    let max = timing::RETRY_MAX.as_secs_f64();
    Duration::from_secs_f64(rand::thread_rng().gen_range(min..max))
}

/// A bound UDP socket with broadcast enabled, shared by the client
/// coordinator and the server dispatch loop.
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    pub fn bind(bind: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind).with_context(|| format!("bind udp {bind}"))?;
        socket.set_broadcast(true).context("enable SO_BROADCAST")?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn send_to(&self, frame: &str, dest: SocketAddr) -> Result<()> {
        log::debug!("{dest} < {frame:?}");
        self.socket
            .send_to(frame.as_bytes(), dest)
            .with_context(|| format!("send to {dest}"))?;
        Ok(())
    }

    /// Wait up to `timeout` for one datagram. `Ok(None)` means the timeout
    /// elapsed; malformed (non-UTF-8) payloads are dropped with a warning
    /// and also report `Ok(None)` so callers treat them as silence.
    pub fn recv(&self, timeout: Duration) -> Result<Option<(String, SocketAddr)>> {
        // zero would mean "block forever" to the OS
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buf = [0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((len, source)) => match std::str::from_utf8(&buf[..len]) {
                Ok(frame) => {
                    log::debug!("{source} > {frame:?}");
                    Ok(Some((frame.to_string(), source)))
                }
                Err(_) => {
                    log::warn!("dropping non-ASCII datagram from {source}");
                    Ok(None)
                }
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e).context("udp receive"),
        }
    }
}

/// Deadline queue for pending retransmissions: one entry per outstanding
/// transmission, serviced by the owning event loop. Entries are keyed so a
/// delivered transmission can simply be forgotten; stale pops are filtered
/// by the caller against its live set.
pub struct RetryQueue<K: Ord> {
    heap: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K: Ord> RetryQueue<K> {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new() }
    }

    pub fn schedule(&mut self, key: K, after: Duration) {
        self.heap.push(Reverse((Instant::now() + after, key)));
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((when, _))| *when)
    }

    /// Pop the next entry whose deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<K> {
        match self.heap.peek() {
            Some(Reverse((when, _))) if *when <= now => {
                self.heap.pop().map(|Reverse((_, key))| key)
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<K: Ord> Default for RetryQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Server side of a download: connect back to the client and stream the
/// image bytes. EOF delimits; there is no framing.
pub fn stream_image(ip: IpAddr, port: u16, data: &[u8]) -> Result<()> {
    let dest = SocketAddr::new(ip, port);
    let mut stream = TcpStream::connect_timeout(&dest, timing::DELIVERY_TIMEOUT)
        .with_context(|| format!("connect to {dest}"))?;
    stream.set_write_timeout(Some(timing::DELIVERY_TIMEOUT))?;
    stream
        .write_all(data)
        .with_context(|| format!("stream {} bytes to {dest}", data.len()))?;
    stream.flush()?;
    Ok(())
}

/// Client side of a download: a short-lived accept socket bound for the
/// duration of one SEND exchange.
pub struct DownloadListener {
    listener: TcpListener,
}

impl DownloadListener {
    pub fn bind(bind_ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(bind_ip, port))
            .with_context(|| format!("bind download listener on port {port}"))?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept one connection from `expected`, discarding connections from
    /// anyone else, until `deadline`.
    pub fn accept_from(&self, expected: IpAddr, deadline: Instant) -> Result<TcpStream> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if peer.ip() == expected {
                        stream.set_nonblocking(false)?;
                        stream.set_read_timeout(Some(timing::DELIVERY_TIMEOUT))?;
                        return Ok(stream);
                    }
                    log::warn!("ignoring image connection from unexpected {peer}");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        bail!("timed out waiting for image connection from {expected}");
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e).context("accept image connection"),
            }
        }
    }
}

/// Drain a download stream into `sink`, returning the byte count.
pub fn read_image(stream: &mut TcpStream, sink: &mut dyn Write) -> Result<u64> {
    let mut buf = [0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf).context("read image stream")?;
        if n == 0 {
            return Ok(total);
        }
        sink.write_all(&buf[..n]).context("write image to sink")?;
        total += n as u64;
    }
}
