//! Client coordinator: owns the peer set, fans commands out by broadcast or
//! per-peer unicast, runs the retry/collect loop, and drives downloads.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use chrono::{TimeZone, Utc};
use indicatif::ProgressBar;

use crate::config::ClientConfig;
use crate::net::{self, DownloadListener, RetryQueue, UdpEndpoint};
use crate::protocol::{
    parse_image_list, AgcMode, AwbMode, Command, ExposureMode, Fraction, ImageInfo,
    MeteringMode, Response, ResponseKind, StatusReport, VERSION,
};
use crate::transfer::{TransferLog, TransferLogEntry, TransferStatus};
use crate::unix_time;

/// Client-side record of one server.
struct Peer {
    /// Next sequence number to allocate for this peer.
    next_seq: u64,
    /// HELLO timestamp the server accepted when the session started.
    hello_time: f64,
    /// Display order (discovery order).
    ordinal: usize,
}

/// Partial results of a fleet operation, keyed by address. Failures are
/// aggregated here rather than raised so callers can tell successful peers
/// from failed ones.
#[derive(Debug)]
pub struct FleetResult<T> {
    pub ok: BTreeMap<Ipv4Addr, T>,
    pub failed: BTreeMap<Ipv4Addr, String>,
}

impl<T> FleetResult<T> {
    fn new() -> Self {
        Self { ok: BTreeMap::new(), failed: BTreeMap::new() }
    }

    pub fn fully_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One datagram to (re)transmit, and the peers it satisfies. A broadcast
/// job covers every target; unicast jobs cover exactly one.
struct SendJob {
    dest: SocketAddr,
    frame: String,
    covers: Vec<Ipv4Addr>,
}

enum Expect {
    /// Wait for each listed peer to answer with the given sequence number.
    Peers(BTreeMap<Ipv4Addr, u64>),
    /// Discovery: accept answers from anywhere on the subnet; stop once
    /// `count` arrived (0 runs out the clock).
    Discovery { seq: u64, count: usize },
}

pub struct FleetClient {
    config: ClientConfig,
    endpoint: UdpEndpoint,
    peers: BTreeMap<Ipv4Addr, Peer>,
    next_ordinal: usize,
    /// Highest sequence number ever placed on the wire; HELLO restarts
    /// above it so sessions never move backwards.
    seq_floor: u64,
    /// Monotonic guard for HELLO timestamps.
    last_hello: f64,
}

impl FleetClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = UdpEndpoint::bind(config.bind)?;
        Ok(Self {
            config,
            endpoint,
            peers: BTreeMap::new(),
            next_ordinal: 0,
            seq_floor: 0,
            last_hello: 0.0,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// HELLO timestamp a server accepted when its session started.
    pub fn session_start(&self, address: Ipv4Addr) -> Option<f64> {
        self.peers.get(&address).map(|peer| peer.hello_time)
    }

    /// Known servers in discovery order.
    pub fn servers(&self) -> Vec<Ipv4Addr> {
        let mut list: Vec<(usize, Ipv4Addr)> = self
            .peers
            .iter()
            .map(|(addr, peer)| (peer.ordinal, *addr))
            .collect();
        list.sort();
        list.into_iter().map(|(_, addr)| addr).collect()
    }

    // ------------------------------------------------------------------
    // Fleet management
    // ------------------------------------------------------------------

    fn next_hello(&mut self) -> (u64, f64) {
        let seq = self.seq_floor + 1;
        self.seq_floor = seq;
        let mut ts = unix_time();
        if ts <= self.last_hello {
            ts = self.last_hello + 1e-6;
        }
        self.last_hello = ts;
        (seq, ts)
    }

    fn accept_hello(&mut self, ip: Ipv4Addr, response: &Response, seq: u64, ts: f64) -> bool {
        match &response.kind {
            ResponseKind::Ok(data) => {
                if data.trim() == format!("VERSION {VERSION}") {
                    let ordinal = self.next_ordinal;
                    self.next_ordinal += 1;
                    self.peers
                        .insert(ip, Peer { next_seq: seq + 1, hello_time: ts, ordinal });
                    true
                } else {
                    log::warn!("{ip}: rejected, version mismatch (got {data:?})");
                    false
                }
            }
            ResponseKind::Error(message) => {
                log::warn!("{ip}: HELLO failed: {message}");
                false
            }
        }
    }

    /// Discover servers by broadcasting HELLO, replacing the current peer
    /// set. Returns as soon as `count` servers answered, or when the
    /// timeout expires (`count` 0 always waits the full timeout).
    pub fn find(&mut self, count: usize) -> Result<Vec<Ipv4Addr>> {
        self.peers.clear();
        self.next_ordinal = 0;
        let (seq, ts) = self.next_hello();
        let frame = Command::Hello { timestamp: ts }.encode(seq);
        let dest = SocketAddr::new(
            IpAddr::V4(self.config.network.broadcast()),
            self.config.port,
        );
        let jobs = vec![SendJob { dest, frame, covers: Vec::new() }];
        let responses = self.collect(jobs, Expect::Discovery { seq, count })?;
        for (ip, response) in responses {
            self.accept_hello(ip, &response, seq, ts);
        }
        let found = self.servers();
        log::info!("found {} server(s)", found.len());
        Ok(found)
    }

    /// Define a server explicitly, verifying it answers HELLO first.
    pub fn add(&mut self, address: Ipv4Addr) -> Result<()> {
        if self.peers.contains_key(&address) {
            bail!("server {address} is already defined");
        }
        let (seq, ts) = self.next_hello();
        let frame = Command::Hello { timestamp: ts }.encode(seq);
        let jobs = vec![SendJob {
            dest: SocketAddr::new(IpAddr::V4(address), self.config.port),
            frame,
            covers: vec![address],
        }];
        let mut expect = BTreeMap::new();
        expect.insert(address, seq);
        let responses = self.collect(jobs, Expect::Peers(expect))?;
        match responses.get(&address) {
            Some(response) if self.accept_hello(address, response, seq, ts) => Ok(()),
            Some(_) => bail!("server {address} rejected"),
            None => bail!("no response from {address}"),
        }
    }

    /// Forget a server. Nothing is sent; the server keeps acting on
    /// broadcasts until it is shut down.
    pub fn remove(&mut self, address: Ipv4Addr) -> Result<()> {
        if self.peers.remove(&address).is_none() {
            bail!("server {address} is not defined");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // The retry/collect engine
    // ------------------------------------------------------------------

    fn collect(
        &self,
        jobs: Vec<SendJob>,
        expect: Expect,
    ) -> Result<BTreeMap<Ipv4Addr, Response>> {
        let deadline = Instant::now() + self.config.timeout;
        let mut responses: BTreeMap<Ipv4Addr, Response> = BTreeMap::new();
        let mut pending: BTreeMap<Ipv4Addr, u64> = match &expect {
            Expect::Peers(map) => map.clone(),
            Expect::Discovery { .. } => BTreeMap::new(),
        };
        let mut retries: RetryQueue<usize> = RetryQueue::new();

        for (i, job) in jobs.iter().enumerate() {
            self.endpoint.send_to(&job.frame, job.dest)?;
            retries.schedule(i, net::retry_jitter());
        }

        loop {
            let done = match &expect {
                Expect::Peers(_) => pending.is_empty(),
                Expect::Discovery { count, .. } => *count > 0 && responses.len() >= *count,
            };
            if done {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            while let Some(i) = retries.pop_due(now) {
                let job = &jobs[i];
                let still_wanted = match &expect {
                    Expect::Peers(_) => job.covers.iter().any(|a| pending.contains_key(a)),
                    Expect::Discovery { .. } => true,
                };
                if still_wanted {
                    self.endpoint.send_to(&job.frame, job.dest)?;
                    retries.schedule(i, net::retry_jitter());
                }
            }
            let wake = match retries.next_deadline() {
                Some(next) => next.min(deadline),
                None => deadline,
            };
            let wait = wake.saturating_duration_since(now);
            if let Some((frame, source)) = self.endpoint.recv(wait)? {
                self.process_datagram(&frame, source, &expect, &mut pending, &mut responses);
            }
        }
        Ok(responses)
    }

    fn process_datagram(
        &self,
        frame: &str,
        source: SocketAddr,
        expect: &Expect,
        pending: &mut BTreeMap<Ipv4Addr, u64>,
        responses: &mut BTreeMap<Ipv4Addr, Response>,
    ) {
        let IpAddr::V4(ip) = source.ip() else {
            log::warn!("{source}: ignoring non-IPv4 response");
            return;
        };
        if source.port() != self.config.port {
            log::warn!("{source}: response from unexpected port");
            return;
        }
        let response = match Response::parse(frame) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("{source}: dropping malformed response: {e:#}");
                return;
            }
        };
        // the ACK only goes to responders this exchange is tracking; an
        // unrecognized address gets nothing and its server times out
        match expect {
            Expect::Discovery { seq, .. } => {
                if !self.config.network.contains(ip) {
                    log::warn!("{ip}: response from outside {}", self.config.network);
                    return;
                }
                self.ack(response.seq, source);
                if response.seq != *seq {
                    log::warn!("{ip}: response for wrong sequence {}", response.seq);
                    return;
                }
                if responses.contains_key(&ip) {
                    log::debug!("{ip}: repeated response dropped");
                    return;
                }
                responses.insert(ip, response);
            }
            Expect::Peers(_) => match pending.get(&ip) {
                Some(&expected) => {
                    self.ack(response.seq, source);
                    if response.seq < expected {
                        log::warn!("{ip}: stale response {} dropped", response.seq);
                    } else if response.seq > expected {
                        log::warn!("{ip}: future response {} dropped", response.seq);
                    } else {
                        pending.remove(&ip);
                        responses.insert(ip, response);
                    }
                }
                None => {
                    if responses.contains_key(&ip) {
                        // repeat of a response already recorded: re-ACK so
                        // the server stops retrying, drop the body
                        self.ack(response.seq, source);
                        log::debug!("{ip}: repeated response dropped");
                    } else {
                        log::warn!("{ip}: response from unknown server");
                    }
                }
            },
        }
    }

    fn ack(&self, seq: u64, source: SocketAddr) {
        let ack = Command::Ack.encode(seq);
        if let Err(e) = self.endpoint.send_to(&ack, source) {
            log::warn!("{source}: ACK failed: {e:#}");
        }
    }

    /// Issue one command to the fleet. No explicit addresses means a single
    /// subnet broadcast to every known peer; explicit addresses go out as
    /// one unicast each.
    fn transact(
        &mut self,
        command: Command,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<String>> {
        let targets: Vec<Ipv4Addr> = match addresses {
            None => {
                if self.peers.is_empty() {
                    bail!("no servers defined; run find or add first");
                }
                self.peers.keys().copied().collect()
            }
            Some(addrs) => {
                if addrs.is_empty() {
                    bail!("empty address list");
                }
                for addr in addrs {
                    if !self.peers.contains_key(addr) {
                        bail!("server {addr} is not defined");
                    }
                }
                addrs.to_vec()
            }
        };

        let mut jobs = Vec::new();
        let mut expect = BTreeMap::new();
        if addresses.is_none() {
            // a single datagram serves every peer, so it carries the highest
            // of their next sequence numbers to stay monotonic for each
            let seq = targets
                .iter()
                .filter_map(|a| self.peers.get(a).map(|p| p.next_seq))
                .max()
                .unwrap_or(self.seq_floor + 1);
            let dest = SocketAddr::new(
                IpAddr::V4(self.config.network.broadcast()),
                self.config.port,
            );
            jobs.push(SendJob { dest, frame: command.encode(seq), covers: targets.clone() });
            for addr in &targets {
                if let Some(peer) = self.peers.get_mut(addr) {
                    peer.next_seq = seq + 1;
                }
                expect.insert(*addr, seq);
            }
            self.seq_floor = self.seq_floor.max(seq);
        } else {
            for addr in &targets {
                let Some(peer) = self.peers.get_mut(addr) else { continue };
                let seq = peer.next_seq;
                peer.next_seq = seq + 1;
                jobs.push(SendJob {
                    dest: SocketAddr::new(IpAddr::V4(*addr), self.config.port),
                    frame: command.encode(seq),
                    covers: vec![*addr],
                });
                expect.insert(*addr, seq);
                self.seq_floor = self.seq_floor.max(seq);
            }
        }

        let mut responses = self.collect(jobs, Expect::Peers(expect))?;
        let mut result = FleetResult::new();
        for addr in &targets {
            match responses.remove(addr) {
                Some(Response { kind: ResponseKind::Ok(data), .. }) => {
                    result.ok.insert(*addr, data);
                }
                Some(Response { kind: ResponseKind::Error(message), .. }) => {
                    result.failed.insert(*addr, format!("server error: {message}"));
                }
                None => {
                    result.failed.insert(*addr, "no response within timeout".to_string());
                }
            }
        }
        if !result.failed.is_empty() {
            log::warn!(
                "{} of {} server(s) did not complete the command",
                result.failed.len(),
                targets.len()
            );
        }
        Ok(result)
    }

    fn simple(
        &mut self,
        command: Command,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<()>> {
        let raw = self.transact(command, addresses)?;
        Ok(FleetResult {
            ok: raw.ok.into_keys().map(|addr| (addr, ())).collect(),
            failed: raw.failed,
        })
    }

    // ------------------------------------------------------------------
    // Protocol operations
    // ------------------------------------------------------------------

    /// Query every target's status and warn about fleet-level
    /// discrepancies without failing on them.
    pub fn status(&mut self, addresses: Option<&[Ipv4Addr]>) -> Result<FleetResult<StatusReport>> {
        let raw = self.transact(Command::Status, addresses)?;
        let mut result = FleetResult::new();
        result.failed = raw.failed;
        for (addr, data) in raw.ok {
            match StatusReport::parse(&data) {
                Ok(report) => {
                    result.ok.insert(addr, report);
                }
                Err(e) => {
                    result.failed.insert(addr, format!("invalid status response: {e:#}"));
                }
            }
        }
        self.flag_discrepancies(&result.ok);
        Ok(result)
    }

    fn flag_discrepancies(&self, reports: &BTreeMap<Ipv4Addr, StatusReport>) {
        if reports.len() < 2 {
            return;
        }
        let warn_if_mixed = |name: &str, values: Vec<String>| {
            if values.windows(2).any(|w| w[0] != w[1]) {
                log::warn!("servers disagree on {name}: {}", values.join(", "));
            }
        };
        warn_if_mixed(
            "resolution",
            reports.values().map(|r| format!("{}x{}", r.width, r.height)).collect(),
        );
        warn_if_mixed(
            "framerate",
            reports.values().map(|r| r.framerate.to_string()).collect(),
        );
        warn_if_mixed(
            "AWB mode",
            reports.values().map(|r| r.awb_mode.to_string()).collect(),
        );
        warn_if_mixed(
            "exposure mode",
            reports.values().map(|r| r.exposure_mode.to_string()).collect(),
        );
        warn_if_mixed(
            "metering mode",
            reports.values().map(|r| r.metering_mode.to_string()).collect(),
        );
        let min_ts = reports
            .values()
            .map(|r| r.timestamp)
            .fold(f64::INFINITY, f64::min);
        for (addr, report) in reports {
            let drift = report.timestamp - min_ts;
            if drift > self.config.time_delta {
                log::warn!("{addr}: clock differs from the fleet minimum by {drift:.3}s");
            }
        }
    }

    pub fn resolution(
        &mut self,
        width: u32,
        height: u32,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<()>> {
        self.simple(Command::Resolution { width, height }, addresses)
    }

    pub fn framerate(
        &mut self,
        rate: Fraction,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<()>> {
        self.simple(Command::Framerate { rate }, addresses)
    }

    pub fn awb(
        &mut self,
        mode: AwbMode,
        gains: Option<(f64, f64)>,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<()>> {
        self.simple(Command::Awb { mode, gains }, addresses)
    }

    pub fn exposure(
        &mut self,
        mode: ExposureMode,
        speed: Option<f64>,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<()>> {
        self.simple(Command::Exposure { mode, speed }, addresses)
    }

    pub fn iso(&mut self, iso: u32, addresses: Option<&[Ipv4Addr]>) -> Result<FleetResult<()>> {
        self.simple(Command::Iso { iso }, addresses)
    }

    pub fn metering(
        &mut self,
        mode: MeteringMode,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<()>> {
        self.simple(Command::Metering { mode }, addresses)
    }

    pub fn levels(
        &mut self,
        brightness: i32,
        contrast: i32,
        saturation: i32,
        ev: i32,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<()>> {
        self.simple(Command::Levels { brightness, contrast, saturation, ev }, addresses)
    }

    pub fn flip(
        &mut self,
        horizontal: bool,
        vertical: bool,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<()>> {
        self.simple(Command::Flip { horizontal, vertical }, addresses)
    }

    pub fn agc(&mut self, mode: AgcMode, addresses: Option<&[Ipv4Addr]>) -> Result<FleetResult<()>> {
        self.simple(Command::Agc { mode }, addresses)
    }

    pub fn denoise(
        &mut self,
        enabled: bool,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<()>> {
        self.simple(Command::Denoise { enabled }, addresses)
    }

    pub fn quality(&mut self, quality: u8, addresses: Option<&[Ipv4Addr]>) -> Result<FleetResult<()>> {
        self.simple(Command::Quality { quality }, addresses)
    }

    pub fn blink(&mut self, addresses: Option<&[Ipv4Addr]>) -> Result<FleetResult<()>> {
        self.simple(Command::Blink, addresses)
    }

    /// Trigger captures. `delay` seconds, if given, are added to the local
    /// clock to form the synchronisation timestamp all targets aim for;
    /// NTP-synchronised server clocks are assumed.
    pub fn capture(
        &mut self,
        count: u32,
        video_port: bool,
        delay: Option<f64>,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<()>> {
        let sync = delay.map(|d| unix_time() + d);
        self.simple(Command::Capture { count, video_port, sync }, addresses)
    }

    pub fn list(
        &mut self,
        addresses: Option<&[Ipv4Addr]>,
    ) -> Result<FleetResult<Vec<ImageInfo>>> {
        let raw = self.transact(Command::List, addresses)?;
        let mut result = FleetResult::new();
        result.failed = raw.failed;
        for (addr, data) in raw.ok {
            match parse_image_list(&data) {
                Ok(images) => {
                    result.ok.insert(addr, images);
                }
                Err(e) => {
                    result.failed.insert(addr, format!("invalid list response: {e:#}"));
                }
            }
        }
        Ok(result)
    }

    pub fn clear(&mut self, addresses: Option<&[Ipv4Addr]>) -> Result<FleetResult<()>> {
        self.simple(Command::Clear, addresses)
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    /// Fetch one image over the TCP side-channel. The accept socket only
    /// lives for this exchange; the sink is written only after both the
    /// payload and the OK response arrived.
    pub fn send(&mut self, address: Ipv4Addr, index: usize, sink: &mut dyn Write) -> Result<u64> {
        if !self.peers.contains_key(&address) {
            bail!("server {address} is not defined");
        }
        let listener = DownloadListener::bind(self.config.bind.ip(), self.config.download_port)?;
        let port = listener.port()?;
        let deadline = Instant::now() + self.config.timeout;

        let data = std::thread::scope(|scope| -> Result<Vec<u8>> {
            let reader = scope.spawn(|| -> Result<Vec<u8>> {
                let mut stream = listener.accept_from(IpAddr::V4(address), deadline)?;
                let mut buf = Vec::new();
                net::read_image(&mut stream, &mut buf)?;
                Ok(buf)
            });
            let send_result = self.transact(Command::Send { index, port }, Some(&[address]));
            let read_result = reader
                .join()
                .map_err(|_| anyhow!("image reader thread panicked"))?;
            let outcome = send_result?;
            if let Some(reason) = outcome.failed.get(&address) {
                bail!("{address}: SEND failed: {reason}");
            }
            read_result
        })?;

        sink.write_all(&data)?;
        Ok(data.len() as u64)
    }

    /// Retrieve every stored image from the targets, one server at a time
    /// to keep the network uncontended, wiping each server only after its
    /// whole set arrived intact. Files land in the configured output
    /// directory named after capture time and address.
    pub fn download(
        &mut self,
        addresses: Option<&[Ipv4Addr]>,
        progress: Option<&ProgressBar>,
    ) -> Result<FleetResult<Vec<PathBuf>>> {
        let targets = match addresses {
            None => self.servers(),
            Some(addrs) => addrs.to_vec(),
        };
        if targets.is_empty() {
            bail!("no servers defined; run find or add first");
        }
        std::fs::create_dir_all(&self.config.output)?;
        let transfer_log = TransferLog::new(&self.config.output);
        let mut result = FleetResult::new();
        for address in targets {
            match self.download_from(address, &transfer_log, progress) {
                Ok(paths) => {
                    result.ok.insert(address, paths);
                }
                Err(e) => {
                    log::warn!("{address}: download failed: {e:#}");
                    result.failed.insert(address, format!("{e:#}"));
                }
            }
        }
        Ok(result)
    }

    fn download_from(
        &mut self,
        address: Ipv4Addr,
        transfer_log: &TransferLog,
        progress: Option<&ProgressBar>,
    ) -> Result<Vec<PathBuf>> {
        let mut listing = self.list(Some(&[address]))?;
        let images = listing.ok.remove(&address).ok_or_else(|| {
            anyhow!(
                "LIST failed: {}",
                listing
                    .failed
                    .remove(&address)
                    .unwrap_or_else(|| "no response".to_string())
            )
        })?;

        let mut paths = Vec::new();
        for image in &images {
            if let Some(bar) = progress {
                bar.set_message(format!("{address} image {}", image.index));
            }
            let path = self.image_path(address, image);
            let mut entry =
                TransferLogEntry::new(address.to_string(), image.index, image.timestamp, image.size);
            let fetched = self.fetch_image(address, image.index, &path);
            let outcome = match fetched {
                Ok(bytes) if bytes == image.size => {
                    entry.received_size = bytes;
                    entry.path = path.clone();
                    entry.status = TransferStatus::Completed;
                    Ok(())
                }
                Ok(bytes) => {
                    let _ = std::fs::remove_file(&path);
                    entry.received_size = bytes;
                    entry.status = TransferStatus::SizeMismatch;
                    Err(anyhow!(
                        "image {} size mismatch: expected {}, received {bytes}",
                        image.index,
                        image.size
                    ))
                }
                Err(e) => {
                    entry.error = Some(format!("{e:#}"));
                    Err(e)
                }
            };
            if let Err(e) = transfer_log.add_entry(&entry) {
                log::warn!("transfer log write failed: {e:#}");
            }
            outcome?;
            if let Some(bar) = progress {
                bar.inc(1);
            }
            paths.push(path);
        }

        // only a fully retrieved server gets wiped
        let cleared = self.clear(Some(&[address]))?;
        if let Some(reason) = cleared.failed.get(&address) {
            bail!("images retrieved but CLEAR failed: {reason}");
        }
        Ok(paths)
    }

    /// Write the image to `path`, discarding the partial file on any
    /// failure.
    fn fetch_image(&mut self, address: Ipv4Addr, index: usize, path: &Path) -> Result<u64> {
        let mut file = File::create(path)?;
        match self.send(address, index, &mut file) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                drop(file);
                let _ = std::fs::remove_file(path);
                Err(e)
            }
        }
    }

    fn image_path(&self, address: Ipv4Addr, image: &ImageInfo) -> PathBuf {
        let when = Utc
            .timestamp_micros((image.timestamp * 1e6) as i64)
            .single()
            .unwrap_or_else(Utc::now);
        self.config
            .output
            .join(format!("{}-{address}.jpg", when.format("%Y%m%d-%H%M%S%.6f")))
    }
}
