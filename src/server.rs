//! Server protocol handler: a single dispatch loop reading UDP commands,
//! per-client sessions with duplicate suppression, the response retry
//! machinery, and brokerage of the camera and image store.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};

use crate::camera::{Camera, CameraSettings};
use crate::config::ServerConfig;
use crate::net::{self, RetryQueue, UdpEndpoint};
use crate::protocol::{
    parse_command, timing, Command, ImageInfo, Response, StatusReport, VERSION,
};
use crate::store::ImageStore;
use crate::unix_time;

// How often the loop wakes with no traffic and no pending retries, to
// notice the shutdown flag and idle sessions.
const IDLE_POLL: Duration = Duration::from_millis(200);

// Cached responses kept per session for duplicate suppression
const RECENT_LIMIT: usize = 32;

/// Per-client protocol state. One per source socket address, created by
/// HELLO and replaced only by a HELLO with a strictly greater timestamp.
struct Session {
    /// Sequence number the session started at; anything at or below it is
    /// stale.
    base: u64,
    /// Highest HELLO timestamp accepted from this client.
    hello_time: f64,
    /// Recently executed sequence numbers and the response each produced.
    recent: BTreeMap<u64, String>,
    last_activity: Instant,
}

impl Session {
    fn new(base: u64, hello_time: f64) -> Self {
        Self {
            base,
            hello_time,
            recent: BTreeMap::new(),
            last_activity: Instant::now(),
        }
    }

    fn remember(&mut self, seq: u64, frame: String) {
        self.recent.insert(seq, frame);
        while self.recent.len() > RECENT_LIMIT {
            self.recent.pop_first();
        }
    }
}

struct Outstanding {
    frame: String,
    expires: Instant,
}

/// The camera daemon core: owns the socket, the camera, the image store,
/// and all session state. Everything is mutated from the dispatch loop.
pub struct CameraServer {
    endpoint: UdpEndpoint,
    camera: Box<dyn Camera>,
    settings: CameraSettings,
    store: ImageStore,
    sessions: HashMap<SocketAddr, Session>,
    outstanding: HashMap<(SocketAddr, u64), Outstanding>,
    retries: RetryQueue<(SocketAddr, u64)>,
    shutdown: Arc<AtomicBool>,
}

impl CameraServer {
    pub fn new(config: &ServerConfig, mut camera: Box<dyn Camera>) -> Result<Self> {
        let endpoint = UdpEndpoint::bind(config.bind)?;
        let mut settings = CameraSettings::default();
        settings.set_quality(config.quality)?;
        camera.configure(&settings)?;
        Ok(Self {
            endpoint,
            camera,
            settings,
            store: ImageStore::new(),
            sessions: HashMap::new(),
            outstanding: HashMap::new(),
            retries: RetryQueue::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Flag another thread can raise to stop [`run`](Self::run) within one
    /// poll interval.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn run(&mut self) -> Result<()> {
        log::info!("camera server listening on {}", self.endpoint.local_addr()?);
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            self.service_retries(now);
            self.evict_idle(now);
            let wait = match self.retries.next_deadline() {
                Some(deadline) => deadline.saturating_duration_since(now).min(IDLE_POLL),
                None => IDLE_POLL,
            };
            match self.endpoint.recv(wait) {
                Ok(Some((frame, source))) => self.handle_datagram(&frame, source),
                Ok(None) => {}
                Err(e) => log::error!("receive failed: {e:#}"),
            }
        }
        log::info!("camera server shutting down");
        self.camera.close()
    }

    fn handle_datagram(&mut self, frame: &str, source: SocketAddr) {
        let (seq, command) = match parse_command(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("{source}: {e:#}");
                // best effort at echoing the sequence number back
                let seq = frame
                    .split_whitespace()
                    .next()
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(0);
                self.queue_response(source, Response::error(seq, format!("{e:#}")));
                return;
            }
        };

        match command {
            Command::Ack => {
                if self.outstanding.remove(&(source, seq)).is_some() {
                    log::debug!("{source}: response {seq} acknowledged");
                }
                return;
            }
            Command::Hello { timestamp } => {
                self.handle_hello(source, seq, timestamp);
                return;
            }
            _ => {}
        }

        {
            let Some(session) = self.sessions.get_mut(&source) else {
                log::warn!("{source}: command {seq} before HELLO ignored");
                return;
            };
            session.last_activity = Instant::now();
            if let Some(cached) = session.recent.get(&seq).cloned() {
                log::debug!("{source}: repeating cached response {seq}");
                if let Err(e) = self.endpoint.send_to(&cached, source) {
                    log::error!("{source}: resend failed: {e:#}");
                }
                return;
            }
            if seq <= session.base {
                log::debug!("{source}: stale sequence {seq} ignored");
                return;
            }
        }

        let response = match self.dispatch(command, source) {
            Ok(data) => Response::ok(seq, data),
            Err(e) => {
                log::error!("{source}: command {seq} failed: {e:#}");
                Response::error(seq, format!("{e:#}"))
            }
        };
        let encoded = response.encode();
        if let Some(session) = self.sessions.get_mut(&source) {
            session.remember(seq, encoded.clone());
        }
        self.queue_response_frame(source, seq, encoded);
    }

    fn handle_hello(&mut self, source: SocketAddr, seq: u64, timestamp: f64) {
        if let Some(existing) = self.sessions.get(&source) {
            if timestamp <= existing.hello_time {
                log::warn!(
                    "{source}: stale HELLO ignored ({timestamp:.6} <= {:.6})",
                    existing.hello_time
                );
                return;
            }
        }
        log::info!("{source}: session started at sequence {seq}");
        self.sessions.insert(source, Session::new(seq, timestamp));
        self.queue_response(source, Response::ok(seq, format!("VERSION {VERSION}")));
    }

    /// Execute a live (non-duplicate) command against the camera and store.
    fn dispatch(&mut self, command: Command, source: SocketAddr) -> Result<String> {
        match command {
            Command::Hello { .. } | Command::Ack => {
                bail!("internal error: {command:?} reached dispatch")
            }
            Command::Status => Ok(self.status_report().render()),
            Command::Resolution { width, height } => {
                self.update_settings(|s| s.set_resolution(width, height))
            }
            Command::Framerate { rate } => self.update_settings(|s| s.set_framerate(rate)),
            Command::Awb { mode, gains } => self.update_settings(|s| s.set_awb(mode, gains)),
            Command::Exposure { mode, speed } => {
                self.update_settings(|s| s.set_exposure(mode, speed))
            }
            Command::Iso { iso } => self.update_settings(|s| s.set_iso(iso)),
            Command::Metering { mode } => self.update_settings(|s| {
                s.metering_mode = mode;
                Ok(())
            }),
            Command::Levels { brightness, contrast, saturation, ev } => {
                self.update_settings(|s| s.set_levels(brightness, contrast, saturation, ev))
            }
            Command::Flip { horizontal, vertical } => self.update_settings(|s| {
                s.hflip = horizontal;
                s.vflip = vertical;
                Ok(())
            }),
            Command::Agc { mode } => self.update_settings(|s| {
                s.agc_mode = mode;
                Ok(())
            }),
            Command::Denoise { enabled } => self.update_settings(|s| {
                s.denoise = enabled;
                Ok(())
            }),
            Command::Quality { quality } => self.update_settings(|s| s.set_quality(quality)),
            Command::Capture { count, video_port, sync } => {
                if let Some(sync) = sync {
                    if sync <= unix_time() {
                        bail!("sync time in past");
                    }
                }
                let frames = self.camera.capture(count, video_port, sync)?;
                for frame in frames {
                    self.store.append(frame);
                }
                Ok(String::new())
            }
            Command::List => Ok(self
                .store
                .manifest()
                .iter()
                .map(ImageInfo::render)
                .collect::<Vec<_>>()
                .join("\n")),
            Command::Clear => {
                log::info!("clearing {} stored image(s)", self.store.len());
                self.store.clear();
                Ok(String::new())
            }
            Command::Send { index, port } => {
                let frame = self
                    .store
                    .get(index)
                    .ok_or_else(|| anyhow!("invalid image index {index}"))?;
                log::info!(
                    "sending image {index} ({} bytes) to {}:{port}",
                    frame.data.len(),
                    source.ip()
                );
                net::stream_image(source.ip(), port, &frame.data)?;
                Ok(String::new())
            }
            Command::Blink => {
                self.camera.blink(timing::BLINK)?;
                Ok(String::new())
            }
        }
    }

    /// Validate against a copy, push it to the camera, and only then commit.
    /// Any failure leaves both the camera and the cached settings untouched.
    fn update_settings(
        &mut self,
        mutate: impl FnOnce(&mut CameraSettings) -> Result<()>,
    ) -> Result<String> {
        let mut candidate = self.settings.clone();
        mutate(&mut candidate)?;
        self.camera.configure(&candidate)?;
        self.settings = candidate;
        Ok(String::new())
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            width: self.settings.width,
            height: self.settings.height,
            framerate: self.settings.framerate,
            awb_mode: self.settings.awb_mode,
            awb_red: self.settings.awb_red,
            awb_blue: self.settings.awb_blue,
            exposure_mode: self.settings.exposure_mode,
            exposure_speed: self.settings.exposure_speed,
            ev: self.settings.ev,
            iso: self.settings.iso,
            metering_mode: self.settings.metering_mode,
            brightness: self.settings.brightness,
            contrast: self.settings.contrast,
            saturation: self.settings.saturation,
            hflip: self.settings.hflip,
            vflip: self.settings.vflip,
            timestamp: unix_time(),
            images: self.store.len(),
        }
    }

    fn queue_response(&mut self, dest: SocketAddr, response: Response) {
        let seq = response.seq;
        self.queue_response_frame(dest, seq, response.encode());
    }

    /// Send a response and keep retrying it until the ACK or the delivery
    /// window closes.
    fn queue_response_frame(&mut self, dest: SocketAddr, seq: u64, frame: String) {
        if let Err(e) = self.endpoint.send_to(&frame, dest) {
            log::error!("{dest}: send failed: {e:#}");
        }
        self.outstanding.insert(
            (dest, seq),
            Outstanding { frame, expires: Instant::now() + timing::DELIVERY_TIMEOUT },
        );
        self.retries.schedule((dest, seq), net::retry_jitter());
    }

    fn service_retries(&mut self, now: Instant) {
        while let Some(key) = self.retries.pop_due(now) {
            // entries for acknowledged responses just fall out of the queue
            let Some(entry) = self.outstanding.get(&key) else {
                continue;
            };
            if now >= entry.expires {
                log::debug!("{}: giving up on response {}", key.0, key.1);
                self.outstanding.remove(&key);
                continue;
            }
            let frame = entry.frame.clone();
            if let Err(e) = self.endpoint.send_to(&frame, key.0) {
                log::error!("{}: retry failed: {e:#}", key.0);
            }
            self.retries.schedule(key, net::retry_jitter());
        }
    }

    fn evict_idle(&mut self, now: Instant) {
        self.sessions.retain(|addr, session| {
            let keep = now.duration_since(session.last_activity) < timing::SESSION_IDLE;
            if !keep {
                log::info!("{addr}: session evicted after idle timeout");
            }
            keep
        });
    }

    #[cfg(test)]
    fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}
