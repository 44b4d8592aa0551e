//! Validated runtime configuration for the client coordinator and the
//! server daemon. Built by the binaries from their command lines; the core
//! treats these as immutable once constructed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::addr::Network;
use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Subnet the fleet lives on; its broadcast address carries fan-outs.
    pub network: Network,
    /// UDP port the servers listen on.
    pub port: u16,
    /// Local UDP bind address for commands and responses.
    pub bind: SocketAddr,
    /// Overall deadline for each multi-peer operation.
    pub timeout: Duration,
    /// Seconds ahead of now to schedule synchronised captures; 0 captures
    /// immediately on receipt.
    pub capture_delay: f64,
    pub capture_count: u32,
    pub video_port: bool,
    /// Largest tolerated spread between peers' reported clocks before a
    /// discrepancy warning.
    pub time_delta: f64,
    /// TCP port to accept image payloads on; 0 picks an ephemeral port.
    pub download_port: u16,
    /// Where downloaded images land.
    pub output: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: "192.168.0.0/16".parse().unwrap(),
            port: DEFAULT_PORT,
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            timeout: Duration::from_secs(5),
            capture_delay: 0.0,
            capture_count: 1,
            video_port: false,
            time_delta: 0.25,
            download_port: 0,
            output: PathBuf::from("/tmp"),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            bail!("timeout must be positive");
        }
        if self.capture_delay < 0.0 {
            bail!("capture delay cannot be negative");
        }
        if self.capture_count == 0 {
            bail!("capture count must be at least 1");
        }
        if self.time_delta < 0.0 {
            bail!("time delta cannot be negative");
        }
        if self.port == 0 {
            bail!("server port cannot be 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP bind address for the dispatch loop.
    pub bind: SocketAddr,
    /// Initial JPEG capture quality, 1-100. Clients can change it later
    /// with the QUALITY command.
    pub quality: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            quality: 85,
        }
    }
}
