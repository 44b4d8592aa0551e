//! Camfleet library
//!
//! Coordinates a fleet of networked camera servers: UDP command protocol
//! with broadcast fan-out and retry-until-ACK delivery, plus a TCP
//! side-channel for image payloads.

pub mod addr;
pub mod camera;
pub mod client;
pub mod config;
pub mod net;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transfer;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional UNIX seconds, the timestamp
/// currency of the wire protocol.
pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
