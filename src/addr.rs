//! Address parsing: the subnet the fleet lives on and the address-list
//! syntax accepted by the client front-end.

use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};

/// An IPv4 network in CIDR notation. The mask must be correct for subnet
/// broadcasts to reach every server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Network {
    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    /// The subnet broadcast address (host bits all ones).
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask()) == (u32::from(self.addr) & self.mask())
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("network {s:?} is not in CIDR notation"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| anyhow!("invalid network address {addr:?}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| anyhow!("invalid prefix length {prefix:?}"))?;
        if prefix > 30 {
            bail!("prefix length /{prefix} leaves no room for hosts");
        }
        Ok(Self { addr, prefix })
    }
}

// Inclusive ranges wider than this are almost certainly typos
const MAX_RANGE: u32 = 65536;

/// Parse the address-list syntax used on the client command line: a single
/// address, an inclusive `A-B` range, or a comma-separated mixture. Returns
/// a de-duplicated list preserving first-seen order.
pub fn parse_address_list(input: &str) -> Result<Vec<Ipv4Addr>> {
    let mut result = Vec::new();
    let mut push = |ip: Ipv4Addr| {
        if !result.contains(&ip) {
            result.push(ip);
        }
    };
    for item in input.split(',') {
        let item = item.trim();
        if item.is_empty() {
            bail!("empty entry in address list {input:?}");
        }
        match item.split_once('-') {
            Some((start, end)) => {
                let start: Ipv4Addr = start
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("invalid address {:?}", start.trim()))?;
                let end: Ipv4Addr = end
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("invalid address {:?}", end.trim()))?;
                let (lo, hi) = (u32::from(start), u32::from(end));
                if hi < lo {
                    bail!("address range {item:?} runs backwards");
                }
                if hi - lo >= MAX_RANGE {
                    bail!("address range {item:?} spans more than {MAX_RANGE} hosts");
                }
                for ip in lo..=hi {
                    push(Ipv4Addr::from(ip));
                }
            }
            None => push(
                item.parse()
                    .map_err(|_| anyhow!("invalid address {item:?}"))?,
            ),
        }
    }
    Ok(result)
}
