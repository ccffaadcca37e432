use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{ClusterError, Result};

/// An IPv4 network in CIDR form. The address is always the network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(ClusterError::InvalidAddress(format!(
                "{}/{}: prefix out of range",
                addr, prefix
            )));
        }
        let network = Ipv4Addr::from(u32::from(addr) & Self::mask(prefix));
        Ok(Self { network, prefix })
    }

    /// Build from an address already aligned to `prefix`. Prefixes past 32 are clamped.
    pub const fn from_network(network: Ipv4Addr, prefix: u8) -> Self {
        let prefix = if prefix > 32 { 32 } else { prefix };
        Self { network, prefix }
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    fn last(&self) -> u32 {
        u32::from(self.network) + (self.size() - 1) as u32
    }

    /// The `n`th address inside the subnet, if it fits.
    pub fn host(&self, n: u32) -> Option<Ipv4Addr> {
        if u64::from(n) >= self.size() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network) + n))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.prefix) == u32::from(self.network)
    }

    pub fn overlaps(&self, other: &Ipv4Subnet) -> bool {
        u32::from(self.network) <= other.last() && u32::from(other.network) <= self.last()
    }

    /// Split into consecutive subnets of the given (longer) prefix.
    pub fn subnets(&self, prefix: u8) -> impl Iterator<Item = Ipv4Subnet> {
        let start = u64::from(u32::from(self.network));
        let step = 1u64 << (32 - u32::from(prefix.min(32)));
        let count = if prefix < self.prefix || prefix > 32 {
            0
        } else {
            self.size() / step
        };
        (0..count).map(move |i| Ipv4Subnet {
            network: Ipv4Addr::from((start + i * step) as u32),
            prefix,
        })
    }

    /// First `prefix`-sized subnet of `self` that overlaps none of `used`.
    pub fn first_free(&self, prefix: u8, used: &[Ipv4Subnet]) -> Result<Ipv4Subnet> {
        self.subnets(prefix)
            .find(|candidate| !used.iter().any(|u| u.overlaps(candidate)))
            .ok_or_else(|| ClusterError::SubnetExhausted {
                pool: self.to_string(),
                prefix,
            })
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| ClusterError::InvalidAddress(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|_| ClusterError::InvalidAddress(s.to_string()))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|_| ClusterError::InvalidAddress(s.to_string()))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Subnet {
    type Error = ClusterError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ipv4Subnet> for String {
    fn from(value: Ipv4Subnet) -> Self {
        value.to_string()
    }
}
