//! Trusted-subnet admission
//!
//! Stateless check run in front of protected routes and RPCs. The caller
//! declares its origin in `X-Real-IP` (HTTP header or gRPC metadata); the
//! address must fall inside the configured CIDR.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Header / metadata key carrying the caller's address
pub const ORIGIN_HEADER: &str = "x-real-ip";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    /// Configured subnet is not valid CIDR
    InvalidCidr(String),
    /// No origin supplied by the caller
    MissingOrigin,
    /// Origin supplied but not an IP address
    InvalidOrigin(String),
    /// Origin outside the trusted subnet
    Untrusted(IpAddr),
}

impl fmt::Display for TrustError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustError::InvalidCidr(cidr) => write!(f, "invalid CIDR: {:?}", cidr),
            TrustError::MissingOrigin => write!(f, "missing {} header", ORIGIN_HEADER),
            TrustError::InvalidOrigin(raw) => write!(f, "origin is not an IP address: {:?}", raw),
            TrustError::Untrusted(ip) => write!(f, "origin {} is outside the trusted subnet", ip),
        }
    }
}

impl std::error::Error for TrustError {}

/// An IPv4 or IPv6 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedSubnet {
    network: IpAddr,
    prefix: u8,
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl TrustedSubnet {
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        // IPv4-mapped IPv6 callers are compared as IPv4
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = mask_v4(self.prefix);
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = mask_v6(self.prefix);
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }

    /// Admission decision for a raw origin header value
    pub fn check(&self, origin: Option<&str>) -> Result<(), TrustError> {
        let raw = origin
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(TrustError::MissingOrigin)?;
        let ip: IpAddr = raw
            .parse()
            .map_err(|_| TrustError::InvalidOrigin(raw.to_string()))?;
        if self.contains(ip) {
            Ok(())
        } else {
            Err(TrustError::Untrusted(ip))
        }
    }
}

/// No subnet configured means every caller is admitted
pub fn admit(subnet: Option<&TrustedSubnet>, origin: Option<&str>) -> Result<(), TrustError> {
    match subnet {
        Some(subnet) => subnet.check(origin),
        None => Ok(()),
    }
}

impl FromStr for TrustedSubnet {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TrustError::InvalidCidr(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        Ok(TrustedSubnet { network, prefix })
    }
}

impl fmt::Display for TrustedSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl Serialize for TrustedSubnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TrustedSubnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
