//! Per-network IP address allocation
//!
//! One [`Ipam`] instance exists per network, rebuilt at startup by
//! replaying that network's persisted attachments (§9: "no persistent
//! IPAM... rebuilt from the StateStore at startup"). `.0` and `.1` of
//! every subnet are reserved (network address and gateway).

use std::collections::HashSet;
use std::net::Ipv4Addr;

use rand::Rng;

use crate::error::{DaemonError, Result};

pub struct Ipam {
    subnet_base: [u8; 2],
    allocated: HashSet<u8>,
}

impl Ipam {
    /// `subnet` must be a `/16` in `a.b.0.0` form, e.g. `172.18.0.0/16`.
    pub fn new(subnet: &str) -> Result<Self> {
        let base = parse_subnet_base(subnet)?;
        Ok(Self { subnet_base: base, allocated: HashSet::from([0, 1]) })
    }

    /// Rebuild allocation state from a set of already-assigned addresses
    /// (used at startup when replaying persisted attachments).
    pub fn rebuild(subnet: &str, in_use: impl IntoIterator<Item = Ipv4Addr>) -> Result<Self> {
        let mut ipam = Self::new(subnet)?;
        for ip in in_use {
            let octets = ip.octets();
            ipam.allocated.insert(octets[3]);
        }
        Ok(ipam)
    }

    /// Allocate the next free address, honoring a caller-preferred IP if
    /// given (must lie in-subnet and be unreserved).
    pub fn allocate(&mut self, preferred: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        if let Some(ip) = preferred {
            let octets = ip.octets();
            if octets[0] != self.subnet_base[0] || octets[1] != self.subnet_base[1] {
                return Err(DaemonError::InvalidArgument(format!(
                    "{ip} is not within this network's subnet"
                )));
            }
            if self.allocated.contains(&octets[3]) {
                return Err(DaemonError::Conflict(format!("{ip} is already allocated")));
            }
            self.allocated.insert(octets[3]);
            return Ok(ip);
        }

        for candidate in 2u16..=255 {
            let candidate = candidate as u8;
            if !self.allocated.contains(&candidate) {
                self.allocated.insert(candidate);
                return Ok(Ipv4Addr::new(
                    self.subnet_base[0],
                    self.subnet_base[1],
                    0,
                    candidate,
                ));
            }
        }

        Err(DaemonError::ResourceExhausted("IP pool exhausted for this network".to_string()))
    }

    pub fn release(&mut self, ip: Ipv4Addr) {
        let octets = ip.octets();
        self.allocated.remove(&octets[3]);
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.subnet_base[0], self.subnet_base[1], 0, 1)
    }
}

fn parse_subnet_base(subnet: &str) -> Result<[u8; 2]> {
    let cidr = subnet
        .split('/')
        .next()
        .ok_or_else(|| DaemonError::InvalidArgument(format!("malformed subnet: {subnet}")))?;
    let mut parts = cidr.split('.');
    let a: u8 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DaemonError::InvalidArgument(format!("malformed subnet: {subnet}")))?;
    let b: u8 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DaemonError::InvalidArgument(format!("malformed subnet: {subnet}")))?;
    Ok([a, b])
}

/// Generates a locally-administered MAC address: `02:xx:xx:xx:xx:xx`.
pub fn generate_mac() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 5] = rng.gen();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

/// Next free `ethN` device name for a container, given its current set
/// of attached device names.
pub fn next_device_name(existing: &[String]) -> String {
    let mut n = 0;
    loop {
        let candidate = format!("eth{n}");
        if !existing.iter().any(|d| d == &candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_network_and_gateway_addresses() {
        let mut ipam = Ipam::new("172.18.0.0/16").unwrap();
        let first = ipam.allocate(None).unwrap();
        assert_eq!(first, Ipv4Addr::new(172, 18, 0, 2));
    }

    #[test]
    fn preferred_ip_must_be_in_subnet() {
        let mut ipam = Ipam::new("172.18.0.0/16").unwrap();
        let err = ipam.allocate(Some(Ipv4Addr::new(172, 19, 0, 5))).unwrap_err();
        assert!(matches!(err, DaemonError::InvalidArgument(_)));
    }

    #[test]
    fn release_frees_the_address_for_reuse() {
        let mut ipam = Ipam::new("172.18.0.0/16").unwrap();
        let ip = ipam.allocate(Some(Ipv4Addr::new(172, 18, 0, 10))).unwrap();
        ipam.release(ip);
        let reused = ipam.allocate(Some(ip)).unwrap();
        assert_eq!(reused, ip);
    }

    #[test]
    fn generated_mac_has_locally_administered_prefix() {
        let mac = generate_mac();
        assert!(mac.starts_with("02:"));
        assert_eq!(mac.len(), 17);
    }

    #[test]
    fn device_names_fill_gaps_left_to_right() {
        let existing = vec!["eth0".to_string(), "eth2".to_string()];
        assert_eq!(next_device_name(&existing), "eth1");
    }
}
