//! Inbound/outbound rule model and address rendering.
//!
//! Rules arrive already decoded from the `up` request. This module owns the
//! two wire renderings of address and port ranges: CIDR blocks for the policy
//! engine, and `start-end` dash ranges for the host firewall.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Protocol numbers understood by both the host firewall and ACL policies.
pub mod protocol_number {
    /// ICMP.
    pub const ICMP: u16 = 1;
    /// TCP.
    pub const TCP: u16 = 6;
    /// UDP.
    pub const UDP: u16 = 17;
    /// Any protocol.
    pub const ANY: u16 = 256;
}

/// One inbound port-forward request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIn {
    /// Host port; `0` asks the port pool to allocate one.
    #[serde(default)]
    pub host_port: u32,
    /// Port the container listens on.
    #[serde(default)]
    pub container_port: u32,
}

/// Protocol selector of a [`NetOut`] rule.
///
/// Encoded as its numeric code on the wire. Codes outside the known set are
/// preserved so the translation step can reject them with the offending value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Protocol {
    /// Any protocol.
    #[default]
    All,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
    /// A code with no known meaning.
    Unknown(u8),
}

impl From<u8> for Protocol {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::All,
            1 => Self::Tcp,
            2 => Self::Udp,
            3 => Self::Icmp,
            other => Self::Unknown(other),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::All => 0,
            Protocol::Tcp => 1,
            Protocol::Udp => 2,
            Protocol::Icmp => 3,
            Protocol::Unknown(code) => code,
        }
    }
}

/// An inclusive IPv4 address range.
///
/// `start <= end` is expected from the caller and not validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    /// First address.
    pub start: Ipv4Addr,
    /// Last address.
    pub end: Ipv4Addr,
}

impl IpRange {
    /// Range spanning every IPv4 address.
    pub const ALL: Self = Self {
        start: Ipv4Addr::UNSPECIFIED,
        end: Ipv4Addr::BROADCAST,
    };

    /// Range covering `start..=end`.
    #[must_use]
    pub const fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { start, end }
    }

    /// Range covering a single address.
    #[must_use]
    pub const fn single(ip: Ipv4Addr) -> Self {
        Self { start: ip, end: ip }
    }

    /// Whether the range spans the whole address space.
    #[must_use]
    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// An inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    #[serde(default)]
    pub start: u16,
    /// Last port.
    #[serde(default)]
    pub end: u16,
}

impl PortRange {
    /// Range covering `start..=end`.
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Range covering a single port.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// One outbound-traffic allow rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetOut {
    /// Protocol to allow.
    #[serde(default)]
    pub protocol: Protocol,
    /// Remote address ranges to allow.
    #[serde(default)]
    pub networks: Vec<IpRange>,
    /// Remote port ranges to allow; ignored for ICMP.
    #[serde(default)]
    pub ports: Vec<PortRange>,
}

/// A resolved inbound mapping reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u32,
    /// Port inside the container.
    pub container_port: u32,
}

/// Render address ranges in the host firewall's `start-end,...` form.
#[must_use]
pub fn firewall_ip_ranges(networks: &[IpRange]) -> String {
    join(networks)
}

/// Render port ranges in the `start-end,...` form shared by both backends.
#[must_use]
pub fn port_ranges(ports: &[PortRange]) -> String {
    join(ports)
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Decompose an inclusive address range into the minimal set of CIDR blocks.
///
/// Blocks are emitted in ascending address order and their union is exactly
/// `range`. At each step the largest aligned block that starts at the cursor
/// and does not pass `range.end` is taken.
#[must_use]
pub fn ip_range_to_cidrs(range: IpRange) -> Vec<String> {
    let mut start = u32::from(range.start);
    let end = u32::from(range.end);
    let mut blocks = Vec::new();

    while start <= end {
        let mut prefix_len = 32;
        while prefix_len > 0 {
            let wider = prefix_len - 1;
            if start != first_address(start, wider) || end < last_address(start, wider) {
                break;
            }
            prefix_len = wider;
        }

        blocks.push(format!("{}/{}", Ipv4Addr::from(start), prefix_len));

        let block_end = last_address(start, prefix_len);
        if block_end == u32::MAX {
            break;
        }
        start = block_end + 1;
    }

    blocks
}

fn netmask(prefix_len: u32) -> u32 {
    u32::MAX.checked_shl(32 - prefix_len).unwrap_or(0)
}

fn first_address(addr: u32, prefix_len: u32) -> u32 {
    addr & netmask(prefix_len)
}

fn last_address(addr: u32, prefix_len: u32) -> u32 {
    (addr & netmask(prefix_len)) | !netmask(prefix_len)
}
