//! Plugin configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sluice_common::{SluiceError, SluiceResult};

use crate::applier::Enforcement;
use crate::pool::Tracker;

/// Host-wide settings shared by every invocation.
///
/// Read from a JSON file; every field has a default so a partial file (or
/// none at all) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Name of the shared NAT network.
    pub network_name: String,
    /// Subnet of the shared NAT network, in CIDR notation.
    pub subnet_range: String,
    /// Gateway of the shared NAT network.
    pub gateway_address: String,
    /// DNS servers handed to containers.
    pub dns_servers: Vec<String>,
    /// Outbound bandwidth limit in bytes per second; `0` disables it.
    pub maximum_outgoing_bandwidth: u64,
    /// First port of the managed host port range.
    pub start_port: u16,
    /// Number of ports in the managed range.
    pub total_ports: u16,
    /// Enforcement backend.
    pub enforcement: Enforcement,
    /// MTU of container adapters; `0` copies the NAT network adapter's MTU.
    pub mtu: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_name: "sluice-nat".to_string(),
            subnet_range: "172.30.0.0/22".to_string(),
            gateway_address: "172.30.0.1".to_string(),
            dns_servers: Vec::new(),
            maximum_outgoing_bandwidth: 0,
            start_port: 40000,
            total_ports: 5000,
            enforcement: Enforcement::default(),
            mtu: 0,
        }
    }
}

impl NetworkConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or is not valid configuration JSON.
    pub fn load(path: &Path) -> SluiceResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Fails when `content` is not valid configuration JSON.
    pub fn from_json(content: &str) -> SluiceResult<Self> {
        serde_json::from_str(content).map_err(|e| SluiceError::Config {
            message: format!("Failed to parse JSON: {e}"),
        })
    }

    /// The managed host port range.
    #[must_use]
    pub const fn tracker(&self) -> Tracker {
        Tracker::new(self.start_port, self.total_ports)
    }

    /// Set the enforcement backend.
    #[must_use]
    pub const fn with_enforcement(mut self, enforcement: Enforcement) -> Self {
        self.enforcement = enforcement;
        self
    }

    /// Set the managed host port range.
    #[must_use]
    pub const fn with_port_range(mut self, start_port: u16, total_ports: u16) -> Self {
        self.start_port = start_port;
        self.total_ports = total_ports;
        self
    }

    /// Set the DNS servers handed to containers.
    #[must_use]
    pub fn with_dns_servers(mut self, dns_servers: Vec<String>) -> Self {
        self.dns_servers = dns_servers;
        self
    }

    /// Set the container adapter MTU.
    #[must_use]
    pub const fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the outbound bandwidth limit.
    #[must_use]
    pub const fn with_maximum_outgoing_bandwidth(mut self, bytes_per_second: u64) -> Self {
        self.maximum_outgoing_bandwidth = bytes_per_second;
        self
    }
}
