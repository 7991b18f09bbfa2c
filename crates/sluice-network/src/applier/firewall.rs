//! Host firewall backend.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use sluice_common::MultiError;

use super::{Inbound, RuleApplier, outbound_protocol, resolve_host_port, to_port};
use crate::error::{NetworkError, NetworkResult};
use crate::host::{AclPolicy, Firewall, FirewallDirection, FirewallRule, NatPolicy};
use crate::netsh::NetshRunner;
use crate::pool::PortAllocator;
use crate::rules::{NetIn, NetOut, PortMapping, firewall_ip_ranges, port_ranges, protocol_number};

/// Creates host firewall rules named after the container handle.
///
/// Every rule for one container shares the handle as its name, so a single
/// delete by name removes them all.
pub struct FirewallApplier {
    handle: String,
    allocator: Arc<dyn PortAllocator>,
    firewall: Arc<dyn Firewall>,
    netsh: NetshRunner,
}

impl FirewallApplier {
    /// Create an applier for the container `handle`.
    pub fn new(
        handle: &str,
        allocator: Arc<dyn PortAllocator>,
        firewall: Arc<dyn Firewall>,
        netsh: NetshRunner,
    ) -> Self {
        Self {
            handle: handle.to_string(),
            allocator,
            firewall,
            netsh,
        }
    }
}

#[async_trait]
impl RuleApplier for FirewallApplier {
    async fn net_in(&self, rule: NetIn, container_ip: Ipv4Addr) -> NetworkResult<Inbound> {
        let container_port = to_port(rule.container_port)?;
        let host_port = resolve_host_port(self.allocator.as_ref(), &self.handle, rule)?;

        let mut fw_rule =
            FirewallRule::allow(&self.handle, FirewallDirection::In, protocol_number::TCP);
        fw_rule.local_addresses = container_ip.to_string();
        fw_rule.local_ports = container_port.to_string();
        self.firewall.create_rule(&fw_rule).await?;

        self.open_port(rule.container_port).await?;

        Ok(Inbound {
            mapping: PortMapping {
                host_port: u32::from(host_port),
                container_port: rule.container_port,
            },
            nat: NatPolicy::tcp(container_port, host_port),
            acl: None,
        })
    }

    async fn net_out(
        &self,
        rule: &NetOut,
        container_ip: Ipv4Addr,
    ) -> NetworkResult<Option<AclPolicy>> {
        let (protocol, with_ports) = outbound_protocol(rule.protocol)?;

        let mut fw_rule = FirewallRule::allow(&self.handle, FirewallDirection::Out, protocol);
        fw_rule.local_addresses = container_ip.to_string();
        fw_rule.remote_addresses = firewall_ip_ranges(&rule.networks);
        if with_ports {
            fw_rule.remote_ports = port_ranges(&rule.ports);
        }

        self.firewall.create_rule(&fw_rule).await?;
        Ok(None)
    }

    async fn open_port(&self, port: u32) -> NetworkResult<()> {
        self.netsh.open_port(port).await
    }

    async fn cleanup(&self) -> NetworkResult<()> {
        let mut errors = MultiError::new();
        errors.record(self.allocator.release_all_ports(&self.handle));
        errors.record(
            self.firewall
                .delete_rule(&self.handle)
                .await
                .map_err(NetworkError::from),
        );
        NetworkError::combine(errors)
    }
}
