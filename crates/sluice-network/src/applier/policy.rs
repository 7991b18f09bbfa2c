//! Endpoint policy backend.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Inbound, RuleApplier, outbound_protocol, resolve_host_port};
use crate::error::NetworkResult;
use crate::host::{AclAction, AclPolicy, AclRuleType, Direction, NatPolicy};
use crate::netsh::NetshRunner;
use crate::pool::PortAllocator;
use crate::rules::{IpRange, NetIn, NetOut, PortMapping, ip_range_to_cidrs, port_ranges, protocol_number};

/// Block-all policies installed when a container was given no ACL at all.
///
/// Endpoints without ACLs are unrestricted, so an empty rule set has to be
/// made explicit.
#[must_use]
pub fn default_deny_acls() -> Vec<AclPolicy> {
    vec![
        AclPolicy::block_all(Direction::Out),
        AclPolicy::block_all(Direction::In),
    ]
}

/// Expresses rules as NAT and ACL policies on the container's endpoint.
pub struct PolicyApplier {
    handle: String,
    allocator: Arc<dyn PortAllocator>,
    netsh: NetshRunner,
}

impl PolicyApplier {
    /// Create an applier for the container `handle`.
    pub fn new(handle: &str, allocator: Arc<dyn PortAllocator>, netsh: NetshRunner) -> Self {
        Self {
            handle: handle.to_string(),
            allocator,
            netsh,
        }
    }
}

#[async_trait]
impl RuleApplier for PolicyApplier {
    async fn net_in(&self, rule: NetIn, container_ip: Ipv4Addr) -> NetworkResult<Inbound> {
        let container_port = super::to_port(rule.container_port)?;
        let host_port = resolve_host_port(self.allocator.as_ref(), &self.handle, rule)?;

        self.open_port(rule.container_port).await?;

        let mut acl = AclPolicy::new(AclAction::Allow, Direction::In, protocol_number::TCP);
        acl.local_addresses = container_ip.to_string();
        acl.local_port = container_port.to_string();
        acl.rule_type = Some(AclRuleType::Switch);

        Ok(Inbound {
            mapping: PortMapping {
                host_port: u32::from(host_port),
                container_port: rule.container_port,
            },
            nat: NatPolicy::tcp(container_port, host_port),
            acl: Some(acl),
        })
    }

    async fn net_out(
        &self,
        rule: &NetOut,
        _container_ip: Ipv4Addr,
    ) -> NetworkResult<Option<AclPolicy>> {
        let (protocol, with_ports) = outbound_protocol(rule.protocol)?;

        let mut acl = AclPolicy::new(AclAction::Allow, Direction::Out, protocol);
        acl.rule_type = Some(AclRuleType::Switch);

        // The full range is expressed by leaving the remote side unset.
        if !rule.networks.iter().any(IpRange::is_all) {
            acl.remote_addresses = rule
                .networks
                .iter()
                .flat_map(|range| ip_range_to_cidrs(*range))
                .collect::<Vec<_>>()
                .join(", ");
        }
        if with_ports {
            acl.remote_port = port_ranges(&rule.ports);
        }

        Ok(Some(acl))
    }

    async fn open_port(&self, port: u32) -> NetworkResult<()> {
        self.netsh.open_port(port).await
    }

    async fn cleanup(&self) -> NetworkResult<()> {
        self.allocator.release_all_ports(&self.handle)
    }
}
