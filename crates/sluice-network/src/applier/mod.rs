//! Translation of NetIn/NetOut rules into enforcement primitives.
//!
//! Two interchangeable backends implement [`RuleApplier`]:
//! - [`PolicyApplier`] expresses rules as NAT and ACL policies attached to
//!   the container's endpoint by the network control plane.
//! - [`FirewallApplier`] creates named rules in the host firewall and only
//!   hands NAT mappings back to the endpoint.
//!
//! The backend is chosen once at startup from [`Enforcement`].

mod firewall;
mod policy;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use firewall::FirewallApplier;
pub use policy::{PolicyApplier, default_deny_acls};

use crate::error::{NetworkError, NetworkResult};
use crate::host::{AclPolicy, NatPolicy};
use crate::pool::PortAllocator;
use crate::rules::{NetIn, NetOut, PortMapping, Protocol, protocol_number};

/// Which enforcement backend a build of the plugin drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// NAT/ACL policy objects attached to the endpoint.
    PolicyEngine,
    /// Named rules in the host firewall.
    #[default]
    Firewall,
}

impl std::fmt::Display for Enforcement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PolicyEngine => write!(f, "policy_engine"),
            Self::Firewall => write!(f, "firewall"),
        }
    }
}

/// Result of translating one NetIn rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Mapping reported back to the caller.
    pub mapping: PortMapping,
    /// Port mapping policy for the endpoint.
    pub nat: NatPolicy,
    /// Inbound allow policy for the endpoint, when the backend enforces
    /// through endpoint policies.
    pub acl: Option<AclPolicy>,
}

/// Translates rules for one container into enforcement primitives.
#[async_trait]
pub trait RuleApplier: Send + Sync {
    /// Translate an inbound port-forward for the container at `container_ip`.
    ///
    /// Reserves a host port when the rule does not pin one, and grants the
    /// container permission to listen on the container port.
    async fn net_in(&self, rule: NetIn, container_ip: Ipv4Addr) -> NetworkResult<Inbound>;

    /// Translate an outbound allow rule for the container at `container_ip`.
    ///
    /// Returns the ACL policy to attach to the endpoint, or `None` when the
    /// backend enforced the rule directly.
    async fn net_out(
        &self,
        rule: &NetOut,
        container_ip: Ipv4Addr,
    ) -> NetworkResult<Option<AclPolicy>>;

    /// Allow the container's unprivileged users to bind an HTTP listener on
    /// `port`.
    async fn open_port(&self, port: u32) -> NetworkResult<()>;

    /// Release every host resource held for the container.
    ///
    /// All teardown steps are attempted; failures are combined.
    async fn cleanup(&self) -> NetworkResult<()>;
}

/// Host port for `rule`: the pinned one, or a fresh reservation.
fn resolve_host_port(
    allocator: &dyn PortAllocator,
    handle: &str,
    rule: NetIn,
) -> NetworkResult<u16> {
    allocator.allocate_port(handle, to_port(rule.host_port)?)
}

fn to_port(port: u32) -> NetworkResult<u16> {
    u16::try_from(port).map_err(|_| NetworkError::InvalidPort { port })
}

/// Protocol number for an outbound rule, and whether remote ports apply.
fn outbound_protocol(protocol: Protocol) -> NetworkResult<(u16, bool)> {
    match protocol {
        Protocol::Tcp => Ok((protocol_number::TCP, true)),
        Protocol::Udp => Ok((protocol_number::UDP, true)),
        Protocol::Icmp => Ok((protocol_number::ICMP, false)),
        Protocol::All => Ok((protocol_number::ANY, false)),
        Protocol::Unknown(code) => Err(NetworkError::InvalidProtocol(code)),
    }
}
