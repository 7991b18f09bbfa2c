//! Host collaborators.
//!
//! The plugin drives three host facilities it does not implement: the
//! network control plane (networks and endpoints), the native host firewall,
//! and process execution inside a container. They are modelled as traits so
//! the platform bindings can be injected at startup and faked in tests.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rules::protocol_number;

/// Errors reported by the host collaborators.
///
/// The variants the plugin reacts to are distinguished by type so retry and
/// idempotency decisions never depend on message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Transient failure of the control plane while creating an endpoint.
    #[error("HNS failed with error : Unspecified error")]
    Unspecified,

    /// No endpoint with the given name or id exists.
    #[error("Endpoint {0} not found")]
    EndpointNotFound(String),

    /// No network with the given name exists.
    #[error("Network {0} not found")]
    NetworkNotFound(String),

    /// The container the endpoint belonged to is already gone.
    #[error("A Compute System with the specified identifier does not exist")]
    ComputeSystemDoesNotExist,

    /// Any other host failure.
    #[error("{0}")]
    Other(String),
}

/// Result type for host collaborator calls.
pub type HostResult<T> = Result<T, HostError>;

/// A subnet of a host network.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subnet {
    /// Address prefix in CIDR notation.
    pub address_prefix: String,
    /// Gateway address.
    #[serde(default)]
    pub gateway_address: String,
}

/// A network known to the host control plane.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostNetworkInfo {
    /// Identifier assigned by the host.
    #[serde(default)]
    pub id: String,
    /// Network name.
    pub name: String,
    /// Network type (`"nat"` for the shared network).
    #[serde(rename = "Type", default)]
    pub network_type: String,
    /// Subnets.
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    /// Comma-separated DNS servers.
    #[serde(rename = "DNSServerList", default, skip_serializing_if = "String::is_empty")]
    pub dns_server_list: String,
}

/// Port mapping policy: external host port to internal container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NatPolicy {
    /// Protocol name, always `"TCP"` for inbound mappings.
    pub protocol: String,
    /// Port inside the container.
    pub internal_port: u16,
    /// Port on the host.
    pub external_port: u16,
}

impl NatPolicy {
    /// A TCP port mapping.
    #[must_use]
    pub fn tcp(internal_port: u16, external_port: u16) -> Self {
        Self {
            protocol: "TCP".to_string(),
            internal_port,
            external_port,
        }
    }
}

/// ACL action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclAction {
    /// Allow matching traffic.
    Allow,
    /// Block matching traffic.
    Block,
}

/// Traffic direction, relative to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Inbound.
    In,
    /// Outbound.
    Out,
}

/// Where an ACL is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclRuleType {
    /// On the host.
    Host,
    /// On the virtual switch port.
    Switch,
}

/// Access control policy attached to an endpoint.
///
/// Empty address and port fields mean "unrestricted".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclPolicy {
    /// Action.
    pub action: AclAction,
    /// Direction.
    pub direction: Direction,
    /// Protocol number (see [`protocol_number`]).
    pub protocol: u16,
    /// Comma-separated local addresses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_addresses: String,
    /// Local port.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_port: String,
    /// Comma-separated remote addresses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_addresses: String,
    /// Comma-separated remote port ranges.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_port: String,
    /// Enforcement point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<AclRuleType>,
}

impl AclPolicy {
    /// A policy with the given action, direction and protocol and no other
    /// restriction.
    #[must_use]
    pub const fn new(action: AclAction, direction: Direction, protocol: u16) -> Self {
        Self {
            action,
            direction,
            protocol,
            local_addresses: String::new(),
            local_port: String::new(),
            remote_addresses: String::new(),
            remote_port: String::new(),
            rule_type: None,
        }
    }

    /// A policy blocking all traffic in `direction`.
    #[must_use]
    pub const fn block_all(direction: Direction) -> Self {
        Self::new(AclAction::Block, direction, protocol_number::ANY)
    }
}

/// Outbound bandwidth limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QosPolicy {
    /// Limit in bytes per second.
    pub maximum_outgoing_bandwidth_in_bytes: u64,
}

/// A policy attached to an endpoint, tagged by type as the control plane
/// encodes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Policy {
    /// Port mapping.
    #[serde(rename = "NAT")]
    Nat(NatPolicy),
    /// Access control.
    #[serde(rename = "ACL")]
    Acl(AclPolicy),
    /// Bandwidth limit.
    #[serde(rename = "QOS")]
    Qos(QosPolicy),
}

/// Resource allocator reported on an attached endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Allocator {
    /// Allocator type.
    #[serde(rename = "Type", default)]
    pub allocator_type: u32,
    /// Network compartment of the endpoint port.
    #[serde(default)]
    pub compartment_id: u32,
    /// Identifier of the endpoint port.
    #[serde(default)]
    pub endpoint_port_guid: String,
}

impl Allocator {
    /// Allocator type carrying the endpoint port of an attached endpoint.
    pub const ENDPOINT_PORT: u32 = 1;
}

/// Resources allocated to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resources {
    /// Allocators.
    #[serde(default)]
    pub allocators: Vec<Allocator>,
}

/// A host-side virtual network interface bound to one container.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    /// Identifier assigned by the host.
    #[serde(default)]
    pub id: String,
    /// Endpoint name, equal to the container handle.
    pub name: String,
    /// Identifier of the network the endpoint belongs to.
    #[serde(default)]
    pub virtual_network: String,
    /// Address assigned to the container.
    #[serde(rename = "IPAddress", default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<Ipv4Addr>,
    /// Comma-separated DNS servers.
    #[serde(rename = "DNSServerList", default, skip_serializing_if = "String::is_empty")]
    pub dns_server_list: String,
    /// Attached policies.
    #[serde(default)]
    pub policies: Vec<Policy>,
    /// Allocated resources.
    #[serde(default)]
    pub resources: Resources,
}

/// The host network control plane.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Look up a network by name.
    async fn network_by_name(&self, name: &str) -> HostResult<HostNetworkInfo>;

    /// Create a network.
    async fn create_network(&self, network: &HostNetworkInfo) -> HostResult<HostNetworkInfo>;

    /// Delete a network.
    async fn delete_network(&self, network: &HostNetworkInfo) -> HostResult<()>;

    /// Create an endpoint.
    async fn create_endpoint(&self, endpoint: &Endpoint) -> HostResult<Endpoint>;

    /// Replace an endpoint's mutable state, including its policy list.
    async fn update_endpoint(&self, endpoint: &Endpoint) -> HostResult<Endpoint>;

    /// Delete an endpoint.
    async fn delete_endpoint(&self, endpoint: &Endpoint) -> HostResult<()>;

    /// Look up an endpoint by id.
    async fn endpoint_by_id(&self, id: &str) -> HostResult<Endpoint>;

    /// Look up an endpoint by name.
    async fn endpoint_by_name(&self, name: &str) -> HostResult<Endpoint>;

    /// Attach an endpoint to a running container.
    async fn hot_attach_endpoint(&self, container_id: &str, endpoint_id: &str) -> HostResult<()>;

    /// Detach an endpoint from a container.
    async fn hot_detach_endpoint(&self, container_id: &str, endpoint_id: &str) -> HostResult<()>;
}

/// Firewall rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FirewallAction {
    /// Block.
    Block = 0,
    /// Allow.
    Allow = 1,
}

/// Firewall rule direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FirewallDirection {
    /// Inbound.
    In = 1,
    /// Outbound.
    Out = 2,
}

/// A host firewall rule.
///
/// Several rules may share one name; deleting by name removes all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// Rule name, the container handle for rules the plugin creates.
    pub name: String,
    /// Action.
    pub action: FirewallAction,
    /// Direction.
    pub direction: FirewallDirection,
    /// Protocol number (see [`protocol_number`]).
    pub protocol: u16,
    /// Comma-separated local addresses.
    pub local_addresses: String,
    /// Comma-separated local ports.
    pub local_ports: String,
    /// Comma-separated remote address ranges.
    pub remote_addresses: String,
    /// Comma-separated remote port ranges.
    pub remote_ports: String,
}

impl FirewallRule {
    /// An allow rule with no address or port restriction.
    #[must_use]
    pub fn allow(name: &str, direction: FirewallDirection, protocol: u16) -> Self {
        Self {
            name: name.to_string(),
            action: FirewallAction::Allow,
            direction,
            protocol,
            local_addresses: String::new(),
            local_ports: String::new(),
            remote_addresses: String::new(),
            remote_ports: String::new(),
        }
    }
}

/// The native host firewall.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Create a rule.
    async fn create_rule(&self, rule: &FirewallRule) -> HostResult<()>;

    /// Delete every rule with this name. Succeeds when none exists.
    async fn delete_rule(&self, name: &str) -> HostResult<()>;

    /// Whether a rule with this name exists.
    async fn rule_exists(&self, name: &str) -> HostResult<bool>;
}

/// Privileged process execution inside a container.
#[async_trait]
pub trait ContainerShell: Send + Sync {
    /// Run `command_line` in the container and wait for it, returning its
    /// exit code.
    async fn exec(&self, handle: &str, command_line: &str) -> HostResult<i32>;
}

/// Host network adapter enumeration and MTU control.
#[async_trait]
pub trait NetInterface: Send + Sync {
    /// Whether an adapter with this alias exists on the host.
    async fn exists(&self, alias: &str) -> HostResult<bool>;

    /// IPv4 MTU of the adapter with this alias.
    async fn mtu(&self, alias: &str) -> HostResult<u32>;

    /// Set the IPv4 MTU of the adapter with this alias.
    async fn set_mtu(&self, alias: &str, mtu: u32) -> HostResult<()>;
}

/// The host collaborators a plugin invocation drives.
///
/// Built once at startup by the platform layer and shared by every component.
#[derive(Clone)]
pub struct HostBindings {
    /// Network control plane.
    pub network: Arc<dyn HostNetwork>,
    /// Native host firewall.
    pub firewall: Arc<dyn Firewall>,
    /// In-container process execution.
    pub shell: Arc<dyn ContainerShell>,
    /// Host adapters.
    pub interfaces: Arc<dyn NetInterface>,
}
