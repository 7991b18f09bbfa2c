//! Plugin operations: shared network create/delete and container up/down.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sluice_common::{Handle, MultiError};
use tracing::{error, info};

use crate::applier::{Enforcement, FirewallApplier, PolicyApplier, RuleApplier};
use crate::config::NetworkConfig;
use crate::endpoint::EndpointManager;
use crate::error::{NetworkError, NetworkResult};
use crate::host::{Endpoint, HostBindings, HostError, HostNetworkInfo, Subnet};
use crate::netsh::NetshRunner;
use crate::pool::PortAllocator;
use crate::rules::{NetIn, NetOut, PortMapping};

/// Host address reported to callers that still read it.
pub const LEGACY_HOST_IP: &str = "255.255.255.255";

/// Inbound port mappings a single container may request.
pub const MAX_PORT_MAPPINGS: usize = 2;

/// Request body of `up`, read from standard input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpInputs {
    /// Process id of the container's init process.
    #[serde(rename = "Pid", default)]
    pub pid: u32,
    /// Free-form caller properties.
    #[serde(rename = "Properties", default)]
    pub properties: BTreeMap<String, String>,
    /// Outbound allow rules.
    #[serde(default)]
    pub netout_rules: Vec<NetOut>,
    /// Inbound port-forwards.
    #[serde(default)]
    pub netin: Vec<NetIn>,
}

/// Properties reported by `up`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpProperties {
    /// Address of the container on the shared network.
    #[serde(rename = "garden.network.container-ip")]
    pub container_ip: String,
    /// Always [`LEGACY_HOST_IP`].
    #[serde(rename = "garden.network.host-ip")]
    pub host_ip: String,
    /// JSON-encoded list of [`PortMapping`]s.
    #[serde(rename = "garden.network.mapped-ports")]
    pub mapped_ports: String,
}

/// Response body of `up`, written to standard output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpOutputs {
    /// Reported properties.
    pub properties: UpProperties,
    /// DNS servers handed to the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
}

impl UpOutputs {
    /// Decode the mapped ports property.
    ///
    /// # Errors
    ///
    /// Fails when the property is not a JSON list of port mappings.
    pub fn mapped_ports(&self) -> serde_json::Result<Vec<PortMapping>> {
        serde_json::from_str(&self.properties.mapped_ports)
    }
}

/// Entry point for every plugin operation.
pub struct NetworkManager {
    bindings: HostBindings,
    allocator: Arc<dyn PortAllocator>,
    config: NetworkConfig,
}

impl NetworkManager {
    /// Create a manager over the given host bindings and port allocator.
    pub fn new(
        bindings: HostBindings,
        allocator: Arc<dyn PortAllocator>,
        config: NetworkConfig,
    ) -> Self {
        Self {
            bindings,
            allocator,
            config,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn endpoints(&self, handle: &Handle) -> EndpointManager {
        EndpointManager::new(&self.bindings, self.config.clone(), handle.as_str())
    }

    fn applier(&self, handle: &Handle) -> Box<dyn RuleApplier> {
        let netsh = NetshRunner::new(self.bindings.shell.clone(), handle.as_str());
        match self.config.enforcement {
            Enforcement::PolicyEngine => Box::new(PolicyApplier::new(
                handle.as_str(),
                self.allocator.clone(),
                netsh,
            )),
            Enforcement::Firewall => Box::new(FirewallApplier::new(
                handle.as_str(),
                self.allocator.clone(),
                self.bindings.firewall.clone(),
                netsh,
            )),
        }
    }

    /// Ensure the shared NAT network exists with the configured subnet.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::NetworkNameConflict`] when a network with the
    /// configured name exists with other subnets, or the control plane error.
    pub async fn create_host_network(&self) -> NetworkResult<HostNetworkInfo> {
        let name = &self.config.network_name;
        let wanted = Subnet {
            address_prefix: self.config.subnet_range.clone(),
            gateway_address: self.config.gateway_address.clone(),
        };

        match self.bindings.network.network_by_name(name).await {
            Ok(existing) => {
                let same_subnet = matches!(
                    existing.subnets.as_slice(),
                    [subnet] if subnet.address_prefix == wanted.address_prefix
                        && subnet.gateway_address == wanted.gateway_address
                );
                if same_subnet {
                    info!(network = %name, "NAT network already exists");
                    Ok(existing)
                } else {
                    Err(NetworkError::NetworkNameConflict {
                        name: name.clone(),
                        subnets: existing.subnets,
                    })
                }
            }
            Err(HostError::NetworkNotFound(_)) => {
                let network = HostNetworkInfo {
                    name: name.clone(),
                    network_type: "nat".to_string(),
                    subnets: vec![wanted],
                    dns_server_list: self.config.dns_servers.join(","),
                    ..Default::default()
                };
                let created = self.bindings.network.create_network(&network).await?;
                info!(network = %name, id = %created.id, "Created NAT network");
                Ok(created)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the shared NAT network. A missing network is success.
    ///
    /// # Errors
    ///
    /// Returns the control plane error.
    pub async fn delete_host_network(&self) -> NetworkResult<()> {
        let name = &self.config.network_name;
        let network = match self.bindings.network.network_by_name(name).await {
            Ok(network) => network,
            Err(HostError::NetworkNotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        self.bindings.network.delete_network(&network).await?;
        info!(network = %name, "Deleted NAT network");
        Ok(())
    }

    /// Bring up networking for the container `handle`.
    ///
    /// Creates and attaches the endpoint, translates every NetIn and then
    /// every NetOut rule, applies the resulting policies and sets the
    /// container adapter's MTU.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::TooManyPortMappings`] before touching the host
    /// when more than [`MAX_PORT_MAPPINGS`] NetIn rules are given. Otherwise
    /// returns the first failure. When it happens after the endpoint was
    /// created, everything set up so far is torn down first.
    pub async fn up(&self, handle: &Handle, inputs: &UpInputs) -> NetworkResult<UpOutputs> {
        if inputs.netin.len() > MAX_PORT_MAPPINGS {
            return Err(NetworkError::TooManyPortMappings {
                count: inputs.netin.len(),
            });
        }

        let endpoints = self.endpoints(handle);
        let applier = self.applier(handle);

        let endpoint = endpoints.create().await?;

        match self
            .configure(&endpoints, applier.as_ref(), endpoint, inputs)
            .await
        {
            Ok(outputs) => {
                info!(handle = %handle, container_ip = %outputs.properties.container_ip, "Network up");
                Ok(outputs)
            }
            Err(err) => {
                if let Err(down_err) = self.down(handle).await {
                    error!(handle = %handle, error = %down_err, "Teardown after failed up also failed");
                }
                Err(err)
            }
        }
    }

    async fn configure(
        &self,
        endpoints: &EndpointManager,
        applier: &dyn RuleApplier,
        endpoint: Endpoint,
        inputs: &UpInputs,
    ) -> NetworkResult<UpOutputs> {
        let container_ip: Ipv4Addr = endpoint.ip_address.ok_or_else(|| {
            NetworkError::MissingEndpointAddress {
                endpoint_id: endpoint.id.clone(),
            }
        })?;

        let mut mappings = Vec::with_capacity(inputs.netin.len());
        let mut nat = Vec::with_capacity(inputs.netin.len());
        let mut acl = Vec::new();

        for rule in &inputs.netin {
            let inbound = applier.net_in(*rule, container_ip).await?;
            mappings.push(inbound.mapping);
            nat.push(inbound.nat);
            acl.extend(inbound.acl);
        }
        for rule in &inputs.netout_rules {
            acl.extend(applier.net_out(rule, container_ip).await?);
        }

        endpoints.apply_policies(endpoint, nat, acl).await?;
        endpoints.set_mtu().await?;

        Ok(UpOutputs {
            properties: UpProperties {
                container_ip: container_ip.to_string(),
                host_ip: LEGACY_HOST_IP.to_string(),
                mapped_ports: serde_json::to_string(&mappings)?,
            },
            dns_servers: self.config.dns_servers.clone(),
        })
    }

    /// Tear down networking for the container `handle`.
    ///
    /// Deletes the endpoint and releases every port and firewall rule held
    /// by the handle. Both steps always run.
    ///
    /// # Errors
    ///
    /// Returns the failure of either step, or both combined.
    pub async fn down(&self, handle: &Handle) -> NetworkResult<()> {
        let mut errors = MultiError::new();
        errors.record(self.endpoints(handle).delete().await);
        errors.record(self.applier(handle).cleanup().await);
        NetworkError::combine(errors)?;

        info!(handle = %handle, "Network down");
        Ok(())
    }
}
