//! Recording fakes of the host collaborators.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{NetworkError, NetworkResult};
use crate::host::{
    Allocator, ContainerShell, Endpoint, Firewall, FirewallRule, HostBindings, HostError,
    HostNetwork, HostNetworkInfo, HostResult, NetInterface,
};
use crate::pool::PortAllocator;

#[derive(Default)]
pub struct FakeAllocator {
    pub next_port: u16,
    pub allocate_error: Option<String>,
    pub release_error: Option<String>,
    pub allocations: Mutex<Vec<(String, u16)>>,
    pub releases: Mutex<Vec<String>>,
}

impl PortAllocator for FakeAllocator {
    fn allocate_port(&self, handle: &str, port: u16) -> NetworkResult<u16> {
        self.allocations
            .lock()
            .unwrap()
            .push((handle.to_string(), port));
        if let Some(message) = &self.allocate_error {
            return Err(HostError::Other(message.clone()).into());
        }
        Ok(if port == 0 { self.next_port } else { port })
    }

    fn release_all_ports(&self, handle: &str) -> NetworkResult<()> {
        self.releases.lock().unwrap().push(handle.to_string());
        match &self.release_error {
            Some(message) => Err(NetworkError::Host(HostError::Other(message.clone()))),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct FakeFirewall {
    pub create_error: Option<String>,
    pub delete_error: Option<String>,
    pub created: Mutex<Vec<FirewallRule>>,
    pub deleted: Mutex<Vec<String>>,
    /// Rules the control plane generated on its own, by name.
    pub generated: Mutex<Vec<String>>,
    pub exists_checks: Mutex<usize>,
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn create_rule(&self, rule: &FirewallRule) -> HostResult<()> {
        self.created.lock().unwrap().push(rule.clone());
        self.create_error
            .as_ref()
            .map_or(Ok(()), |m| Err(HostError::Other(m.clone())))
    }

    async fn delete_rule(&self, name: &str) -> HostResult<()> {
        self.deleted.lock().unwrap().push(name.to_string());
        self.generated.lock().unwrap().retain(|n| n != name);
        self.delete_error
            .as_ref()
            .map_or(Ok(()), |m| Err(HostError::Other(m.clone())))
    }

    async fn rule_exists(&self, name: &str) -> HostResult<bool> {
        *self.exists_checks.lock().unwrap() += 1;
        Ok(self.generated.lock().unwrap().iter().any(|n| n == name)
            || self.created.lock().unwrap().iter().any(|r| r.name == name))
    }
}

#[derive(Default)]
pub struct FakeShell {
    pub exit_code: i32,
    pub commands: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerShell for FakeShell {
    async fn exec(&self, _handle: &str, command_line: &str) -> HostResult<i32> {
        self.commands.lock().unwrap().push(command_line.to_string());
        Ok(self.exit_code)
    }
}

/// Adapter enumeration that reports the adapter once `appears_after` probes
/// have missed; `None` never reports it. Every adapter reports `adapter_mtu`.
#[derive(Default)]
pub struct FakeInterfaces {
    pub appears_after: Option<usize>,
    pub probes: Mutex<Vec<String>>,
    pub adapter_mtu: u32,
    pub set_mtu_error: Option<HostError>,
    pub mtu_queries: Mutex<Vec<String>>,
    pub mtus_set: Mutex<Vec<(String, u32)>>,
}

impl FakeInterfaces {
    pub fn ready() -> Self {
        Self {
            appears_after: Some(0),
            adapter_mtu: 1500,
            ..Default::default()
        }
    }
}

#[async_trait]
impl NetInterface for FakeInterfaces {
    async fn exists(&self, alias: &str) -> HostResult<bool> {
        let mut probes = self.probes.lock().unwrap();
        let missed = probes.len();
        probes.push(alias.to_string());
        Ok(self.appears_after.is_some_and(|n| missed >= n))
    }

    async fn mtu(&self, alias: &str) -> HostResult<u32> {
        self.mtu_queries.lock().unwrap().push(alias.to_string());
        Ok(self.adapter_mtu)
    }

    async fn set_mtu(&self, alias: &str, mtu: u32) -> HostResult<()> {
        if let Some(err) = &self.set_mtu_error {
            return Err(err.clone());
        }
        self.mtus_set.lock().unwrap().push((alias.to_string(), mtu));
        Ok(())
    }
}

#[derive(Default)]
pub struct HostState {
    pub networks: Vec<HostNetworkInfo>,
    pub endpoints: Vec<Endpoint>,
    /// Failures returned by successive `create_endpoint` calls before one
    /// succeeds.
    pub create_endpoint_errors: VecDeque<HostError>,
    pub attach_error: Option<HostError>,
    pub detach_error: Option<HostError>,
    pub delete_error: Option<HostError>,
    pub update_error: Option<HostError>,
    pub endpoint_by_id_error: Option<HostError>,
    /// Allocators reported on endpoints once attached.
    pub allocators: Vec<Allocator>,
    pub calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeHost {
    pub state: Mutex<HostState>,
}

pub const ENDPOINT_IP: Ipv4Addr = Ipv4Addr::new(172, 30, 0, 2);

impl FakeHost {
    pub fn with_network(name: &str) -> Self {
        let host = Self::default();
        host.state.lock().unwrap().networks.push(HostNetworkInfo {
            id: format!("net-{name}"),
            name: name.to_string(),
            network_type: "nat".to_string(),
            ..Default::default()
        });
        host
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().unwrap().endpoints.clone()
    }

    fn record(&self, call: &str) -> std::sync::MutexGuard<'_, HostState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.to_string());
        state
    }
}

#[async_trait]
impl HostNetwork for FakeHost {
    async fn network_by_name(&self, name: &str) -> HostResult<HostNetworkInfo> {
        let state = self.record("network_by_name");
        state
            .networks
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .ok_or_else(|| HostError::NetworkNotFound(name.to_string()))
    }

    async fn create_network(&self, network: &HostNetworkInfo) -> HostResult<HostNetworkInfo> {
        let mut state = self.record("create_network");
        let mut created = network.clone();
        created.id = format!("net-{}", network.name);
        state.networks.push(created.clone());
        Ok(created)
    }

    async fn delete_network(&self, network: &HostNetworkInfo) -> HostResult<()> {
        let mut state = self.record("delete_network");
        state.networks.retain(|n| n.id != network.id);
        Ok(())
    }

    async fn create_endpoint(&self, endpoint: &Endpoint) -> HostResult<Endpoint> {
        let mut state = self.record("create_endpoint");
        if let Some(err) = state.create_endpoint_errors.pop_front() {
            return Err(err);
        }
        let mut created = endpoint.clone();
        created.id = format!("ep-{}", endpoint.name);
        created.ip_address = Some(ENDPOINT_IP);
        state.endpoints.push(created.clone());
        Ok(created)
    }

    async fn update_endpoint(&self, endpoint: &Endpoint) -> HostResult<Endpoint> {
        let mut state = self.record("update_endpoint");
        if let Some(err) = state.update_error.clone() {
            return Err(err);
        }
        let stored = state
            .endpoints
            .iter_mut()
            .find(|e| e.id == endpoint.id)
            .ok_or_else(|| HostError::EndpointNotFound(endpoint.id.clone()))?;
        *stored = endpoint.clone();
        Ok(endpoint.clone())
    }

    async fn delete_endpoint(&self, endpoint: &Endpoint) -> HostResult<()> {
        let mut state = self.record("delete_endpoint");
        if let Some(err) = state.delete_error.clone() {
            return Err(err);
        }
        state.endpoints.retain(|e| e.id != endpoint.id);
        Ok(())
    }

    async fn endpoint_by_id(&self, id: &str) -> HostResult<Endpoint> {
        let state = self.record("endpoint_by_id");
        if let Some(err) = state.endpoint_by_id_error.clone() {
            return Err(err);
        }
        state
            .endpoints
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| HostError::EndpointNotFound(id.to_string()))
    }

    async fn endpoint_by_name(&self, name: &str) -> HostResult<Endpoint> {
        let state = self.record("endpoint_by_name");
        state
            .endpoints
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| HostError::EndpointNotFound(name.to_string()))
    }

    async fn hot_attach_endpoint(&self, _container_id: &str, endpoint_id: &str) -> HostResult<()> {
        let mut state = self.record("hot_attach_endpoint");
        if let Some(err) = state.attach_error.clone() {
            return Err(err);
        }
        let allocators = state.allocators.clone();
        if let Some(endpoint) = state.endpoints.iter_mut().find(|e| e.id == endpoint_id) {
            endpoint.resources.allocators = allocators;
        }
        Ok(())
    }

    async fn hot_detach_endpoint(&self, _container_id: &str, _endpoint_id: &str) -> HostResult<()> {
        let state = self.record("hot_detach_endpoint");
        state.detach_error.clone().map_or(Ok(()), Err)
    }
}

/// A full set of fakes, kept typed so tests can inspect them.
pub struct FakeBindings {
    pub host: Arc<FakeHost>,
    pub firewall: Arc<FakeFirewall>,
    pub shell: Arc<FakeShell>,
    pub interfaces: Arc<FakeInterfaces>,
}

impl FakeBindings {
    pub fn new(network_name: &str) -> Self {
        Self {
            host: Arc::new(FakeHost::with_network(network_name)),
            firewall: Arc::new(FakeFirewall::default()),
            shell: Arc::new(FakeShell::default()),
            interfaces: Arc::new(FakeInterfaces::ready()),
        }
    }

    pub fn bindings(&self) -> HostBindings {
        HostBindings {
            network: self.host.clone(),
            firewall: self.firewall.clone(),
            shell: self.shell.clone(),
            interfaces: self.interfaces.clone(),
        }
    }
}
