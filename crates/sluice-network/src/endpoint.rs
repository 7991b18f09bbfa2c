//! Endpoint lifecycle.
//!
//! An endpoint moves through `absent -> created -> attached -> policy-applied`
//! on the way up, and is detached and deleted on the way down. Every failure
//! after creation removes the endpoint again so no orphan is left behind.

use std::sync::Arc;
use std::time::Duration;

use sluice_common::MultiError;
use tracing::{debug, error, info, warn};

use crate::applier::{Enforcement, default_deny_acls};
use crate::config::NetworkConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::host::{
    AclPolicy, Allocator, Endpoint, Firewall, HostBindings, HostError, HostNetwork, NatPolicy,
    NetInterface, Policy, QosPolicy,
};

/// Attempts at endpoint creation while the control plane reports the
/// transient error.
pub const CREATE_ATTEMPTS: u32 = 3;

/// Probes for the container adapter after attach.
pub const READINESS_PROBES: u32 = 10;

/// Delay between adapter probes.
pub const READINESS_INTERVAL: Duration = Duration::from_millis(200);

/// Lookups of the firewall rule the control plane generates on attach.
pub const GENERATED_RULE_LOOKUPS: u32 = 3;

/// Base delay between generated rule lookups; lookup `i` waits `i` times this.
pub const GENERATED_RULE_BACKOFF: Duration = Duration::from_millis(200);

/// Drives the endpoint of one container.
pub struct EndpointManager {
    network: Arc<dyn HostNetwork>,
    firewall: Arc<dyn Firewall>,
    interfaces: Arc<dyn NetInterface>,
    config: NetworkConfig,
    handle: String,
}

impl EndpointManager {
    /// Create a manager for the container `handle`.
    pub fn new(bindings: &HostBindings, config: NetworkConfig, handle: &str) -> Self {
        Self {
            network: bindings.network.clone(),
            firewall: bindings.firewall.clone(),
            interfaces: bindings.interfaces.clone(),
            config,
            handle: handle.to_string(),
        }
    }

    /// Create the container's endpoint on the shared network and attach it.
    ///
    /// Returns the endpoint as the control plane reports it after attach,
    /// with its address and allocators filled in.
    ///
    /// # Errors
    ///
    /// Fails when the network is missing, creation fails with anything but
    /// the transient error (or keeps failing with it), or any attach step
    /// fails. In the last case the endpoint is deleted before returning.
    pub async fn create(&self) -> NetworkResult<Endpoint> {
        let network = self.network.network_by_name(&self.config.network_name).await?;

        let mut descriptor = Endpoint {
            name: self.handle.clone(),
            virtual_network: network.id,
            dns_server_list: self.config.dns_servers.join(","),
            ..Default::default()
        };
        if self.config.maximum_outgoing_bandwidth != 0 {
            descriptor.policies.push(Policy::Qos(QosPolicy {
                maximum_outgoing_bandwidth_in_bytes: self.config.maximum_outgoing_bandwidth,
            }));
        }

        let created = self.create_with_retry(&descriptor).await?;
        debug!(handle = %self.handle, endpoint_id = %created.id, "Created endpoint");

        match self.attach(&created).await {
            Ok(attached) => {
                info!(handle = %self.handle, endpoint_id = %attached.id, "Attached endpoint");
                Ok(attached)
            }
            Err(err) => {
                if let Err(cleanup_err) = self.network.delete_endpoint(&created).await {
                    error!(
                        handle = %self.handle,
                        endpoint_id = %created.id,
                        error = %cleanup_err,
                        "Failed to delete endpoint after attach failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn create_with_retry(&self, descriptor: &Endpoint) -> NetworkResult<Endpoint> {
        let mut attempt = 1;
        loop {
            match self.network.create_endpoint(descriptor).await {
                Ok(created) => return Ok(created),
                Err(HostError::Unspecified) if attempt < CREATE_ATTEMPTS => {
                    warn!(handle = %self.handle, attempt, "Endpoint creation failed transiently, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn attach(&self, created: &Endpoint) -> NetworkResult<Endpoint> {
        self.network
            .hot_attach_endpoint(&self.handle, &created.id)
            .await?;
        self.wait_for_interface().await?;

        let attached = self.network.endpoint_by_id(&created.id).await?;
        if self.config.enforcement == Enforcement::Firewall {
            self.remove_generated_rule(&attached).await?;
        }
        Ok(attached)
    }

    async fn wait_for_interface(&self) -> NetworkResult<()> {
        let alias = format!("vEthernet ({})", self.handle);
        for _ in 0..READINESS_PROBES {
            if self.interfaces.exists(&alias).await? {
                return Ok(());
            }
            tokio::time::sleep(READINESS_INTERVAL).await;
        }
        Err(NetworkError::InterfaceNotReady { alias })
    }

    /// Delete the permissive rule the control plane creates for an attached
    /// endpoint port, which would otherwise bypass the handle's own rules.
    async fn remove_generated_rule(&self, endpoint: &Endpoint) -> NetworkResult<()> {
        let allocators = &endpoint.resources.allocators;
        let port = allocators
            .iter()
            .find(|a| a.allocator_type == Allocator::ENDPOINT_PORT)
            .filter(|a| a.compartment_id != 0 && !a.endpoint_port_guid.is_empty())
            .ok_or_else(|| NetworkError::InvalidEndpointAllocators {
                endpoint_id: endpoint.id.clone(),
                allocators: allocators.clone(),
            })?;

        let name = format!(
            "Compartment {} - {}",
            port.compartment_id, port.endpoint_port_guid
        );
        for lookup in 0..GENERATED_RULE_LOOKUPS {
            tokio::time::sleep(GENERATED_RULE_BACKOFF * lookup).await;
            if self.firewall.rule_exists(&name).await? {
                self.firewall.delete_rule(&name).await?;
                debug!(handle = %self.handle, rule = %name, "Deleted generated firewall rule");
                return Ok(());
            }
        }
        Err(NetworkError::FirewallRuleNotGenerated { name })
    }

    /// Add NAT and ACL policies to the endpoint's existing ones and commit
    /// them in one update.
    ///
    /// With the policy engine, an empty ACL list is replaced by block-all
    /// policies in both directions.
    ///
    /// # Errors
    ///
    /// Fails when the control plane rejects the update.
    pub async fn apply_policies(
        &self,
        mut endpoint: Endpoint,
        nat: Vec<NatPolicy>,
        mut acl: Vec<AclPolicy>,
    ) -> NetworkResult<Endpoint> {
        if acl.is_empty() && self.config.enforcement == Enforcement::PolicyEngine {
            acl = default_deny_acls();
        }

        endpoint.policies.extend(nat.into_iter().map(Policy::Nat));
        endpoint.policies.extend(acl.into_iter().map(Policy::Acl));

        let updated = self.network.update_endpoint(&endpoint).await?;
        debug!(
            handle = %self.handle,
            policies = updated.policies.len(),
            "Applied endpoint policies"
        );
        Ok(updated)
    }

    /// Set the MTU of the container's adapter to the configured value, or to
    /// the NAT network adapter's MTU when none is configured.
    ///
    /// # Errors
    ///
    /// Fails when either adapter cannot be queried or updated.
    pub async fn set_mtu(&self) -> NetworkResult<u32> {
        let mtu = match self.config.mtu {
            0 => {
                let nat = format!("vEthernet ({})", self.config.network_name);
                self.interfaces.mtu(&nat).await?
            }
            mtu => mtu,
        };

        let alias = format!("vEthernet ({})", self.handle);
        self.interfaces.set_mtu(&alias, mtu).await?;
        debug!(handle = %self.handle, mtu, "Set container adapter MTU");
        Ok(mtu)
    }

    /// Detach and delete the container's endpoint.
    ///
    /// A missing endpoint is success. Delete is attempted even when detach
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns the detach or delete failure, or both combined.
    pub async fn delete(&self) -> NetworkResult<()> {
        let endpoint = match self.network.endpoint_by_name(&self.handle).await {
            Ok(endpoint) => endpoint,
            Err(HostError::EndpointNotFound(_)) => {
                debug!(handle = %self.handle, "Endpoint already gone");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut errors = MultiError::new();
        match self
            .network
            .hot_detach_endpoint(&self.handle, &endpoint.id)
            .await
        {
            Ok(()) | Err(HostError::ComputeSystemDoesNotExist) => {}
            Err(err) => errors.push(err.into()),
        }
        errors.record(
            self.network
                .delete_endpoint(&endpoint)
                .await
                .map_err(NetworkError::from),
        );

        NetworkError::combine(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ENDPOINT_IP, FakeBindings, FakeInterfaces};
    use crate::host::{AclAction, Direction};

    const HANDLE: &str = "containerabc";

    fn policy_engine() -> NetworkConfig {
        NetworkConfig::default().with_enforcement(Enforcement::PolicyEngine)
    }

    fn endpoint_port(compartment_id: u32, guid: &str) -> Allocator {
        Allocator {
            allocator_type: Allocator::ENDPOINT_PORT,
            compartment_id,
            endpoint_port_guid: guid.to_string(),
        }
    }

    #[tokio::test]
    async fn create_attaches_and_refetches() {
        let fakes = FakeBindings::new("sluice-nat");
        let config = policy_engine()
            .with_dns_servers(vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()])
            .with_maximum_outgoing_bandwidth(1024);
        let manager = EndpointManager::new(&fakes.bindings(), config, HANDLE);

        let endpoint = manager.create().await.unwrap();

        assert_eq!(endpoint.name, HANDLE);
        assert_eq!(endpoint.virtual_network, "net-sluice-nat");
        assert_eq!(endpoint.dns_server_list, "8.8.8.8,8.8.4.4");
        assert_eq!(endpoint.ip_address, Some(ENDPOINT_IP));
        assert_eq!(
            endpoint.policies,
            vec![Policy::Qos(QosPolicy {
                maximum_outgoing_bandwidth_in_bytes: 1024
            })]
        );
        assert_eq!(
            fakes.host.calls(),
            vec![
                "network_by_name",
                "create_endpoint",
                "hot_attach_endpoint",
                "endpoint_by_id"
            ]
        );
        assert_eq!(
            *fakes.interfaces.probes.lock().unwrap(),
            vec!["vEthernet (containerabc)".to_string()]
        );
    }

    #[tokio::test]
    async fn create_without_bandwidth_has_no_qos() {
        let fakes = FakeBindings::new("sluice-nat");
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);

        let endpoint = manager.create().await.unwrap();
        assert!(endpoint.policies.is_empty());
    }

    #[tokio::test]
    async fn create_fails_without_network() {
        let fakes = FakeBindings::new("other-network");
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);

        let err = manager.create().await.unwrap_err();
        assert_eq!(err.to_string(), "Network sluice-nat not found");
        assert_eq!(fakes.host.calls(), vec!["network_by_name"]);
    }

    #[test_log::test(tokio::test)]
    async fn create_retries_transient_failures() {
        let fakes = FakeBindings::new("sluice-nat");
        fakes.host.state.lock().unwrap().create_endpoint_errors =
            [HostError::Unspecified, HostError::Unspecified].into();
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);

        manager.create().await.unwrap();

        let creates = fakes
            .host
            .calls()
            .iter()
            .filter(|c| *c == "create_endpoint")
            .count();
        assert_eq!(creates, 3);
    }

    #[tokio::test]
    async fn create_gives_up_after_three_transient_failures() {
        let fakes = FakeBindings::new("sluice-nat");
        fakes.host.state.lock().unwrap().create_endpoint_errors =
            vec![HostError::Unspecified; 4].into();
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);

        let err = manager.create().await.unwrap_err();

        assert!(matches!(err, NetworkError::Host(HostError::Unspecified)));
        assert_eq!(
            fakes.host.calls(),
            vec![
                "network_by_name",
                "create_endpoint",
                "create_endpoint",
                "create_endpoint"
            ]
        );
    }

    #[tokio::test]
    async fn create_does_not_retry_other_failures() {
        let fakes = FakeBindings::new("sluice-nat");
        fakes.host.state.lock().unwrap().create_endpoint_errors =
            [HostError::Other("cannot create endpoint".to_string())].into();
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);

        let err = manager.create().await.unwrap_err();

        assert_eq!(err.to_string(), "cannot create endpoint");
        assert_eq!(fakes.host.calls(), vec!["network_by_name", "create_endpoint"]);
    }

    #[test_log::test(tokio::test)]
    async fn attach_failure_deletes_endpoint() {
        let fakes = FakeBindings::new("sluice-nat");
        fakes.host.state.lock().unwrap().attach_error =
            Some(HostError::Other("cannot attach endpoint".to_string()));
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);

        let err = manager.create().await.unwrap_err();

        assert_eq!(err.to_string(), "cannot attach endpoint");
        assert!(fakes.host.endpoints().is_empty());
        assert_eq!(fakes.host.calls().last().unwrap(), "delete_endpoint");
    }

    #[test_log::test(tokio::test)]
    async fn cleanup_failure_keeps_original_error() {
        let fakes = FakeBindings::new("sluice-nat");
        {
            let mut state = fakes.host.state.lock().unwrap();
            state.endpoint_by_id_error = Some(HostError::Other("cannot get endpoint".to_string()));
            state.delete_error = Some(HostError::Other("cannot delete endpoint".to_string()));
        }
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);

        let err = manager.create().await.unwrap_err();
        assert_eq!(err.to_string(), "cannot get endpoint");
    }

    #[tokio::test(start_paused = true)]
    async fn adapter_that_never_appears_times_out() {
        let mut fakes = FakeBindings::new("sluice-nat");
        fakes.interfaces = std::sync::Arc::new(FakeInterfaces::default());
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);

        let started = tokio::time::Instant::now();
        let err = manager.create().await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "container interface vEthernet (containerabc) not created in time"
        );
        assert_eq!(fakes.interfaces.probes.lock().unwrap().len(), 10);
        assert!(started.elapsed() >= READINESS_INTERVAL * READINESS_PROBES);
        assert!(fakes.host.endpoints().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn adapter_that_appears_late_is_accepted() {
        let mut fakes = FakeBindings::new("sluice-nat");
        fakes.interfaces = std::sync::Arc::new(FakeInterfaces {
            appears_after: Some(3),
            ..Default::default()
        });
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);

        manager.create().await.unwrap();
        assert_eq!(fakes.interfaces.probes.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn firewall_mode_deletes_generated_rule() {
        let fakes = FakeBindings::new("sluice-nat");
        fakes.host.state.lock().unwrap().allocators = vec![endpoint_port(4, "abc-123")];
        fakes
            .firewall
            .generated
            .lock()
            .unwrap()
            .push("Compartment 4 - abc-123".to_string());
        let manager = EndpointManager::new(&fakes.bindings(), NetworkConfig::default(), HANDLE);

        manager.create().await.unwrap();

        assert_eq!(
            *fakes.firewall.deleted.lock().unwrap(),
            vec!["Compartment 4 - abc-123".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn firewall_mode_requires_endpoint_port_allocator() {
        let fakes = FakeBindings::new("sluice-nat");
        fakes.host.state.lock().unwrap().allocators = vec![endpoint_port(0, "abc-123")];
        let manager = EndpointManager::new(&fakes.bindings(), NetworkConfig::default(), HANDLE);

        let err = manager.create().await.unwrap_err();

        assert!(matches!(err, NetworkError::InvalidEndpointAllocators { .. }));
        assert!(fakes.host.endpoints().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn firewall_mode_fails_when_rule_never_generated() {
        let fakes = FakeBindings::new("sluice-nat");
        fakes.host.state.lock().unwrap().allocators = vec![endpoint_port(4, "abc-123")];
        let manager = EndpointManager::new(&fakes.bindings(), NetworkConfig::default(), HANDLE);

        let err = manager.create().await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "firewall rule Compartment 4 - abc-123 not generated in time"
        );
        assert_eq!(*fakes.firewall.exists_checks.lock().unwrap(), 3);
        assert!(fakes.host.endpoints().is_empty());
    }

    #[tokio::test]
    async fn apply_policies_appends_to_existing() {
        let fakes = FakeBindings::new("sluice-nat");
        let config = policy_engine().with_maximum_outgoing_bandwidth(1024);
        let manager = EndpointManager::new(&fakes.bindings(), config, HANDLE);
        let endpoint = manager.create().await.unwrap();

        let allow = AclPolicy::new(AclAction::Allow, Direction::Out, 6);
        let updated = manager
            .apply_policies(
                endpoint,
                vec![NatPolicy::tcp(8080, 40000)],
                vec![allow.clone()],
            )
            .await
            .unwrap();

        assert_eq!(updated.policies.len(), 3);
        assert!(matches!(updated.policies[0], Policy::Qos(_)));
        assert_eq!(updated.policies[1], Policy::Nat(NatPolicy::tcp(8080, 40000)));
        assert_eq!(updated.policies[2], Policy::Acl(allow));
        assert_eq!(fakes.host.endpoints()[0].policies, updated.policies);
    }

    #[tokio::test]
    async fn policy_engine_denies_by_default() {
        let fakes = FakeBindings::new("sluice-nat");
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);
        let endpoint = manager.create().await.unwrap();

        let updated = manager
            .apply_policies(endpoint, Vec::new(), Vec::new())
            .await
            .unwrap();

        assert_eq!(
            updated.policies,
            vec![
                Policy::Acl(AclPolicy::block_all(Direction::Out)),
                Policy::Acl(AclPolicy::block_all(Direction::In)),
            ]
        );
    }

    #[tokio::test]
    async fn firewall_mode_adds_no_default_acls() {
        let fakes = FakeBindings::new("sluice-nat");
        let manager = EndpointManager::new(&fakes.bindings(), NetworkConfig::default(), HANDLE);
        let endpoint = Endpoint {
            id: "ep-1".to_string(),
            name: HANDLE.to_string(),
            ..Default::default()
        };
        fakes.host.state.lock().unwrap().endpoints.push(endpoint.clone());

        let updated = manager
            .apply_policies(endpoint, vec![NatPolicy::tcp(80, 8000)], Vec::new())
            .await
            .unwrap();

        assert_eq!(updated.policies, vec![Policy::Nat(NatPolicy::tcp(80, 8000))]);
    }

    #[tokio::test]
    async fn delete_missing_endpoint_is_noop() {
        let fakes = FakeBindings::new("sluice-nat");
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);

        manager.delete().await.unwrap();

        assert_eq!(fakes.host.calls(), vec!["endpoint_by_name"]);
    }

    #[tokio::test]
    async fn delete_detaches_then_deletes() {
        let fakes = FakeBindings::new("sluice-nat");
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);
        manager.create().await.unwrap();
        fakes.host.state.lock().unwrap().calls.clear();

        manager.delete().await.unwrap();

        assert_eq!(
            fakes.host.calls(),
            vec!["endpoint_by_name", "hot_detach_endpoint", "delete_endpoint"]
        );
        assert!(fakes.host.endpoints().is_empty());
    }

    #[tokio::test]
    async fn delete_ignores_missing_compute_system() {
        let fakes = FakeBindings::new("sluice-nat");
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);
        manager.create().await.unwrap();
        fakes.host.state.lock().unwrap().detach_error = Some(HostError::ComputeSystemDoesNotExist);

        manager.delete().await.unwrap();
        assert!(fakes.host.endpoints().is_empty());
    }

    #[tokio::test]
    async fn delete_still_deletes_after_detach_failure() {
        let fakes = FakeBindings::new("sluice-nat");
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);
        manager.create().await.unwrap();
        fakes.host.state.lock().unwrap().detach_error =
            Some(HostError::Other("cannot detach".to_string()));

        let err = manager.delete().await.unwrap_err();

        assert_eq!(err.to_string(), "cannot detach");
        assert!(fakes.host.endpoints().is_empty());
    }

    #[tokio::test]
    async fn delete_combines_detach_and_delete_failures() {
        let fakes = FakeBindings::new("sluice-nat");
        let manager = EndpointManager::new(&fakes.bindings(), policy_engine(), HANDLE);
        manager.create().await.unwrap();
        {
            let mut state = fakes.host.state.lock().unwrap();
            state.detach_error = Some(HostError::Other("cannot detach".to_string()));
            state.delete_error = Some(HostError::Other("cannot delete".to_string()));
        }

        let err = manager.delete().await.unwrap_err();
        assert_eq!(err.to_string(), "cannot detach, cannot delete");
    }
}
