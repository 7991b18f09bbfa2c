//! # sluice-network
//!
//! Network policy translation, host port allocation and endpoint lifecycle
//! for the Sluice container network plugin.
//!
//! - [`rules`]: NetIn/NetOut rule model and CIDR decomposition
//! - [`pool`]: host port pool persisted under a cross-process file lock
//! - [`applier`]: the policy-engine and host-firewall enforcement backends
//! - [`endpoint`]: endpoint create/attach, policy application and teardown
//! - [`manager`]: the `create`/`delete`/`up`/`down` plugin operations
//! - [`host`]: traits for the host facilities the plugin drives

#![warn(missing_docs)]

pub mod applier;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod manager;
pub mod netsh;
pub mod pool;
pub mod rules;

#[cfg(test)]
mod testing;

pub use applier::{Enforcement, FirewallApplier, Inbound, PolicyApplier, RuleApplier};
pub use config::NetworkConfig;
pub use endpoint::EndpointManager;
pub use error::{NetworkError, NetworkResult};
pub use host::{HostBindings, HostError};
pub use manager::{NetworkManager, UpInputs, UpOutputs};
pub use pool::{FilePortAllocator, PortAllocator, Tracker};
pub use rules::{IpRange, NetIn, NetOut, PortMapping, PortRange, Protocol};
