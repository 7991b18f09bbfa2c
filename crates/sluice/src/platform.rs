//! Host bindings for the running platform.

use sluice_common::{SluiceError, SluiceResult};
use sluice_network::HostBindings;

/// Bindings to the native container network control plane, host firewall and
/// in-container execution of this host.
///
/// # Errors
///
/// Returns [`SluiceError::Unsupported`] on hosts without a native container
/// network control plane.
pub fn host_bindings() -> SluiceResult<HostBindings> {
    Err(SluiceError::Unsupported {
        feature: format!("container network control plane on {}", std::env::consts::OS),
    })
}
