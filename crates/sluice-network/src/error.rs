//! Network error types.

use std::time::Duration;

use miette::Diagnostic;
use sluice_common::MultiError;
use thiserror::Error;

use crate::host::{Allocator, HostError, Subnet};

/// Result type alias using [`NetworkError`].
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors raised while translating rules, allocating ports or driving
/// endpoints.
#[derive(Error, Diagnostic, Debug)]
pub enum NetworkError {
    /// An explicit host port collides with the managed allocation range.
    #[error("cannot specify port from allocation range: {port}")]
    #[diagnostic(
        code(sluice::ports::explicit_in_range),
        help("Pick a host port outside the configured start_port/total_ports range, or use 0")
    )]
    ExplicitPortInRange {
        /// The requested port.
        port: u16,
    },

    /// An `up` request asks for more inbound mappings than a container may
    /// hold.
    #[error("invalid number of port mappings: {count}")]
    #[diagnostic(
        code(sluice::rules::too_many_mappings),
        help("A container accepts at most two inbound port mappings")
    )]
    TooManyPortMappings {
        /// Number of mappings requested.
        count: usize,
    },

    /// A port value does not fit in 16 bits.
    #[error("invalid port: {port}")]
    #[diagnostic(code(sluice::ports::invalid))]
    InvalidPort {
        /// The offending value.
        port: u32,
    },

    /// Every port in the managed range is owned by some container.
    #[error("port pool exhausted")]
    #[diagnostic(code(sluice::ports::exhausted))]
    PortPoolExhausted,

    /// The pool file could not be opened or locked.
    #[error("open lock: {0}")]
    #[diagnostic(code(sluice::ports::lock))]
    OpenLock(#[source] std::io::Error),

    /// The pool file could not be read or parsed.
    #[error("decoding state file: {0}")]
    #[diagnostic(code(sluice::ports::decode))]
    DecodeState(String),

    /// The pool file could not be rewritten.
    #[error("encode and overwrite: {0}")]
    #[diagnostic(code(sluice::ports::encode))]
    EncodeState(String),

    /// A NetOut rule names a protocol code with no meaning.
    #[error("invalid protocol: {0}")]
    #[diagnostic(code(sluice::rules::invalid_protocol))]
    InvalidProtocol(u8),

    /// A host collaborator failed.
    #[error(transparent)]
    #[diagnostic(code(sluice::host))]
    Host(#[from] HostError),

    /// An in-container command exited unsuccessfully.
    #[error("running '{command_line}' in {handle} failed: exit code {exit_code}")]
    #[diagnostic(code(sluice::container::command_failed))]
    CommandFailed {
        /// The command line that was executed.
        command_line: String,
        /// Container the command ran in.
        handle: String,
        /// Exit code reported by the container.
        exit_code: i32,
    },

    /// An in-container command did not finish in time.
    #[error("running '{command_line}' in {handle} timed out after {timeout:?}")]
    #[diagnostic(code(sluice::container::command_timeout))]
    CommandTimeout {
        /// The command line that was executed.
        command_line: String,
        /// Container the command ran in.
        handle: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// The container's virtual adapter never appeared on the host.
    #[error("container interface {alias} not created in time")]
    #[diagnostic(code(sluice::endpoint::not_ready))]
    InterfaceNotReady {
        /// Adapter alias that was polled.
        alias: String,
    },

    /// An attached endpoint carries no usable port allocator.
    #[error("invalid endpoint {endpoint_id} allocators: {allocators:?}")]
    #[diagnostic(code(sluice::endpoint::invalid_allocators))]
    InvalidEndpointAllocators {
        /// Endpoint identifier.
        endpoint_id: String,
        /// Allocators found on the endpoint.
        allocators: Vec<Allocator>,
    },

    /// An attached endpoint was reported without an IPv4 address.
    #[error("endpoint {endpoint_id} has no IP address")]
    #[diagnostic(code(sluice::endpoint::no_address))]
    MissingEndpointAddress {
        /// Endpoint identifier.
        endpoint_id: String,
    },

    /// The control plane never generated the expected firewall rule.
    #[error("firewall rule {name} not generated in time")]
    #[diagnostic(code(sluice::endpoint::rule_not_generated))]
    FirewallRuleNotGenerated {
        /// Rule name that was polled.
        name: String,
    },

    /// A network with the configured name exists with other subnets.
    #[error("network name already exists with different subnets: {name}")]
    #[diagnostic(
        code(sluice::network::name_conflict),
        help("Delete the existing network or change network_name in the config")
    )]
    NetworkNameConflict {
        /// Network name.
        name: String,
        /// Subnets of the existing network.
        subnets: Vec<Subnet>,
    },

    /// A response could not be encoded.
    #[error("encoding output: {0}")]
    #[diagnostic(code(sluice::output))]
    EncodeOutput(#[from] serde_json::Error),

    /// Several independent steps failed.
    #[error("{0}")]
    #[diagnostic(code(sluice::combined))]
    Combined(MultiError<Self>),
}

impl NetworkError {
    /// Collapse the failures of independent steps into one result.
    ///
    /// # Errors
    ///
    /// Returns the only error unchanged, or [`NetworkError::Combined`] when
    /// several steps failed.
    pub fn combine(errors: MultiError<Self>) -> NetworkResult<()> {
        errors.into_result(Self::Combined)
    }
}
