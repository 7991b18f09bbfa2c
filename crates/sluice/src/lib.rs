//! # Sluice
//!
//! Network plugin for a container runtime. Every container lifecycle event is
//! a separate invocation:
//!
//! - `create` / `delete`: manage the shared NAT network
//! - `up`: create and attach the container's endpoint, reserve host ports and
//!   enforce its inbound/outbound rules; the request is read from stdin and the
//!   response written to stdout as JSON
//! - `down`: remove the endpoint and release everything held for the container
//!
//! The work is done by [`sluice_network`]; this crate parses arguments and
//! wires the host bindings in.

#![warn(missing_docs)]

pub mod cli;
pub mod platform;
