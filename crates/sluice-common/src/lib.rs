//! # sluice-common
//!
//! Shared utilities and types for the Sluice network plugin.
//!
//! This crate provides common functionality used across all Sluice crates:
//! - Container handle validation
//! - Standard filesystem paths for persisted plugin state
//! - Common error types, including the aggregate [`MultiError`]

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{MultiError, SluiceError, SluiceResult};
pub use id::Handle;
pub use paths::SluicePaths;
