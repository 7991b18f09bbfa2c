//! Common error types for the Sluice plugin.

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`SluiceError`].
pub type SluiceResult<T> = Result<T, SluiceError>;

/// Common errors across the Sluice crates.
#[derive(Error, Diagnostic, Debug)]
pub enum SluiceError {
    /// Invalid container handle format.
    #[error("Invalid container handle: {handle}")]
    #[diagnostic(
        code(sluice::handle::invalid),
        help("Handles must be alphanumeric with hyphens, underscores and dots, 1-128 characters")
    )]
    InvalidHandle {
        /// The invalid handle.
        handle: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(sluice::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(sluice::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(sluice::unsupported),
        help("Host network bindings are only available on hosts with a native container network control plane")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(sluice::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for SluiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// An ordered collection of independent failures.
///
/// Teardown paths run several steps that must all be attempted; their errors
/// are collected here instead of keeping only the first. Displays as the
/// individual messages joined with `", "`.
#[derive(Debug)]
pub struct MultiError<E> {
    errors: Vec<E>,
}

impl<E> MultiError<E> {
    /// Create an empty collection.
    #[must_use]
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Record the error of a step, if it failed.
    pub fn record(&mut self, result: Result<(), E>) {
        if let Err(err) = result {
            self.errors.push(err);
        }
    }

    /// Push an error.
    pub fn push(&mut self, err: E) {
        self.errors.push(err);
    }

    /// Number of collected errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether no error was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterate over the underlying causes, in the order they were recorded.
    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.errors.iter()
    }

    /// Consume the collection, returning the underlying causes.
    #[must_use]
    pub fn into_inner(self) -> Vec<E> {
        self.errors
    }

    /// Collapse the collection into a single result.
    ///
    /// No errors yields `Ok(())`, exactly one yields that error unchanged, and
    /// more than one is wrapped with `wrap`.
    ///
    /// # Errors
    ///
    /// Returns the single recorded error, or all of them wrapped by `wrap`.
    pub fn into_result(mut self, wrap: impl FnOnce(Self) -> E) -> Result<(), E> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(wrap(self)),
        }
    }
}

impl<E> Default for MultiError<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for MultiError<E> {}

impl<'a, E> IntoIterator for &'a MultiError<E> {
    type Item = &'a E;
    type IntoIter = std::slice::Iter<'a, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
