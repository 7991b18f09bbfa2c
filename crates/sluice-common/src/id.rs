//! Container handle validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SluiceError, SluiceResult};

/// A validated container handle.
///
/// The handle scopes every host resource the plugin manages for a container:
/// the endpoint name, the host firewall rule name and the owner recorded in
/// the port pool. Handles must:
/// - Be 1-128 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

impl Handle {
    /// Maximum length of a handle.
    pub const MAX_LENGTH: usize = 128;

    /// Create a new handle, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle format is invalid.
    pub fn new(handle: impl Into<String>) -> SluiceResult<Self> {
        let handle = handle.into();
        Self::validate(&handle)?;
        Ok(Self(handle))
    }

    /// Get the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(handle: &str) -> SluiceResult<()> {
        let invalid = || SluiceError::InvalidHandle {
            handle: handle.to_string(),
        };

        if handle.is_empty() || handle.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        if !handle.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if !handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Handle {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Handle {
    type Error = SluiceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
