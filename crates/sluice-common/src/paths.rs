//! Standard filesystem paths for Sluice.

use std::path::PathBuf;

use once_cell::sync::Lazy;

#[cfg(windows)]
const DEFAULT_ROOT: &str = r"C:\ProgramData\sluice";
#[cfg(not(windows))]
const DEFAULT_ROOT: &str = "/var/lib/sluice";

/// Default root directory for persisted plugin state.
pub static SLUICE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SLUICE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_ROOT))
});

/// Standard paths used by the plugin.
///
/// Every invocation of the plugin is a separate process; the files under
/// `root` are the only state that outlives one.
#[derive(Debug, Clone)]
pub struct SluicePaths {
    /// Root data directory (default: /var/lib/sluice).
    pub root: PathBuf,
}

impl SluicePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host port pool state file.
    #[must_use]
    pub fn port_pool(&self) -> PathBuf {
        self.root.join("ports.json")
    }

    /// Create the root directory.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        tracing::debug!(root = %self.root.display(), "State directory ready");
        Ok(())
    }
}

impl Default for SluicePaths {
    fn default() -> Self {
        Self {
            root: SLUICE_ROOT.clone(),
        }
    }
}
