//! Host port pool.
//!
//! Host ports handed out for inbound mappings are recorded in a JSON file
//! shared by every invocation of the plugin. Each invocation is its own
//! process, so the file is the single source of truth and every
//! read-decide-write cycle runs under an exclusive advisory lock.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};

/// Persisted port ownership, keyed by port.
///
/// On disk the map is grouped by owner as
/// `{"acquired_ports": {"<handle>": [port, ...]}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PoolFile", into = "PoolFile")]
pub struct Pool {
    /// Owner of each acquired port.
    pub acquired_ports: BTreeMap<u16, String>,
}

#[derive(Serialize, Deserialize)]
struct PoolFile {
    #[serde(default)]
    acquired_ports: BTreeMap<String, Vec<u16>>,
}

impl From<PoolFile> for Pool {
    fn from(file: PoolFile) -> Self {
        let acquired_ports = file
            .acquired_ports
            .into_iter()
            .flat_map(|(handle, ports)| ports.into_iter().map(move |port| (port, handle.clone())))
            .collect();
        Self { acquired_ports }
    }
}

impl From<Pool> for PoolFile {
    fn from(pool: Pool) -> Self {
        let mut acquired_ports: BTreeMap<String, Vec<u16>> = BTreeMap::new();
        for (port, handle) in pool.acquired_ports {
            acquired_ports.entry(handle).or_default().push(port);
        }
        Self { acquired_ports }
    }
}

impl Pool {
    /// Ports held by `handle`, ascending.
    #[must_use]
    pub fn ports_of(&self, handle: &str) -> Vec<u16> {
        self.acquired_ports
            .iter()
            .filter(|(_, owner)| owner.as_str() == handle)
            .map(|(port, _)| *port)
            .collect()
    }
}

/// The allocatable port range `[start_port, start_port + capacity)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracker {
    /// First managed port.
    pub start_port: u16,
    /// Number of managed ports.
    pub capacity: u16,
}

impl Tracker {
    /// Create a tracker for `capacity` ports starting at `start_port`.
    #[must_use]
    pub const fn new(start_port: u16, capacity: u16) -> Self {
        Self {
            start_port,
            capacity,
        }
    }

    /// Whether `port` belongs to the managed range.
    #[must_use]
    pub fn in_range(&self, port: u16) -> bool {
        let port = u32::from(port);
        let start = u32::from(self.start_port);
        port >= start && port < start + u32::from(self.capacity)
    }

    /// Record the lowest free managed port as owned by `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::PortPoolExhausted`] when every managed port is
    /// taken.
    pub fn acquire_one(&self, pool: &mut Pool, handle: &str) -> NetworkResult<u16> {
        let start = u32::from(self.start_port);
        let end = (start + u32::from(self.capacity)).min(u32::from(u16::MAX) + 1);

        let free = (start..end)
            .filter_map(|port| u16::try_from(port).ok())
            .find(|port| !pool.acquired_ports.contains_key(port))
            .ok_or(NetworkError::PortPoolExhausted)?;

        pool.acquired_ports.insert(free, handle.to_string());
        Ok(free)
    }

    /// Forget every port owned by `handle`.
    pub fn release_all(&self, pool: &mut Pool, handle: &str) {
        pool.acquired_ports.retain(|_, owner| owner != handle);
    }
}

/// Host port reservation.
pub trait PortAllocator: Send + Sync {
    /// Reserve a host port for `handle`.
    ///
    /// A non-zero `port` is returned unchanged as long as it lies outside the
    /// managed range; `0` reserves the lowest free managed port.
    ///
    /// # Errors
    ///
    /// Fails for explicit ports inside the managed range, when the pool is
    /// exhausted, or when the pool file cannot be locked, read or written.
    fn allocate_port(&self, handle: &str, port: u16) -> NetworkResult<u16>;

    /// Release every port reserved for `handle`.
    ///
    /// # Errors
    ///
    /// Fails when the pool file cannot be locked, read or written.
    fn release_all_ports(&self, handle: &str) -> NetworkResult<()>;
}

/// [`PortAllocator`] backed by a lock-guarded JSON file.
#[derive(Debug, Clone)]
pub struct FilePortAllocator {
    tracker: Tracker,
    path: PathBuf,
}

impl FilePortAllocator {
    /// Create an allocator persisting to `path`.
    pub fn new(tracker: Tracker, path: impl Into<PathBuf>) -> Self {
        Self {
            tracker,
            path: path.into(),
        }
    }

    /// The managed range.
    #[must_use]
    pub const fn tracker(&self) -> Tracker {
        self.tracker
    }

    /// Read the current pool under the lock.
    ///
    /// # Errors
    ///
    /// Fails when the pool file cannot be locked or decoded.
    pub fn snapshot(&self) -> NetworkResult<Pool> {
        LockedFile::open(&self.path)?.decode()
    }

    fn update<T>(&self, mutate: impl FnOnce(&mut Pool) -> NetworkResult<T>) -> NetworkResult<T> {
        let file = LockedFile::open(&self.path)?;
        let mut pool = file.decode()?;
        let value = mutate(&mut pool)?;
        file.encode_and_overwrite(&pool)?;
        Ok(value)
    }
}

impl PortAllocator for FilePortAllocator {
    fn allocate_port(&self, handle: &str, port: u16) -> NetworkResult<u16> {
        if port != 0 {
            if self.tracker.in_range(port) {
                return Err(NetworkError::ExplicitPortInRange { port });
            }
            return Ok(port);
        }

        let port = self.update(|pool| self.tracker.acquire_one(pool, handle))?;
        tracing::debug!(handle, port, "Allocated host port");
        Ok(port)
    }

    fn release_all_ports(&self, handle: &str) -> NetworkResult<()> {
        let released = self.update(|pool| {
            let held = pool.ports_of(handle);
            self.tracker.release_all(pool, handle);
            Ok(held)
        })?;

        tracing::debug!(handle, ports = ?released, "Released host ports");
        Ok(())
    }
}

/// The pool file, guarded by an exclusive lock on its `.lock` sibling until
/// dropped.
///
/// Closing the lock descriptor releases the lock, so every exit path unlocks.
/// The lock lives on a separate file because the pool file itself is replaced
/// on every write.
struct LockedFile {
    _lock: File,
    path: PathBuf,
}

impl LockedFile {
    fn open(path: &Path) -> NetworkResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(NetworkError::OpenLock)?;
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sibling(path, "lock"))
            .map_err(NetworkError::OpenLock)?;

        lock_exclusive(&lock).map_err(NetworkError::OpenLock)?;
        Ok(Self {
            _lock: lock,
            path: path.to_path_buf(),
        })
    }

    fn decode(&self) -> NetworkResult<Pool> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Pool::default()),
            Err(e) => return Err(NetworkError::DecodeState(e.to_string())),
        };

        if contents.trim().is_empty() {
            return Ok(Pool::default());
        }

        serde_json::from_str(&contents).map_err(|e| NetworkError::DecodeState(e.to_string()))
    }

    /// Replace the pool file with `pool`. The new contents are written to a
    /// temporary sibling and renamed over the pool file, so a failed write
    /// leaves the previous pool in place.
    fn encode_and_overwrite(&self, pool: &Pool) -> NetworkResult<()> {
        let json =
            serde_json::to_vec(pool).map_err(|e| NetworkError::EncodeState(e.to_string()))?;

        let temp_path = sibling(&self.path, "tmp");
        let written = File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(&json)?;
                file.sync_all()
            })
            .and_then(|()| std::fs::rename(&temp_path, &self.path));

        if let Err(e) = written {
            let _ = std::fs::remove_file(&temp_path);
            return Err(NetworkError::EncodeState(e.to_string()));
        }
        Ok(())
    }
}

/// `path` with `.suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Block until an exclusive advisory lock on `file` is held.
#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use rustix::fs::{FlockOperation, flock};

    flock(file, FlockOperation::LockExclusive).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "exclusive file locks are not supported on this platform",
    ))
}
