//! The embedded ordered key-value engine.
//!
//! The replication layer treats the engine as an opaque collaborator: an
//! ordered store with `insert`, `update`, `delete`, `lookup` and a
//! per-thread registration discipline. Results are plain `i32` return
//! codes (see [`crate::types`]) so they can ride RPC replies unchanged.
//!
//! [`SledEngine`] is the production implementation. sled handles its own
//! locking, so thread registration is bookkeeping only, but the discipline
//! is kept at the trait level: engines that need real registration get
//! called at the right times.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, error, info, warn};

use crate::types::{
    ENGINE_IO_ERROR, ENGINE_KEY_NOT_FOUND, ENGINE_KEY_TOO_LARGE, ENGINE_OK,
};

/// The ordered store every replica applies committed operations to.
///
/// Mutations are invoked only from the Raft apply path, in commit order.
/// `lookup` may be called concurrently from any registered thread.
pub trait StorageEngine: Send + Sync + 'static {
    /// Create or overwrite `key`.
    fn insert(&self, key: &[u8], value: &[u8]) -> i32;

    /// Overwrite `key`, which must already exist.
    fn update(&self, key: &[u8], value: &[u8]) -> i32;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &[u8]) -> i32;

    /// Point lookup. `(Some(value), 0)` on hit, `(None, rc)` otherwise.
    fn lookup(&self, key: &[u8]) -> (Option<Vec<u8>>, i32);

    /// Must be called once per thread before that thread reaches the
    /// engine through `lookup` or the apply path.
    fn register_thread(&self);

    fn deregister_thread(&self);

    /// Write engine statistics into `directory`. Returns false on failure.
    fn dump_stats(&self, directory: &str) -> bool;

    /// Flush caches/buffers to stable storage. Returns false on failure.
    fn clear_cache(&self) -> bool;

    /// Full contents, in key order. Used to build snapshots.
    fn iter_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, i32>;

    /// Replace the full contents. Used to install snapshots.
    fn replace_all(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> i32;
}

/// Engine tunables, filled from [`crate::config::ServerConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub path: String,
    pub cache_size: u64,
    pub max_key_size: usize,
    /// Advisory on-disk budget in bytes; 0 disables the check.
    pub disk_size: u64,
}

/// sled-backed [`StorageEngine`].
pub struct SledEngine {
    db: sled::Db,
    max_key_size: usize,
    registered_threads: AtomicUsize,
}

impl SledEngine {
    pub fn open(config: &EngineConfig) -> Result<Self, sled::Error> {
        let db = sled::Config::new()
            .path(Path::new(&config.path))
            .cache_capacity(config.cache_size)
            .open()?;

        if config.disk_size > 0 {
            let on_disk = db.size_on_disk()?;
            if on_disk > config.disk_size {
                warn!(
                    path = %config.path,
                    on_disk,
                    budget = config.disk_size,
                    "engine exceeds its configured disk budget"
                );
            }
        }

        info!(path = %config.path, entries = db.len(), "engine opened");

        Ok(Self {
            db,
            max_key_size: config.max_key_size,
            registered_threads: AtomicUsize::new(0),
        })
    }

    fn check_key(&self, key: &[u8]) -> i32 {
        if key.len() > self.max_key_size {
            ENGINE_KEY_TOO_LARGE
        } else {
            ENGINE_OK
        }
    }
}

fn io_rc(err: sled::Error) -> i32 {
    error!(error = %err, "engine I/O failure");
    ENGINE_IO_ERROR
}

impl StorageEngine for SledEngine {
    fn insert(&self, key: &[u8], value: &[u8]) -> i32 {
        let rc = self.check_key(key);
        if rc != ENGINE_OK {
            return rc;
        }
        match self.db.insert(key, value) {
            Ok(_) => ENGINE_OK,
            Err(e) => io_rc(e),
        }
    }

    fn update(&self, key: &[u8], value: &[u8]) -> i32 {
        let rc = self.check_key(key);
        if rc != ENGINE_OK {
            return rc;
        }
        // Mutations run in log order on the apply path, so the
        // contains/insert pair cannot interleave with another writer.
        match self.db.contains_key(key) {
            Ok(false) => ENGINE_KEY_NOT_FOUND,
            Ok(true) => match self.db.insert(key, value) {
                Ok(_) => ENGINE_OK,
                Err(e) => io_rc(e),
            },
            Err(e) => io_rc(e),
        }
    }

    fn delete(&self, key: &[u8]) -> i32 {
        let rc = self.check_key(key);
        if rc != ENGINE_OK {
            return rc;
        }
        match self.db.remove(key) {
            Ok(_) => ENGINE_OK,
            Err(e) => io_rc(e),
        }
    }

    fn lookup(&self, key: &[u8]) -> (Option<Vec<u8>>, i32) {
        if key.len() > self.max_key_size {
            return (None, ENGINE_KEY_TOO_LARGE);
        }
        match self.db.get(key) {
            Ok(Some(v)) => (Some(v.to_vec()), ENGINE_OK),
            Ok(None) => (None, ENGINE_KEY_NOT_FOUND),
            Err(e) => (None, io_rc(e)),
        }
    }

    fn register_thread(&self) {
        let n = self.registered_threads.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(registered = n, "engine thread registered");
    }

    fn deregister_thread(&self) {
        let n = self.registered_threads.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(registered = n, "engine thread deregistered");
    }

    fn dump_stats(&self, directory: &str) -> bool {
        let size_on_disk = match self.db.size_on_disk() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to read engine size");
                return false;
            }
        };
        let stats = format!(
            "entries: {}\nsize_on_disk: {}\nregistered_threads: {}\n",
            self.db.len(),
            size_on_disk,
            self.registered_threads.load(Ordering::Relaxed),
        );
        let path = Path::new(directory).join("engine-stats.txt");
        match std::fs::write(&path, stats) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to dump engine stats");
                false
            }
        }
    }

    fn clear_cache(&self) -> bool {
        match self.db.flush() {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "engine flush failed");
                false
            }
        }
    }

    fn iter_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, i32> {
        let mut pairs = Vec::new();
        for item in self.db.iter() {
            let (k, v) = item.map_err(io_rc)?;
            pairs.push((k.to_vec(), v.to_vec()));
        }
        Ok(pairs)
    }

    fn replace_all(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> i32 {
        if let Err(e) = self.db.clear() {
            return io_rc(e);
        }
        for (k, v) in pairs {
            if let Err(e) = self.db.insert(k, v) {
                return io_rc(e);
            }
        }
        match self.db.flush() {
            Ok(_) => ENGINE_OK,
            Err(e) => io_rc(e),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
