//! Durable, integrity-checked storage for opaque blocks identified by string
//! id. One [`BlockStore`] lives inside each node process.
//!
//! Persistence mirrors `blockframe::chunker::io`'s payload-plus-manifest
//! convention: every block is two artifacts on disk — the raw payload and a
//! sidecar JSON record `{size, checksum, createdAt}`. On retrieve, the
//! recomputed checksum is compared against the sidecar; a mismatch is an
//! `IntegrityFailure`, never silent corruption.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::BlockStoreError;
use crate::parity::checksum;

/// Payloads at or above this size are read back via `memmap2` rather than a
/// single `fs::read`, mirroring the large-file path in
/// `blockframe::chunker::commit`.
const MMAP_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Sidecar {
    size: u64,
    checksum: String,
    created_at: chrono::DateTime<Utc>,
}

/// Durable per-node block store rooted at a configured data directory.
pub struct BlockStore {
    root: PathBuf,
    capacity: u64,
    /// Per-blockId serialization: operations on distinct ids proceed in
    /// parallel, operations on the same id are serialized.
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl BlockStore {
    /// Creates a block store rooted at `root`, creating the directory if
    /// necessary. `capacity` is the advisory total capacity in bytes used for
    /// space accounting.
    ///
    /// # Examples
    ///
    /// ```
    /// # use raidframe::block_store::BlockStore;
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let dir = tempfile::tempdir()?;
    /// let store = BlockStore::new(dir.path(), 1_000_000)?;
    /// assert_eq!(store.used_space()?, 0);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(root: &Path, capacity: u64) -> Result<Self, BlockStoreError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            capacity,
            locks: RwLock::new(HashMap::new()),
        })
    }

    fn lock_for(&self, block_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().get(block_id) {
            return lock.clone();
        }
        let mut locks = self.locks.write();
        locks
            .entry(block_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn payload_path(&self, block_id: &str) -> PathBuf {
        self.root.join(format!("{block_id}.bin"))
    }

    fn sidecar_path(&self, block_id: &str) -> PathBuf {
        self.root.join(format!("{block_id}.meta.json"))
    }

    /// Stores `bytes` under `block_id`. Idempotent: storing the same id again
    /// overwrites the previous payload (last writer wins).
    pub fn store_block(&self, block_id: &str, bytes: &[u8]) -> Result<(), BlockStoreError> {
        if block_id.is_empty() {
            return Err(BlockStoreError::InvalidId);
        }

        let lock = self.lock_for(block_id);
        let _guard = lock.lock();

        let available = self.available_space_locked()?;
        if bytes.len() as u64 > available {
            return Err(BlockStoreError::InsufficientSpace {
                needed: bytes.len() as u64,
                available,
            });
        }

        fs::write(self.payload_path(block_id), bytes)?;

        let sidecar = Sidecar {
            size: bytes.len() as u64,
            checksum: checksum(bytes),
            created_at: Utc::now(),
        };
        fs::write(
            self.sidecar_path(block_id),
            serde_json::to_vec_pretty(&sidecar).map_err(|e| {
                BlockStoreError::SidecarCorrupt(block_id.to_string(), e)
            })?,
        )?;

        Ok(())
    }

    /// Retrieves the payload for `block_id`, verifying it against the
    /// sidecar checksum. Returns `IntegrityFailure` (never silently-corrupt
    /// bytes) on mismatch.
    pub fn retrieve_block(&self, block_id: &str) -> Result<Vec<u8>, BlockStoreError> {
        let lock = self.lock_for(block_id);
        let _guard = lock.lock();

        let payload_path = self.payload_path(block_id);
        if !payload_path.exists() {
            return Err(BlockStoreError::NotFound(block_id.to_string()));
        }

        let sidecar = self.read_sidecar(block_id)?;

        let meta = fs::metadata(&payload_path)?;
        let bytes = if meta.len() >= MMAP_THRESHOLD_BYTES {
            let file = fs::File::open(&payload_path)?;
            let mmap = unsafe { memmap2::Mmap::map(&file)? };
            mmap.to_vec()
        } else {
            fs::read(&payload_path)?
        };

        if !crate::parity::verify_checksum(&bytes, &sidecar.checksum) {
            return Err(BlockStoreError::IntegrityFailure(block_id.to_string()));
        }

        Ok(bytes)
    }

    fn read_sidecar(&self, block_id: &str) -> Result<Sidecar, BlockStoreError> {
        let sidecar_path = self.sidecar_path(block_id);
        if !sidecar_path.exists() {
            return Err(BlockStoreError::NotFound(block_id.to_string()));
        }
        let content = fs::read_to_string(&sidecar_path)?;
        serde_json::from_str(&content)
            .map_err(|e| BlockStoreError::SidecarCorrupt(block_id.to_string(), e))
    }

    /// Deletes both artifacts for `block_id`.
    pub fn delete_block(&self, block_id: &str) -> Result<(), BlockStoreError> {
        let lock = self.lock_for(block_id);
        let _guard = lock.lock();

        let payload_path = self.payload_path(block_id);
        if !payload_path.exists() {
            return Err(BlockStoreError::NotFound(block_id.to_string()));
        }
        fs::remove_file(&payload_path)?;
        let sidecar_path = self.sidecar_path(block_id);
        if sidecar_path.exists() {
            fs::remove_file(&sidecar_path)?;
        }
        Ok(())
    }

    /// Presence-only probe.
    pub fn block_exists(&self, block_id: &str) -> bool {
        self.payload_path(block_id).exists()
    }

    /// Lists every stored block id, derived from payload file names.
    pub fn list_blocks(&self) -> Result<Vec<String>, BlockStoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some(id) = name.strip_suffix(".bin") {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Bytes currently occupied by stored payloads.
    pub fn used_space(&self) -> Result<u64, BlockStoreError> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("bin") {
                total += fs::metadata(&path)?.len();
            }
        }
        Ok(total)
    }

    /// Advisory remaining capacity. Space accounting is eventually
    /// consistent under concurrent stores — admission control here is
    /// advisory, not a hard lock.
    pub fn available_space(&self) -> Result<u64, BlockStoreError> {
        self.available_space_locked()
    }

    fn available_space_locked(&self) -> Result<u64, BlockStoreError> {
        let used = self.used_space()?;
        Ok(self.capacity.saturating_sub(used))
    }

    /// Recomputes the checksum of `block_id`'s payload and compares it to
    /// `expected_checksum`, case-insensitively.
    pub fn verify_integrity(&self, block_id: &str, expected_checksum: &str) -> bool {
        match self.retrieve_block_unverified(block_id) {
            Ok(bytes) => crate::parity::verify_checksum(&bytes, expected_checksum),
            Err(_) => false,
        }
    }

    fn retrieve_block_unverified(&self, block_id: &str) -> Result<Vec<u8>, BlockStoreError> {
        let payload_path = self.payload_path(block_id);
        if !payload_path.exists() {
            return Err(BlockStoreError::NotFound(block_id.to_string()));
        }
        Ok(fs::read(&payload_path)?)
    }

    /// Removes sidecars whose payload no longer exists. Returns the number
    /// removed.
    pub fn cleanup_orphans(&self) -> Result<usize, BlockStoreError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    let block_id = stem.trim_end_matches(".meta");
                    if !self.payload_path(block_id).exists() {
                        fs::remove_file(&path)?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}
