//! Durable mapping from file name to its ordered list of block descriptors.
//! Mutated only by the [`crate::coordinator::RaidCoordinator`] under a
//! single-writer-per-filename discipline.
//!
//! Persistence is grounded in `blockframe::merkle_tree::manifest::
//! ManifestStructure::from_file`'s load-and-validate pattern and
//! `blockframe::filestore::mod`'s directory-walking — one JSON record per
//! file, keyed on disk by file id.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BlockDescriptor {
    pub node_id: u32,
    pub block_id: String,
    pub checksum: String,
    pub stripe_index: u64,
    pub position: u64,
    pub is_parity: bool,
    pub length: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FileRecord {
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
    pub blocks: Vec<BlockDescriptor>,
    /// Written `true` only after the last stripe commits; startup
    /// reconciliation drops any record still `false`.
    pub complete: bool,
}

impl FileRecord {
    pub fn data_blocks(&self) -> impl Iterator<Item = &BlockDescriptor> {
        self.blocks.iter().filter(|b| !b.is_parity)
    }

    pub fn parity_block_for_stripe(&self, stripe_index: u64) -> Option<&BlockDescriptor> {
        self.blocks
            .iter()
            .find(|b| b.is_parity && b.stripe_index == stripe_index)
    }
}

struct Inner {
    root: PathBuf,
    index: RwLock<HashMap<String, FileRecord>>,
    write_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

/// Durable catalog rooted at a configured directory, one JSON file per
/// record. Keys are lowercased file names (file names are case-insensitive
/// per the distilled spec's data model).
pub struct Catalog {
    inner: Inner,
}

impl Catalog {
    /// Loads the catalog at startup, reconciling away any record that never
    /// reached `complete == true` and orphaning its blocks for node-side
    /// cleanup.
    pub fn open(root: &Path) -> Result<Self, CatalogError> {
        fs::create_dir_all(root)?;
        let mut index = HashMap::new();

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let record: FileRecord = match serde_json::from_str(&content) {
                Ok(record) => record,
                Err(_) => {
                    // Unparseable record: treat like an incomplete one and
                    // drop it during reconciliation.
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };

            if !record.complete {
                let _ = fs::remove_file(&path);
                continue;
            }

            index.insert(record.file_name.to_lowercase(), record);
        }

        Ok(Self {
            inner: Inner {
                root: root.to_path_buf(),
                index: RwLock::new(index),
                write_locks: RwLock::new(HashMap::new()),
            },
        })
    }

    fn lock_for(&self, file_name: &str) -> Arc<Mutex<()>> {
        let key = file_name.to_lowercase();
        if let Some(lock) = self.inner.write_locks.read().get(&key) {
            return lock.clone();
        }
        let mut locks = self.inner.write_locks.write();
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn record_path(&self, file_id: &str) -> PathBuf {
        self.inner.root.join(format!("{file_id}.json"))
    }

    /// Persists `record` atomically (write to a temp path, then rename) and
    /// publishes it into the in-memory index. Takes the per-filename write
    /// lock so concurrent writes to the *same* name serialize; writes to
    /// different names proceed in parallel.
    pub fn add_file(&self, record: FileRecord) -> Result<(), CatalogError> {
        let lock = self.lock_for(&record.file_name);
        let _guard = lock.lock();

        let key = record.file_name.to_lowercase();
        if self.inner.index.read().contains_key(&key) {
            return Err(CatalogError::AlreadyExists(record.file_name));
        }

        let path = self.record_path(&record.file_id);
        let tmp_path = self.record_path(&format!("{}.tmp", record.file_id));
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| CatalogError::Corrupt(record.file_name.clone(), e))?;
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &path)?;

        self.inner.index.write().insert(key, record);
        Ok(())
    }

    pub fn find(&self, file_name: &str) -> Result<FileRecord, CatalogError> {
        self.inner
            .index
            .read()
            .get(&file_name.to_lowercase())
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(file_name.to_string()))
    }

    /// Removes the catalog entry. The entry is removed even if the caller's
    /// best-effort node-side block deletes failed — those blocks become
    /// orphans reaped by each node's `cleanupOrphans`.
    pub fn remove_file(&self, file_name: &str) -> Result<FileRecord, CatalogError> {
        let lock = self.lock_for(file_name);
        let _guard = lock.lock();

        let key = file_name.to_lowercase();
        let record = self
            .inner
            .index
            .write()
            .remove(&key)
            .ok_or_else(|| CatalogError::NotFound(file_name.to_string()))?;

        let path = self.record_path(&record.file_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(record)
    }

    pub fn list(&self) -> Vec<FileRecord> {
        let mut records: Vec<FileRecord> = self.inner.index.read().values().cloned().collect();
        records.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        records
    }

    /// Substring match on file name, case-insensitive. Callers enforce the
    /// minimum query length (2) at the API boundary.
    pub fn search(&self, query: &str) -> Vec<FileRecord> {
        let needle = query.to_lowercase();
        self.inner
            .index
            .read()
            .values()
            .filter(|record| record.file_name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.inner.index.read().values().map(|r| r.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(name: &str) -> FileRecord {
        FileRecord {
            file_id: format!("id-{name}"),
            file_name: name.to_string(),
            size: 10,
            content_type: "application/pdf".into(),
            uploaded_at: Utc::now(),
            blocks: vec![],
            complete: true,
        }
    }

    #[test]
    fn add_then_find_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.add_file(sample_record("Report.pdf")).unwrap();
        assert!(catalog.find("report.pdf").is_ok());
        assert!(catalog.find("REPORT.PDF").is_ok());
    }

    #[test]
    fn startup_reconciliation_drops_incomplete_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut incomplete = sample_record("partial.pdf");
        incomplete.complete = false;
        fs::write(
            dir.path().join(format!("{}.json", incomplete.file_id)),
            serde_json::to_vec(&incomplete).unwrap(),
        )
        .unwrap();

        let catalog = Catalog::open(dir.path()).unwrap();
        assert!(catalog.find("partial.pdf").is_err());
        assert!(!dir.path().join(format!("{}.json", incomplete.file_id)).exists());
    }

    #[test]
    fn search_matches_substring_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.add_file(sample_record("Quarterly-Report.pdf")).unwrap();
        catalog.add_file(sample_record("Invoice.pdf")).unwrap();

        let results = catalog.search("report");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_name, "Quarterly-Report.pdf");
    }

    #[test]
    fn remove_file_deletes_record() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.add_file(sample_record("gone.pdf")).unwrap();
        catalog.remove_file("gone.pdf").unwrap();
        assert!(catalog.find("gone.pdf").is_err());
    }
}
