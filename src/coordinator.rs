//! The write path, read path, delete path, and recovery strategy: the core
//! of the system. Stripe planning and write dispatch are grounded in
//! `blockframe::chunker::commit`'s tier-dispatch shape; read-path recovery is
//! grounded in `blockframe::filestore::health`'s repair-dispatch shape, both
//! re-expressed against the fixed D=3/N=4 XOR model instead of the teacher's
//! 3-tier adaptive Reed-Solomon model.

use std::sync::Arc;

use chrono::Utc;
use rayon::prelude::*;

use crate::catalog::{BlockDescriptor, Catalog, FileRecord};
use crate::error::CoordinatorError;
use crate::health::{HealthMonitor, NodeState, SystemStatus};
use crate::parity::{checksum, compute_parity, recover_block, verify_checksum};
use crate::transport::NodeClient;

/// Cluster-wide fixed parameters. `node_count` (N) and `stripe_width` (D)
/// are fixed at 4 and 3 for this fleet; `block_size`/`max_file_size` are the
/// tunable system parameters from the distilled spec's External Interfaces
/// section.
#[derive(Debug, Clone)]
pub struct ClusterParams {
    pub node_count: u32,
    pub stripe_width: u32,
    pub block_size: usize,
    pub max_file_size: u64,
}

impl ClusterParams {
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.node_count < 3 {
            return Err(crate::error::ConfigError::Invalid(format!(
                "node_count must be >= 3, got {}",
                self.node_count
            )));
        }
        if self.stripe_width != self.node_count - 1 {
            return Err(crate::error::ConfigError::Invalid(format!(
                "stripe_width must equal node_count - 1 (D = N - 1), got D={} N={}",
                self.stripe_width, self.node_count
            )));
        }
        if self.block_size < 1024 || self.block_size > 1024 * 1024 {
            return Err(crate::error::ConfigError::Invalid(format!(
                "block_size must be within [1 KiB, 1 MiB], got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

pub struct UploadResult {
    pub file_id: String,
    pub blocks_created: usize,
    pub nodes_used: Vec<u32>,
}

pub struct DeleteResult {
    pub blocks_deleted: usize,
}

pub struct RaidStatus {
    pub status: SystemStatus,
    pub online_nodes: usize,
    pub total_nodes: usize,
    pub total_files: usize,
    pub total_size: u64,
}

pub struct RaidCoordinator {
    catalog: Catalog,
    transport: Arc<dyn NodeClient>,
    health: HealthMonitor,
    params: ClusterParams,
}

impl RaidCoordinator {
    pub fn new(
        catalog: Catalog,
        transport: Arc<dyn NodeClient>,
        health: HealthMonitor,
        params: ClusterParams,
    ) -> Result<Self, crate::error::ConfigError> {
        params.validate()?;
        Ok(Self {
            catalog,
            transport,
            health,
            params,
        })
    }

    /// `P(s) = ((s mod N) + 1)`: the node assigned parity for stripe `s`.
    fn parity_node(&self, stripe_index: u64) -> u32 {
        ((stripe_index % self.params.node_count as u64) + 1) as u32
    }

    /// The k-th data block of stripe `s` (`k ∈ [0..D-1]`) goes to the k-th
    /// non-parity node of `(1,2,...,N) \ {P(s)}`. A total function of
    /// `(s, k)` and `P(s)` only — never of current node liveness.
    fn data_node(&self, stripe_index: u64, position: u64) -> u32 {
        let parity = self.parity_node(stripe_index);
        (1..=self.params.node_count)
            .filter(|&n| n != parity)
            .nth(position as usize)
            .expect("position must be within [0, D)")
    }

    fn block_id(file_id: &str, stripe_index: u64, position: u64, is_parity: bool) -> String {
        let tag = if is_parity { "p" } else { "d" };
        format!("{file_id}:s={stripe_index}:k={position}:{tag}")
    }

    fn slice_into_blocks(bytes: &[u8], block_size: usize) -> Vec<Vec<u8>> {
        if bytes.is_empty() {
            return vec![Vec::new()];
        }
        bytes.chunks(block_size).map(|c| c.to_vec()).collect()
    }

    /// Writes require every node `Online`; the coordinator refuses rather
    /// than accumulating a degraded-write backlog (distilled spec Open
    /// Questions, resolved in favor of the stricter path).
    fn require_all_nodes_online(&self) -> Result<(), CoordinatorError> {
        let snapshot = self.health.snapshot();
        let online = snapshot
            .iter()
            .filter(|s| s.state == NodeState::Online)
            .count();
        if online < self.params.node_count as usize {
            return Err(CoordinatorError::ServiceDegraded(format!(
                "writes require all {} nodes online, {} online",
                self.params.node_count, online
            )));
        }
        Ok(())
    }

    pub fn upload(
        &self,
        file_name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<UploadResult, CoordinatorError> {
        if file_name.trim().is_empty() {
            return Err(CoordinatorError::Validation("file name is empty".into()));
        }
        if content_type != "application/pdf" {
            return Err(CoordinatorError::Validation(
                "only application/pdf uploads are accepted".into(),
            ));
        }
        if bytes.len() as u64 > self.params.max_file_size {
            return Err(CoordinatorError::Validation(format!(
                "file exceeds max size of {} bytes",
                self.params.max_file_size
            )));
        }
        if self.catalog.find(file_name).is_ok() {
            return Err(CoordinatorError::Validation(format!(
                "a file named {file_name} already exists"
            )));
        }

        self.require_all_nodes_online()?;

        let file_id = format!("{}-{}", file_name.replace(' ', "_"), Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let data_blocks = Self::slice_into_blocks(bytes, self.params.block_size);
        let stripes: Vec<&[Vec<u8>]> = data_blocks.chunks(self.params.stripe_width as usize).collect();

        let mut descriptors: Vec<BlockDescriptor> = Vec::new();
        let mut stored_ids: Vec<(u32, String)> = Vec::new();

        for (stripe_index, stripe_blocks) in stripes.iter().enumerate() {
            let stripe_index = stripe_index as u64;
            let parity = compute_parity(stripe_blocks)
                .map_err(|e| CoordinatorError::Validation(e.to_string()))?;

            let mut members: Vec<(u32, String, Vec<u8>, bool, u64)> = Vec::new();
            for (position, block) in stripe_blocks.iter().enumerate() {
                let node_id = self.data_node(stripe_index, position as u64);
                let block_id = Self::block_id(&file_id, stripe_index, position as u64, false);
                members.push((node_id, block_id, block.clone(), false, position as u64));
            }
            let parity_node = self.parity_node(stripe_index);
            let parity_block_id = Self::block_id(&file_id, stripe_index, 0, true);
            members.push((parity_node, parity_block_id, parity.clone(), true, 0));

            let results: Vec<Result<(u32, String, String, bool, u64, u64), CoordinatorError>> =
                members
                    .par_iter()
                    .map(|(node_id, block_id, block, is_parity, position)| {
                        let sum = checksum(block);
                        self.transport
                            .store_block(
                                *node_id,
                                block_id,
                                block,
                                *is_parity,
                                stripe_index,
                                *position,
                                &sum,
                            )
                            .map(|_| {
                                (
                                    *node_id,
                                    block_id.clone(),
                                    sum,
                                    *is_parity,
                                    stripe_index,
                                    *position,
                                )
                            })
                            .map_err(CoordinatorError::from)
                    })
                    .collect();

            let mut stripe_ok = true;
            for (idx, result) in results.iter().enumerate() {
                match result {
                    Ok((node_id, block_id, sum, is_parity, s_idx, position)) => {
                        stored_ids.push((*node_id, block_id.clone()));
                        descriptors.push(BlockDescriptor {
                            node_id: *node_id,
                            block_id: block_id.clone(),
                            checksum: sum.clone(),
                            stripe_index: *s_idx,
                            position: *position,
                            is_parity: *is_parity,
                            length: members[idx].2.len() as u64,
                        });
                    }
                    Err(_) => stripe_ok = false,
                }
            }

            if !stripe_ok {
                for (node_id, block_id) in &stored_ids {
                    let _ = self.transport.delete_block(*node_id, block_id);
                }
                return Err(CoordinatorError::StorageFailure(format!(
                    "stripe {stripe_index} failed to commit on all {} members",
                    self.params.node_count
                )));
            }
        }

        let nodes_used: Vec<u32> = {
            let mut ids: Vec<u32> = descriptors.iter().map(|d| d.node_id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };

        let record = FileRecord {
            file_id: file_id.clone(),
            file_name: file_name.to_string(),
            size: bytes.len() as u64,
            content_type: content_type.to_string(),
            uploaded_at: Utc::now(),
            blocks: descriptors.clone(),
            complete: true,
        };
        self.catalog.add_file(record)?;

        Ok(UploadResult {
            file_id,
            blocks_created: descriptors.len(),
            nodes_used,
        })
    }

    pub fn download(&self, file_name: &str) -> Result<Vec<u8>, CoordinatorError> {
        let record = self
            .catalog
            .find(file_name)
            .map_err(|_| CoordinatorError::NotFound(file_name.to_string()))?;

        let mut stripes: std::collections::BTreeMap<u64, Vec<&BlockDescriptor>> =
            std::collections::BTreeMap::new();
        for block in record.data_blocks() {
            stripes.entry(block.stripe_index).or_default().push(block);
        }

        let mut assembled: Vec<u8> = Vec::with_capacity(record.size as usize);

        for (stripe_index, mut members) in stripes {
            members.sort_by_key(|b| b.position);

            let fetched: Vec<(u64, Result<Vec<u8>, ()>)> = members
                .par_iter()
                .map(|descriptor| {
                    let result = self
                        .transport
                        .retrieve_block(descriptor.node_id, &descriptor.block_id)
                        .ok()
                        .filter(|bytes| verify_checksum(bytes, &descriptor.checksum));
                    (descriptor.position, result.ok_or(()))
                })
                .collect();

            let missing: Vec<u64> = fetched
                .iter()
                .filter(|(_, r)| r.is_err())
                .map(|(pos, _)| *pos)
                .collect();

            let mut stripe_bytes: Vec<(u64, Vec<u8>)> = Vec::with_capacity(members.len());

            if missing.is_empty() {
                for (position, result) in fetched {
                    stripe_bytes.push((position, result.unwrap()));
                }
            } else if missing.len() == 1 {
                let missing_position = missing[0];
                let parity_descriptor = record.parity_block_for_stripe(stripe_index).ok_or_else(|| {
                    CoordinatorError::UnrecoverableLoss(format!(
                        "stripe {stripe_index} has no recorded parity member"
                    ))
                })?;
                let parity_bytes = self
                    .transport
                    .retrieve_block(parity_descriptor.node_id, &parity_descriptor.block_id)
                    .map_err(|_| {
                        CoordinatorError::UnrecoverableLoss(format!(
                            "stripe {stripe_index} lost a data block and its parity is also unavailable"
                        ))
                    })?;

                let surviving: Vec<Vec<u8>> = fetched
                    .iter()
                    .filter(|(pos, _)| *pos != missing_position)
                    .map(|(_, r)| r.clone().unwrap())
                    .collect();

                let mut recovered = recover_block(&surviving, &parity_bytes, missing_position as usize)
                    .map_err(|e| CoordinatorError::UnrecoverableLoss(e.to_string()))?;

                let missing_descriptor = members
                    .iter()
                    .find(|m| m.position == missing_position)
                    .expect("missing position must belong to this stripe");
                // `recoverBlock` returns a block padded to the stripe's
                // longest member; trim back to this member's declared
                // length before checking it against its own checksum.
                recovered.truncate(missing_descriptor.length as usize);
                if !verify_checksum(&recovered, &missing_descriptor.checksum) {
                    return Err(CoordinatorError::UnrecoverableLoss(format!(
                        "reconstructed block for stripe {stripe_index} position {missing_position} failed checksum verification"
                    )));
                }

                for (position, result) in fetched {
                    if position == missing_position {
                        stripe_bytes.push((position, recovered.clone()));
                    } else {
                        stripe_bytes.push((position, result.unwrap()));
                    }
                }
            } else {
                return Err(CoordinatorError::UnrecoverableLoss(format!(
                    "stripe {stripe_index} lost {} members, at most 1 is recoverable",
                    missing.len()
                )));
            }

            stripe_bytes.sort_by_key(|(pos, _)| *pos);
            for (_, bytes) in stripe_bytes {
                assembled.extend_from_slice(&bytes);
            }
        }

        assembled.truncate(record.size as usize);
        Ok(assembled)
    }

    pub fn delete(&self, file_name: &str) -> Result<DeleteResult, CoordinatorError> {
        let record = self.catalog.remove_file(file_name)?;

        let results: Vec<bool> = record
            .blocks
            .par_iter()
            .map(|block| {
                self.transport
                    .delete_block(block.node_id, &block.block_id)
                    .is_ok()
            })
            .collect();

        Ok(DeleteResult {
            blocks_deleted: results.iter().filter(|ok| **ok).count(),
        })
    }

    pub fn list(&self) -> Vec<FileRecord> {
        self.catalog.list()
    }

    pub fn search(&self, query: &str) -> Result<Vec<FileRecord>, CoordinatorError> {
        if query.len() < 2 {
            return Err(CoordinatorError::Validation(
                "search query must be at least 2 characters".into(),
            ));
        }
        Ok(self.catalog.search(query))
    }

    pub fn info(&self, file_name: &str) -> Result<FileRecord, CoordinatorError> {
        self.catalog
            .find(file_name)
            .map_err(|_| CoordinatorError::NotFound(file_name.to_string()))
    }

    pub fn raid_status(&self) -> RaidStatus {
        let stats = self.health.availability_stats();
        RaidStatus {
            status: stats.status,
            online_nodes: stats.online,
            total_nodes: stats.total,
            total_files: self.catalog.list().len(),
            total_size: self.catalog.total_size(),
        }
    }

    pub fn node_statuses(&self) -> Vec<crate::health::NodeStatus> {
        self.health.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::BlockStore;
    use crate::health::HealthMonitor;
    use crate::transport::test_support::InProcessTransport;
    use std::collections::HashMap;
    use std::time::Duration;

    fn params() -> ClusterParams {
        ClusterParams {
            node_count: 4,
            stripe_width: 3,
            block_size: 8,
            max_file_size: 10_000,
        }
    }

    /// Builds a coordinator backed by four real, in-process `BlockStore`s
    /// (one per node, each rooted in its own temp dir) and marks every node
    /// `Online` via a real health probe round, matching the distilled spec's
    /// "writes require all N nodes online" precondition.
    fn test_coordinator() -> (RaidCoordinator, Vec<tempfile::TempDir>, Arc<InProcessTransport>) {
        let dirs: Vec<tempfile::TempDir> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();
        let mut stores = HashMap::new();
        for (i, dir) in dirs.iter().enumerate() {
            stores.insert((i + 1) as u32, BlockStore::new(dir.path(), 1_000_000).unwrap());
        }
        let transport = Arc::new(InProcessTransport::new(stores));
        let health = HealthMonitor::new(transport.clone(), 4, 3, Duration::from_secs(120));
        for node_id in 1..=4u32 {
            health.check_node(node_id);
        }
        let catalog_dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(catalog_dir.path()).unwrap();
        let coordinator = RaidCoordinator::new(catalog, transport.clone(), health, params()).unwrap();
        (coordinator, dirs, transport)
    }

    #[test]
    fn placement_never_collides_within_a_stripe() {
        let (coordinator, _dirs, _transport) = test_coordinator();
        for stripe in 0..10u64 {
            let parity = coordinator.parity_node(stripe);
            let mut nodes = vec![parity];
            for position in 0..3u64 {
                nodes.push(coordinator.data_node(stripe, position));
            }
            nodes.sort_unstable();
            nodes.dedup();
            assert_eq!(nodes.len(), 4, "stripe {stripe} must use 4 distinct nodes");
        }
    }

    #[test]
    fn parity_rotates_with_stripe_index() {
        let (coordinator, _dirs, _transport) = test_coordinator();
        assert_eq!(coordinator.parity_node(0), 1);
        assert_eq!(coordinator.parity_node(1), 2);
        assert_eq!(coordinator.parity_node(4), 1);
    }

    #[test]
    fn cluster_params_reject_bad_stripe_width() {
        let mut bad = params();
        bad.stripe_width = 2;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn upload_without_all_nodes_online_is_degraded() {
        let dirs: Vec<tempfile::TempDir> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();
        let mut stores = HashMap::new();
        for (i, dir) in dirs.iter().enumerate() {
            stores.insert((i + 1) as u32, BlockStore::new(dir.path(), 1_000_000).unwrap());
        }
        let transport = Arc::new(InProcessTransport::new(stores));
        // No health checks have ever run, so every node is still `Unknown`.
        let health = HealthMonitor::new(transport.clone(), 4, 3, Duration::from_secs(120));
        let catalog_dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(catalog_dir.path()).unwrap();
        let coordinator = RaidCoordinator::new(catalog, transport, health, params()).unwrap();

        let result = coordinator.upload("doc.pdf", b"hello world", "application/pdf");
        assert!(matches!(result, Err(CoordinatorError::ServiceDegraded(_))));
    }

    #[test]
    fn upload_then_download_roundtrips_exact_bytes() {
        let (coordinator, _dirs, _transport) = test_coordinator();
        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        let upload = coordinator
            .upload("report.pdf", &payload, "application/pdf")
            .unwrap();
        assert_eq!(upload.blocks_created, coordinator.info("report.pdf").unwrap().blocks.len());

        let downloaded = coordinator.download("report.pdf").unwrap();
        assert_eq!(downloaded, payload);
    }

    #[test]
    fn single_one_byte_file_roundtrips() {
        let (coordinator, _dirs, _transport) = test_coordinator();
        coordinator.upload("tiny.pdf", b"!", "application/pdf").unwrap();
        assert_eq!(coordinator.download("tiny.pdf").unwrap(), b"!");
    }

    #[test]
    fn rejects_non_pdf_uploads_without_storing_any_blocks() {
        let (coordinator, _dirs, transport) = test_coordinator();
        let result = coordinator.upload("notes.txt", b"plain text body", "text/plain");
        assert!(matches!(result, Err(CoordinatorError::Validation(_))));
        for node_id in 1..=4u32 {
            assert!(transport.store(node_id).unwrap().list_blocks().unwrap().is_empty());
        }
        assert!(coordinator.list().is_empty());
    }

    #[test]
    fn download_survives_a_single_downed_node() {
        let (coordinator, _dirs, transport) = test_coordinator();
        let payload: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();
        coordinator
            .upload("survivable.pdf", &payload, "application/pdf")
            .unwrap();

        // Stripe 0's parity node is P(0) = 1, so its data members are on
        // nodes 2,3,4. Taking down node 2 loses one data block per stripe
        // it participates in, forcing parity reconstruction on every read.
        transport.set_down(2, true);
        let downloaded = coordinator.download("survivable.pdf").unwrap();
        assert_eq!(downloaded, payload);
    }

    #[test]
    fn download_fails_unrecoverable_when_a_stripe_loses_two_members() {
        let (coordinator, _dirs, transport) = test_coordinator();
        let payload: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();
        coordinator
            .upload("fragile.pdf", &payload, "application/pdf")
            .unwrap();

        // Stripe 0 has parity on node 1 and data on nodes 2,3,4. Taking down
        // two of those four loses two members of the same stripe.
        transport.set_down(1, true);
        transport.set_down(2, true);

        let result = coordinator.download("fragile.pdf");
        assert!(matches!(result, Err(CoordinatorError::UnrecoverableLoss(_))));

        // The catalog entry survives an unrecoverable read.
        assert!(coordinator.info("fragile.pdf").is_ok());
    }

    #[test]
    fn delete_removes_catalog_entry_even_with_nodes_down() {
        let (coordinator, _dirs, transport) = test_coordinator();
        coordinator
            .upload("gone-soon.pdf", b"delete me please", "application/pdf")
            .unwrap();

        transport.set_down(3, true);
        let result = coordinator.delete("gone-soon.pdf").unwrap();
        assert!(result.blocks_deleted > 0);
        assert!(coordinator.info("gone-soon.pdf").is_err());
    }

    #[test]
    fn search_requires_minimum_query_length() {
        let (coordinator, _dirs, _transport) = test_coordinator();
        coordinator
            .upload("quarterly-report.pdf", b"numbers go here", "application/pdf")
            .unwrap();
        assert!(coordinator.search("q").is_err());
        assert_eq!(coordinator.search("report").unwrap().len(), 1);
    }
}
