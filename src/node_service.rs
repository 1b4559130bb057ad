//! Per-node HTTP service: the Block Store contract plus a health probe,
//! exposed over the exact wire format [`crate::transport::NodeTransport`]
//! speaks on the coordinator side — custom `X-*` headers carry placement and
//! integrity metadata, the body is the raw (optionally gzip-compressed)
//! payload.
//!
//! Grounded in `blockframe::serve::routes::BlockframeApi`'s `#[OpenApi]` impl
//! shape: state behind a shared handle, storage errors mapped to HTTP status
//! via `poem::Error::from_string`.

use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use flate2::read::GzDecoder;
use poem::http::StatusCode;
use poem_openapi::{
    param::{Header, Path},
    payload::{Binary, Json},
    Object, OpenApi,
};

use crate::block_store::BlockStore;
use crate::error::BlockStoreError;
use crate::parity::{checksum, verify_checksum};

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct StoreResponseBody {
    pub ok: bool,
    pub stored_at: String,
    pub checksum: String,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct DeleteResponseBody {
    pub ok: bool,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct ExistsResponseBody {
    pub exists: bool,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct BlockListResponseBody {
    pub block_ids: Vec<String>,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct BlockInfoResponseBody {
    pub total_storage: i64,
    pub used_storage: i64,
    pub available_storage: i64,
    pub total_blocks: i32,
    pub data_blocks: i32,
    pub parity_blocks: i32,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct HealthResponseBody {
    pub node_id: i32,
    pub status: String,
    pub uptime_seconds: i64,
    pub error_count: i32,
}

/// One node's state: its durable [`BlockStore`] plus the bookkeeping the
/// health probe reports on. A node process holds exactly one of these, built
/// from its own `--node-id` / `data_dir` / `capacity_bytes` configuration.
pub struct NodeApi {
    node_id: u32,
    store: BlockStore,
    started_at: Instant,
    error_count: AtomicU32,
}

impl NodeApi {
    pub fn new(node_id: u32, store: BlockStore) -> Self {
        Self {
            node_id,
            store,
            started_at: Instant::now(),
            error_count: AtomicU32::new(0),
        }
    }

    fn map_store_error(&self, err: BlockStoreError) -> poem::Error {
        let status = match &err {
            BlockStoreError::InvalidId => StatusCode::BAD_REQUEST,
            BlockStoreError::InsufficientSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,
            BlockStoreError::NotFound(_) => StatusCode::NOT_FOUND,
            BlockStoreError::IntegrityFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BlockStoreError::Io(_) | BlockStoreError::SidecarCorrupt(_, _) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::warn!(node_id = self.node_id, error = %err, "block store operation failed");
        poem::Error::from_string(err.to_string(), status)
    }
}

#[OpenApi]
impl NodeApi {
    /// `blocks.store` — placement/integrity metadata rides in headers so the
    /// body can stay a raw byte stream; the stored checksum is recomputed
    /// server-side and compared against `X-Checksum` rather than trusted
    /// blindly from the caller.
    #[oai(path = "/blocks", method = "post")]
    async fn store_block(
        &self,
        #[oai(name = "X-Block-Id")] block_id: Header<String>,
        #[oai(name = "X-Is-Parity")] is_parity: Header<Option<bool>>,
        #[oai(name = "X-Stripe-Index")] stripe_index: Header<Option<u64>>,
        #[oai(name = "X-Position")] position: Header<Option<u64>>,
        #[oai(name = "X-Checksum")] expected_checksum: Header<String>,
        #[oai(name = "Content-Encoding")] content_encoding: Header<Option<String>>,
        body: Binary<Vec<u8>>,
    ) -> poem::Result<Json<StoreResponseBody>> {
        // Placement bookkeeping is informational at this layer — the node
        // store is keyed entirely by block_id, which already encodes stripe
        // and position (see FileRecord's block-id scheme).
        let _ = (is_parity.0, stripe_index.0, position.0);

        let bytes = if content_encoding.0.as_deref() == Some("gzip") {
            let mut decoder = GzDecoder::new(body.0.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| poem::Error::from_string(e.to_string(), StatusCode::BAD_REQUEST))?;
            out
        } else {
            body.0
        };

        if !verify_checksum(&bytes, &expected_checksum.0) {
            return Err(poem::Error::from_string(
                format!("checksum mismatch for block {}", block_id.0),
                StatusCode::BAD_REQUEST,
            ));
        }

        self.store
            .store_block(&block_id.0, &bytes)
            .map_err(|e| self.map_store_error(e))?;

        Ok(Json(StoreResponseBody {
            ok: true,
            stored_at: block_id.0.clone(),
            checksum: checksum(&bytes),
        }))
    }

    /// `blocks.retrieve/{blockId}` — body is the raw payload; integrity is
    /// already verified against the sidecar checksum inside
    /// [`BlockStore::retrieve_block`] before it ever reaches the wire.
    #[oai(path = "/blocks/:block_id", method = "get")]
    async fn retrieve_block(&self, block_id: Path<String>) -> poem::Result<Binary<Vec<u8>>> {
        let bytes = self
            .store
            .retrieve_block(&block_id.0)
            .map_err(|e| self.map_store_error(e))?;
        Ok(Binary(bytes))
    }

    #[oai(path = "/blocks/:block_id", method = "delete")]
    async fn delete_block(
        &self,
        block_id: Path<String>,
    ) -> poem::Result<Json<DeleteResponseBody>> {
        self.store
            .delete_block(&block_id.0)
            .map_err(|e| self.map_store_error(e))?;
        Ok(Json(DeleteResponseBody { ok: true }))
    }

    #[oai(path = "/blocks/:block_id/exists", method = "get")]
    async fn block_exists(&self, block_id: Path<String>) -> Json<ExistsResponseBody> {
        Json(ExistsResponseBody {
            exists: self.store.block_exists(&block_id.0),
        })
    }

    #[oai(path = "/blocks", method = "get")]
    async fn list_blocks(&self) -> poem::Result<Json<BlockListResponseBody>> {
        let block_ids = self
            .store
            .list_blocks()
            .map_err(|e| self.map_store_error(e))?;
        Ok(Json(BlockListResponseBody { block_ids }))
    }

    #[oai(path = "/blocks/info", method = "get")]
    async fn block_info(&self) -> poem::Result<Json<BlockInfoResponseBody>> {
        let block_ids = self
            .store
            .list_blocks()
            .map_err(|e| self.map_store_error(e))?;
        let used = self
            .store
            .used_space()
            .map_err(|e| self.map_store_error(e))?;
        let available = self
            .store
            .available_space()
            .map_err(|e| self.map_store_error(e))?;
        let parity_blocks = block_ids.iter().filter(|id| id.ends_with(":p")).count() as i32;
        let total_blocks = block_ids.len() as i32;
        Ok(Json(BlockInfoResponseBody {
            total_storage: (used + available) as i64,
            used_storage: used as i64,
            available_storage: available as i64,
            total_blocks,
            data_blocks: total_blocks - parity_blocks,
            parity_blocks,
        }))
    }

    /// `blocks.health` — a node reports itself `Degraded` once its own
    /// internal I/O error count crosses [`crate::health::NODE_FAILURE_ERROR_THRESHOLD`],
    /// independent of whatever the coordinator's own liveness probe decides.
    #[oai(path = "/blocks/health", method = "get")]
    async fn health(&self) -> Json<HealthResponseBody> {
        let error_count = self.error_count.load(Ordering::Relaxed);
        let status = if error_count >= crate::health::NODE_FAILURE_ERROR_THRESHOLD {
            "Degraded"
        } else {
            "Healthy"
        };
        Json(HealthResponseBody {
            node_id: self.node_id as i32,
            status: status.to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs() as i64,
            error_count: error_count as i32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> (NodeApi, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(dir.path(), 1_000_000).unwrap();
        (NodeApi::new(1, store), dir)
    }

    #[test]
    fn block_info_reports_parity_and_data_counts_separately() {
        let (api, _dir) = api();
        api.store.store_block("f:s=0:k=0:d", b"data one").unwrap();
        api.store.store_block("f:s=0:k=1:d", b"data two").unwrap();
        api.store.store_block("f:s=0:p", b"parity").unwrap();

        let block_ids = api.store.list_blocks().unwrap();
        let parity_blocks = block_ids.iter().filter(|id| id.ends_with(":p")).count();
        assert_eq!(parity_blocks, 1);
        assert_eq!(block_ids.len() - parity_blocks, 2);
    }

    #[test]
    fn map_store_error_marks_not_found_as_404() {
        let (api, _dir) = api();
        let err = api
            .store
            .retrieve_block("missing")
            .expect_err("block was never stored");
        let mapped = api.map_store_error(err);
        assert_eq!(mapped.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn map_store_error_marks_integrity_failure_as_unprocessable() {
        let (api, dir) = api();
        api.store.store_block("tampered", b"original").unwrap();
        std::fs::write(dir.path().join("tampered.bin"), b"swapped!!").unwrap();
        let err = api
            .store
            .retrieve_block("tampered")
            .expect_err("payload was tampered with");
        let mapped = api.map_store_error(err);
        assert_eq!(mapped.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
