//! The coordinator's public HTTP surface: upload/download/delete/list/search
//! over files, plus cluster status. Shaped after
//! `blockframe::serve::routes::BlockframeApi` — one `#[OpenApi]` impl over a
//! shared handle, `poem::Error::from_string` mapping at every fallible call.

use std::sync::Arc;

use poem::http::StatusCode;
use poem_openapi::{
    param::{Header, Path, Query},
    payload::{Binary, Json},
    Object, OpenApi,
};

use crate::catalog::{BlockDescriptor, FileRecord};
use crate::coordinator::RaidCoordinator;
use crate::error::CoordinatorError;
use crate::health::{NodeState, NodeStatus};

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct UploadResponseBody {
    pub file_id: String,
    pub blocks_created: i32,
    pub nodes_used: Vec<i32>,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct DeleteResponseBody {
    pub blocks_deleted: i32,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct BlockDescriptorBody {
    pub node_id: i32,
    pub block_id: String,
    pub checksum: String,
    pub stripe_index: i64,
    pub position: i64,
    pub is_parity: bool,
    pub length: i64,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct FileSummaryBody {
    pub file_id: String,
    pub file_name: String,
    pub size: i64,
    pub content_type: String,
    pub uploaded_at: String,
    pub node_count: i32,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct FileInfoResponseBody {
    pub file_id: String,
    pub file_name: String,
    pub size: i64,
    pub content_type: String,
    pub uploaded_at: String,
    pub blocks: Vec<BlockDescriptorBody>,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct RaidStatusResponseBody {
    pub status: String,
    pub online_nodes: i32,
    pub total_nodes: i32,
    pub total_files: i32,
    pub total_size: i64,
    pub total_size_human: String,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct HealthSummaryResponseBody {
    pub status: String,
    pub online_nodes: i32,
    pub total_nodes: i32,
}

#[derive(Debug, Object)]
#[oai(rename_all = "snake_case")]
pub struct NodeStatusResponseBody {
    pub node_id: i32,
    pub state: String,
    pub error_count: i32,
    pub last_response_time_ms: Option<i64>,
    pub heartbeat_age_seconds: Option<i64>,
}

fn node_state_label(state: NodeState) -> &'static str {
    match state {
        NodeState::Unknown => "Unknown",
        NodeState::Online => "Online",
        NodeState::Offline => "Offline",
    }
}

fn node_status_body(status: &NodeStatus) -> NodeStatusResponseBody {
    NodeStatusResponseBody {
        node_id: status.node_id as i32,
        state: node_state_label(status.state).to_string(),
        error_count: status.error_count as i32,
        last_response_time_ms: status
            .last_response_time
            .map(|d| d.as_millis() as i64),
        heartbeat_age_seconds: status
            .last_heartbeat
            .map(|t| t.elapsed().as_secs() as i64),
    }
}

fn block_descriptor_body(block: &BlockDescriptor) -> BlockDescriptorBody {
    BlockDescriptorBody {
        node_id: block.node_id as i32,
        block_id: block.block_id.clone(),
        checksum: block.checksum.clone(),
        stripe_index: block.stripe_index as i64,
        position: block.position as i64,
        is_parity: block.is_parity,
        length: block.length as i64,
    }
}

fn file_summary_body(record: &FileRecord) -> FileSummaryBody {
    let mut nodes: Vec<u32> = record.blocks.iter().map(|b| b.node_id).collect();
    nodes.sort_unstable();
    nodes.dedup();
    FileSummaryBody {
        file_id: record.file_id.clone(),
        file_name: record.file_name.clone(),
        size: record.size as i64,
        content_type: record.content_type.clone(),
        uploaded_at: record.uploaded_at.to_rfc3339(),
        node_count: nodes.len() as i32,
    }
}

fn map_coordinator_error(err: CoordinatorError) -> poem::Error {
    let status = match &err {
        CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::ServiceDegraded(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::StorageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoordinatorError::UnrecoverableLoss(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::error!(error = %err, "coordinator operation failed");
    poem::Error::from_string(err.to_string(), status)
}

/// Public API handle. `RaidCoordinator` already synchronizes itself
/// internally (the catalog's index and each node's block locks), so unlike
/// `blockframe::serve::routes::BlockframeApi`'s `Arc<RwLock<FileStore>>` no
/// outer lock is needed here — the shared `Arc` alone is sufficient.
pub struct CoordinatorApi {
    coordinator: Arc<RaidCoordinator>,
}

impl CoordinatorApi {
    pub fn new(coordinator: Arc<RaidCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[OpenApi]
impl CoordinatorApi {
    /// `files.upload` — content type rides in the standard `Content-Type`
    /// header; only `application/pdf` is accepted per the distilled spec's
    /// upload validation.
    #[oai(path = "/files/:file_name", method = "post")]
    async fn upload(
        &self,
        file_name: Path<String>,
        #[oai(name = "Content-Type")] content_type: Header<String>,
        body: Binary<Vec<u8>>,
    ) -> poem::Result<Json<UploadResponseBody>> {
        let result = self
            .coordinator
            .upload(&file_name.0, &body.0, &content_type.0)
            .map_err(map_coordinator_error)?;

        Ok(Json(UploadResponseBody {
            file_id: result.file_id,
            blocks_created: result.blocks_created as i32,
            nodes_used: result.nodes_used.iter().map(|n| *n as i32).collect(),
        }))
    }

    #[oai(path = "/files/:file_name", method = "get")]
    async fn download(&self, file_name: Path<String>) -> poem::Result<Binary<Vec<u8>>> {
        let bytes = self
            .coordinator
            .download(&file_name.0)
            .map_err(map_coordinator_error)?;
        Ok(Binary(bytes))
    }

    #[oai(path = "/files/:file_name", method = "delete")]
    async fn delete(&self, file_name: Path<String>) -> poem::Result<Json<DeleteResponseBody>> {
        let result = self
            .coordinator
            .delete(&file_name.0)
            .map_err(map_coordinator_error)?;
        Ok(Json(DeleteResponseBody {
            blocks_deleted: result.blocks_deleted as i32,
        }))
    }

    #[oai(path = "/files/:file_name/info", method = "get")]
    async fn file_info(&self, file_name: Path<String>) -> poem::Result<Json<FileInfoResponseBody>> {
        let record = self
            .coordinator
            .info(&file_name.0)
            .map_err(map_coordinator_error)?;
        Ok(Json(FileInfoResponseBody {
            file_id: record.file_id.clone(),
            file_name: record.file_name.clone(),
            size: record.size as i64,
            content_type: record.content_type.clone(),
            uploaded_at: record.uploaded_at.to_rfc3339(),
            blocks: record.blocks.iter().map(block_descriptor_body).collect(),
        }))
    }

    #[oai(path = "/files", method = "get")]
    async fn list_files(&self) -> Json<Vec<FileSummaryBody>> {
        Json(
            self.coordinator
                .list()
                .iter()
                .map(file_summary_body)
                .collect(),
        )
    }

    /// `files.search` — the coordinator itself enforces the two-character
    /// minimum query length.
    #[oai(path = "/files/search", method = "get")]
    async fn search_files(
        &self,
        query: Query<String>,
    ) -> poem::Result<Json<Vec<FileSummaryBody>>> {
        let results = self
            .coordinator
            .search(&query.0)
            .map_err(map_coordinator_error)?;
        Ok(Json(results.iter().map(file_summary_body).collect()))
    }

    #[oai(path = "/status/raid", method = "get")]
    async fn raid_status(&self) -> Json<RaidStatusResponseBody> {
        let status = self.coordinator.raid_status();
        Json(RaidStatusResponseBody {
            status: format!("{:?}", status.status),
            online_nodes: status.online_nodes as i32,
            total_nodes: status.total_nodes as i32,
            total_files: status.total_files as i32,
            total_size: status.total_size as i64,
            total_size_human: crate::utils::format_bytes(status.total_size),
        })
    }

    #[oai(path = "/status/nodes", method = "get")]
    async fn node_status(&self) -> Json<Vec<NodeStatusResponseBody>> {
        Json(
            self.coordinator
                .node_statuses()
                .iter()
                .map(node_status_body)
                .collect(),
        )
    }

    /// `status.health` — the minimal liveness summary a load balancer or
    /// orchestrator would poll, distinct from `status.raid`'s fuller
    /// cluster-capacity view.
    #[oai(path = "/status/health", method = "get")]
    async fn health_summary(&self) -> Json<HealthSummaryResponseBody> {
        let status = self.coordinator.raid_status();
        Json(HealthSummaryResponseBody {
            status: format!("{:?}", status.status),
            online_nodes: status.online_nodes as i32,
            total_nodes: status.total_nodes as i32,
        })
    }
}
