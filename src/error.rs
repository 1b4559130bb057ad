//! Typed error taxonomy for each subsystem.
//!
//! `blockframe` propagated `Box<dyn std::error::Error>` / `std::io::Error`
//! everywhere; here each subsystem gets a named-variant enum instead, the way
//! the `qc-08-consensus` / `qc-*` crates in the wider example pack model their
//! subsystem boundaries with `thiserror`.

use std::fmt;

/// Errors raised by the pure Parity Engine functions.
#[derive(Debug, thiserror::Error)]
pub enum ParityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Errors raised by a node's [`crate::block_store::BlockStore`].
#[derive(Debug, thiserror::Error)]
pub enum BlockStoreError {
    #[error("block id must not be empty")]
    InvalidId,
    #[error("not enough space: need {needed} bytes, have {available} available")]
    InsufficientSpace { needed: u64, available: u64 },
    #[error("block not found: {0}")]
    NotFound(String),
    #[error("integrity check failed for block {0}")]
    IntegrityFailure(String),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("sidecar metadata corrupt for block {0}: {1}")]
    SidecarCorrupt(String, serde_json::Error),
}

/// Errors raised by [`crate::transport::NodeTransport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to node {node_id} timed out after {timeout_secs}s")]
    Timeout { node_id: u32, timeout_secs: u64 },
    #[error("node {node_id} unreachable: {reason}")]
    ConnectionFailed { node_id: u32, reason: String },
    #[error("node {node_id} returned server error: {status}")]
    ServerError { node_id: u32, status: u16 },
    #[error("node {node_id} rejected request: {status} {message}")]
    ClientError {
        node_id: u32,
        status: u16,
        message: String,
    },
    #[error("node {0} marked unavailable after exhausting retries")]
    NodeUnavailable(u32),
}

impl TransportError {
    /// Whether the transport policy should retry this outcome: anything that
    /// looks like a transient/5xx-class failure, never a 4xx-class one.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. }
                | TransportError::ConnectionFailed { .. }
                | TransportError::ServerError { .. }
        )
    }
}

/// Errors raised by the [`crate::catalog::Catalog`].
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog entry corrupt for {0}: {1}")]
    Corrupt(String, serde_json::Error),
}

/// Errors surfaced by the [`crate::coordinator::RaidCoordinator`], already
/// collapsed per the distilled spec's propagation policy.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("unrecoverable loss: {0}")]
    UnrecoverableLoss(String),
    #[error("service degraded: {0}")]
    ServiceDegraded(String),
}

impl From<TransportError> for CoordinatorError {
    fn from(err: TransportError) -> Self {
        CoordinatorError::StorageFailure(err.to_string())
    }
}

impl From<CatalogError> for CoordinatorError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(name) => CoordinatorError::NotFound(name),
            other => CoordinatorError::StorageFailure(other.to_string()),
        }
    }
}

/// Cluster parameters that break an invariant at startup (`N<3`,
/// `blockSize` out of range, etc). Fatal — the process refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid cluster configuration: {0}")]
    Invalid(String),
    #[error("failed to read or parse config file: {0}")]
    Load(String),
}

/// Minimal display-only wrapper so node-internal error detail never reaches
/// an external caller as a stack trace, per the distilled spec's error
/// handling design ("user-visible failures never reveal node-internal paths
/// or stack traces").
#[derive(Debug)]
pub struct PublicError(pub String);

impl fmt::Display for PublicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PublicError {}
