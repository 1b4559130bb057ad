//! Request/response envelope and transport policy between the coordinator
//! and each node. The coordinator treats a node purely as an endpoint
//! exposing the Block Store contract plus a health probe.
//!
//! Built on `ureq` (already a `blockframe` dependency, used there for
//! `mount::source::RemoteSource`). Connection pooling uses a `moka::sync::
//! Cache` keyed by `scheme+host+port` — `moka`'s `get_with` gives exactly the
//! "first caller constructs the client, subsequent callers reuse it"
//! semantics the transport policy requires, without a hand-rolled
//! double-checked lock.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Settings bound to a transport at construction time. Reconfiguration means
/// building a new [`NodeTransport`] — the distilled spec's Design Notes flag
/// the teacher's "ambient singleton with mutable timeout" pattern as
/// something to retire.
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    pub request_timeout: Duration,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    pub compression_enabled: bool,
    pub compression_threshold_bytes: usize,
    pub max_connections_per_server: usize,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            compression_enabled: true,
            compression_threshold_bytes: 8 * 1024,
            max_connections_per_server: 8,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreRequest<'a> {
    pub block_id: String,
    pub block_data: &'a [u8],
    pub is_parity: bool,
    pub stripe_index: u64,
    pub position: u64,
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreResponse {
    pub ok: bool,
    pub stored_at: String,
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetrieveResponse {
    pub block_id: String,
    #[serde(with = "base64_bytes")]
    pub block_data: Vec<u8>,
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockInfoResponse {
    pub total_storage: u64,
    pub used_storage: u64,
    pub available_storage: u64,
    pub total_blocks: usize,
    pub data_blocks: usize,
    pub parity_blocks: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealthState {
    Healthy,
    Online,
    Degraded,
    Offline,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeHealthResponse {
    pub node_id: u32,
    pub status: NodeHealthState,
    pub uptime_seconds: u64,
    pub error_count: u32,
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        let encoded = data_encoding_hex(bytes);
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        data_decoding_hex(&s).map_err(serde::de::Error::custom)
    }

    fn data_encoding_hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn data_decoding_hex(s: &str) -> Result<Vec<u8>, String> {
        if s.len() % 2 != 0 {
            return Err("odd-length hex string".into());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
            .collect()
    }
}

/// Capability the coordinator actually depends on: the Block Store contract
/// plus a health probe, against a node id. The distilled spec's Design Notes
/// call for "capability sets with variants" instead of base-class
/// polymorphism over a concrete transport — grounded in the same shape as
/// `blockframe::mount::source::SegmentSource`, which lets `LocalSource` and
/// `RemoteSource` stand in for each other. Here [`NodeTransport`] is the real
/// HTTP implementation; tests substitute an in-process implementation over
/// bare [`crate::block_store::BlockStore`]s with no network involved.
pub trait NodeClient: Send + Sync {
    fn node_ids(&self) -> Vec<u32>;

    fn store_block(
        &self,
        node_id: u32,
        block_id: &str,
        bytes: &[u8],
        is_parity: bool,
        stripe_index: u64,
        position: u64,
        checksum: &str,
    ) -> Result<StoreResponse, TransportError>;

    fn retrieve_block(&self, node_id: u32, block_id: &str) -> Result<Vec<u8>, TransportError>;

    fn delete_block(&self, node_id: u32, block_id: &str) -> Result<(), TransportError>;

    fn health(&self, node_id: u32) -> Result<NodeHealthResponse, TransportError>;
}

/// Client-side view of the cluster. Holds an endpoint per node id and a
/// pooled `ureq::Agent` per endpoint.
pub struct NodeTransport {
    endpoints: std::collections::HashMap<u32, String>,
    pool: moka::sync::Cache<String, Arc<ureq::Agent>>,
    policy: TransportPolicy,
}

impl NodeTransport {
    pub fn new(endpoints: std::collections::HashMap<u32, String>, policy: TransportPolicy) -> Self {
        let pool = moka::sync::Cache::builder()
            .max_capacity(endpoints.len().max(1) as u64)
            .build();
        Self {
            endpoints,
            pool,
            policy,
        }
    }

    pub fn policy(&self) -> &TransportPolicy {
        &self.policy
    }

    pub fn node_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.endpoints.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn base_url(&self, node_id: u32) -> Result<&str, TransportError> {
        self.endpoints
            .get(&node_id)
            .map(|s| s.as_str())
            .ok_or(TransportError::ConnectionFailed {
                node_id,
                reason: "node id not present in cluster configuration".into(),
            })
    }

    fn agent_for(&self, _node_id: u32, base_url: &str) -> Result<Arc<ureq::Agent>, TransportError> {
        // `moka::sync::Cache::get_with` constructs the value at most once per
        // key even under concurrent first-access, which is exactly the
        // "first caller builds the client, subsequent callers reuse it"
        // semantics the transport policy requires. The agent itself is built
        // from `self.policy`, so the configured per-operation timeout and
        // per-endpoint connection cap actually bound every request made
        // through it, rather than falling back to ureq's defaults.
        let key = base_url.to_string();
        let policy = &self.policy;
        let agent = self.pool.get_with(key, || {
            let config = ureq::Agent::config_builder()
                .timeout_global(Some(policy.request_timeout))
                .max_idle_connections_per_host(policy.max_connections_per_server)
                .build();
            Arc::new(ureq::Agent::new_with_config(config))
        });
        Ok(agent)
    }

    /// Maps a `ureq` call failure onto the transport error taxonomy: a
    /// timed-out request becomes `TransportError::Timeout` (so the §4.3
    /// "expiry surfaces as a transport failure to the retry logic"
    /// requirement is actually observable, not just configured), a 4xx
    /// status a `ClientError`, a 5xx status a `ServerError`, and anything
    /// else (DNS failure, connection refused, broken pipe) a
    /// `ConnectionFailed`.
    fn classify_err(&self, node_id: u32, err: ureq::Error) -> TransportError {
        match err {
            ureq::Error::Timeout(_) => TransportError::Timeout {
                node_id,
                timeout_secs: self.policy.request_timeout.as_secs(),
            },
            ureq::Error::StatusCode(code) if (400..500).contains(&code) => {
                TransportError::ClientError {
                    node_id,
                    status: code,
                    message: "request rejected".into(),
                }
            }
            ureq::Error::StatusCode(code) => TransportError::ServerError { node_id, status: code },
            _ => TransportError::ConnectionFailed {
                node_id,
                reason: "transport failure".into(),
            },
        }
    }

    /// Runs `op` up to `max_retry_attempts` times with a fixed delay between
    /// attempts, but only when the failure is retryable (transport/5xx-class
    /// — never 4xx-class).
    fn with_retry<T>(
        &self,
        node_id: u32,
        mut op: impl FnMut() -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.policy.max_retry_attempts => {
                    attempt += 1;
                    std::thread::sleep(self.policy.retry_delay);
                }
                Err(err) if err.is_retryable() => {
                    return Err(TransportError::NodeUnavailable(node_id));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn maybe_compress(&self, bytes: &[u8]) -> (Vec<u8>, bool) {
        if self.policy.compression_enabled && bytes.len() >= self.policy.compression_threshold_bytes
        {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            use std::io::Write;
            if encoder.write_all(bytes).is_ok() {
                if let Ok(compressed) = encoder.finish() {
                    return (compressed, true);
                }
            }
        }
        (bytes.to_vec(), false)
    }

    fn maybe_decompress(&self, bytes: Vec<u8>, was_compressed: bool) -> Vec<u8> {
        if !was_compressed {
            return bytes;
        }
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_ok() {
            out
        } else {
            bytes
        }
    }

    pub fn store_block(
        &self,
        node_id: u32,
        block_id: &str,
        bytes: &[u8],
        is_parity: bool,
        stripe_index: u64,
        position: u64,
        checksum: &str,
    ) -> Result<StoreResponse, TransportError> {
        let base_url = self.base_url(node_id)?.to_string();
        let (body, compressed) = self.maybe_compress(bytes);

        self.with_retry(node_id, || {
            let agent = self.agent_for(node_id, &base_url)?;
            let url = format!("{}/api/blocks", base_url);
            let mut request = agent.post(&url);
            if compressed {
                request = request.header("Content-Encoding", "gzip");
            }
            let request = request
                .header("X-Block-Id", block_id)
                .header("X-Is-Parity", is_parity.to_string())
                .header("X-Stripe-Index", stripe_index.to_string())
                .header("X-Position", position.to_string())
                .header("X-Checksum", checksum)
                .header("X-Request-Id", crate::utils::generate_request_id());

            match request.send(&body) {
                Ok(mut response) => {
                    let parsed: Result<StoreResponse, _> =
                        response.body_mut().with_config().read_json();
                    Ok(parsed.unwrap_or(StoreResponse {
                        ok: true,
                        stored_at: block_id.to_string(),
                        checksum: checksum.to_string(),
                    }))
                }
                Err(err) => Err(self.classify_err(node_id, err)),
            }
        })
    }

    pub fn retrieve_block(&self, node_id: u32, block_id: &str) -> Result<Vec<u8>, TransportError> {
        let base_url = self.base_url(node_id)?.to_string();

        self.with_retry(node_id, || {
            let agent = self.agent_for(node_id, &base_url)?;
            let url = format!("{}/api/blocks/{}", base_url, block_id);
            match agent.get(&url).call() {
                Ok(mut response) => {
                    let was_compressed = response
                        .headers()
                        .get("Content-Encoding")
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v == "gzip")
                        .unwrap_or(false);
                    let bytes = response
                        .body_mut()
                        .with_config()
                        .read_to_vec()
                        .map_err(|_| TransportError::ServerError { node_id, status: 0 })?;
                    Ok(self.maybe_decompress(bytes, was_compressed))
                }
                Err(ureq::Error::StatusCode(404)) => Err(TransportError::ClientError {
                    node_id,
                    status: 404,
                    message: "block not found".into(),
                }),
                Err(err) => Err(self.classify_err(node_id, err)),
            }
        })
    }

    pub fn delete_block(&self, node_id: u32, block_id: &str) -> Result<(), TransportError> {
        let base_url = self.base_url(node_id)?.to_string();

        self.with_retry(node_id, || {
            let agent = self.agent_for(node_id, &base_url)?;
            let url = format!("{}/api/blocks/{}", base_url, block_id);
            match agent.delete(&url).call() {
                Ok(_) => Ok(()),
                Err(ureq::Error::StatusCode(404)) => Err(TransportError::ClientError {
                    node_id,
                    status: 404,
                    message: "block not found".into(),
                }),
                Err(err) => Err(self.classify_err(node_id, err)),
            }
        })
    }

    pub fn health(&self, node_id: u32) -> Result<NodeHealthResponse, TransportError> {
        let base_url = self.base_url(node_id)?.to_string();
        let agent = self.agent_for(node_id, &base_url)?;
        let url = format!("{}/api/blocks/health", base_url);
        match agent.get(&url).call() {
            Ok(mut response) => response
                .body_mut()
                .with_config()
                .read_json()
                .map_err(|_| TransportError::ServerError { node_id, status: 0 }),
            Err(err) => Err(self.classify_err(node_id, err)),
        }
    }
}

impl NodeClient for NodeTransport {
    fn node_ids(&self) -> Vec<u32> {
        NodeTransport::node_ids(self)
    }

    fn store_block(
        &self,
        node_id: u32,
        block_id: &str,
        bytes: &[u8],
        is_parity: bool,
        stripe_index: u64,
        position: u64,
        checksum: &str,
    ) -> Result<StoreResponse, TransportError> {
        NodeTransport::store_block(
            self,
            node_id,
            block_id,
            bytes,
            is_parity,
            stripe_index,
            position,
            checksum,
        )
    }

    fn retrieve_block(&self, node_id: u32, block_id: &str) -> Result<Vec<u8>, TransportError> {
        NodeTransport::retrieve_block(self, node_id, block_id)
    }

    fn delete_block(&self, node_id: u32, block_id: &str) -> Result<(), TransportError> {
        NodeTransport::delete_block(self, node_id, block_id)
    }

    fn health(&self, node_id: u32) -> Result<NodeHealthResponse, TransportError> {
        NodeTransport::health(self, node_id)
    }
}

/// In-process stand-in for [`NodeTransport`] used by coordinator and health
/// monitor tests: each "node" is a real [`crate::block_store::BlockStore`]
/// rooted in a temp directory, so stored blocks really hit disk and really
/// get checksum-verified on read, but nothing crosses the network. A node
/// can be toggled "down" to drive the distilled spec's single/double
/// node-failure scenarios without an actual process to kill.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::block_store::BlockStore;
    use std::collections::{HashMap, HashSet};

    pub struct InProcessTransport {
        stores: HashMap<u32, BlockStore>,
        down: parking_lot::Mutex<HashSet<u32>>,
    }

    impl InProcessTransport {
        pub fn new(stores: HashMap<u32, BlockStore>) -> Self {
            Self {
                stores,
                down: parking_lot::Mutex::new(HashSet::new()),
            }
        }

        pub fn set_down(&self, node_id: u32, down: bool) {
            let mut set = self.down.lock();
            if down {
                set.insert(node_id);
            } else {
                set.remove(&node_id);
            }
        }

        fn is_down(&self, node_id: u32) -> bool {
            self.down.lock().contains(&node_id)
        }

        /// Test-only escape hatch to inspect a node's store directly, e.g.
        /// to assert no blocks were written after a rejected upload.
        pub fn store(&self, node_id: u32) -> Option<&BlockStore> {
            self.stores.get(&node_id)
        }

        fn store_for(&self, node_id: u32) -> Result<&BlockStore, TransportError> {
            if self.is_down(node_id) {
                return Err(TransportError::ConnectionFailed {
                    node_id,
                    reason: "node simulated offline".into(),
                });
            }
            self.stores.get(&node_id).ok_or(TransportError::ConnectionFailed {
                node_id,
                reason: "unknown node".into(),
            })
        }
    }

    impl NodeClient for InProcessTransport {
        fn node_ids(&self) -> Vec<u32> {
            let mut ids: Vec<u32> = self.stores.keys().copied().collect();
            ids.sort_unstable();
            ids
        }

        fn store_block(
            &self,
            node_id: u32,
            block_id: &str,
            bytes: &[u8],
            _is_parity: bool,
            _stripe_index: u64,
            _position: u64,
            checksum: &str,
        ) -> Result<StoreResponse, TransportError> {
            let store = self.store_for(node_id)?;
            store.store_block(block_id, bytes).map_err(|_| TransportError::ServerError {
                node_id,
                status: 500,
            })?;
            Ok(StoreResponse {
                ok: true,
                stored_at: block_id.to_string(),
                checksum: checksum.to_string(),
            })
        }

        fn retrieve_block(&self, node_id: u32, block_id: &str) -> Result<Vec<u8>, TransportError> {
            let store = self.store_for(node_id)?;
            store
                .retrieve_block(block_id)
                .map_err(|_| TransportError::ClientError {
                    node_id,
                    status: 404,
                    message: "block not found or integrity check failed".into(),
                })
        }

        fn delete_block(&self, node_id: u32, block_id: &str) -> Result<(), TransportError> {
            let store = self.store_for(node_id)?;
            store.delete_block(block_id).map_err(|_| TransportError::ClientError {
                node_id,
                status: 404,
                message: "block not found".into(),
            })
        }

        fn health(&self, node_id: u32) -> Result<NodeHealthResponse, TransportError> {
            if self.is_down(node_id) {
                return Err(TransportError::ConnectionFailed {
                    node_id,
                    reason: "node simulated offline".into(),
                });
            }
            if !self.stores.contains_key(&node_id) {
                return Err(TransportError::ConnectionFailed {
                    node_id,
                    reason: "unknown node".into(),
                });
            }
            Ok(NodeHealthResponse {
                node_id,
                status: NodeHealthState::Healthy,
                uptime_seconds: 0,
                error_count: 0,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_retryability_matches_policy() {
        assert!(TransportError::Timeout {
            node_id: 1,
            timeout_secs: 10
        }
        .is_retryable());
        assert!(TransportError::ServerError {
            node_id: 1,
            status: 503
        }
        .is_retryable());
        assert!(!TransportError::ClientError {
            node_id: 1,
            status: 404,
            message: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn base_url_missing_node_is_connection_failure() {
        let transport = NodeTransport::new(Default::default(), TransportPolicy::default());
        let result = transport.retrieve_block(9, "whatever");
        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed { .. })
        ));
    }
}
