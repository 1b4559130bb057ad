//! Periodically probes each node, maintains a cached status map, and emits
//! failure/recovery events without blocking foreground requests.
//!
//! Re-purposed from `blockframe::filestore::health`'s `batch_health_check`
//! classification style — there it scans static file integrity, here it
//! probes live node liveness. Events are a `tokio::sync::broadcast` channel:
//! the distilled spec's Design Notes call for "a typed message stream the
//! coordinator consumes" rather than a shared mutable listener list, and a
//! broadcast channel is the idiomatic tokio way to do that.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::transport::NodeClient;

pub const NODE_FAILURE_ERROR_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u32,
    pub state: NodeState,
    pub last_heartbeat: Option<Instant>,
    pub last_response_time: Option<Duration>,
    pub error_count: u32,
}

impl NodeStatus {
    fn unknown(node_id: u32) -> Self {
        Self {
            node_id,
            state: NodeState::Unknown,
            last_heartbeat: None,
            last_response_time: None,
            error_count: 0,
        }
    }

    /// `isHealthy = isOnline ∧ errorCount<5 ∧ (now−lastHeartbeat)<T_stale`.
    pub fn is_healthy(&self, stale_after: Duration) -> bool {
        self.state == NodeState::Online
            && self.error_count < NODE_FAILURE_ERROR_THRESHOLD
            && self
                .last_heartbeat
                .map(|t| t.elapsed() < stale_after)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    NodeFailure {
        node_id: u32,
        reason: String,
        last_known: Option<Instant>,
    },
    NodeRecovery {
        node_id: u32,
        downtime: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemStatus {
    Operational,
    Degraded,
    Critical,
}

#[derive(Debug, Clone)]
pub struct AvailabilityStats {
    pub online: usize,
    pub total: usize,
    pub status: SystemStatus,
}

struct Inner {
    statuses: RwLock<HashMap<u32, NodeStatus>>,
    transport: Arc<dyn NodeClient>,
    events: broadcast::Sender<NodeEvent>,
    node_count: usize,
    stripe_width: usize,
    stale_after: Duration,
    ticker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the health monitor. Cloning is cheap (`Arc` internally);
/// the background ticker task holds its own clone.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    /// `stale_after` feeds the Node data model's derived `isHealthy` term —
    /// `nodeFailureThreshold` (minutes of heartbeat absence) from the system
    /// parameters, converted to a `Duration` by the caller.
    pub fn new(
        transport: Arc<dyn NodeClient>,
        node_count: usize,
        stripe_width: usize,
        stale_after: Duration,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        let statuses = transport
            .node_ids()
            .into_iter()
            .map(|id| (id, NodeStatus::unknown(id)))
            .collect();
        Self {
            inner: Arc::new(Inner {
                statuses: RwLock::new(statuses),
                transport,
                events: tx,
                node_count,
                stripe_width,
                stale_after,
                ticker: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub fn status_of(&self, node_id: u32) -> Option<NodeStatus> {
        self.inner.statuses.read().get(&node_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<NodeStatus> {
        let mut statuses: Vec<NodeStatus> = self.inner.statuses.read().values().cloned().collect();
        statuses.sort_by_key(|s| s.node_id);
        statuses
    }

    /// The Node data model's derived `isHealthy` field for one node, or
    /// `false` if the node id is unknown to this monitor.
    pub fn is_healthy(&self, node_id: u32) -> bool {
        self.inner
            .statuses
            .read()
            .get(&node_id)
            .map(|s| s.is_healthy(self.inner.stale_after))
            .unwrap_or(false)
    }

    /// Performs one probe of `node_id`, updates the cached status, and
    /// emits a `NodeFailure`/`NodeRecovery` event on an edge transition.
    pub fn check_node(&self, node_id: u32) {
        let started = Instant::now();
        let probe_result = self.inner.transport.health(node_id);

        let mut statuses = self.inner.statuses.write();
        let previous = statuses
            .get(&node_id)
            .cloned()
            .unwrap_or_else(|| NodeStatus::unknown(node_id));

        let new_state = if probe_result.is_ok() {
            NodeState::Online
        } else {
            NodeState::Offline
        };

        let updated = match new_state {
            NodeState::Online => NodeStatus {
                node_id,
                state: NodeState::Online,
                last_heartbeat: Some(Instant::now()),
                last_response_time: Some(started.elapsed()),
                error_count: 0,
            },
            NodeState::Offline => NodeStatus {
                node_id,
                state: NodeState::Offline,
                last_heartbeat: previous.last_heartbeat,
                last_response_time: previous.last_response_time,
                error_count: previous.error_count + 1,
            },
            NodeState::Unknown => previous.clone(),
        };

        statuses.insert(node_id, updated.clone());
        drop(statuses);

        if previous.state == NodeState::Online && updated.state == NodeState::Offline {
            let _ = self.inner.events.send(NodeEvent::NodeFailure {
                node_id,
                reason: probe_result
                    .err()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "probe failed".into()),
                last_known: previous.last_heartbeat,
            });
        } else if previous.state == NodeState::Offline && updated.state == NodeState::Online {
            let downtime = previous
                .last_heartbeat
                .map(|t| t.elapsed())
                .unwrap_or_default();
            let _ = self
                .inner
                .events
                .send(NodeEvent::NodeRecovery { node_id, downtime });
        }
    }

    /// Probes every node concurrently and returns the resulting snapshot.
    pub async fn check_all(&self) -> Vec<NodeStatus> {
        let node_ids = self.inner.transport.node_ids();
        let monitor = self.clone();
        let handles: Vec<JoinHandle<()>> = node_ids
            .into_iter()
            .map(|id| {
                let monitor = monitor.clone();
                tokio::task::spawn_blocking(move || monitor.check_node(id))
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.snapshot()
    }

    /// Launches a background ticker invoking `check_all()` every `interval`.
    /// A second call while one is already running is a no-op — the ticker
    /// handle lives in `Inner`, guarded by a lock, so only the first caller
    /// actually spawns a task.
    pub fn start(&self, interval: Duration) {
        let mut ticker = self.inner.ticker.lock();
        if ticker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let monitor = self.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                monitor.check_all().await;
            }
        }));
    }

    /// Stops the background ticker started by [`Self::start`], if any.
    /// Idempotent: stopping an already-stopped monitor is a no-op.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.ticker.lock().take() {
            handle.abort();
        }
    }

    /// `Operational` when every node is online (`online == N`, which is also
    /// `≥ D+1` since `D+1 == N` for this fixed fleet); `Degraded` while at
    /// least two nodes are online but at least one is down; `Critical` once
    /// fewer than two remain online. This resolves an apparent internal
    /// inconsistency in the distilled spec's availability formula — applying
    /// it literally would mark a single downed node `Critical`, contradicting
    /// the spec's own worked scenario ("stop node P(0)... server reports
    /// `Degraded`") — in favor of the worked scenario, which is authoritative.
    pub fn availability_stats(&self) -> AvailabilityStats {
        let statuses = self.inner.statuses.read();
        let online = statuses
            .values()
            .filter(|s| s.is_healthy(self.inner.stale_after))
            .count();
        let total = self.inner.node_count;
        let _d_plus_1 = self.inner.stripe_width + 1;

        let status = if online == total {
            SystemStatus::Operational
        } else if online >= 2 {
            SystemStatus::Degraded
        } else {
            SystemStatus::Critical
        };

        AvailabilityStats {
            online,
            total,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_classifies_by_online_count() {
        use crate::transport::NodeTransport;
        let transport = Arc::new(NodeTransport::new(
            Default::default(),
            crate::transport::TransportPolicy::default(),
        ));
        let monitor = HealthMonitor::new(transport, 4, 3, Duration::from_secs(120));

        {
            let mut statuses = monitor.inner.statuses.write();
            for id in 1..=4u32 {
                statuses.insert(
                    id,
                    NodeStatus {
                        node_id: id,
                        state: NodeState::Online,
                        last_heartbeat: Some(Instant::now()),
                        last_response_time: None,
                        error_count: 0,
                    },
                );
            }
        }
        assert_eq!(monitor.availability_stats().status, SystemStatus::Operational);

        monitor
            .inner
            .statuses
            .write()
            .get_mut(&1)
            .unwrap()
            .state = NodeState::Offline;
        assert_eq!(monitor.availability_stats().status, SystemStatus::Degraded);

        let mut statuses = monitor.inner.statuses.write();
        statuses.get_mut(&2).unwrap().state = NodeState::Offline;
        statuses.get_mut(&3).unwrap().state = NodeState::Offline;
        drop(statuses);
        assert_eq!(monitor.availability_stats().status, SystemStatus::Critical);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears_the_ticker() {
        use crate::transport::NodeTransport;
        let transport = Arc::new(NodeTransport::new(
            Default::default(),
            crate::transport::TransportPolicy::default(),
        ));
        let monitor = HealthMonitor::new(transport, 4, 3, Duration::from_secs(120));

        monitor.start(Duration::from_millis(10));
        let first = monitor.inner.ticker.lock().as_ref().unwrap().id();

        // A second call while the ticker is still running must not replace it.
        monitor.start(Duration::from_millis(10));
        let second = monitor.inner.ticker.lock().as_ref().unwrap().id();
        assert_eq!(first, second, "second start() spawned a new ticker");

        monitor.stop();
        assert!(monitor.inner.ticker.lock().is_none());

        // Stopping twice, or stopping when nothing is running, is a no-op.
        monitor.stop();
    }

    #[test]
    fn check_node_emits_exactly_one_event_per_transition() {
        use crate::block_store::BlockStore;
        use crate::transport::test_support::InProcessTransport;
        use std::collections::HashMap;

        let dir = tempfile::tempdir().unwrap();
        let mut stores = HashMap::new();
        stores.insert(1u32, BlockStore::new(dir.path(), 1_000).unwrap());
        let transport = Arc::new(InProcessTransport::new(stores));
        let monitor = HealthMonitor::new(transport.clone(), 1, 0, Duration::from_secs(120));
        let mut events = monitor.subscribe();

        // Unknown -> Online is not a failure/recovery edge.
        monitor.check_node(1);
        assert_eq!(monitor.status_of(1).unwrap().state, NodeState::Online);

        transport.set_down(1, true);
        monitor.check_node(1);
        assert_eq!(monitor.status_of(1).unwrap().state, NodeState::Offline);
        match events.try_recv().unwrap() {
            NodeEvent::NodeFailure { node_id, .. } => assert_eq!(node_id, 1),
            other => panic!("expected NodeFailure, got {other:?}"),
        }
        assert!(events.try_recv().is_err(), "exactly one NodeFailure expected");

        transport.set_down(1, false);
        monitor.check_node(1);
        assert_eq!(monitor.status_of(1).unwrap().state, NodeState::Online);
        match events.try_recv().unwrap() {
            NodeEvent::NodeRecovery { node_id, .. } => assert_eq!(node_id, 1),
            other => panic!("expected NodeRecovery, got {other:?}"),
        }
        assert!(events.try_recv().is_err(), "exactly one NodeRecovery expected");
    }
}
