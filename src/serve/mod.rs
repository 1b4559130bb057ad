pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use poem::{listener::TcpListener, middleware::Cors, EndpointExt, Route, Server};
use poem_openapi::OpenApiService;

use crate::block_store::BlockStore;
use crate::coordinator::RaidCoordinator;
use crate::health::{HealthMonitor, NodeEvent};
use crate::node_service::NodeApi;

fn permissive_cors() -> Cors {
    Cors::new()
        .allow_origin(poem::http::header::HeaderValue::from_static("*"))
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS", "HEAD"])
        .allow_headers(vec![
            "Content-Type",
            "X-Block-Id",
            "X-Is-Parity",
            "X-Stripe-Index",
            "X-Position",
            "X-Checksum",
            "X-Request-Id",
            "Content-Encoding",
        ])
        .expose_headers(vec!["Content-Length", "Content-Type", "Content-Encoding"])
        .max_age(3600)
}

/// Logs every `NodeFailure`/`NodeRecovery` event as it arrives. Runs for the
/// lifetime of the coordinator process; each event is handled to completion
/// before the next is read off the channel, matching the distilled spec's
/// "node events are processed one at a time, in arrival order" concurrency
/// rule.
async fn log_node_events(health: HealthMonitor) {
    let mut events = health.subscribe();
    loop {
        match events.recv().await {
            Ok(NodeEvent::NodeFailure {
                node_id,
                reason,
                last_known,
            }) => {
                tracing::warn!(
                    node_id,
                    reason = %reason,
                    last_known_secs_ago = ?last_known.map(|t| t.elapsed().as_secs()),
                    "node marked offline"
                );
            }
            Ok(NodeEvent::NodeRecovery { node_id, downtime }) => {
                tracing::info!(
                    node_id,
                    downtime_secs = downtime.as_secs(),
                    "node recovered"
                );
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "node event log lagged behind, some events dropped");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Boots the coordinator's HTTP service: Swagger UI under `/docs`, the API
/// under `/api`, plus the health monitor's background ticker and event log —
/// mirroring `blockframe::serve::run_server`'s `OpenApiService` + CORS +
/// nested-route pattern, generalized from one archive to the whole cluster.
pub async fn run_coordinator_server(
    coordinator: Arc<RaidCoordinator>,
    health: HealthMonitor,
    health_check_interval: Duration,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    health.start(health_check_interval);
    tokio::spawn(log_node_events(health));

    let api_service = OpenApiService::new(
        routes::CoordinatorApi::new(coordinator),
        "RAID Coordinator API",
        env!("CARGO_PKG_VERSION"),
    )
    .server("/api");
    let ui = api_service.swagger_ui();

    let app = Route::new()
        .nest("/api", api_service.with(permissive_cors()))
        .nest("/docs", ui.with(permissive_cors()));

    tracing::info!(port, "coordinator listening");
    Server::new(TcpListener::bind(format!("0.0.0.0:{port}")))
        .run(app)
        .await?;

    Ok(())
}

/// Boots a single node's HTTP service exposing the Block Store contract plus
/// a health probe, under the same `/api` + `/docs` convention as the
/// coordinator.
pub async fn run_node_server(
    node_id: u32,
    store: BlockStore,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let api_service = OpenApiService::new(
        NodeApi::new(node_id, store),
        format!("RAID Node {node_id} API"),
        env!("CARGO_PKG_VERSION"),
    )
    .server("/api");
    let ui = api_service.swagger_ui();

    let app = Route::new()
        .nest("/api", api_service.with(permissive_cors()))
        .nest("/docs", ui.with(permissive_cors()));

    tracing::info!(node_id, port, "node listening");
    Server::new(TcpListener::bind(format!("0.0.0.0:{port}")))
        .run(app)
        .await?;

    Ok(())
}
