//! Entry points for graph requests.

use std::future::Future;

use crate::appender::GlobalInfo;
use crate::error::{GraphError, Result};
use crate::graph::TrafficMap;
use crate::payloads::TelemetryOptions;
use crate::telemetry;

async fn with_timeout<F>(global: &GlobalInfo, build: F) -> Result<TrafficMap>
where
    F: Future<Output = Result<TrafficMap>>,
{
    let timeout = global.conf.request_timeout();
    tokio::time::timeout(timeout, build).await.map_err(|_| {
        tracing::warn!(?timeout, "graph generation timed out");
        GraphError::Timeout(timeout)
    })?
}

/// Graph of the requested namespaces.
pub async fn graph_namespaces(o: &TelemetryOptions, global: &GlobalInfo) -> Result<TrafficMap> {
    o.validate()?;
    if o.is_node_graph() {
        return Err(GraphError::BadRequest(
            "node options are not allowed on a namespaces graph".to_string(),
        ));
    }
    with_timeout(global, telemetry::build_namespaces_traffic_map(o, global)).await
}

/// Graph around one node.
pub async fn graph_node(o: &TelemetryOptions, global: &GlobalInfo) -> Result<TrafficMap> {
    o.validate()?;
    if !o.is_node_graph() {
        return Err(GraphError::BadRequest(
            "a node graph requires node options".to_string(),
        ));
    }
    with_timeout(global, telemetry::build_node_traffic_map(o, global)).await
}
