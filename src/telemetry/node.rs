//! Traffic of a single node: everything it calls and everything calling it.

use super::builder::{families, Family, Populator};
use super::util::{prom_query, reporter};
use crate::appender::GlobalInfo;
use crate::error::{GraphError, Result};
use crate::graph::{is_ok_version, Node, NodeType, TrafficMap};
use crate::payloads::{NamespaceInfo, NodeOptions, TelemetryOptions};

/// The node a node graph is requested for.
pub fn requested_node(o: &TelemetryOptions, home_cluster: &str) -> Result<Node> {
    let n: &NodeOptions = o
        .node
        .as_ref()
        .ok_or_else(|| GraphError::BadRequest("node graph requires node options".to_string()))?;
    let cluster = if n.cluster.is_empty() {
        home_cluster
    } else {
        n.cluster.as_str()
    };
    if !n.aggregate.is_empty() {
        return Ok(Node::new_aggregate(
            cluster,
            &n.namespace,
            &n.aggregate,
            &n.aggregate_value,
            &n.service,
            &n.app,
        ));
    }
    let node = Node::new(
        cluster,
        &n.namespace,
        &n.service,
        &n.namespace,
        &n.workload,
        &n.app,
        &n.version,
        o.graph_type,
    )
    .map_err(|e| GraphError::BadRequest(e.to_string()))?;
    Ok(node)
}

/// Selectors for traffic into the node and out of it.
fn selectors(node: &Node, family: &Family, o: &TelemetryOptions) -> (Vec<String>, Vec<String>) {
    let ns = &node.namespace;
    let dest_reporter = reporter("destination", &o.rates);
    let source_reporter = reporter("source", &o.rates);

    match node.node_type {
        NodeType::Workload => (
            vec![format!(
                r#"{},destination_workload_namespace="{}",destination_workload="{}""#,
                dest_reporter, ns, node.workload
            )],
            vec![format!(
                r#"{},source_workload_namespace="{}",source_workload="{}""#,
                source_reporter, ns, node.workload
            )],
        ),
        NodeType::App => {
            let (dest_version, source_version) = if is_ok_version(&node.version) {
                (
                    format!(r#",destination_canonical_revision="{}""#, node.version),
                    format!(r#",source_canonical_revision="{}""#, node.version),
                )
            } else {
                (String::new(), String::new())
            };
            (
                vec![format!(
                    r#"{},destination_service_namespace="{}",destination_canonical_service="{}"{}"#,
                    dest_reporter, ns, node.app, dest_version
                )],
                vec![format!(
                    r#"{},source_workload_namespace="{}",source_canonical_service="{}"{}"#,
                    source_reporter, ns, node.app, source_version
                )],
            )
        }
        NodeType::Service => {
            let mut incoming = vec![format!(
                r#"{},destination_service_namespace="{}",destination_service_name="{}""#,
                source_reporter, ns, node.service
            )];
            // unknown sources only report destination side
            if family.protocol.is_none() {
                incoming.insert(
                    0,
                    format!(
                        r#"reporter="destination",source_workload="unknown",destination_service_namespace="{}",destination_service_name="{}""#,
                        ns, node.service
                    ),
                );
            }
            (incoming, Vec::new())
        }
        NodeType::Aggregate => {
            // aggregates classify requests only; the appender resolves the aggregate itself
            if family.protocol.is_some() {
                return (Vec::new(), Vec::new());
            }
            let aggregate = node.metadata.aggregate.as_deref().unwrap_or_default();
            let value = node.metadata.aggregate_value.as_deref().unwrap_or_default();
            let service = if node.service.is_empty() {
                String::new()
            } else {
                format!(r#",destination_service_name="{}""#, node.service)
            };
            (
                vec![format!(
                    r#"{},destination_service_namespace="{}",{}="{}"{}"#,
                    dest_reporter, ns, aggregate, value, service
                )],
                Vec::new(),
            )
        }
        NodeType::Unknown => (Vec::new(), Vec::new()),
    }
}

/// Builds the traffic map around `node`. The node itself is absent when it had no traffic.
#[tracing::instrument(skip_all, fields(node = %node.id))]
pub async fn node_traffic_map(
    node: &Node,
    namespace: &NamespaceInfo,
    o: &TelemetryOptions,
    global: &GlobalInfo,
) -> Result<TrafficMap> {
    let mut traffic_map = TrafficMap::new();
    let populator = Populator::new(o, global, namespace.is_ambient).await?;
    let duration = namespace.duration.as_secs();

    for family in families(o) {
        let (incoming, outgoing) = selectors(node, &family, o);
        for selector in incoming.iter().chain(outgoing.iter()) {
            let query = family.query(selector, duration, o.include_idle_edges);
            let vector = prom_query(global.prom.as_ref(), &global.conf, &query, o.query_time, None).await?;
            populator.populate(&mut traffic_map, &vector, &family);
        }
    }
    Ok(traffic_map)
}

/// Whether the map holds the node. A requested app is present through any of its workloads.
fn is_present(traffic_map: &TrafficMap, node: &Node) -> bool {
    if traffic_map.contains_key(&node.id) {
        return true;
    }
    node.node_type == NodeType::App
        && traffic_map.values().any(|n| {
            n.node_type == NodeType::App
                && n.cluster == node.cluster
                && n.namespace == node.namespace
                && n.app == node.app
                && (!is_ok_version(&node.version) || n.version == node.version)
        })
}

/// Inserts the requested node flagged idle when nothing reported traffic for it.
pub fn add_requested_node(traffic_map: &mut TrafficMap, mut node: Node) {
    if is_present(traffic_map, &node) {
        return;
    }
    tracing::debug!(node = %node.id, "requested node has no traffic, adding it idle");
    node.metadata.is_idle = true;
    traffic_map.insert_node(node);
}
