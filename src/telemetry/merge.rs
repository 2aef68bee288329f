use crate::graph::{
    add_outgoing_edge_to_metadata, aggregate_edge_traffic, Edge, Node, NodeType, RateKey,
    TrafficMap,
};

/// Merges the map of `namespace` into the accumulated map.
///
/// A node seen from two namespaces keeps the instance of the namespace it belongs to, since
/// that one went through every namespace appender. Edges of the other instance are copied over
/// unless an edge with the same destination and protocol is already there, e.g. for
///
/// ```text
/// ns1: unknown -> ns1:A -> ns2:B
/// ns2:           ns1:A -> ns2:B -> ns2:C
/// ```
pub fn merge_traffic_maps(traffic_map: &mut TrafficMap, namespace: &str, ns_traffic_map: TrafficMap) {
    for (id, ns_node) in ns_traffic_map {
        let (mut kept, superseded) = match traffic_map.remove(&id) {
            None => {
                traffic_map.insert(id, ns_node);
                continue;
            }
            Some(existing) if ns_node.namespace == namespace => (ns_node, existing),
            Some(existing) => (existing, ns_node),
        };
        for edge in superseded.edges {
            if kept.has_edge(&edge.dest, edge.metadata.protocol) {
                continue;
            }
            add_outgoing_edge_to_metadata(&mut kept.metadata, &edge.metadata);
            kept.edges.push(edge);
        }
        traffic_map.insert_node(kept);
    }
}

fn merge_edge(node: &mut Node, edge: &Edge) {
    match node.edge_mut(&edge.dest, edge.metadata.protocol) {
        Some(existing) => aggregate_edge_traffic(&edge.metadata, &mut existing.metadata),
        None => {
            let mut edge = edge.clone();
            edge.source = node.id.clone();
            node.edges.push(edge);
        }
    }
}

fn recompute_outgoing(node: &mut Node) {
    for key in [RateKey::GrpcOut, RateKey::HttpOut, RateKey::TcpOut] {
        node.metadata.rates.remove(key);
    }
    for edge in &node.edges {
        add_outgoing_edge_to_metadata(&mut node.metadata, &edge.metadata);
    }
}

/// Collapses a service injected workload graph to service nodes. Paths
/// `service -> workload -> service` become direct service edges; non-service nodes survive
/// only as roots with traffic to some service.
pub fn reduce_to_service_graph(traffic_map: TrafficMap) -> TrafficMap {
    let is_service = |id: &str| traffic_map.node_type(id) == Some(NodeType::Service);
    let mut reduced = TrafficMap::new();

    for node in traffic_map.values() {
        if node.node_type != NodeType::Service {
            if !node.metadata.is_root {
                continue;
            }
            let mut root = node.clone();
            root.edges.retain(|e| is_service(&e.dest));
            if root.edges.is_empty() {
                tracing::trace!(node = %node.id, "dropping root without service traffic");
                continue;
            }
            recompute_outgoing(&mut root);
            reduced.insert_node(root);
            continue;
        }

        let mut service = node.clone();
        service.edges = Vec::new();
        for edge in &node.edges {
            let dest = match traffic_map.get(&edge.dest) {
                Some(dest) => dest,
                None => continue,
            };
            if dest.node_type == NodeType::Service {
                merge_edge(&mut service, edge);
                continue;
            }
            for hop in dest.edges.iter().filter(|e| is_service(&e.dest)) {
                merge_edge(&mut service, hop);
            }
        }
        recompute_outgoing(&mut service);
        reduced.insert_node(service);
    }
    reduced
}
