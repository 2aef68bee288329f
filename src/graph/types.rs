use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::metadata::{EdgeMetadata, NodeMetadata};
use super::protocol::Protocol;
use super::{is_egress_cluster, is_ok, is_ok_version, UNKNOWN};
use crate::error::{GraphError, Result};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "camelCase")]
pub enum GraphType {
    App,
    Service,
    VersionedApp,
    Workload,
}

impl GraphType {
    pub fn as_str(self) -> &'static str {
        match self {
            GraphType::App => "app",
            GraphType::Service => "service",
            GraphType::VersionedApp => "versionedApp",
            GraphType::Workload => "workload",
        }
    }
}

impl FromStr for GraphType {
    type Err = GraphError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "app" => Ok(GraphType::App),
            "service" => Ok(GraphType::Service),
            "versionedApp" => Ok(GraphType::VersionedApp),
            "workload" => Ok(GraphType::Workload),
            other => Err(GraphError::BadRequest(format!(
                "invalid graph type [{}]",
                other
            ))),
        }
    }
}

impl fmt::Display for GraphType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Unknown,
    Service,
    App,
    Workload,
    Aggregate,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Unknown => "unknown",
            NodeType::Service => "service",
            NodeType::App => "app",
            NodeType::Workload => "workload",
            NodeType::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    pub cluster: String,
    pub namespace: String,
    pub workload: String,
    pub app: String,
    pub version: String,
    pub service: String,
    pub edges: Vec<Edge>,
    pub metadata: NodeMetadata,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Edge {
    pub source: String,
    pub dest: String,
    pub metadata: EdgeMetadata,
}

impl Edge {
    pub fn new(source: &str, dest: &str) -> Self {
        Edge {
            source: source.to_string(),
            dest: dest.to_string(),
            metadata: EdgeMetadata::default(),
        }
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.metadata.protocol
    }
}

/// Computes the node ID and type for a telemetry identity tuple.
///
/// Service graphs are identified like workload graphs; they are collapsed to services
/// after the whole graph is assembled.
#[allow(clippy::too_many_arguments)]
pub fn node_id(
    cluster: &str,
    service_namespace: &str,
    service: &str,
    workload_namespace: &str,
    workload: &str,
    app: &str,
    version: &str,
    graph_type: GraphType,
) -> Result<(String, NodeType)> {
    let namespace = if is_ok(workload_namespace) {
        workload_namespace
    } else {
        service_namespace
    };

    // the special-case unknown source node
    if namespace == UNKNOWN && workload == UNKNOWN && app == UNKNOWN && service.is_empty() {
        return Ok((format!("{}_unknown_source", cluster), NodeType::Unknown));
    }

    // one unknown service per namespace for requests to unknown destinations
    if workload == UNKNOWN && app == UNKNOWN && service == UNKNOWN {
        return Ok((
            format!("svc_{}_{}_unknown", cluster, namespace),
            NodeType::Service,
        ));
    }

    let workload_ok = is_ok(workload);
    let app_ok = is_ok(app);
    let service_ok = is_ok(service);

    if !workload_ok && !app_ok && !service_ok {
        return Err(GraphError::InvalidNode(format!(
            "cluster=[{}] namespace=[{}] workload=[{}] app=[{}] version=[{}] service=[{}] graphType=[{}]",
            cluster, namespace, workload, app, version, service, graph_type
        )));
    }

    if graph_type == GraphType::Workload || graph_type == GraphType::Service {
        if workload_ok {
            return Ok((
                format!("wl_{}_{}_{}", cluster, namespace, workload),
                NodeType::Workload,
            ));
        }
        let service = if service_ok { service } else { UNKNOWN };
        return Ok((
            format!("svc_{}_{}_{}", cluster, namespace, service),
            NodeType::Service,
        ));
    }

    if app_ok {
        if graph_type == GraphType::VersionedApp {
            if workload_ok {
                return Ok((
                    format!("vapp_{}_{}_{}", cluster, namespace, workload),
                    NodeType::App,
                ));
            }
            if is_ok_version(version) {
                return Ok((
                    format!("vapp_{}_{}_{}_{}", cluster, namespace, app, version),
                    NodeType::App,
                ));
            }
        }
        return Ok((format!("app_{}_{}_{}", cluster, namespace, app), NodeType::App));
    }

    if workload_ok {
        return Ok((
            format!("wl_{}_{}_{}", cluster, namespace, workload),
            NodeType::Workload,
        ));
    }

    Ok((
        format!("svc_{}_{}_{}", cluster, namespace, service),
        NodeType::Service,
    ))
}

pub fn aggregate_id(
    cluster: &str,
    namespace: &str,
    aggregate: &str,
    aggregate_value: &str,
    service: &str,
) -> String {
    if service.is_empty() {
        format!("agg_{}_{}_{}_{}", cluster, namespace, aggregate, aggregate_value)
    } else {
        format!(
            "agg_{}_{}_{}_{}_{}",
            cluster, namespace, aggregate, aggregate_value, service
        )
    }
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: &str,
        service_namespace: &str,
        service: &str,
        workload_namespace: &str,
        workload: &str,
        app: &str,
        version: &str,
        graph_type: GraphType,
    ) -> Result<Node> {
        let (id, node_type) = node_id(
            cluster,
            service_namespace,
            service,
            workload_namespace,
            workload,
            app,
            version,
            graph_type,
        )?;
        let namespace = if is_ok(workload_namespace) {
            workload_namespace
        } else {
            service_namespace
        };
        Ok(Node::new_explicit(
            id, cluster, namespace, workload, app, version, service, node_type, graph_type,
        ))
    }

    /// Builds a node under an already resolved ID, trimming fields the node type does not use.
    #[allow(clippy::too_many_arguments)]
    pub fn new_explicit(
        id: String,
        cluster: &str,
        namespace: &str,
        workload: &str,
        app: &str,
        version: &str,
        service: &str,
        node_type: NodeType,
        graph_type: GraphType,
    ) -> Node {
        let mut metadata = NodeMetadata::default();
        let (mut workload, mut app, mut version, mut service) = (workload, app, version, service);

        match node_type {
            NodeType::App => {
                // a versioned app keeps its backing workload name
                if graph_type != GraphType::VersionedApp {
                    workload = "";
                    version = "";
                }
                service = "";
            }
            NodeType::Service => {
                app = "";
                workload = "";
                version = "";
                if is_egress_cluster(service) {
                    metadata.is_egress_cluster = true;
                }
            }
            NodeType::Workload => {
                if app == UNKNOWN {
                    app = "";
                }
                if version == UNKNOWN {
                    version = "";
                }
                service = "";
            }
            NodeType::Unknown | NodeType::Aggregate => {}
        }

        Node {
            id,
            node_type,
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            workload: workload.to_string(),
            app: app.to_string(),
            version: version.to_string(),
            service: service.to_string(),
            edges: Vec::new(),
            metadata,
        }
    }

    /// Aggregate node; `service` and `app` are empty unless the aggregate is service specific.
    pub fn new_aggregate(
        cluster: &str,
        namespace: &str,
        aggregate: &str,
        aggregate_value: &str,
        service: &str,
        app: &str,
    ) -> Node {
        let id = aggregate_id(cluster, namespace, aggregate, aggregate_value, service);
        let mut metadata = NodeMetadata::default();
        metadata.aggregate = Some(aggregate.to_string());
        metadata.aggregate_value = Some(aggregate_value.to_string());

        Node {
            id,
            node_type: NodeType::Aggregate,
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            workload: String::new(),
            app: app.to_string(),
            version: String::new(),
            service: service.to_string(),
            edges: Vec::new(),
            metadata,
        }
    }

    /// Appends an edge without checking for an existing one.
    pub fn add_edge(&mut self, dest: &str) -> &mut Edge {
        self.edges.push(Edge::new(&self.id, dest));
        let last = self.edges.len() - 1;
        &mut self.edges[last]
    }

    pub fn edge_mut(&mut self, dest: &str, protocol: Option<Protocol>) -> Option<&mut Edge> {
        self.edges
            .iter_mut()
            .find(|e| e.dest == dest && e.metadata.protocol == protocol)
    }

    pub fn has_edge(&self, dest: &str, protocol: Option<Protocol>) -> bool {
        self.edges
            .iter()
            .any(|e| e.dest == dest && e.metadata.protocol == protocol)
    }

    /// Returns the edge for (dest, protocol), creating it when absent.
    pub fn find_or_add_edge(&mut self, dest: &str, protocol: Protocol) -> &mut Edge {
        let found = self
            .edges
            .iter()
            .position(|e| e.dest == dest && e.metadata.protocol == Some(protocol));
        match found {
            Some(i) => &mut self.edges[i],
            None => {
                let edge = self.add_edge(dest);
                edge.metadata.protocol = Some(protocol);
                edge
            }
        }
    }
}

/// Node ID to node. Ordered so that traversal is deterministic.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TrafficMap(BTreeMap<String, Node>);

impl Deref for TrafficMap {
    type Target = BTreeMap<String, Node>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for TrafficMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl IntoIterator for TrafficMap {
    type Item = (String, Node);
    type IntoIter = std::collections::btree_map::IntoIter<String, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Node> for TrafficMap {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        TrafficMap(iter.into_iter().map(|n| (n.id.clone(), n)).collect())
    }
}

impl TrafficMap {
    pub fn new() -> Self {
        TrafficMap(BTreeMap::new())
    }

    pub fn insert_node(&mut self, node: Node) {
        self.0.insert(node.id.clone(), node);
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.0.values().flat_map(|n| n.edges.iter())
    }

    pub fn node_type(&self, id: &str) -> Option<NodeType> {
        self.0.get(id).map(|n| n.node_type)
    }

    /// IDs of every node that is the destination of some edge.
    pub fn dest_ids(&self) -> BTreeSet<String> {
        self.edges().map(|e| e.dest.clone()).collect()
    }

    /// Drops edges whose destination is in `removed`. Returns the number of edges dropped.
    pub fn prune_edges_to(&mut self, removed: &BTreeSet<String>) -> usize {
        let mut pruned = 0;
        for node in self.0.values_mut() {
            let before = node.edges.len();
            node.edges.retain(|e| !removed.contains(&e.dest));
            pruned += before - node.edges.len();
        }
        pruned
    }

    /// Drops edges whose destination is no longer in the map.
    pub fn prune_dangling_edges(&mut self) -> usize {
        let ids: BTreeSet<String> = self.0.keys().cloned().collect();
        let mut pruned = 0;
        for node in self.0.values_mut() {
            let before = node.edges.len();
            node.edges.retain(|e| ids.contains(&e.dest));
            pruned += before - node.edges.len();
        }
        pruned
    }
}
