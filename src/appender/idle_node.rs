use super::GlobalInfo;
use crate::error::Result;
use crate::graph::{GraphType, Node, TrafficMap};
use crate::payloads::NamespaceInfo;

pub const NAME: &str = "idleNode";

/// Adds workloads of the namespace that saw no traffic as idle nodes. Services are added too
/// when service nodes are injected. `is_idle` also covers what older callers call unused.
#[derive(Debug, Clone)]
pub struct IdleNodeAppender {
    pub graph_type: GraphType,
    pub inject_service_nodes: bool,
    pub is_node_graph: bool,
}

impl IdleNodeAppender {
    pub async fn append_graph(
        &self,
        traffic_map: &mut TrafficMap,
        global: &GlobalInfo,
        namespace: &NamespaceInfo,
    ) -> Result<()> {
        if self.graph_type == GraphType::Service || self.is_node_graph {
            return Ok(());
        }
        let ns = namespace.name.as_str();
        let clusters = global.namespace_clusters(ns).await?;

        let mut idle = Vec::new();
        for cluster in clusters.iter() {
            if self.inject_service_nodes {
                for service in global.service_list(cluster, ns).await?.iter() {
                    idle.push(Node::new(cluster, ns, &service.name, "", "", "", "", self.graph_type));
                }
            }
            for workload in global.workload_list(cluster, ns).await?.iter() {
                let app = global.conf.app_label(&workload.labels).unwrap_or_default();
                let version = global.conf.version_label(&workload.labels).unwrap_or_default();
                idle.push(Node::new(cluster, ns, "", ns, &workload.name, app, version, self.graph_type));
            }
        }

        let mut added = 0;
        for node in idle {
            let mut node = match node {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!("skipping idle node, {}", e);
                    continue;
                }
            };
            if traffic_map.contains_key(&node.id) {
                continue;
            }
            node.metadata.is_idle = true;
            traffic_map.insert_node(node);
            added += 1;
        }
        tracing::trace!(namespace = ns, added, "idle nodes added");
        Ok(())
    }
}
