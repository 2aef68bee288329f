use std::collections::BTreeSet;

use super::GlobalInfo;
use crate::business::NodeKey;
use crate::error::Result;
use crate::graph::{is_ok, NodeType, TrafficMap};

pub const NAME: &str = "ambient";

pub const DEFAULT_SHOW_WAYPOINTS: bool = true;

/// Flags waypoint proxies. When waypoints are hidden they are removed with their edges.
#[derive(Debug, Clone)]
pub struct AmbientAppender {
    pub show_waypoints: bool,
}

impl Default for AmbientAppender {
    fn default() -> Self {
        AmbientAppender {
            show_waypoints: DEFAULT_SHOW_WAYPOINTS,
        }
    }
}

impl AmbientAppender {
    pub async fn append_graph(&self, traffic_map: &mut TrafficMap, global: &GlobalInfo) -> Result<()> {
        if traffic_map.is_empty() {
            return Ok(());
        }
        let waypoints = global.waypoints().await?;
        if waypoints.is_empty() {
            return Ok(());
        }

        let mut found = BTreeSet::new();
        for node in traffic_map.values_mut() {
            if !matches!(node.node_type, NodeType::Workload | NodeType::App) || !is_ok(&node.workload) {
                continue;
            }
            if waypoints.contains(&NodeKey::new(&node.cluster, &node.namespace, &node.workload)) {
                node.metadata.is_waypoint = true;
                found.insert(node.id.clone());
            }
        }

        if !self.show_waypoints && !found.is_empty() {
            for id in &found {
                traffic_map.remove(id);
            }
            let pruned = traffic_map.prune_edges_to(&found);
            tracing::trace!(waypoints = found.len(), pruned, "waypoints removed");
        }
        Ok(())
    }
}
