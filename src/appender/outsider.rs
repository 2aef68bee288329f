use std::collections::BTreeMap;

use crate::graph::{Node, NodeType, TrafficMap, UNKNOWN};
use crate::payloads::{cluster_sensitive_key, AccessibleNamespaces, NamespaceInfo};

pub const NAME: &str = "outsider";

/// Marks nodes outside the requested namespaces, and nodes the requester may not inspect.
#[derive(Debug, Clone, Default)]
pub struct OutsiderAppender {
    pub accessible_namespaces: AccessibleNamespaces,
    pub namespaces: BTreeMap<String, NamespaceInfo>,
}

impl OutsiderAppender {
    pub fn append_graph(&self, traffic_map: &mut TrafficMap) {
        for node in traffic_map.values_mut() {
            match node.node_type {
                NodeType::Unknown => node.metadata.is_inaccessible = true,
                NodeType::Service
                    if node.metadata.is_service_entry.is_some()
                        || (node.namespace == UNKNOWN && node.service == UNKNOWN) =>
                {
                    node.metadata.is_inaccessible = true
                }
                _ => node.metadata.is_outside = self.is_outside(node),
            }
            if node.metadata.is_outside && !node.metadata.is_inaccessible {
                node.metadata.is_inaccessible = !self.is_accessible(node);
            }
        }
    }

    fn is_outside(&self, node: &Node) -> bool {
        node.namespace != UNKNOWN && !self.namespaces.contains_key(&node.namespace)
    }

    fn is_accessible(&self, node: &Node) -> bool {
        self.accessible_namespaces
            .contains_key(&cluster_sensitive_key(&node.cluster, &node.namespace))
    }
}
