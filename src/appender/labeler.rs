use std::collections::BTreeMap;

use super::GlobalInfo;
use crate::error::Result;
use crate::graph::{is_ok, is_ok_version, Node, NodeType, TrafficMap};

pub const NAME: &str = "labeler";

/// Copies inventory labels onto service, workload and app nodes. App nodes get the labels
/// shared by every workload of the app.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelerAppender;

type Labels = BTreeMap<String, String>;

fn common_labels<'a>(mut sets: impl Iterator<Item = &'a Labels>) -> Option<Labels> {
    let mut common = sets.next()?.clone();
    for labels in sets {
        common.retain(|k, v| labels.get(k) == Some(v));
    }
    Some(common)
}

impl LabelerAppender {
    pub async fn append_graph(&self, traffic_map: &mut TrafficMap, global: &GlobalInfo) -> Result<()> {
        let mut found = Vec::new();
        for node in traffic_map.values() {
            if node.metadata.is_inaccessible {
                continue;
            }
            if let Some(labels) = self.labels(node, global).await? {
                if !labels.is_empty() {
                    found.push((node.id.clone(), labels));
                }
            }
        }
        for (id, labels) in found {
            if let Some(node) = traffic_map.get_mut(&id) {
                node.metadata.labels = Some(labels);
            }
        }
        Ok(())
    }

    async fn labels(&self, node: &Node, global: &GlobalInfo) -> Result<Option<Labels>> {
        match node.node_type {
            NodeType::Service => Ok(global
                .service_definition(&node.cluster, &node.namespace, &node.service)
                .await?
                .map(|s| s.labels)),
            NodeType::Workload => Ok(global
                .workload(&node.cluster, &node.namespace, &node.workload)
                .await?
                .map(|w| w.labels)),
            NodeType::App if is_ok(&node.workload) => Ok(global
                .workload(&node.cluster, &node.namespace, &node.workload)
                .await?
                .map(|w| w.labels)),
            NodeType::App => {
                let version = Some(node.version.as_str()).filter(|v| is_ok_version(v));
                let workloads = global
                    .app_workloads(&node.cluster, &node.namespace, &node.app, version)
                    .await?;
                Ok(common_labels(workloads.iter().map(|w| &w.labels)))
            }
            NodeType::Aggregate | NodeType::Unknown => Ok(None),
        }
    }
}
