use std::collections::BTreeSet;

use super::GlobalInfo;
use crate::error::Result;
use crate::graph::{is_ok, Node, NodeType, TrafficMap, PROTOCOLS};
use crate::payloads::AccessibleNamespaces;

pub const NAME: &str = "deadNode";

/// Removes nodes that saw no traffic and have no running backing workload. Zero traffic nodes
/// whose workload exists without pods are kept and flagged dead.
#[derive(Debug, Clone, Default)]
pub struct DeadNodeAppender {
    pub accessible_namespaces: AccessibleNamespaces,
}

fn has_traffic(node: &Node) -> bool {
    PROTOCOLS.iter().any(|info| {
        info.node_rates
            .iter()
            .filter(|rate| rate.is_in || rate.is_out)
            .any(|rate| node.metadata.rates.value(rate.key) > 0.0)
    })
}

enum Verdict {
    Keep,
    Dead,
    Remove,
}

impl DeadNodeAppender {
    /// Repeats removal until nothing changes, at most once per node present on entry.
    pub async fn append_graph(&self, traffic_map: &mut TrafficMap, global: &GlobalInfo) -> Result<()> {
        let max_passes = traffic_map.len();
        let mut passes = 0;
        while passes < max_passes {
            passes += 1;
            let removed = self.remove_dead_nodes(traffic_map, global).await?;
            if removed == 0 {
                break;
            }
        }
        tracing::trace!(passes, nodes = traffic_map.len(), "dead node removal complete");
        Ok(())
    }

    fn is_inspectable(&self, cluster: &str, global: &GlobalInfo) -> bool {
        !is_ok(cluster)
            || cluster == global.conf.home_cluster
            || self
                .accessible_namespaces
                .values()
                .any(|ns| ns.cluster == cluster)
    }

    async fn verdict(&self, node: &Node, global: &GlobalInfo) -> Result<Verdict> {
        if has_traffic(node) || !self.is_inspectable(&node.cluster, global) {
            return Ok(Verdict::Keep);
        }
        match node.node_type {
            NodeType::Aggregate => Ok(Verdict::Keep),
            NodeType::Service => {
                if !node.edges.is_empty()
                    || node.metadata.is_service_entry.is_some()
                    || node.metadata.is_egress_cluster
                {
                    Ok(Verdict::Keep)
                } else {
                    Ok(Verdict::Remove)
                }
            }
            NodeType::Unknown => Ok(Verdict::Remove),
            NodeType::Workload | NodeType::App => {
                // versionless app nodes have no single backing workload
                if !is_ok(&node.workload) {
                    return Ok(Verdict::Keep);
                }
                match global
                    .workload(&node.cluster, &node.namespace, &node.workload)
                    .await?
                {
                    None => Ok(Verdict::Remove),
                    Some(workload) if workload.pod_count == 0 => Ok(Verdict::Dead),
                    Some(_) => Ok(Verdict::Keep),
                }
            }
        }
    }

    async fn remove_dead_nodes(&self, traffic_map: &mut TrafficMap, global: &GlobalInfo) -> Result<usize> {
        let mut removed = BTreeSet::new();
        let mut dead = Vec::new();
        for (id, node) in traffic_map.iter() {
            match self.verdict(node, global).await? {
                Verdict::Keep => {}
                Verdict::Dead => dead.push(id.clone()),
                Verdict::Remove => {
                    removed.insert(id.clone());
                }
            }
        }

        for id in dead {
            if let Some(node) = traffic_map.get_mut(&id) {
                node.metadata.is_dead = true;
            }
        }
        for id in &removed {
            tracing::trace!(node = %id, "removing dead node");
            traffic_map.remove(id);
        }
        if !removed.is_empty() {
            traffic_map.prune_edges_to(&removed);
        }
        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::graph::{GraphType, Protocol, SeInfo};
    use crate::models::MESH_EXTERNAL;
    use crate::testing::{
        connect, global_info, service_node, workload, workload_node, MockInventory, MockMetrics,
    };

    const GT: GraphType = GraphType::Workload;

    #[tokio::test]
    async fn test_removes_node_without_workload() {
        let global = global_info(
            MockMetrics::new(),
            MockInventory::new().with_workload(workload("bookinfo", "productpage-v1", "productpage", "v1")),
        );
        let mut tm: TrafficMap = vec![
            workload_node("bookinfo", "productpage-v1", "productpage", "v1", GT),
            workload_node("bookinfo", "reviews-v1", "reviews", "v1", GT),
        ]
        .into_iter()
        .collect();
        // an edge without traffic leaves reviews-v1 at zero
        tm.get_mut("wl_east_bookinfo_productpage-v1")
            .unwrap()
            .find_or_add_edge("wl_east_bookinfo_reviews-v1", Protocol::Http);

        DeadNodeAppender::default().append_graph(&mut tm, &global).await.unwrap();

        assert_eq!(tm.len(), 1);
        assert!(tm["wl_east_bookinfo_productpage-v1"].edges.is_empty());
        assert!(!tm["wl_east_bookinfo_productpage-v1"].metadata.is_dead);
    }

    #[tokio::test]
    async fn test_flags_workload_without_pods() {
        let mut scaled_down = workload("bookinfo", "ratings-v1", "ratings", "v1");
        scaled_down.pod_count = 0;
        let global = global_info(MockMetrics::new(), MockInventory::new().with_workload(scaled_down));
        let mut tm: TrafficMap = vec![workload_node("bookinfo", "ratings-v1", "ratings", "v1", GT)]
            .into_iter()
            .collect();
        DeadNodeAppender::default().append_graph(&mut tm, &global).await.unwrap();
        assert!(tm["wl_east_bookinfo_ratings-v1"].metadata.is_dead);
    }

    #[tokio::test]
    async fn test_services_kept_and_cascade() {
        let global = global_info(MockMetrics::new(), MockInventory::new());
        let mut external = service_node("bookinfo", "api.example.com", GT);
        external.metadata.is_service_entry = Some(SeInfo {
            hosts: vec!["api.example.com".to_string()],
            location: MESH_EXTERNAL.to_string(),
            namespace: "bookinfo".to_string(),
        });
        let mut tm: TrafficMap = vec![
            external,
            service_node("istio-system", "PassthroughCluster", GT),
            service_node("bookinfo", "reviews", GT),
            workload_node("bookinfo", "reviews-v1", "reviews", "v1", GT),
        ]
        .into_iter()
        .collect();
        // reviews only leads to a workload that is gone, so it goes on the second pass
        tm.get_mut("svc_east_bookinfo_reviews")
            .unwrap()
            .find_or_add_edge("wl_east_bookinfo_reviews-v1", Protocol::Http);

        DeadNodeAppender::default().append_graph(&mut tm, &global).await.unwrap();

        let ids: Vec<&str> = tm.keys().map(String::as_str).collect();
        assert_eq!(
            ids,
            vec!["svc_east_bookinfo_api.example.com", "svc_east_istio-system_PassthroughCluster"]
        );
    }

    #[tokio::test]
    async fn test_remote_cluster_untouched() {
        let global = global_info(MockMetrics::new(), MockInventory::new());
        let remote = Node::new("west", "bookinfo", "", "bookinfo", "reviews-v2", "reviews", "v2", GT).unwrap();
        let mut tm: TrafficMap = vec![remote].into_iter().collect();
        DeadNodeAppender::default().append_graph(&mut tm, &global).await.unwrap();
        assert_eq!(tm.len(), 1);
    }

    fn arbitrary_graph() -> impl Strategy<Value = (Vec<(bool, bool, u8)>, Vec<(usize, usize)>)> {
        // per node: has traffic, has a workload, pod count
        (1usize..8).prop_flat_map(|n| {
            (
                prop::collection::vec((any::<bool>(), any::<bool>(), 0u8..2), n),
                prop::collection::vec((0..n, 0..n), 0..12),
            )
        })
    }

    proptest! {
        #[test]
        fn test_removal_is_a_fixpoint((nodes, edges) in arbitrary_graph()) {
            let mut inventory = MockInventory::new();
            let mut tm = TrafficMap::new();
            for (i, (traffic, exists, pods)) in nodes.iter().enumerate() {
                let name = format!("wl-{}", i);
                tm.insert_node(workload_node("ns", &name, "", "", GT));
                if *exists {
                    let mut w = workload("ns", &name, "", "");
                    w.pod_count = *pods as usize;
                    inventory = inventory.with_workload(w);
                }
                if *traffic {
                    let id = format!("wl_east_ns_{}", name);
                    connect(&mut tm, &id, &id, Protocol::Tcp, 1.0);
                }
            }
            for (from, to) in edges {
                let source = format!("wl_east_ns_wl-{}", from);
                let dest = format!("wl_east_ns_wl-{}", to);
                tm.get_mut(&source).unwrap().find_or_add_edge(&dest, Protocol::Http);
            }

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let global = global_info(MockMetrics::new(), inventory);
            let appender = DeadNodeAppender::default();
            rt.block_on(appender.append_graph(&mut tm, &global)).unwrap();
            let once = tm.clone();
            rt.block_on(appender.append_graph(&mut tm, &global)).unwrap();
            prop_assert_eq!(once, tm);
        }
    }
}
