use super::GlobalInfo;
use crate::error::Result;
use crate::graph::{is_ok, is_ok_version, Node, NodeType, TrafficMap};
use crate::models::WorkloadListItem;
use crate::payloads::{cluster_sensitive_key, AccessibleNamespaces, NamespaceInfo};

pub const NAME: &str = "meshCheck";

/// Accepted as an alias of [`NAME`].
pub const SIDECARS_CHECK_NAME: &str = "sidecarsCheck";

/// Flags workload and app nodes of the namespace backed by workloads outside the mesh: no
/// sidecar, not ambient captured and not a mesh proxy.
#[derive(Debug, Clone, Default)]
pub struct MeshCheckAppender {
    pub accessible_namespaces: AccessibleNamespaces,
}

impl MeshCheckAppender {
    pub async fn append_graph(
        &self,
        traffic_map: &mut TrafficMap,
        global: &GlobalInfo,
        namespace: &NamespaceInfo,
    ) -> Result<()> {
        if traffic_map.is_empty() || global.conf.is_istio_namespace(&namespace.name) {
            return Ok(());
        }

        let mut out_of_mesh = Vec::new();
        for node in traffic_map.values() {
            if !self.is_checked(node, &namespace.name) {
                continue;
            }
            let workloads = self.backing_workloads(node, global).await?;
            if workloads.iter().any(|w| !w.is_in_mesh()) {
                out_of_mesh.push(node.id.clone());
            }
        }
        for id in out_of_mesh {
            if let Some(node) = traffic_map.get_mut(&id) {
                tracing::trace!(node = %id, "out of mesh");
                node.metadata.is_out_of_mesh = true;
            }
        }
        Ok(())
    }

    fn is_checked(&self, node: &Node, namespace: &str) -> bool {
        node.namespace == namespace
            && matches!(node.node_type, NodeType::Workload | NodeType::App)
            && !node.metadata.is_dead
            && self
                .accessible_namespaces
                .contains_key(&cluster_sensitive_key(&node.cluster, &node.namespace))
    }

    async fn backing_workloads(&self, node: &Node, global: &GlobalInfo) -> Result<Vec<WorkloadListItem>> {
        if is_ok(&node.workload) {
            return Ok(global
                .workload(&node.cluster, &node.namespace, &node.workload)
                .await?
                .into_iter()
                .collect());
        }
        if !is_ok(&node.app) {
            return Ok(Vec::new());
        }
        let version = Some(node.version.as_str()).filter(|v| is_ok_version(v));
        global
            .app_workloads(&node.cluster, &node.namespace, &node.app, version)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::graph::GraphType;
    use crate::payloads::AccessibleNamespace;
    use crate::testing::{global_info, service_node, workload, workload_node, MockInventory, MockMetrics, CLUSTER};

    fn accessible() -> AccessibleNamespaces {
        [(
            cluster_sensitive_key(CLUSTER, "bookinfo"),
            AccessibleNamespace {
                cluster: CLUSTER.to_string(),
                name: "bookinfo".to_string(),
                creation_timestamp: None,
            },
        )]
        .into_iter()
        .collect()
    }

    async fn run(tm: &mut TrafficMap, inventory: MockInventory, accessible_namespaces: AccessibleNamespaces) {
        let global = global_info(MockMetrics::new(), inventory);
        let ns = NamespaceInfo::new("bookinfo", Duration::from_secs(60));
        MeshCheckAppender {
            accessible_namespaces,
        }
        .append_graph(tm, &global, &ns)
        .await
        .unwrap();
    }

    fn sidecarless(name: &str, app: &str, version: &str) -> WorkloadListItem {
        let mut w = workload("bookinfo", name, app, version);
        w.istio_sidecar = false;
        w
    }

    #[tokio::test]
    async fn test_workload_checks() {
        let gt = GraphType::Workload;
        let mut tm: TrafficMap = vec![
            workload_node("bookinfo", "meshed-v1", "meshed", "v1", gt),
            workload_node("bookinfo", "plain-v1", "plain", "v1", gt),
            service_node("bookinfo", "plain", gt),
        ]
        .into_iter()
        .collect();
        let mut ambient = sidecarless("meshed-v1", "meshed", "v1");
        ambient.is_ambient = true;
        let inventory = MockInventory::new()
            .with_workload(ambient)
            .with_workload(sidecarless("plain-v1", "plain", "v1"));
        run(&mut tm, inventory, accessible()).await;

        assert!(!tm["wl_east_bookinfo_meshed-v1"].metadata.is_out_of_mesh);
        assert!(tm["wl_east_bookinfo_plain-v1"].metadata.is_out_of_mesh);
        assert!(!tm["svc_east_bookinfo_plain"].metadata.is_out_of_mesh);
    }

    #[tokio::test]
    async fn test_app_checks_and_inaccessible() {
        let gt = GraphType::App;
        let mut tm: TrafficMap = vec![workload_node("bookinfo", "", "reviews", "", gt)]
            .into_iter()
            .collect();

        // no pods behind the app
        run(&mut tm, MockInventory::new(), accessible()).await;
        assert!(!tm["app_east_bookinfo_reviews"].metadata.is_out_of_mesh);

        let inventory = || {
            MockInventory::new()
                .with_workload(workload("bookinfo", "reviews-v1", "reviews", "v1"))
                .with_workload(sidecarless("reviews-v2", "reviews", "v2"))
        };
        run(&mut tm, inventory(), AccessibleNamespaces::new()).await;
        assert!(!tm["app_east_bookinfo_reviews"].metadata.is_out_of_mesh);

        run(&mut tm, inventory(), accessible()).await;
        assert!(tm["app_east_bookinfo_reviews"].metadata.is_out_of_mesh);
    }
}
