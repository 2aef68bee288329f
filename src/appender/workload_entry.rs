use super::GlobalInfo;
use crate::error::Result;
use crate::graph::{is_ok, NodeType, TrafficMap, WeInfo};
use crate::payloads::{AccessibleNamespaces, NamespaceInfo};

pub const NAME: &str = "workloadEntry";

/// Flags workload nodes of the namespace that are backed by WorkloadEntries, matched on the
/// app and version labels of the entry.
#[derive(Debug, Clone, Default)]
pub struct WorkloadEntryAppender {
    pub accessible_namespaces: AccessibleNamespaces,
}

impl WorkloadEntryAppender {
    pub async fn append_graph(
        &self,
        traffic_map: &mut TrafficMap,
        global: &GlobalInfo,
        namespace: &NamespaceInfo,
    ) -> Result<()> {
        if traffic_map.is_empty() {
            return Ok(());
        }
        let clusters: Vec<String> = self
            .accessible_namespaces
            .values()
            .filter(|ns| ns.name == namespace.name)
            .map(|ns| ns.cluster.clone())
            .collect();

        for cluster in clusters {
            let config = global.istio_config(&cluster, &namespace.name).await?;
            if config.workload_entries.is_empty() {
                continue;
            }
            for node in traffic_map.values_mut() {
                if node.cluster != cluster
                    || node.namespace != namespace.name
                    || !matches!(node.node_type, NodeType::Workload | NodeType::App)
                    || !is_ok(&node.workload)
                {
                    continue;
                }
                let entries: Vec<WeInfo> = config
                    .workload_entries
                    .iter()
                    .filter(|entry| {
                        global.conf.app_label(&entry.labels) == Some(node.app.as_str())
                            && global.conf.version_label(&entry.labels) == Some(node.version.as_str())
                    })
                    .map(|entry| WeInfo {
                        name: entry.name.clone(),
                    })
                    .collect();
                if !entries.is_empty() {
                    tracing::trace!(node = %node.id, entries = entries.len(), "workload entries found");
                    node.metadata.has_workload_entry = Some(entries);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::graph::{GraphType, Node, Protocol};
    use crate::models::{IstioConfigList, WorkloadEntry};
    use crate::payloads::{cluster_sensitive_key, AccessibleNamespace};
    use crate::testing::{global_info, service_node, workload_node, MockInventory, MockMetrics, CLUSTER};

    const GT: GraphType = GraphType::VersionedApp;

    fn entry(name: &str, app: &str, version: &str) -> WorkloadEntry {
        let labels: BTreeMap<String, String> = [("app", app), ("version", version)]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkloadEntry {
            name: name.to_string(),
            namespace: "bookinfo".to_string(),
            labels,
        }
    }

    fn traffic() -> TrafficMap {
        let outsider = Node::new(CLUSTER, "outsider", "outsider", "outsider", "outsider-v1", "outsider", "v1", GT).unwrap();
        let mut tm: TrafficMap = vec![
            service_node("bookinfo", "ratings", GT),
            workload_node("bookinfo", "ratings-v1", "ratings", "v1", GT),
            workload_node("bookinfo", "ratings-v2", "ratings", "v2", GT),
            workload_node("bookinfo", "ratings-v3", "ratings", "v3", GT),
            outsider,
        ]
        .into_iter()
        .collect();
        let ids: Vec<String> = tm.keys().filter(|id| id.starts_with("vapp_")).cloned().collect();
        let svc = tm.get_mut("svc_east_bookinfo_ratings").unwrap();
        for id in ids {
            svc.find_or_add_edge(&id, Protocol::Http);
        }
        tm
    }

    fn appender() -> WorkloadEntryAppender {
        WorkloadEntryAppender {
            accessible_namespaces: [(
                cluster_sensitive_key(CLUSTER, "bookinfo"),
                AccessibleNamespace {
                    cluster: CLUSTER.to_string(),
                    name: "bookinfo".to_string(),
                    creation_timestamp: None,
                },
            )]
            .into_iter()
            .collect(),
        }
    }

    async fn run(entries: Vec<WorkloadEntry>) -> TrafficMap {
        let config = IstioConfigList {
            workload_entries: entries,
            ..IstioConfigList::default()
        };
        let global = global_info(
            MockMetrics::new(),
            MockInventory::new().with_istio_config("bookinfo", config),
        );
        let mut tm = traffic();
        let ns = NamespaceInfo::new("bookinfo", Duration::from_secs(60));
        appender().append_graph(&mut tm, &global, &ns).await.unwrap();
        tm
    }

    #[tokio::test]
    async fn test_matching_entries() {
        let tm = run(vec![
            entry("workloadA", "ratings", "v1"),
            entry("workloadB", "ratings", "v2"),
            entry("workloadC", "ratings", "v2"),
        ])
        .await;
        assert_eq!(tm.len(), 5);
        assert_eq!(tm["svc_east_bookinfo_ratings"].edges.len(), 4);

        let names = |id: &str| -> Option<Vec<String>> {
            tm[id]
                .metadata
                .has_workload_entry
                .as_ref()
                .map(|v| v.iter().map(|we| we.name.clone()).collect())
        };
        assert_eq!(names("vapp_east_bookinfo_ratings-v1"), Some(vec!["workloadA".to_string()]));
        assert_eq!(
            names("vapp_east_bookinfo_ratings-v2"),
            Some(vec!["workloadB".to_string(), "workloadC".to_string()])
        );
        assert_eq!(names("vapp_east_bookinfo_ratings-v3"), None);
        assert_eq!(names("vapp_east_outsider_outsider-v1"), None);
    }

    #[tokio::test]
    async fn test_app_label_not_matching() {
        let tm = run(vec![
            entry("workloadA", "pastamaker", "v1"),
            entry("workloadB", "pastamaker", "v2"),
        ])
        .await;
        assert!(tm.values().all(|n| n.metadata.has_workload_entry.is_none()));
    }
}
