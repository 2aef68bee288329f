use super::GlobalInfo;
use crate::error::Result;
use crate::graph::{is_ok, Node, NodeType, SeInfo, TrafficMap};
use crate::models::{ServiceEntry, MESH_EXTERNAL, MESH_INTERNAL};
use crate::payloads::{AccessibleNamespace, AccessibleNamespaces, NamespaceInfo};

pub const NAME: &str = "serviceEntry";

/// Tags terminal service nodes that resolve to a ServiceEntry host, so they are kept as
/// registered destinations rather than removed as dead.
#[derive(Debug, Clone, Default)]
pub struct ServiceEntryAppender {
    pub accessible_namespaces: AccessibleNamespaces,
}

fn is_candidate(node: &Node) -> bool {
    node.node_type == NodeType::Service
        && node.edges.is_empty()
        && !node.metadata.is_egress_cluster
        && node.metadata.is_service_entry.is_none()
        && is_ok(&node.cluster)
        && is_ok(&node.namespace)
}

fn is_exported_to(entry: &ServiceEntry, namespace: &str) -> bool {
    match &entry.export_to {
        None => true,
        Some(targets) => targets.iter().any(|target| {
            target == "*"
                || (target == "." && entry.namespace == namespace)
                || target == namespace
        }),
    }
}

/// Whether `host` of the entry names `service`: exactly, or by its first label for mesh
/// internal entries. Multicluster `<svc>.<ns>.<suffix>` hosts only match exactly.
fn host_names_service(entry: &ServiceEntry, host: &str, service: &str, multicluster_suffix: &str) -> bool {
    if host == service {
        return true;
    }
    if entry.location != MESH_INTERNAL {
        return false;
    }
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() == 3 && parts[2] == multicluster_suffix {
        return false;
    }
    parts[0] == service
}

impl ServiceEntryAppender {
    pub async fn append_graph(
        &self,
        traffic_map: &mut TrafficMap,
        global: &GlobalInfo,
        namespace: &NamespaceInfo,
    ) -> Result<()> {
        let candidates: Vec<String> = traffic_map
            .values()
            .filter(|n| is_candidate(n))
            .map(|n| n.id.clone())
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        tracing::trace!(namespace = %namespace.name, candidates = candidates.len(), "checking service entries");

        for id in candidates {
            let (cluster, node_ns, service) = match traffic_map.get(&id) {
                Some(n) => (n.cluster.clone(), n.namespace.clone(), n.service.clone()),
                None => continue,
            };
            let info = self.find(&cluster, &node_ns, &service, global).await?;
            if let (Some(info), Some(node)) = (info, traffic_map.get_mut(&id)) {
                node.metadata.is_service_entry = Some(info);
            }
        }
        Ok(())
    }

    fn namespaces_on<'a>(&'a self, cluster: &'a str) -> impl Iterator<Item = &'a AccessibleNamespace> + 'a {
        self.accessible_namespaces
            .values()
            .filter(move |ns| ns.cluster == cluster)
    }

    async fn find(
        &self,
        cluster: &str,
        namespace: &str,
        service: &str,
        global: &GlobalInfo,
    ) -> Result<Option<SeInfo>> {
        for accessible in self.namespaces_on(cluster) {
            let config = global.istio_config(cluster, &accessible.name).await?;
            for entry in &config.service_entries {
                if !is_exported_to(entry, namespace) {
                    continue;
                }
                let matched = entry.hosts.iter().any(|host| {
                    host_names_service(entry, host, service, &global.conf.multicluster_host_suffix)
                });
                if matched {
                    let location = if entry.location == MESH_INTERNAL {
                        MESH_INTERNAL
                    } else {
                        MESH_EXTERNAL
                    };
                    return Ok(Some(SeInfo {
                        hosts: entry.hosts.clone(),
                        location: location.to_string(),
                        namespace: entry.namespace.clone(),
                    }));
                }
            }
        }
        Ok(None)
    }
}
