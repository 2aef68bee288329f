use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{HealthKind, IstioConfigList, ServiceOverview, WorkloadListItem};

/// Identifies a workload across clusters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
}

impl NodeKey {
    pub fn new(cluster: &str, namespace: &str, name: &str) -> Self {
        NodeKey {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// Read-only view of the mesh inventory.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Clusters on which the namespace exists.
    async fn namespace_clusters(&self, namespace: &str) -> anyhow::Result<Vec<String>>;

    async fn workload_list(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> anyhow::Result<Vec<WorkloadListItem>>;

    async fn service_list(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> anyhow::Result<Vec<ServiceOverview>>;

    async fn istio_config(&self, cluster: &str, namespace: &str)
        -> anyhow::Result<IstioConfigList>;

    /// Every waypoint proxy workload in the mesh.
    async fn waypoints(&self) -> anyhow::Result<Vec<NodeKey>>;

    /// Health payloads for every entity of `kind` in the namespace, by entity name.
    async fn namespace_health(
        &self,
        namespace: &str,
        kind: HealthKind,
        duration: Duration,
        query_time: DateTime<Utc>,
    ) -> anyhow::Result<BTreeMap<String, serde_json::Value>>;
}
