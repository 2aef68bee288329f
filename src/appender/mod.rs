//! Graph transformation passes run over a namespace traffic map, or once over the merged map.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::business::{Inventory, NodeKey};
use crate::config::Config;
use crate::error::{GraphError, Result};
use crate::graph::{is_ok, TrafficMap};
use crate::models::{IstioConfigList, ServiceOverview, WorkloadListItem};
use crate::payloads::{cluster_sensitive_key, NamespaceInfo};
use crate::prometheus::MetricsClient;

pub mod aggregate_node;
pub mod ambient;
pub mod dead_node;
pub mod health;
pub mod idle_node;
pub mod istio_details;
pub mod labeler;
pub mod mesh_check;
pub mod outsider;
pub mod response_time;
pub mod security_policy;
pub mod service_entry;
pub mod throughput;
pub mod traffic_generator;
pub mod workload_entry;

pub use aggregate_node::AggregateNodeAppender;
pub use ambient::AmbientAppender;
pub use dead_node::DeadNodeAppender;
pub use health::HealthAppender;
pub use idle_node::IdleNodeAppender;
pub use istio_details::IstioAppender;
pub use labeler::LabelerAppender;
pub use mesh_check::MeshCheckAppender;
pub use outsider::OutsiderAppender;
pub use response_time::ResponseTimeAppender;
pub use security_policy::SecurityPolicyAppender;
pub use service_entry::ServiceEntryAppender;
pub use throughput::ThroughputAppender;
pub use traffic_generator::TrafficGeneratorAppender;
pub use workload_entry::WorkloadEntryAppender;

type Cache<T> = Mutex<HashMap<String, Arc<T>>>;

/// Inventory lookups shared by every appender of one request. Each list is fetched once.
#[derive(Default)]
pub struct IstioInfo {
    namespace_clusters: Cache<Vec<String>>,
    workload_lists: Cache<Vec<WorkloadListItem>>,
    service_lists: Cache<Vec<ServiceOverview>>,
    istio_configs: Cache<IstioConfigList>,
    waypoints: Mutex<Option<Arc<BTreeSet<NodeKey>>>>,
}

async fn cached<T, F, Fut>(cache: &Cache<T>, key: String, fetch: F) -> Result<Arc<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let hit = cache.lock().get(&key).cloned();
    if let Some(hit) = hit {
        return Ok(hit);
    }
    let value = Arc::new(fetch().await?);
    Ok(cache.lock().entry(key).or_insert(value).clone())
}

/// Request scoped state handed to every appender.
pub struct GlobalInfo {
    pub conf: Arc<Config>,
    pub prom: Arc<dyn MetricsClient>,
    pub business: Arc<dyn Inventory>,
    pub vendor: IstioInfo,
}

impl GlobalInfo {
    pub fn new(
        conf: Arc<Config>,
        prom: Arc<dyn MetricsClient>,
        business: Arc<dyn Inventory>,
    ) -> Self {
        GlobalInfo {
            conf,
            prom,
            business,
            vendor: IstioInfo::default(),
        }
    }

    pub async fn namespace_clusters(&self, namespace: &str) -> Result<Arc<Vec<String>>> {
        cached(&self.vendor.namespace_clusters, namespace.to_string(), || {
            self.business.namespace_clusters(namespace)
        })
        .await
    }

    pub async fn workload_list(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Arc<Vec<WorkloadListItem>>> {
        cached(
            &self.vendor.workload_lists,
            cluster_sensitive_key(cluster, namespace),
            || self.business.workload_list(cluster, namespace),
        )
        .await
    }

    pub async fn service_list(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Arc<Vec<ServiceOverview>>> {
        cached(
            &self.vendor.service_lists,
            cluster_sensitive_key(cluster, namespace),
            || self.business.service_list(cluster, namespace),
        )
        .await
    }

    pub async fn istio_config(&self, cluster: &str, namespace: &str) -> Result<Arc<IstioConfigList>> {
        cached(
            &self.vendor.istio_configs,
            cluster_sensitive_key(cluster, namespace),
            || self.business.istio_config(cluster, namespace),
        )
        .await
    }

    /// The named workload, if it exists.
    pub async fn workload(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadListItem>> {
        if !is_ok(name) {
            return Ok(None);
        }
        let list = self.workload_list(cluster, namespace).await?;
        Ok(list.iter().find(|w| w.name == name).cloned())
    }

    /// Workloads labelled with the app, and with the version when one is given.
    pub async fn app_workloads(
        &self,
        cluster: &str,
        namespace: &str,
        app: &str,
        version: Option<&str>,
    ) -> Result<Vec<WorkloadListItem>> {
        let list = self.workload_list(cluster, namespace).await?;
        Ok(list
            .iter()
            .filter(|w| self.conf.app_label(&w.labels) == Some(app))
            .filter(|w| match version {
                Some(version) => self.conf.version_label(&w.labels) == Some(version),
                None => true,
            })
            .cloned()
            .collect())
    }

    pub async fn service_definition(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceOverview>> {
        let list = self.service_list(cluster, namespace).await?;
        Ok(list.iter().find(|s| s.name == name).cloned())
    }

    pub async fn waypoints(&self) -> Result<Arc<BTreeSet<NodeKey>>> {
        let hit = self.vendor.waypoints.lock().clone();
        if let Some(hit) = hit {
            return Ok(hit);
        }
        let fetched: BTreeSet<NodeKey> = self.business.waypoints().await?.into_iter().collect();
        let fetched = Arc::new(fetched);
        Ok(self
            .vendor
            .waypoints
            .lock()
            .get_or_insert(fetched)
            .clone())
    }

    pub async fn is_waypoint(&self, cluster: &str, namespace: &str, workload: &str) -> Result<bool> {
        Ok(self
            .waypoints()
            .await?
            .contains(&NodeKey::new(cluster, namespace, workload)))
    }
}

/// Values an annotating appender computed against a read-only map, applied afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Annotations {
    ResponseTime(response_time::ResponseTimes),
    SecurityPolicy(security_policy::SecurityPolicies),
    Throughput(throughput::Throughputs),
}

impl Annotations {
    pub fn apply(self, traffic_map: &mut TrafficMap) {
        match self {
            Annotations::ResponseTime(times) => times.apply(traffic_map),
            Annotations::SecurityPolicy(policies) => policies.apply(traffic_map),
            Annotations::Throughput(throughputs) => throughputs.apply(traffic_map),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Appender {
    ServiceEntry(ServiceEntryAppender),
    DeadNode(DeadNodeAppender),
    WorkloadEntry(WorkloadEntryAppender),
    ResponseTime(ResponseTimeAppender),
    SecurityPolicy(SecurityPolicyAppender),
    Throughput(ThroughputAppender),
    AggregateNode(AggregateNodeAppender),
    IdleNode(IdleNodeAppender),
    MeshCheck(MeshCheckAppender),
    Outsider(OutsiderAppender),
    Istio(IstioAppender),
    Ambient(AmbientAppender),
    Health(HealthAppender),
    Labeler(LabelerAppender),
    TrafficGenerator(TrafficGeneratorAppender),
}

impl Appender {
    pub fn name(&self) -> &'static str {
        match self {
            Appender::ServiceEntry(_) => service_entry::NAME,
            Appender::DeadNode(_) => dead_node::NAME,
            Appender::WorkloadEntry(_) => workload_entry::NAME,
            Appender::ResponseTime(_) => response_time::NAME,
            Appender::SecurityPolicy(_) => security_policy::NAME,
            Appender::Throughput(_) => throughput::NAME,
            Appender::AggregateNode(_) => aggregate_node::NAME,
            Appender::IdleNode(_) => idle_node::NAME,
            Appender::MeshCheck(_) => mesh_check::NAME,
            Appender::Outsider(_) => outsider::NAME,
            Appender::Istio(_) => istio_details::NAME,
            Appender::Ambient(_) => ambient::NAME,
            Appender::Health(_) => health::NAME,
            Appender::Labeler(_) => labeler::NAME,
            Appender::TrafficGenerator(_) => traffic_generator::NAME,
        }
    }

    /// Finalizers run once, over the merged map of every namespace.
    pub fn is_finalizer(&self) -> bool {
        matches!(
            self,
            Appender::Outsider(_)
                | Appender::Istio(_)
                | Appender::Ambient(_)
                | Appender::Health(_)
                | Appender::Labeler(_)
                | Appender::TrafficGenerator(_)
        )
    }

    /// Concurrent appenders only annotate existing edges and may run side by side.
    pub fn is_concurrent(&self) -> bool {
        matches!(
            self,
            Appender::ResponseTime(_) | Appender::SecurityPolicy(_) | Appender::Throughput(_)
        )
    }

    /// Runs the pass. `namespace` is `None` only for finalizers.
    #[tracing::instrument(skip_all, fields(appender = self.name(), namespace = namespace.map(|n| n.name.as_str())))]
    pub async fn append_graph(
        &self,
        traffic_map: &mut TrafficMap,
        global: &GlobalInfo,
        namespace: Option<&NamespaceInfo>,
    ) -> Result<()> {
        if self.is_finalizer() {
            return match self {
                Appender::Outsider(a) => {
                    a.append_graph(traffic_map);
                    Ok(())
                }
                Appender::Istio(a) => a.append_graph(traffic_map, global).await,
                Appender::Ambient(a) => a.append_graph(traffic_map, global).await,
                Appender::Health(a) => a.append_graph(traffic_map, global).await,
                Appender::Labeler(a) => a.append_graph(traffic_map, global).await,
                Appender::TrafficGenerator(a) => {
                    a.append_graph(traffic_map);
                    Ok(())
                }
                other => Err(GraphError::Internal(format!(
                    "appender [{}] is not a finalizer",
                    other.name()
                ))),
            };
        }

        let namespace = namespace.ok_or_else(|| {
            GraphError::Internal(format!(
                "appender [{}] requires a namespace",
                self.name()
            ))
        })?;
        match self {
            Appender::ServiceEntry(a) => a.append_graph(traffic_map, global, namespace).await,
            Appender::DeadNode(a) => a.append_graph(traffic_map, global).await,
            Appender::WorkloadEntry(a) => a.append_graph(traffic_map, global, namespace).await,
            Appender::AggregateNode(a) => a.append_graph(traffic_map, global, namespace).await,
            Appender::IdleNode(a) => a.append_graph(traffic_map, global, namespace).await,
            Appender::MeshCheck(a) => a.append_graph(traffic_map, global, namespace).await,
            Appender::ResponseTime(_) | Appender::SecurityPolicy(_) | Appender::Throughput(_) => {
                let annotations = self.annotate(traffic_map, global, namespace).await?;
                annotations.apply(traffic_map);
                Ok(())
            }
            other => Err(GraphError::Internal(format!(
                "appender [{}] has no namespace pass",
                other.name()
            ))),
        }
    }

    /// Computes the annotations of a concurrent appender without touching the map.
    pub async fn annotate(
        &self,
        traffic_map: &TrafficMap,
        global: &GlobalInfo,
        namespace: &NamespaceInfo,
    ) -> Result<Annotations> {
        match self {
            Appender::ResponseTime(a) => Ok(Annotations::ResponseTime(
                a.response_times(traffic_map, global, namespace).await?,
            )),
            Appender::SecurityPolicy(a) => Ok(Annotations::SecurityPolicy(
                a.security_policies(traffic_map, global, namespace).await?,
            )),
            Appender::Throughput(a) => Ok(Annotations::Throughput(
                a.throughputs(traffic_map, global, namespace).await?,
            )),
            other => Err(GraphError::Internal(format!(
                "appender [{}] does not annotate concurrently",
                other.name()
            ))),
        }
    }
}
