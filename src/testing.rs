use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::appender::GlobalInfo;
use crate::business::{Inventory, NodeKey};
use crate::config::Config;
use crate::graph::{
    add_outgoing_edge_to_metadata, add_to_metadata, EdgeMetadata, GraphType, Node, Protocol,
    TrafficMap,
};
use crate::models::{
    HealthKind, IstioConfigList, ServiceOverview, WorkloadListItem,
};
use crate::prometheus::{MetricsClient, QueryResult, Sample, Vector};

pub const CLUSTER: &str = "east";

pub fn query_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn sample(labels: &[(&str, &str)], value: f64) -> Sample {
    Sample {
        metric: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        value,
    }
}

/// One end of a series: (namespace, workload, app, version).
pub type Peer<'a> = (&'a str, &'a str, &'a str, &'a str);

/// Labels of a series from `source` to `dest` through the service `dest_service`, all on
/// [`CLUSTER`].
pub fn traffic_labels(source: Peer, dest_service: &str, dest: Peer) -> Vec<(String, String)> {
    let (src_ns, src_wl, src_app, src_ver) = source;
    let (dst_ns, dst_wl, dst_app, dst_ver) = dest;
    let host = if dest_service == crate::graph::UNKNOWN {
        dest_service.to_string()
    } else {
        format!("{}.{}.svc.cluster.local", dest_service, dst_ns)
    };
    [
        ("source_cluster", CLUSTER),
        ("source_workload_namespace", src_ns),
        ("source_workload", src_wl),
        ("source_canonical_service", src_app),
        ("source_canonical_revision", src_ver),
        ("destination_cluster", CLUSTER),
        ("destination_service_namespace", dst_ns),
        ("destination_service", host.as_str()),
        ("destination_service_name", dest_service),
        ("destination_workload_namespace", dst_ns),
        ("destination_workload", dst_wl),
        ("destination_canonical_service", dst_app),
        ("destination_canonical_revision", dst_ver),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// A request series as the builder queries it.
pub fn request(
    source: Peer,
    dest_service: &str,
    dest: Peer,
    protocol: &str,
    code: &str,
    value: f64,
) -> Sample {
    let mut metric: BTreeMap<String, String> =
        traffic_labels(source, dest_service, dest).into_iter().collect();
    metric.insert("request_protocol".to_string(), protocol.to_string());
    metric.insert("response_code".to_string(), code.to_string());
    metric.insert("response_flags".to_string(), "-".to_string());
    Sample { metric, value }
}

/// A series with extra labels on top of [`traffic_labels`].
pub fn labelled(
    source: Peer,
    dest_service: &str,
    dest: Peer,
    extra: &[(&str, &str)],
    value: f64,
) -> Sample {
    let mut metric: BTreeMap<String, String> =
        traffic_labels(source, dest_service, dest).into_iter().collect();
    for (k, v) in extra {
        metric.insert(k.to_string(), v.to_string());
    }
    Sample { metric, value }
}

/// Metrics backend answering canned vectors. A query is answered by the first responder whose
/// fragments all occur in it; unmatched queries return nothing.
#[derive(Default)]
pub struct MockMetrics {
    responders: Vec<(Vec<String>, Vector)>,
    queries: Mutex<Vec<String>>,
    failure: Option<String>,
}

impl MockMetrics {
    pub fn new() -> Self {
        MockMetrics::default()
    }

    pub fn failing(message: &str) -> Self {
        MockMetrics {
            failure: Some(message.to_string()),
            ..MockMetrics::default()
        }
    }

    pub fn on(mut self, fragments: &[&str], vector: Vector) -> Self {
        self.responders.push((
            fragments.iter().map(|f| f.to_string()).collect(),
            vector,
        ));
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl MetricsClient for MockMetrics {
    async fn query(&self, query: &str, _eval_time: DateTime<Utc>) -> anyhow::Result<QueryResult> {
        self.queries.lock().push(query.to_string());
        if let Some(message) = &self.failure {
            anyhow::bail!("{}", message);
        }
        let vector = self
            .responders
            .iter()
            .find(|(fragments, _)| fragments.iter().all(|f| query.contains(f.as_str())))
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        Ok(QueryResult {
            vector,
            warnings: Vec::new(),
        })
    }
}

/// A meshed workload with one running pod.
pub fn workload(namespace: &str, name: &str, app: &str, version: &str) -> WorkloadListItem {
    let mut labels = BTreeMap::new();
    if !app.is_empty() {
        labels.insert("app".to_string(), app.to_string());
    }
    if !version.is_empty() {
        labels.insert("version".to_string(), version.to_string());
    }
    WorkloadListItem {
        name: name.to_string(),
        namespace: namespace.to_string(),
        cluster: CLUSTER.to_string(),
        labels,
        istio_sidecar: true,
        pod_count: 1,
        ..WorkloadListItem::default()
    }
}

pub fn service(namespace: &str, name: &str) -> ServiceOverview {
    ServiceOverview {
        name: name.to_string(),
        namespace: namespace.to_string(),
        cluster: CLUSTER.to_string(),
        labels: [("app".to_string(), name.to_string())].into_iter().collect(),
        selector: [("app".to_string(), name.to_string())].into_iter().collect(),
        ..ServiceOverview::default()
    }
}

#[derive(Default)]
pub struct MockInventory {
    workloads: Vec<WorkloadListItem>,
    services: Vec<ServiceOverview>,
    istio: BTreeMap<(String, String), IstioConfigList>,
    waypoints: Vec<NodeKey>,
    health: BTreeMap<(String, HealthKind), BTreeMap<String, serde_json::Value>>,
    health_delay: Option<Duration>,
    failure: Option<String>,
    health_failure: Option<String>,
    workload_list_calls: AtomicUsize,
    health_calls: AtomicUsize,
}

impl MockInventory {
    pub fn new() -> Self {
        MockInventory::default()
    }

    pub fn failing(message: &str) -> Self {
        MockInventory {
            failure: Some(message.to_string()),
            ..MockInventory::default()
        }
    }

    pub fn with_workload(mut self, workload: WorkloadListItem) -> Self {
        self.workloads.push(workload);
        self
    }

    pub fn with_service(mut self, service: ServiceOverview) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_istio_config(mut self, namespace: &str, config: IstioConfigList) -> Self {
        self.istio
            .insert((CLUSTER.to_string(), namespace.to_string()), config);
        self
    }

    pub fn with_waypoint(mut self, namespace: &str, name: &str) -> Self {
        self.waypoints.push(NodeKey::new(CLUSTER, namespace, name));
        self
    }

    pub fn with_health(
        mut self,
        namespace: &str,
        kind: HealthKind,
        name: &str,
        value: serde_json::Value,
    ) -> Self {
        self.health
            .entry((namespace.to_string(), kind))
            .or_default()
            .insert(name.to_string(), value);
        self
    }

    pub fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = Some(delay);
        self
    }

    pub fn with_health_failure(mut self, message: &str) -> Self {
        self.health_failure = Some(message.to_string());
        self
    }

    pub fn workload_list_calls(&self) -> usize {
        self.workload_list_calls.load(Ordering::SeqCst)
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> anyhow::Result<()> {
        match &self.failure {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Inventory for MockInventory {
    async fn namespace_clusters(&self, namespace: &str) -> anyhow::Result<Vec<String>> {
        self.check()?;
        let mut clusters: Vec<String> = self
            .workloads
            .iter()
            .filter(|w| w.namespace == namespace)
            .map(|w| w.cluster.clone())
            .chain(
                self.services
                    .iter()
                    .filter(|s| s.namespace == namespace)
                    .map(|s| s.cluster.clone()),
            )
            .collect();
        clusters.sort();
        clusters.dedup();
        if clusters.is_empty() {
            clusters.push(CLUSTER.to_string());
        }
        Ok(clusters)
    }

    async fn workload_list(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> anyhow::Result<Vec<WorkloadListItem>> {
        self.check()?;
        self.workload_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .workloads
            .iter()
            .filter(|w| w.cluster == cluster && w.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn service_list(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> anyhow::Result<Vec<ServiceOverview>> {
        self.check()?;
        Ok(self
            .services
            .iter()
            .filter(|s| s.cluster == cluster && s.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn istio_config(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> anyhow::Result<IstioConfigList> {
        self.check()?;
        Ok(self
            .istio
            .get(&(cluster.to_string(), namespace.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn waypoints(&self) -> anyhow::Result<Vec<NodeKey>> {
        self.check()?;
        Ok(self.waypoints.clone())
    }

    async fn namespace_health(
        &self,
        namespace: &str,
        kind: HealthKind,
        _duration: Duration,
        _query_time: DateTime<Utc>,
    ) -> anyhow::Result<BTreeMap<String, serde_json::Value>> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.health_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.health_failure {
            anyhow::bail!("{}", message);
        }
        Ok(self
            .health
            .get(&(namespace.to_string(), kind))
            .cloned()
            .unwrap_or_default())
    }
}

pub fn global_info(metrics: MockMetrics, inventory: MockInventory) -> GlobalInfo {
    global_with(Arc::new(metrics), Arc::new(inventory))
}

/// Like [`global_info`], keeping handles on the mocks for inspection.
pub fn global_with(metrics: Arc<MockMetrics>, inventory: Arc<MockInventory>) -> GlobalInfo {
    GlobalInfo::new(
        Arc::new(Config {
            home_cluster: CLUSTER.to_string(),
            ..Config::default()
        }),
        metrics,
        inventory,
    )
}

pub fn workload_node(namespace: &str, name: &str, app: &str, version: &str, graph_type: GraphType) -> Node {
    Node::new(CLUSTER, namespace, "", namespace, name, app, version, graph_type).unwrap()
}

pub fn service_node(namespace: &str, name: &str, graph_type: GraphType) -> Node {
    Node::new(CLUSTER, namespace, name, "", "", "", "", graph_type).unwrap()
}

/// Adds an edge carrying `value` of `protocol` traffic between two nodes of the map.
pub fn connect(traffic_map: &mut TrafficMap, source: &str, dest: &str, protocol: Protocol, value: f64) {
    let mut edge = EdgeMetadata::default();
    edge.protocol = Some(protocol);
    let code = if protocol == Protocol::Grpc { "0" } else { "200" };
    {
        let dest_node = traffic_map.get_mut(dest).unwrap();
        add_to_metadata(protocol, value, code, "-", "", None, Some(&mut dest_node.metadata), &mut edge);
    }
    let source_node = traffic_map.get_mut(source).unwrap();
    add_outgoing_edge_to_metadata(&mut source_node.metadata, &edge);
    source_node.find_or_add_edge(dest, protocol).metadata = edge;
}
