use std::fmt::Write as _;
use std::time::Instant;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::graph::{is_ok, node_id, GraphType, NodeType, Protocol, PASSTHROUGH_CLUSTER, UNKNOWN};
use crate::payloads::{AmbientRate, RequestedRates};
use crate::prometheus::{MetricsClient, Sample, Vector};

lazy_static! {
    // a pod IP with optional port, e.g. 10.11.12.13:80
    static ref BAD_SERVICE_MATCHER: Regex = Regex::new(r"^\d+\.\d+\.\d+\.\d+(:\d+)?$").unwrap();
    static ref LABEL_NAME_SANITIZER: Regex = Regex::new(r"[^a-zA-Z0-9_]").unwrap();
}

/// Labels identifying both ends of one telemetry time series.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficLabels {
    pub source_cluster: String,
    pub source_cluster_ok: bool,
    pub source_wl_ns: String,
    pub source_wl: String,
    pub source_app: String,
    pub source_ver: String,
    pub dest_cluster: String,
    pub dest_cluster_ok: bool,
    pub dest_svc_ns: String,
    pub dest_svc: String,
    pub dest_svc_name: String,
    pub dest_wl_ns: String,
    pub dest_wl: String,
    pub dest_app: String,
    pub dest_ver: String,
}

const REQUIRED_LABELS: [&str; 11] = [
    "source_workload_namespace",
    "source_workload",
    "source_canonical_service",
    "source_canonical_revision",
    "destination_service_namespace",
    "destination_service",
    "destination_service_name",
    "destination_workload_namespace",
    "destination_workload",
    "destination_canonical_service",
    "destination_canonical_revision",
];

impl TrafficLabels {
    /// Reads the source and destination labels. Errs with the name of a missing label.
    pub fn parse(sample: &Sample) -> std::result::Result<Self, &'static str> {
        if let Some(missing) = REQUIRED_LABELS
            .iter()
            .find(|l| !sample.metric.contains_key(**l))
        {
            return Err(*missing);
        }
        let label = |name: &str| sample.label(name).unwrap_or_default().to_string();
        let (source_cluster, source_cluster_ok) = cluster_label(sample, "source_cluster");
        let (dest_cluster, dest_cluster_ok) = cluster_label(sample, "destination_cluster");

        Ok(TrafficLabels {
            source_cluster,
            source_cluster_ok,
            source_wl_ns: label("source_workload_namespace"),
            source_wl: label("source_workload"),
            source_app: label("source_canonical_service"),
            source_ver: label("source_canonical_revision"),
            dest_cluster,
            dest_cluster_ok,
            dest_svc_ns: label("destination_service_namespace"),
            dest_svc: label("destination_service"),
            dest_svc_name: label("destination_service_name"),
            dest_wl_ns: label("destination_workload_namespace"),
            dest_wl: label("destination_workload"),
            dest_app: label("destination_canonical_service"),
            dest_ver: label("destination_canonical_revision"),
        })
    }

    pub fn is_bad_source_telemetry(&self) -> bool {
        is_bad_source_telemetry(
            &self.source_cluster,
            self.source_cluster_ok,
            &self.source_wl_ns,
            &self.source_wl,
            &self.source_app,
        )
    }

    pub fn source_node_id(&self, graph_type: GraphType) -> Result<(String, NodeType)> {
        node_id(
            &self.source_cluster,
            &self.source_wl_ns,
            "",
            &self.source_wl_ns,
            &self.source_wl,
            &self.source_app,
            &self.source_ver,
            graph_type,
        )
    }

    pub fn dest_node_id(&self, graph_type: GraphType) -> Result<(String, NodeType)> {
        node_id(
            &self.dest_cluster,
            &self.dest_svc_ns,
            &self.dest_svc_name,
            &self.dest_wl_ns,
            &self.dest_wl,
            &self.dest_app,
            &self.dest_ver,
            graph_type,
        )
    }

    /// The node of the destination service alone.
    pub fn service_node_id(&self, graph_type: GraphType) -> Result<(String, NodeType)> {
        node_id(
            &self.dest_cluster,
            &self.dest_svc_ns,
            &self.dest_svc_name,
            "",
            "",
            "",
            "",
            graph_type,
        )
    }

    /// Whether a service node goes between source and destination: the service is named,
    /// is not the passthrough cluster, and is not already the destination node.
    pub fn injects_service(&self, inject_service_nodes: bool, graph_type: GraphType) -> Result<bool> {
        if !inject_service_nodes
            || !is_ok(&self.dest_svc_name)
            || self.dest_svc_name == PASSTHROUGH_CLUSTER
        {
            return Ok(false);
        }
        let (_, dest_type) = self.dest_node_id(graph_type)?;
        Ok(dest_type != NodeType::Service)
    }

    pub fn is_bad_dest_telemetry(&self) -> bool {
        is_bad_dest_telemetry(
            &self.dest_cluster,
            self.dest_cluster_ok,
            &self.dest_svc_ns,
            &self.dest_svc,
            &self.dest_svc_name,
            &self.dest_wl,
        )
    }
}

/// A missing cluster label is reported as unknown.
fn cluster_label(sample: &Sample, name: &str) -> (String, bool) {
    match sample.label(name) {
        Some(cluster) => (cluster.to_string(), true),
        None => (UNKNOWN.to_string(), false),
    }
}

/// Source telemetry known to be incomplete:
/// the namespace is set but neither workload nor app is, or the cluster is reported but unknown.
pub fn is_bad_source_telemetry(
    cluster: &str,
    cluster_ok: bool,
    namespace: &str,
    workload: &str,
    app: &str,
) -> bool {
    if is_ok(namespace) && !is_ok(workload) && !is_ok(app) {
        tracing::debug!(namespace, workload, app, "skipping bad source telemetry [case 1]");
        return true;
    }
    if is_ok(namespace) && cluster_ok && !is_ok(cluster) {
        tracing::debug!(namespace, workload, app, cluster, "skipping bad source telemetry [case 2]");
        return true;
    }
    false
}

/// Destination telemetry known to be incomplete:
/// a pod IP reported as the service with no workload, or the cluster is reported but unknown.
pub fn is_bad_dest_telemetry(
    cluster: &str,
    cluster_ok: bool,
    service_namespace: &str,
    service: &str,
    service_name: &str,
    workload: &str,
) -> bool {
    let names_service_only =
        !is_ok(workload) && is_ok(service) && is_ok(service_name) && service == service_name;
    if names_service_only && BAD_SERVICE_MATCHER.is_match(service_name) {
        tracing::debug!(service, service_name, workload, "skipping bad dest telemetry [case 1]");
        return true;
    }
    if is_ok(service_namespace) && cluster_ok && !is_ok(cluster) {
        tracing::debug!(service_namespace, cluster, "skipping bad dest telemetry [case 2]");
        return true;
    }
    false
}

/// Rewrites the destination for known corner cases. Returns true when the egress gateway
/// rewrite applied.
pub fn handle_destination(labels: &mut TrafficLabels, conf: &Config) -> bool {
    let egress_host = conf.egress_gateway_host();
    if labels.dest_svc == egress_host && labels.dest_svc == labels.dest_svc_name {
        let istio_ns = conf.istio_namespace.clone();
        tracing::debug!(cluster = %labels.source_cluster, namespace = %istio_ns, "rewriting egress gateway destination");
        labels.dest_cluster = labels.source_cluster.clone();
        labels.dest_svc_ns = istio_ns.clone();
        labels.dest_svc_name = "istio-egressgateway".to_string();
        labels.dest_wl_ns = istio_ns;
        labels.dest_wl = "istio-egressgateway".to_string();
        labels.dest_app = "istio-egressgateway".to_string();
        labels.dest_ver = "latest".to_string();
        return true;
    }

    // the destination cluster can be misreported as unknown, assume it matches the source
    if !is_ok(&labels.dest_cluster) && is_ok(&labels.source_cluster) && is_ok(&labels.dest_svc_ns)
    {
        tracing::debug!(from = %labels.dest_cluster, to = %labels.source_cluster, "resetting unknown destination cluster");
        labels.dest_cluster = labels.source_cluster.clone();
    }
    false
}

/// Requests forwarded from a remote cluster arrive for `<name>.<namespace>.<suffix>` with an
/// unresolved source; map them back to the local service.
pub fn handle_multicluster_request(labels: &mut TrafficLabels, conf: &Config) {
    if is_ok(&labels.source_wl_ns) || is_ok(&labels.source_wl) {
        return;
    }
    let parts: Vec<&str> = labels.dest_svc_name.split('.').collect();
    if let [name, namespace, suffix] = parts.as_slice() {
        if *suffix == conf.multicluster_host_suffix {
            let (name, namespace) = (name.to_string(), namespace.to_string());
            labels.dest_svc_ns = namespace;
            labels.dest_svc_name = name;
        }
    }
}

pub fn is_http_error(code: &str) -> bool {
    code.starts_with('4') || code.starts_with('5')
}

/// `-` for requests without a response. Otherwise the HTTP code, unless the request is gRPC
/// with a reported status and a successful HTTP transport.
pub fn handle_response_code(protocol: Protocol, code: &str, grpc_status: Option<&str>) -> String {
    if code == "0" {
        return "-".to_string();
    }
    match grpc_status {
        Some(status) if protocol == Protocol::Grpc && !is_http_error(code) => status.to_string(),
        _ => code.to_string(),
    }
}

/// Injects the configured scope after every `{` of the query.
pub fn add_query_scope(query: &str, conf: &Config) -> String {
    if conf.query_scope.is_empty() {
        return query.to_string();
    }
    let mut scope = String::from("{");
    for (name, value) in &conf.query_scope {
        let _ = write!(
            scope,
            "{}=\"{}\",",
            LABEL_NAME_SANITIZER.replace_all(name, "_"),
            value
        );
    }
    query.replace('{', &scope)
}

/// The reporter selector, widened to waypoint reports when waypoint traffic is requested.
pub fn reporter(reporter: &str, rates: &RequestedRates) -> String {
    match rates.ambient {
        AmbientRate::Waypoint | AmbientRate::Total => {
            format!(r#"reporter=~"waypoint|{}""#, reporter)
        }
        _ => format!(r#"reporter="{}""#, reporter),
    }
}

/// Selector excluding ztunnel reports when they are not requested.
pub fn app_selector(rates: &RequestedRates) -> &'static str {
    match rates.ambient {
        AmbientRate::Waypoint | AmbientRate::None => r#"app!="ztunnel","#,
        _ => "",
    }
}

/// Identity of one time series contribution, used to count it once per edge.
pub fn ts_hash(
    metric: &str,
    source_id: &str,
    dest_id: &str,
    code: &str,
    flags: &str,
    host: &str,
) -> Uuid {
    let name = [metric, source_id, dest_id, code, flags, host].join("\u{1f}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Runs an instant query, scoped and rounded. Backend failures abort the build.
pub async fn prom_query(
    client: &dyn MetricsClient,
    conf: &Config,
    query: &str,
    query_time: DateTime<Utc>,
    appender: Option<&str>,
) -> Result<Vector> {
    if query.is_empty() {
        return Ok(Vector::new());
    }

    let query = format!("round({},0.001)", add_query_scope(query, conf));
    let caller = appender.unwrap_or("graph-generation");
    let start = Instant::now();

    let result = client.query(&query, query_time).await.map_err(|e| {
        tracing::trace!(failed_query = %query, caller, "query failed: {}", e);
        e
    })?;

    if !result.warnings.is_empty() {
        tracing::warn!(problem_query = %query, caller, "metrics backend warnings: [{}]", result.warnings.join(","));
    }
    tracing::trace!(
        %query,
        caller,
        duration = ?start.elapsed(),
        query_time = query_time.timestamp(),
        "query complete"
    );

    Ok(result.vector)
}
