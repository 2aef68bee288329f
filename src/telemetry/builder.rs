//! Turns request, message and byte counters into the nodes and edges of one namespace.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::util::{
    app_selector, handle_destination, handle_multicluster_request, handle_response_code,
    prom_query, reporter, ts_hash, TrafficLabels,
};
use crate::appender::GlobalInfo;
use crate::business::NodeKey;
use crate::error::{GraphError, Result};
use crate::graph::{
    add_to_metadata, is_ok, GraphType, Node, NodeMetadata, NodeType, Protocol, TrafficMap,
    UNKNOWN,
};
use crate::payloads::{GrpcRate, HttpRate, NamespaceInfo, TcpRate, TelemetryOptions};
use crate::prometheus::{Sample, Vector};

const REQUESTS_METRIC: &str = "istio_requests_total";
const REQUEST_MESSAGES_METRIC: &str = "istio_request_messages_total";
const RESPONSE_MESSAGES_METRIC: &str = "istio_response_messages_total";
const TCP_SENT_METRIC: &str = "istio_tcp_sent_bytes_total";
const TCP_RECEIVED_METRIC: &str = "istio_tcp_received_bytes_total";

const PEERS_GROUP_BY: &str = "source_cluster,source_workload_namespace,source_workload,source_canonical_service,source_canonical_revision,destination_cluster,destination_service_namespace,destination_service,destination_service_name,destination_workload_namespace,destination_workload,destination_canonical_service,destination_canonical_revision";

/// A counter family: the metric and, for non-request counters, the protocol it implies.
#[derive(Debug, Clone, PartialEq)]
pub struct Family {
    pub metric: &'static str,
    pub protocol: Option<Protocol>,
    /// Extra selector, starting with a comma when set.
    pub selector: &'static str,
}

impl Family {
    pub fn group_by(&self) -> String {
        match self.protocol {
            None => format!(
                "{},request_protocol,response_code,grpc_response_status,response_flags",
                PEERS_GROUP_BY
            ),
            Some(_) => format!("{},response_flags", PEERS_GROUP_BY),
        }
    }

    /// Renders `sum(rate(...)) by (...)` for the selector.
    pub fn query(&self, selector: &str, duration_secs: u64, include_idle_edges: bool) -> String {
        format!(
            "sum(rate({}{{{}{}}}[{}s])) by ({}){}",
            self.metric,
            selector,
            self.selector,
            duration_secs,
            self.group_by(),
            if include_idle_edges { "" } else { " > 0" }
        )
    }
}

/// The counter families the requested rates call for.
pub fn families(o: &TelemetryOptions) -> Vec<Family> {
    let mut families = Vec::new();
    let rates = &o.rates;
    let http = rates.http == HttpRate::Requests;
    let grpc = rates.grpc == GrpcRate::Requests;
    if http || grpc {
        families.push(Family {
            metric: REQUESTS_METRIC,
            protocol: None,
            selector: match (http, grpc) {
                (true, false) => r#",request_protocol="http""#,
                (false, true) => r#",request_protocol="grpc""#,
                _ => "",
            },
        });
    }
    if matches!(rates.grpc, GrpcRate::Sent | GrpcRate::Total) {
        families.push(Family {
            metric: REQUEST_MESSAGES_METRIC,
            protocol: Some(Protocol::Grpc),
            selector: "",
        });
    }
    if matches!(rates.grpc, GrpcRate::Received | GrpcRate::Total) {
        families.push(Family {
            metric: RESPONSE_MESSAGES_METRIC,
            protocol: Some(Protocol::Grpc),
            selector: "",
        });
    }
    if matches!(rates.tcp, TcpRate::Sent | TcpRate::Total) {
        families.push(Family {
            metric: TCP_SENT_METRIC,
            protocol: Some(Protocol::Tcp),
            selector: "",
        });
    }
    if matches!(rates.tcp, TcpRate::Received | TcpRate::Total) {
        families.push(Family {
            metric: TCP_RECEIVED_METRIC,
            protocol: Some(Protocol::Tcp),
            selector: "",
        });
    }
    families
}

/// One end of a traffic contribution, before identity resolution.
#[derive(Debug, Clone, Copy)]
struct Endpoint<'a> {
    cluster: &'a str,
    service_namespace: &'a str,
    service: &'a str,
    workload_namespace: &'a str,
    workload: &'a str,
    app: &'a str,
    version: &'a str,
}

impl<'a> Endpoint<'a> {
    fn source(l: &'a TrafficLabels) -> Self {
        Endpoint {
            cluster: &l.source_cluster,
            service_namespace: &l.source_wl_ns,
            service: "",
            workload_namespace: &l.source_wl_ns,
            workload: &l.source_wl,
            app: &l.source_app,
            version: &l.source_ver,
        }
    }

    fn service(l: &'a TrafficLabels) -> Self {
        Endpoint {
            cluster: &l.dest_cluster,
            service_namespace: &l.dest_svc_ns,
            service: &l.dest_svc_name,
            workload_namespace: "",
            workload: "",
            app: "",
            version: "",
        }
    }

    fn dest(l: &'a TrafficLabels) -> Self {
        Endpoint {
            cluster: &l.dest_cluster,
            service_namespace: &l.dest_svc_ns,
            service: &l.dest_svc_name,
            workload_namespace: &l.dest_wl_ns,
            workload: &l.dest_wl,
            app: &l.dest_app,
            version: &l.dest_ver,
        }
    }

    fn node(&self, graph_type: GraphType) -> Result<Node> {
        Node::new(
            self.cluster,
            self.service_namespace,
            self.service,
            self.workload_namespace,
            self.workload,
            self.app,
            self.version,
            graph_type,
        )
    }
}

/// What one sample contributes to an edge.
#[derive(Debug, Clone)]
struct Contribution<'a> {
    metric: &'a str,
    protocol: Protocol,
    code: String,
    flags: String,
    host: String,
    value: f64,
}

/// Adds samples to a traffic map. Shared by namespace and node graphs.
pub struct Populator {
    pub graph_type: GraphType,
    pub inject_service_nodes: bool,
    pub rates: crate::payloads::RequestedRates,
    pub conf: Arc<crate::config::Config>,
    /// Waypoint workloads; set when the namespace runs the ambient data plane.
    pub waypoints: Option<Arc<BTreeSet<NodeKey>>>,
}

impl Populator {
    pub async fn new(o: &TelemetryOptions, global: &GlobalInfo, ambient: bool) -> Result<Self> {
        let waypoints = if ambient {
            Some(global.waypoints().await?)
        } else {
            None
        };
        Ok(Populator {
            graph_type: o.graph_type,
            inject_service_nodes: o.inject_service_nodes,
            rates: o.rates,
            conf: global.conf.clone(),
            waypoints,
        })
    }

    pub fn populate(&self, traffic_map: &mut TrafficMap, vector: &Vector, family: &Family) {
        for sample in vector {
            let (mut labels, contribution) = match self.parse(sample, family) {
                Some(parsed) => parsed,
                None => continue,
            };
            handle_multicluster_request(&mut labels, &self.conf);
            if labels.is_bad_source_telemetry() {
                continue;
            }
            handle_destination(&mut labels, &self.conf);
            if labels.is_bad_dest_telemetry() {
                continue;
            }
            let contribution = Contribution {
                host: labels.dest_svc.clone(),
                ..contribution
            };
            if let Err(e) = self.add_sample(traffic_map, &labels, &contribution) {
                tracing::warn!("skipping sample, {}", e);
            }
        }
    }

    fn parse<'a>(&self, sample: &Sample, family: &'a Family) -> Option<(TrafficLabels, Contribution<'a>)> {
        let labels = match TrafficLabels::parse(sample) {
            Ok(labels) => labels,
            Err(missing) => {
                tracing::warn!(metric = ?sample.metric, missing, "skipping sample, missing expected label");
                return None;
            }
        };
        let flags = match sample.label("response_flags") {
            Some(flags) => flags.to_string(),
            None => {
                tracing::warn!(metric = ?sample.metric, "skipping sample, missing response_flags");
                return None;
            }
        };

        let (protocol, code) = match family.protocol {
            Some(Protocol::Grpc) => (Protocol::Grpc, "0".to_string()),
            Some(protocol) => (protocol, "-".to_string()),
            None => {
                let (raw, code) = match (sample.label("request_protocol"), sample.label("response_code")) {
                    (Some(raw), Some(code)) => (raw, code),
                    _ => {
                        tracing::warn!(metric = ?sample.metric, "skipping sample, missing request labels");
                        return None;
                    }
                };
                let protocol = match raw.parse::<Protocol>() {
                    Ok(protocol) => protocol,
                    Err(e) => {
                        tracing::debug!("skipping sample, {}", e);
                        return None;
                    }
                };
                if !self.rates.wants_requests(protocol) {
                    return None;
                }
                let code = handle_response_code(protocol, code, sample.label("grpc_response_status"));
                (protocol, code)
            }
        };

        Some((
            labels,
            Contribution {
                metric: family.metric,
                protocol,
                code,
                flags,
                host: String::new(),
                value: sample.value,
            },
        ))
    }

    fn is_waypoint(&self, cluster: &str, namespace: &str, workload: &str) -> bool {
        self.waypoints
            .as_ref()
            .map_or(false, |w| w.contains(&NodeKey::new(cluster, namespace, workload)))
    }

    fn add_sample(&self, traffic_map: &mut TrafficMap, labels: &TrafficLabels, c: &Contribution) -> Result<()> {
        let touches_waypoint = self.is_waypoint(&labels.source_cluster, &labels.source_wl_ns, &labels.source_wl)
            || self.is_waypoint(&labels.dest_cluster, &labels.dest_wl_ns, &labels.dest_wl);

        if labels.injects_service(self.inject_service_nodes, self.graph_type)? && !touches_waypoint {
            self.add_traffic(traffic_map, c, &Endpoint::source(labels), &Endpoint::service(labels))?;
            self.add_traffic(traffic_map, c, &Endpoint::service(labels), &Endpoint::dest(labels))
        } else {
            self.add_traffic(traffic_map, c, &Endpoint::source(labels), &Endpoint::dest(labels))
        }
    }

    /// Adds the node pair when absent and counts the contribution on their edge, once per series.
    fn add_traffic(
        &self,
        traffic_map: &mut TrafficMap,
        c: &Contribution,
        source: &Endpoint,
        dest: &Endpoint,
    ) -> Result<()> {
        let (source_id, source_found) = add_node(traffic_map, source, self.graph_type)?;
        let (dest_id, dest_found) = add_node(traffic_map, dest, self.graph_type)?;

        let mut dest_node = traffic_map
            .remove(&dest_id)
            .ok_or_else(|| GraphError::Internal(format!("node [{}] vanished", dest_id)))?;
        if is_ok(dest.service) {
            dest_node
                .metadata
                .add_dest_service(dest.cluster, dest.service_namespace, dest.service);
        }
        if dest_found {
            handle_misconfigured_labels(&mut dest_node, dest, c.value, self.graph_type);
        }

        let hash = ts_hash(c.metric, &source_id, &dest_id, &c.code, &c.flags, &c.host);
        if source_id == dest_id {
            if source_found {
                handle_misconfigured_labels(&mut dest_node, source, c.value, self.graph_type);
            }
            let mut metadata = std::mem::take(&mut dest_node.metadata);
            let edge = dest_node.find_or_add_edge(&dest_id, c.protocol);
            if edge.metadata.ts_hashes.insert(hash) {
                let mut incoming = NodeMetadata::default();
                add_to_metadata(c.protocol, c.value, &c.code, &c.flags, &c.host, Some(&mut metadata), Some(&mut incoming), &mut edge.metadata);
                for (key, value) in incoming.rates.iter() {
                    metadata.rates.add(key, value);
                }
            }
            dest_node.metadata = metadata;
            traffic_map.insert_node(dest_node);
            return Ok(());
        }

        let result = match traffic_map.get_mut(&source_id) {
            Some(source_node) => {
                if source_found {
                    handle_misconfigured_labels(source_node, source, c.value, self.graph_type);
                }
                let mut metadata = std::mem::take(&mut source_node.metadata);
                let edge = source_node.find_or_add_edge(&dest_id, c.protocol);
                if edge.metadata.ts_hashes.insert(hash) {
                    add_to_metadata(c.protocol, c.value, &c.code, &c.flags, &c.host, Some(&mut metadata), Some(&mut dest_node.metadata), &mut edge.metadata);
                } else {
                    tracing::trace!(source = %source_id, dest = %dest_id, "series already counted");
                }
                source_node.metadata = metadata;
                Ok(())
            }
            None => Err(GraphError::Internal(format!("node [{}] vanished", source_id))),
        };
        traffic_map.insert_node(dest_node);
        result
    }
}

/// Returns the node ID, and whether the node was already present.
fn add_node(traffic_map: &mut TrafficMap, e: &Endpoint, graph_type: GraphType) -> Result<(String, bool)> {
    let node = e.node(graph_type)?;
    let id = node.id.clone();
    let found = traffic_map.contains_key(&id);
    if !found {
        traffic_map.insert_node(node);
    }
    Ok((id, found))
}

/// A workload may carry several app or version labels over time. The node is flagged and
/// follows the labels of active series.
fn handle_misconfigured_labels(node: &mut Node, e: &Endpoint, value: f64, graph_type: GraphType) {
    let checked = node.node_type == NodeType::Workload
        || (node.node_type == NodeType::App && graph_type == GraphType::VersionedApp);
    if !checked {
        return;
    }
    let normalize = |v: &str| {
        if node.node_type == NodeType::Workload && v == UNKNOWN {
            String::new()
        } else {
            v.to_string()
        }
    };
    let (app, version) = (normalize(e.app), normalize(e.version));

    let mut mismatched = Vec::new();
    if node.app != app {
        mismatched.push("app");
    }
    if node.version != version {
        mismatched.push("version");
    }
    if mismatched.is_empty() {
        return;
    }
    node.metadata.is_misconfigured = Some(format!("labels=[{}]", mismatched.join(" ")));
    if value > 0.0 {
        node.app = app;
        node.version = version;
    }
}

/// Builds the traffic map of one namespace: unserviced incoming, ambient ingress, destination
/// reported incoming and source reported outgoing traffic of every requested family.
#[tracing::instrument(skip_all, fields(namespace = %namespace.name))]
pub async fn build_namespace_traffic_map(
    namespace: &NamespaceInfo,
    o: &TelemetryOptions,
    global: &GlobalInfo,
) -> Result<TrafficMap> {
    let mut traffic_map = TrafficMap::new();
    let populator = Populator::new(o, global, namespace.is_ambient).await?;
    let ns = &namespace.name;
    let duration = namespace.duration.as_secs();
    let app_sel = app_selector(&o.rates);

    for family in families(o) {
        let mut selectors = vec![format!(
            r#"{}reporter="source",source_workload_namespace!="{ns}",destination_workload="unknown",destination_service=~"^.+\\.{ns}\\..+$""#,
            app_sel,
            ns = ns
        )];
        if namespace.is_ambient {
            selectors.push(format!(
                r#"{}reporter="source",source_workload_namespace!="{ns}",destination_workload_namespace="{ns}""#,
                app_sel,
                ns = ns
            ));
        }
        selectors.push(format!(
            r#"{}{},destination_workload_namespace="{}""#,
            app_sel,
            reporter("destination", &o.rates),
            ns
        ));
        selectors.push(format!(
            r#"{}{},source_workload_namespace="{}""#,
            app_sel,
            reporter("source", &o.rates),
            ns
        ));

        for selector in selectors {
            let query = family.query(&selector, duration, o.include_idle_edges);
            let vector = prom_query(global.prom.as_ref(), &global.conf, &query, o.query_time, None).await?;
            populator.populate(&mut traffic_map, &vector, &family);
        }
    }

    tracing::trace!(nodes = traffic_map.len(), "namespace traffic map built");
    Ok(traffic_map)
}
