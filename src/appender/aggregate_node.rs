use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::GlobalInfo;
use crate::error::Result;
use crate::graph::{add_to_metadata, GraphType, Node, NodeType, Protocol, TrafficMap};
use crate::payloads::{NamespaceInfo, RequestedRates};
use crate::prometheus::Vector;
use crate::telemetry::util::{
    handle_destination, handle_response_code, prom_query, reporter, TrafficLabels,
};

pub const NAME: &str = "aggregateNode";

pub const DEFAULT_AGGREGATE: &str = "request_operation";

const METRIC: &str = "istio_requests_total";

const GROUP_BY: &str = "source_cluster,source_workload_namespace,source_workload,source_canonical_service,source_canonical_revision,destination_cluster,destination_service_namespace,destination_service,destination_service_name,destination_workload_namespace,destination_workload,destination_canonical_service,destination_canonical_revision,request_protocol,response_code,grpc_response_status,response_flags";

/// Splits request edges by a classification label, routing each classified share through an
/// aggregate node. With `aggregate_value` set only that value is resolved, for node graphs.
#[derive(Debug, Clone)]
pub struct AggregateNodeAppender {
    pub aggregate: String,
    pub aggregate_value: Option<String>,
    pub graph_type: GraphType,
    pub inject_service_nodes: bool,
    pub namespaces: BTreeMap<String, NamespaceInfo>,
    pub query_time: DateTime<Utc>,
    pub rates: RequestedRates,
    pub service: Option<String>,
}

/// One classified series, resolved against the map.
struct Classified {
    protocol: Protocol,
    code: String,
    flags: String,
    host: String,
    value: f64,
}

impl AggregateNodeAppender {
    pub async fn append_graph(
        &self,
        traffic_map: &mut TrafficMap,
        global: &GlobalInfo,
        namespace: &NamespaceInfo,
    ) -> Result<()> {
        if traffic_map.is_empty()
            || self.graph_type == GraphType::Service
            || !self.rates.has_requests()
        {
            return Ok(());
        }

        for query in self.queries(namespace) {
            let vector = prom_query(
                global.prom.as_ref(),
                &global.conf,
                &query,
                self.query_time,
                Some(NAME),
            )
            .await?;
            self.inject_aggregates(traffic_map, &vector, global);
        }
        Ok(())
    }

    fn queries(&self, namespace: &NamespaceInfo) -> Vec<String> {
        let ns = &namespace.name;
        let duration = self
            .namespaces
            .get(ns)
            .map_or(namespace.duration, |n| n.duration)
            .as_secs();
        let rep = reporter("destination", &self.rates);
        let group_by = format!("{},{}", GROUP_BY, self.aggregate);
        let query = |selector: String| {
            format!(
                "sum(rate({}{{{}}}[{}s])) by ({}) > 0",
                METRIC, selector, duration, group_by
            )
        };

        match &self.aggregate_value {
            None => {
                tracing::trace!(namespace = %ns, aggregate = %self.aggregate, "resolving request aggregates");
                vec![
                    query(format!(
                        r#"{},source_workload_namespace!="{ns}",destination_service_namespace="{ns}",{}!="unknown""#,
                        rep,
                        self.aggregate,
                        ns = ns
                    )),
                    query(format!(
                        r#"{},source_workload_namespace="{}",{}!="unknown""#,
                        rep, ns, self.aggregate
                    )),
                ]
            }
            Some(value) => {
                tracing::trace!(namespace = %ns, aggregate = %self.aggregate, value = %value, "resolving node request aggregates");
                let service = match &self.service {
                    Some(service) => format!(r#",destination_service_name="{}""#, service),
                    None => String::new(),
                };
                vec![query(format!(
                    r#"{},destination_service_namespace="{}",{}="{}"{}"#,
                    rep, ns, self.aggregate, value, service
                ))]
            }
        }
    }

    fn inject_aggregates(&self, traffic_map: &mut TrafficMap, vector: &Vector, global: &GlobalInfo) {
        for sample in vector {
            let aggregate_value = match sample.label(&self.aggregate) {
                Some(value) => value,
                None => continue,
            };
            let (flags, raw_protocol) = match (sample.label("response_flags"), sample.label("request_protocol")) {
                (Some(flags), Some(protocol)) => (flags, protocol),
                _ => {
                    tracing::warn!(metric = ?sample.metric, "skipping aggregate, missing expected labels");
                    continue;
                }
            };
            let mut labels = match TrafficLabels::parse(sample) {
                Ok(labels) => labels,
                Err(missing) => {
                    tracing::warn!(metric = ?sample.metric, missing, "skipping aggregate, missing expected label");
                    continue;
                }
            };
            let protocol = match raw_protocol.parse::<Protocol>() {
                Ok(protocol) => protocol,
                Err(e) => {
                    tracing::debug!("skipping aggregate, {}", e);
                    continue;
                }
            };
            if !self.rates.wants_requests(protocol) || labels.is_bad_source_telemetry() {
                continue;
            }
            let code = handle_response_code(
                protocol,
                sample.label("response_code").unwrap_or_default(),
                sample.label("grpc_response_status"),
            );
            handle_destination(&mut labels, &global.conf);
            if labels.is_bad_dest_telemetry() {
                continue;
            }

            let classified = Classified {
                protocol,
                code,
                flags: flags.to_string(),
                host: labels.dest_svc.clone(),
                value: sample.value,
            };
            if let Err(e) = self.inject(traffic_map, &labels, aggregate_value, &classified) {
                tracing::warn!("skipping aggregate, {}", e);
            }
        }
    }

    fn inject(
        &self,
        traffic_map: &mut TrafficMap,
        labels: &TrafficLabels,
        aggregate_value: &str,
        classified: &Classified,
    ) -> Result<()> {
        let gt = self.graph_type;
        let (source_id, _) = labels.source_node_id(gt)?;
        if !traffic_map.contains_key(&source_id) {
            tracing::debug!(source = %source_id, aggregate = aggregate_value, "source not in traffic map, skipping aggregate");
            return Ok(());
        }
        let (dest_id, _) = if self.inject_service_nodes {
            labels.service_node_id(gt)?
        } else {
            labels.dest_node_id(gt)?
        };
        if !traffic_map.contains_key(&dest_id) {
            tracing::debug!(dest = %dest_id, aggregate = aggregate_value, "dest not in traffic map, skipping aggregate");
            return Ok(());
        }

        let aggregate = if self.inject_service_nodes {
            Node::new_aggregate(
                &labels.dest_cluster,
                &labels.dest_svc_ns,
                &self.aggregate,
                aggregate_value,
                &labels.dest_svc_name,
                &labels.dest_app,
            )
        } else {
            Node::new_aggregate(
                &labels.dest_cluster,
                &labels.dest_wl_ns,
                &self.aggregate,
                aggregate_value,
                "",
                "",
            )
        };
        let aggregate_id = aggregate.id.clone();
        traffic_map.entry(aggregate_id.clone()).or_insert(aggregate);

        // the direct edge is replaced by the hop through the aggregate
        if let Some(source) = traffic_map.get_mut(&source_id) {
            source.edges.retain(|e| e.dest != dest_id);
        }
        add_traffic(traffic_map, &source_id, &aggregate_id, classified);
        add_traffic(traffic_map, &aggregate_id, &dest_id, classified);
        Ok(())
    }
}

/// Adds the series to the edge, counting node traffic on the aggregate end only.
fn add_traffic(traffic_map: &mut TrafficMap, source: &str, dest: &str, c: &Classified) {
    let source_is_aggregate = traffic_map.node_type(source) == Some(NodeType::Aggregate);
    let aggregate_id = if source_is_aggregate { source } else { dest };

    let mut aggregate = match traffic_map.get_mut(aggregate_id) {
        Some(node) => std::mem::take(&mut node.metadata),
        None => return,
    };
    if let Some(node) = traffic_map.get_mut(source) {
        let edge = node.find_or_add_edge(dest, c.protocol);
        let (out, inc) = if source_is_aggregate {
            (Some(&mut aggregate), None)
        } else {
            (None, Some(&mut aggregate))
        };
        add_to_metadata(c.protocol, c.value, &c.code, &c.flags, &c.host, out, inc, &mut edge.metadata);
    }
    if let Some(node) = traffic_map.get_mut(aggregate_id) {
        node.metadata = aggregate;
    }
}
