use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::GlobalInfo;
use crate::error::Result;
use crate::graph::{node_id, GraphType, NodeType, TrafficMap, PASSTHROUGH_CLUSTER, UNKNOWN, is_ok};
use crate::payloads::{AmbientRate, GrpcRate, NamespaceInfo, RequestedRates, TcpRate};
use crate::prometheus::{Sample, Vector};
use crate::telemetry::util::{app_selector, prom_query, reporter};

pub const NAME: &str = "securityPolicy";

const POLICY_MTLS: &str = "mutual_tls";

const GROUP_BY: &str = "source_cluster,source_workload_namespace,source_workload,source_canonical_service,source_canonical_revision,source_principal,destination_cluster,destination_service_namespace,destination_service_name,destination_workload_namespace,destination_workload,destination_canonical_service,destination_canonical_revision,destination_principal,connection_security_policy";

const REQUIRED_LABELS: [&str; 12] = [
    "source_workload_namespace",
    "source_workload",
    "source_canonical_service",
    "source_canonical_revision",
    "source_principal",
    "destination_service_namespace",
    "destination_service_name",
    "destination_workload_namespace",
    "destination_workload",
    "destination_canonical_service",
    "destination_canonical_revision",
    "destination_principal",
];

/// Annotates edges with the percentage of mutual TLS traffic and the peer principals.
#[derive(Debug, Clone)]
pub struct SecurityPolicyAppender {
    pub graph_type: GraphType,
    pub inject_service_nodes: bool,
    pub namespaces: BTreeMap<String, NamespaceInfo>,
    pub query_time: DateTime<Utc>,
    pub rates: RequestedRates,
}

type EdgeKey = (String, String);

/// Traffic per connection security policy, and principals, per (source, dest).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityPolicies {
    rates: BTreeMap<EdgeKey, BTreeMap<String, f64>>,
    principals: BTreeMap<EdgeKey, (String, String)>,
}

impl SecurityPolicies {
    fn add(&mut self, key: EdgeKey, policy: &str, value: f64, principals: (&str, &str)) {
        self.principals
            .entry(key.clone())
            .or_insert_with(|| (principals.0.to_string(), principals.1.to_string()));
        self.rates
            .entry(key)
            .or_default()
            .insert(policy.to_string(), value);
    }

    /// Percentage of the edge's traffic under mutual TLS, when any is.
    pub fn mtls(&self, source: &str, dest: &str) -> Option<f64> {
        let rates = self.rates.get(&(source.to_string(), dest.to_string()))?;
        let mut mtls = 0.0;
        let mut other = 0.0;
        for (policy, rate) in rates {
            if policy == POLICY_MTLS {
                mtls = *rate;
            } else {
                other += rate;
            }
        }
        if mtls > 0.0 {
            Some(mtls / (mtls + other) * 100.0)
        } else {
            None
        }
    }

    pub fn apply(self, traffic_map: &mut TrafficMap) {
        let waypoints: std::collections::BTreeSet<String> = traffic_map
            .values()
            .filter(|n| n.metadata.is_waypoint)
            .map(|n| n.id.clone())
            .collect();

        for node in traffic_map.values_mut() {
            for edge in node.edges.iter_mut() {
                let key = (edge.source.clone(), edge.dest.clone());
                if self.rates.contains_key(&key) {
                    if let Some(percent) = self.mtls(&edge.source, &edge.dest) {
                        edge.metadata.is_mtls = Some(percent);
                    }
                } else if waypoints.contains(&edge.source) || waypoints.contains(&edge.dest) {
                    // waypoint hops are always secured, though unmatched by telemetry
                    edge.metadata.is_mtls = Some(100.0);
                }
                if let Some((source_principal, dest_principal)) = self.principals.get(&key) {
                    edge.metadata.source_principal = Some(source_principal.clone());
                    edge.metadata.dest_principal = Some(dest_principal.clone());
                }
            }
        }
    }
}

impl SecurityPolicyAppender {
    fn queries(&self, selector: &str, duration: u64) -> String {
        let mut parts = Vec::new();
        let destination = reporter("destination", &self.rates);
        let mut push = |metric: &str, app: &str| {
            parts.push(format!(
                "(sum(rate({}{{{}{},{}}}[{}s])) by ({}) > 0)",
                metric, app, destination, selector, duration, GROUP_BY
            ));
        };
        if self.rates.has_requests() {
            push("istio_requests_total", "");
        }
        if matches!(self.rates.grpc, GrpcRate::Sent | GrpcRate::Total) {
            push("istio_request_messages_total", "");
        }
        if matches!(self.rates.grpc, GrpcRate::Received | GrpcRate::Total) {
            push("istio_response_messages_total", "");
        }
        if matches!(self.rates.tcp, TcpRate::Sent | TcpRate::Total) {
            push("istio_tcp_sent_bytes_total", app_selector(&self.rates));
        }
        if matches!(self.rates.tcp, TcpRate::Received | TcpRate::Total) {
            push("istio_tcp_received_bytes_total", app_selector(&self.rates));
        }
        parts.join(" OR ")
    }

    /// ztunnel reports ztunnel-to-sidecar TCP traffic as the source only.
    fn ztunnel_queries(&self, namespace: &str, duration: u64) -> Vec<String> {
        if !matches!(self.rates.ambient, AmbientRate::Total | AmbientRate::Ztunnel) {
            return Vec::new();
        }
        let mut metrics = Vec::new();
        if matches!(self.rates.tcp, TcpRate::Sent | TcpRate::Total) {
            metrics.push("istio_tcp_sent_bytes_total");
        }
        if matches!(self.rates.tcp, TcpRate::Received | TcpRate::Total) {
            metrics.push("istio_tcp_received_bytes_total");
        }
        metrics
            .into_iter()
            .map(|metric| {
                format!(
                    r#"(sum(rate({}{{app="ztunnel",reporter="source",source_workload_namespace="{}"}}[{}s])) by ({}) > 0)"#,
                    metric, namespace, duration, GROUP_BY
                )
            })
            .collect()
    }

    pub async fn security_policies(
        &self,
        traffic_map: &TrafficMap,
        global: &GlobalInfo,
        namespace: &NamespaceInfo,
    ) -> Result<SecurityPolicies> {
        let mut policies = SecurityPolicies::default();
        if traffic_map.is_empty() {
            return Ok(policies);
        }
        let ns = &namespace.name;
        let duration = self
            .namespaces
            .get(ns)
            .map_or(namespace.duration, |n| n.duration)
            .as_secs();
        tracing::trace!(namespace = %ns, "resolving security policy");

        // requests entering the namespace, then requests leaving workloads of the namespace
        let incoming = self.queries(
            &format!(
                r#"source_workload_namespace!="{ns}",destination_service_namespace="{ns}""#,
                ns = ns
            ),
            duration,
        );
        let mut internal = vec![self.queries(
            &format!(r#"source_workload_namespace="{}""#, ns),
            duration,
        )];
        internal.extend(self.ztunnel_queries(ns, duration));
        let internal: Vec<String> = internal.into_iter().filter(|q| !q.is_empty()).collect();

        for query in [incoming, internal.join(" OR ")] {
            let vector = prom_query(
                global.prom.as_ref(),
                &global.conf,
                &query,
                self.query_time,
                Some(NAME),
            )
            .await?;
            self.populate(&mut policies, &vector);
        }
        Ok(policies)
    }

    fn populate(&self, policies: &mut SecurityPolicies, vector: &Vector) {
        for sample in vector {
            if let Some(missing) = REQUIRED_LABELS
                .iter()
                .find(|l| !sample.metric.contains_key(**l))
            {
                tracing::warn!(metric = ?sample.metric, missing, "skipping security policy, missing expected label");
                continue;
            }
            if let Err(e) = self.add_sample(policies, sample) {
                tracing::warn!("skipping security policy, {}", e);
            }
        }
    }

    fn add_sample(&self, policies: &mut SecurityPolicies, sample: &Sample) -> Result<()> {
        let label = |name: &str| sample.label(name).unwrap_or(UNKNOWN);
        let source_cluster = label("source_cluster");
        let dest_cluster = label("destination_cluster");
        let (source_ns, source_wl, source_app, source_ver) = (
            label("source_workload_namespace"),
            label("source_workload"),
            label("source_canonical_service"),
            label("source_canonical_revision"),
        );
        let (dest_svc_ns, dest_svc) = (
            label("destination_service_namespace"),
            label("destination_service_name"),
        );
        let (dest_wl_ns, dest_wl, dest_app, dest_ver) = (
            label("destination_workload_namespace"),
            label("destination_workload"),
            label("destination_canonical_service"),
            label("destination_canonical_revision"),
        );
        // not set on gRPC message metrics
        let policy = label("connection_security_policy");
        let principals = (label("source_principal"), label("destination_principal"));
        let gt = self.graph_type;

        let (source_id, _) = node_id(
            source_cluster, source_ns, "", source_ns, source_wl, source_app, source_ver, gt,
        )?;
        let (dest_id, dest_type) = node_id(
            dest_cluster, dest_svc_ns, dest_svc, dest_wl_ns, dest_wl, dest_app, dest_ver, gt,
        )?;

        let inject = self.inject_service_nodes
            && is_ok(dest_svc)
            && dest_svc != PASSTHROUGH_CLUSTER
            && dest_type != NodeType::Service;
        if inject {
            let (service_id, _) = node_id(dest_cluster, dest_svc_ns, dest_svc, "", "", "", "", gt)?;
            policies.add((source_id, service_id.clone()), policy, sample.value, principals);
            policies.add((service_id, dest_id), policy, sample.value, principals);
        } else {
            policies.add((source_id, dest_id), policy, sample.value, principals);
        }
        Ok(())
    }
}
