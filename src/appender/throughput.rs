use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::GlobalInfo;
use crate::error::{GraphError, Result};
use crate::graph::{GraphType, Protocol, TrafficMap};
use crate::payloads::{NamespaceInfo, RequestedRates};
use crate::prometheus::Vector;
use crate::telemetry::util::{handle_destination, prom_query, reporter, TrafficLabels};

pub const NAME: &str = "throughput";

const GROUP_BY: &str = "source_cluster,source_workload_namespace,source_workload,source_canonical_service,source_canonical_revision,destination_cluster,destination_service_namespace,destination_service,destination_service_name,destination_workload_namespace,destination_workload,destination_canonical_service,destination_canonical_revision";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThroughputType {
    Request,
    Response,
}

impl ThroughputType {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "request" => Ok(ThroughputType::Request),
            "response" => Ok(ThroughputType::Response),
            other => Err(GraphError::BadRequest(format!(
                "invalid throughputType [{}], expecting request or response",
                other
            ))),
        }
    }

    fn metric(self) -> &'static str {
        match self {
            ThroughputType::Request => "istio_request_bytes_sum",
            ThroughputType::Response => "istio_response_bytes_sum",
        }
    }

    /// Request bytes are reported by the sender, response bytes by the receiver.
    fn reporter(self) -> &'static str {
        match self {
            ThroughputType::Request => "source",
            ThroughputType::Response => "destination",
        }
    }
}

/// Annotates HTTP edges with bytes per second of request or response payload.
#[derive(Debug, Clone)]
pub struct ThroughputAppender {
    pub graph_type: GraphType,
    pub inject_service_nodes: bool,
    pub namespaces: BTreeMap<String, NamespaceInfo>,
    pub query_time: DateTime<Utc>,
    pub rates: RequestedRates,
    pub throughput_type: ThroughputType,
}

/// Throughput per (source, dest). The first value seen for an edge is kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Throughputs(BTreeMap<(String, String), f64>);

impl Throughputs {
    fn add(&mut self, source: String, dest: String, value: f64) {
        self.0.entry((source, dest)).or_insert(value);
    }

    pub fn get(&self, source: &str, dest: &str) -> Option<f64> {
        self.0.get(&(source.to_string(), dest.to_string())).copied()
    }

    pub fn apply(self, traffic_map: &mut TrafficMap) {
        for node in traffic_map.values_mut() {
            for edge in node.edges.iter_mut() {
                if edge.metadata.protocol != Some(Protocol::Http) {
                    continue;
                }
                if let Some(value) = self.get(&edge.source, &edge.dest) {
                    edge.metadata.throughput = Some(value);
                }
            }
        }
    }
}

impl ThroughputAppender {
    pub async fn throughputs(
        &self,
        traffic_map: &TrafficMap,
        global: &GlobalInfo,
        namespace: &NamespaceInfo,
    ) -> Result<Throughputs> {
        let mut throughputs = Throughputs::default();
        if traffic_map.is_empty() || !self.rates.wants_requests(Protocol::Http) {
            return Ok(throughputs);
        }
        let ns = &namespace.name;
        let duration = self
            .namespaces
            .get(ns)
            .map_or(namespace.duration, |n| n.duration)
            .as_secs();
        let rep = reporter(self.throughput_type.reporter(), &self.rates);
        tracing::trace!(namespace = %ns, throughput_type = ?self.throughput_type, "resolving throughput");

        let selectors = [
            format!(
                r#"{},source_workload_namespace!="{ns}",destination_service_namespace="{ns}""#,
                rep,
                ns = ns
            ),
            format!(r#"{},source_workload_namespace="{}""#, rep, ns),
        ];
        for selector in selectors {
            let query = format!(
                "sum(rate({}{{{}}}[{}s])) by ({}) > 0",
                self.throughput_type.metric(),
                selector,
                duration,
                GROUP_BY
            );
            let vector = prom_query(
                global.prom.as_ref(),
                &global.conf,
                &query,
                self.query_time,
                Some(NAME),
            )
            .await?;
            self.populate(&mut throughputs, &vector, global);
        }
        Ok(throughputs)
    }

    fn populate(&self, throughputs: &mut Throughputs, vector: &Vector, global: &GlobalInfo) {
        for sample in vector {
            let mut labels = match TrafficLabels::parse(sample) {
                Ok(labels) => labels,
                Err(missing) => {
                    tracing::warn!(metric = ?sample.metric, missing, "skipping throughput, missing expected label");
                    continue;
                }
            };
            if labels.is_bad_source_telemetry() {
                continue;
            }
            handle_destination(&mut labels, &global.conf);
            if labels.is_bad_dest_telemetry() {
                continue;
            }

            if let Err(e) = self.add_sample(throughputs, &labels, sample.value) {
                tracing::warn!("skipping throughput, {}", e);
            }
        }
    }

    fn add_sample(&self, throughputs: &mut Throughputs, labels: &TrafficLabels, value: f64) -> Result<()> {
        let gt = self.graph_type;
        let (source_id, _) = labels.source_node_id(gt)?;
        let (dest_id, _) = labels.dest_node_id(gt)?;
        if labels.injects_service(self.inject_service_nodes, gt)? {
            let (service_id, _) = labels.service_node_id(gt)?;
            // request bytes are seen leaving the source, response bytes at the service
            if self.throughput_type == ThroughputType::Request {
                throughputs.add(source_id, service_id.clone(), value);
            }
            throughputs.add(service_id, dest_id, value);
        } else {
            throughputs.add(source_id, dest_id, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::payloads::HttpRate;
    use crate::testing::{
        connect, global_with, labelled, query_time, service_node, workload_node, MockInventory,
        MockMetrics,
    };

    const GT: GraphType = GraphType::VersionedApp;

    fn traffic() -> TrafficMap {
        let mut tm: TrafficMap = vec![
            workload_node("bookinfo", "productpage-v1", "productpage", "v1", GT),
            service_node("bookinfo", "reviews", GT),
            workload_node("bookinfo", "reviews-v1", "reviews", "v1", GT),
        ]
        .into_iter()
        .collect();
        connect(&mut tm, "vapp_east_bookinfo_productpage-v1", "svc_east_bookinfo_reviews", Protocol::Http, 10.0);
        connect(&mut tm, "vapp_east_bookinfo_productpage-v1", "svc_east_bookinfo_reviews", Protocol::Tcp, 10.0);
        connect(&mut tm, "svc_east_bookinfo_reviews", "vapp_east_bookinfo_reviews-v1", Protocol::Http, 10.0);
        tm
    }

    fn appender(throughput_type: ThroughputType) -> ThroughputAppender {
        ThroughputAppender {
            graph_type: GT,
            inject_service_nodes: true,
            namespaces: BTreeMap::new(),
            query_time: query_time(),
            rates: RequestedRates::default(),
            throughput_type,
        }
    }

    fn metrics(metric: &str) -> Arc<MockMetrics> {
        let series = labelled(
            ("bookinfo", "productpage-v1", "productpage", "v1"),
            "reviews",
            ("bookinfo", "reviews-v1", "reviews", "v1"),
            &[],
            1000.0,
        );
        Arc::new(MockMetrics::new().on(&[metric], vec![series]))
    }

    #[tokio::test]
    async fn test_response_throughput_on_service_hop() {
        let m = metrics("istio_response_bytes_sum");
        let global = global_with(m.clone(), Arc::new(MockInventory::new()));
        let mut tm = traffic();
        let ns = NamespaceInfo::new("bookinfo", Duration::from_secs(60));
        appender(ThroughputType::Response)
            .throughputs(&tm, &global, &ns)
            .await
            .unwrap()
            .apply(&mut tm);

        let productpage = &tm["vapp_east_bookinfo_productpage-v1"];
        assert_eq!(productpage.edges[0].metadata.throughput, None);
        assert_eq!(productpage.edges[1].metadata.throughput, None);
        assert_eq!(
            tm["svc_east_bookinfo_reviews"].edges[0].metadata.throughput,
            Some(1000.0)
        );
        assert!(m.queries()[0].contains(r#"reporter=~"waypoint|destination",source_workload_namespace!="bookinfo""#));
    }

    #[tokio::test]
    async fn test_request_throughput_on_both_hops() {
        let m = metrics("istio_request_bytes_sum");
        let global = global_with(m, Arc::new(MockInventory::new()));
        let mut tm = traffic();
        let ns = NamespaceInfo::new("bookinfo", Duration::from_secs(60));
        appender(ThroughputType::Request)
            .throughputs(&tm, &global, &ns)
            .await
            .unwrap()
            .apply(&mut tm);

        let productpage = &tm["vapp_east_bookinfo_productpage-v1"];
        assert_eq!(productpage.edges[0].metadata.throughput, Some(1000.0));
        // tcp edges carry no throughput
        assert_eq!(productpage.edges[1].metadata.throughput, None);
    }

    #[tokio::test]
    async fn test_http_not_requested() {
        let m = metrics("istio_request_bytes_sum");
        let global = global_with(m.clone(), Arc::new(MockInventory::new()));
        let mut t = appender(ThroughputType::Request);
        t.rates.http = HttpRate::None;
        let ns = NamespaceInfo::new("bookinfo", Duration::from_secs(60));
        let found = t.throughputs(&traffic(), &global, &ns).await.unwrap();
        assert_eq!(found, Throughputs::default());
        assert!(m.queries().is_empty());
        assert!(ThroughputType::parse("both").is_err());
    }
}
