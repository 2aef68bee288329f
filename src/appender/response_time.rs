use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::GlobalInfo;
use crate::error::Result;
use crate::graph::{GraphType, Protocol, TrafficMap};
use crate::payloads::{NamespaceInfo, RequestedRates};
use crate::prometheus::Vector;
use crate::telemetry::util::{handle_destination, prom_query, reporter, TrafficLabels};

pub const NAME: &str = "responseTime";

pub const DEFAULT_QUANTILE: f64 = 0.95;

const METRIC: &str = "istio_request_duration_milliseconds";

const GROUP_BY: &str = "source_cluster,source_workload_namespace,source_workload,source_canonical_service,source_canonical_revision,destination_cluster,destination_service_namespace,destination_service,destination_service_name,destination_workload_namespace,destination_workload,destination_canonical_service,destination_canonical_revision,request_protocol";

/// Annotates request edges with a response time quantile, or the average when the quantile
/// is zero. Values are milliseconds.
#[derive(Debug, Clone)]
pub struct ResponseTimeAppender {
    pub graph_type: GraphType,
    pub inject_service_nodes: bool,
    pub namespaces: BTreeMap<String, NamespaceInfo>,
    pub quantile: f64,
    pub query_time: DateTime<Utc>,
    pub rates: RequestedRates,
}

/// Response time per (source, dest, protocol). The first value seen for an edge is kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseTimes(BTreeMap<(String, String, Protocol), f64>);

impl ResponseTimes {
    fn add(&mut self, source: String, dest: String, protocol: Protocol, value: f64) {
        self.0.entry((source, dest, protocol)).or_insert(value);
    }

    pub fn get(&self, source: &str, dest: &str, protocol: Protocol) -> Option<f64> {
        self.0
            .get(&(source.to_string(), dest.to_string(), protocol))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn apply(self, traffic_map: &mut TrafficMap) {
        for node in traffic_map.values_mut() {
            for edge in node.edges.iter_mut() {
                let protocol = match edge.metadata.protocol {
                    Some(protocol) => protocol,
                    None => continue,
                };
                if let Some(value) = self.get(&edge.source, &edge.dest, protocol) {
                    edge.metadata.response_time = Some(value);
                }
            }
        }
    }
}

impl ResponseTimeAppender {
    fn query(&self, selector: &str, duration: u64) -> String {
        if self.quantile > 0.0 {
            format!(
                "histogram_quantile({}, sum(rate({}_bucket{{{}}}[{}s])) by (le,{})) > 0",
                self.quantile, METRIC, selector, duration, GROUP_BY
            )
        } else {
            format!(
                "sum(rate({m}_sum{{{s}}}[{d}s])) by ({g}) / sum(rate({m}_count{{{s}}}[{d}s])) by ({g}) > 0",
                m = METRIC,
                s = selector,
                d = duration,
                g = GROUP_BY
            )
        }
    }

    /// Queries, in order of preference: ambient ingress, destination reported, source reported.
    pub async fn response_times(
        &self,
        traffic_map: &TrafficMap,
        global: &GlobalInfo,
        namespace: &NamespaceInfo,
    ) -> Result<ResponseTimes> {
        let mut times = ResponseTimes::default();
        if traffic_map.is_empty() || !self.rates.has_requests() {
            return Ok(times);
        }

        let ns = &namespace.name;
        let duration = self
            .namespaces
            .get(ns)
            .map_or(namespace.duration, |n| n.duration)
            .as_secs();
        tracing::trace!(namespace = %ns, quantile = self.quantile, "resolving response times");

        let mut selectors = Vec::new();
        if namespace.is_ambient {
            selectors.push(format!(
                r#"reporter="source",source_workload_namespace!="{ns}",destination_service_namespace="{ns}""#,
                ns = ns
            ));
        }
        selectors.push(format!(
            r#"{},destination_service_namespace="{}""#,
            reporter("destination", &self.rates),
            ns
        ));
        selectors.push(format!(
            r#"{},source_workload_namespace="{}""#,
            reporter("source", &self.rates),
            ns
        ));

        for selector in selectors {
            let query = self.query(&selector, duration);
            let vector = prom_query(
                global.prom.as_ref(),
                &global.conf,
                &query,
                self.query_time,
                Some(NAME),
            )
            .await?;
            self.populate(&mut times, &vector, global);
        }
        Ok(times)
    }

    fn populate(&self, times: &mut ResponseTimes, vector: &Vector, global: &GlobalInfo) {
        for sample in vector {
            if !sample.value.is_finite() {
                continue;
            }
            let protocol = match sample.label("request_protocol").map(str::parse::<Protocol>) {
                Some(Ok(protocol)) => protocol,
                _ => {
                    tracing::warn!(metric = ?sample.metric, "skipping response time, missing or bad request_protocol");
                    continue;
                }
            };
            if !self.rates.wants_requests(protocol) {
                continue;
            }
            let mut labels = match TrafficLabels::parse(sample) {
                Ok(labels) => labels,
                Err(missing) => {
                    tracing::warn!(metric = ?sample.metric, missing, "skipping response time, missing expected label");
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

            let ids = labels.dest_node_id(self.graph_type).and_then(|(dest_id, _)| {
                // the service to destination hop is where the time is measured
                if labels.injects_service(self.inject_service_nodes, self.graph_type)? {
                    let (service_id, _) = labels.service_node_id(self.graph_type)?;
                    Ok((service_id, dest_id))
                } else {
                    let (source_id, _) = labels.source_node_id(self.graph_type)?;
                    Ok((source_id, dest_id))
                }
            });
            match ids {
                Ok((source_id, dest_id)) => times.add(source_id, dest_id, protocol, sample.value),
                Err(e) => tracing::warn!("skipping response time, {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::payloads::{GrpcRate, HttpRate};
    use crate::testing::{
        connect, global_with, labelled, query_time, service_node, workload_node, MockInventory,
        MockMetrics,
    };

    const GT: GraphType = GraphType::VersionedApp;

    fn traffic() -> TrafficMap {
        let mut tm: TrafficMap = vec![
            workload_node("istio-system", "ingressgateway", "ingressgateway", "", GT),
            service_node("bookinfo", "productpage", GT),
            workload_node("bookinfo", "productpage-v1", "productpage", "v1", GT),
            service_node("bookinfo", "reviews", GT),
            workload_node("bookinfo", "reviews-v1", "reviews", "v1", GT),
        ]
        .into_iter()
        .collect();
        connect(&mut tm, "vapp_east_istio-system_ingressgateway", "svc_east_bookinfo_productpage", Protocol::Http, 10.0);
        connect(&mut tm, "svc_east_bookinfo_productpage", "vapp_east_bookinfo_productpage-v1", Protocol::Http, 10.0);
        connect(&mut tm, "vapp_east_bookinfo_productpage-v1", "svc_east_bookinfo_reviews", Protocol::Http, 20.0);
        connect(&mut tm, "svc_east_bookinfo_reviews", "vapp_east_bookinfo_reviews-v1", Protocol::Http, 20.0);
        tm
    }

    fn appender(quantile: f64) -> ResponseTimeAppender {
        let ns = NamespaceInfo::new("bookinfo", Duration::from_secs(60));
        ResponseTimeAppender {
            graph_type: GT,
            inject_service_nodes: true,
            namespaces: [("bookinfo".to_string(), ns)].into_iter().collect(),
            quantile,
            query_time: query_time(),
            rates: RequestedRates::default(),
        }
    }

    fn series(source: (&str, &str, &str, &str), svc: &str, dest: (&str, &str, &str, &str), protocol: &str, value: f64) -> crate::prometheus::Sample {
        labelled(source, svc, dest, &[("request_protocol", protocol)], value)
    }

    #[tokio::test]
    async fn test_quantile_on_service_hops() {
        let ingress = ("istio-system", "ingressgateway", "ingressgateway", "latest");
        let productpage = ("bookinfo", "productpage-v1", "productpage", "v1");
        let reviews = ("bookinfo", "reviews-v1", "reviews", "v1");
        let metrics = Arc::new(
            MockMetrics::new()
                .on(
                    &["histogram_quantile(0.95", r#"reporter=~"waypoint|destination",destination_service_namespace="bookinfo""#],
                    vec![
                        series(ingress, "productpage", productpage, "http", 10.0),
                        series(productpage, "reviews", reviews, "http", 20.0),
                    ],
                )
                .on(
                    &[r#"reporter=~"waypoint|source",source_workload_namespace="bookinfo""#],
                    vec![series(productpage, "reviews", reviews, "http", 99.0)],
                ),
        );
        let global = global_with(metrics.clone(), Arc::new(MockInventory::new()));
        let mut tm = traffic();
        let ns = NamespaceInfo::new("bookinfo", Duration::from_secs(60));
        let times = appender(0.95).response_times(&tm, &global, &ns).await.unwrap();
        times.apply(&mut tm);

        let edge_rt = |source: &str| tm[source].edges[0].metadata.response_time;
        assert_eq!(edge_rt("vapp_east_istio-system_ingressgateway"), None);
        assert_eq!(edge_rt("svc_east_bookinfo_productpage"), Some(10.0));
        assert_eq!(edge_rt("vapp_east_bookinfo_productpage-v1"), None);
        // destination reported wins over source reported
        assert_eq!(edge_rt("svc_east_bookinfo_reviews"), Some(20.0));

        let queries = metrics.queries();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].starts_with("round(histogram_quantile(0.95, sum(rate(istio_request_duration_milliseconds_bucket{"));
        assert!(queries[0].contains("by (le,source_cluster,"));
        assert!(queries[0].ends_with("request_protocol)) > 0,0.001)"));
    }

    #[tokio::test]
    async fn test_average_without_injection() {
        let productpage = ("bookinfo", "productpage-v1", "productpage", "v1");
        let reviews = ("bookinfo", "reviews-v1", "reviews", "v1");
        let metrics = Arc::new(MockMetrics::new().on(
            &["_sum{", "_count{"],
            vec![
                series(productpage, "reviews", reviews, "http", 12.5),
                series(productpage, "reviews", reviews, "grpc", 3.0),
            ],
        ));
        let global = global_with(metrics.clone(), Arc::new(MockInventory::new()));
        let mut rt = appender(0.0);
        rt.inject_service_nodes = false;
        rt.rates.http = HttpRate::Requests;
        rt.rates.grpc = GrpcRate::None;

        let mut ns = NamespaceInfo::new("bookinfo", Duration::from_secs(60));
        ns.is_ambient = true;
        let times = rt.response_times(&traffic(), &global, &ns).await.unwrap();

        // grpc was not requested
        assert_eq!(times.len(), 1);
        assert_eq!(
            times.get("vapp_east_bookinfo_productpage-v1", "vapp_east_bookinfo_reviews-v1", Protocol::Http),
            Some(12.5)
        );
        let queries = metrics.queries();
        assert_eq!(queries.len(), 3);
        assert!(queries[0].contains(r#"reporter="source",source_workload_namespace!="bookinfo""#));
        assert!(queries[1].contains(") / sum(rate(istio_request_duration_milliseconds_count{"));
    }

    #[tokio::test]
    async fn test_skipped_without_request_rates() {
        let metrics = Arc::new(MockMetrics::new());
        let global = global_with(metrics.clone(), Arc::new(MockInventory::new()));
        let mut rt = appender(0.95);
        rt.rates.http = HttpRate::None;
        rt.rates.grpc = GrpcRate::None;
        let ns = NamespaceInfo::new("bookinfo", Duration::from_secs(60));
        assert!(rt.response_times(&traffic(), &global, &ns).await.unwrap().is_empty());
        assert!(metrics.queries().is_empty());
    }
}
