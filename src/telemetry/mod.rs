//! Builds traffic maps from mesh telemetry and runs the appender pipeline over them.

use futures::future::try_join_all;
use futures::{stream, StreamExt, TryStreamExt};

use crate::appender::{Appender, GlobalInfo};
use crate::error::{GraphError, Result};
use crate::graph::{GraphType, TrafficMap};
use crate::payloads::{NamespaceInfo, TelemetryOptions};
use crate::registry::parse_appenders;

pub mod builder;
pub mod merge;
pub mod node;
pub mod util;

pub use merge::{merge_traffic_maps, reduce_to_service_graph};

/// Splits namespace appenders into those that reshape the map, in registration order, and
/// those that only annotate it.
fn partition(appenders: &[Appender]) -> (Vec<&Appender>, Vec<&Appender>) {
    appenders.iter().partition(|a| !a.is_concurrent())
}

/// Runs the namespace appenders over one namespace map. Reshaping appenders run one after the
/// other; annotating appenders then run side by side against the settled map.
#[tracing::instrument(skip_all, fields(namespace = %namespace.name))]
pub async fn run_appenders(
    appenders: &[Appender],
    traffic_map: &mut TrafficMap,
    global: &GlobalInfo,
    namespace: &NamespaceInfo,
) -> Result<()> {
    let (sequential, concurrent) = partition(appenders);
    for appender in sequential {
        appender.append_graph(traffic_map, global, Some(namespace)).await?;
    }

    let settled: &TrafficMap = traffic_map;
    let annotations = try_join_all(
        concurrent
            .iter()
            .map(|a| a.annotate(settled, global, namespace)),
    )
    .await?;
    for annotations in annotations {
        annotations.apply(traffic_map);
    }
    Ok(())
}

async fn run_finalizers(
    finalizers: &[Appender],
    traffic_map: &mut TrafficMap,
    global: &GlobalInfo,
) -> Result<()> {
    for finalizer in finalizers {
        finalizer.append_graph(traffic_map, global, None).await?;
    }
    Ok(())
}

/// Builds the graph of every requested namespace. Namespaces are built concurrently and merged
/// in namespace order.
#[tracing::instrument(skip_all, fields(graph_type = %o.graph_type, namespaces = o.namespaces.len()))]
pub async fn build_namespaces_traffic_map(
    o: &TelemetryOptions,
    global: &GlobalInfo,
) -> Result<TrafficMap> {
    let (appenders, finalizers) = parse_appenders(o)?;
    let appenders = &appenders;

    let namespace_maps: Vec<(String, TrafficMap)> = stream::iter(o.namespaces.values())
        .map(|namespace| async move {
            let mut traffic_map = builder::build_namespace_traffic_map(namespace, o, global).await?;
            run_appenders(appenders, &mut traffic_map, global, namespace).await?;
            Ok::<_, GraphError>((namespace.name.clone(), traffic_map))
        })
        .buffered(global.conf.namespace_concurrency.max(1))
        .try_collect()
        .await?;

    let mut traffic_map = TrafficMap::new();
    for (namespace, namespace_map) in namespace_maps {
        merge_traffic_maps(&mut traffic_map, &namespace, namespace_map);
    }

    run_finalizers(&finalizers, &mut traffic_map, global).await?;

    if o.graph_type == GraphType::Service {
        traffic_map = reduce_to_service_graph(traffic_map);
    }
    tracing::debug!(nodes = traffic_map.len(), "graph built");
    Ok(traffic_map)
}

/// Builds the graph around the requested node. The node is always part of the result, and the
/// graph is never reduced to services.
#[tracing::instrument(skip_all, fields(graph_type = %o.graph_type))]
pub async fn build_node_traffic_map(o: &TelemetryOptions, global: &GlobalInfo) -> Result<TrafficMap> {
    let requested = node::requested_node(o, &global.conf.home_cluster)?;
    let mut o = o.clone();
    let namespace = o
        .namespaces
        .entry(requested.namespace.clone())
        .or_insert_with(|| NamespaceInfo::new(&requested.namespace, o.common.duration))
        .clone();
    let (appenders, finalizers) = parse_appenders(&o)?;

    let mut traffic_map = node::node_traffic_map(&requested, &namespace, &o, global).await?;
    run_appenders(&appenders, &mut traffic_map, global, &namespace).await?;
    node::add_requested_node(&mut traffic_map, requested);
    run_finalizers(&finalizers, &mut traffic_map, global).await?;

    tracing::debug!(nodes = traffic_map.len(), "node graph built");
    Ok(traffic_map)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::graph::RateKey;
    use crate::payloads::{NodeOptions, RequestedAppenders};
    use crate::testing::{
        global_info, global_with, query_time, request, MockInventory, MockMetrics, CLUSTER,
    };

    const PRODUCTPAGE: (&str, &str, &str, &str) = ("bookinfo", "productpage-v1", "productpage", "v1");
    const REVIEWS: (&str, &str, &str, &str) = ("bookinfo", "reviews-v1", "reviews", "v1");
    const RATINGS: (&str, &str, &str, &str) = ("backend", "ratings-v1", "ratings", "v1");

    fn options(graph_type: GraphType, namespaces: &[&str]) -> TelemetryOptions {
        let mut o = TelemetryOptions::new(graph_type, query_time(), Duration::from_secs(600));
        for ns in namespaces {
            o = o.with_namespace(CLUSTER, ns);
        }
        o.appenders = RequestedAppenders::named(&[]);
        o
    }

    #[test]
    fn test_partition_keeps_registration_order() {
        let mut o = options(GraphType::Workload, &["bookinfo"]);
        o.appenders = RequestedAppenders::default();
        let (appenders, _) = parse_appenders(&o).unwrap();
        let (sequential, concurrent) = partition(&appenders);
        let names = |group: &[&Appender]| group.iter().map(|a| a.name()).collect::<Vec<_>>();
        assert_eq!(
            names(&sequential),
            vec!["serviceEntry", "deadNode", "workloadEntry", "aggregateNode", "idleNode", "meshCheck"]
        );
        assert_eq!(names(&concurrent), vec!["responseTime", "securityPolicy", "throughput"]);
    }

    #[tokio::test]
    async fn test_namespaces_merge() {
        let to_ratings = request(REVIEWS, "ratings", RATINGS, "http", "200", 4.0);
        let metrics = MockMetrics::new()
            .on(
                &["istio_requests_total", r#"source_workload_namespace="bookinfo""#],
                vec![
                    request(PRODUCTPAGE, "reviews", REVIEWS, "http", "200", 10.0),
                    to_ratings.clone(),
                ],
            )
            .on(
                &["istio_requests_total", r#"destination_workload_namespace="backend""#],
                vec![to_ratings],
            );
        let global = global_info(metrics, MockInventory::new());
        let o = options(GraphType::Workload, &["bookinfo", "backend"]);

        let tm = build_namespaces_traffic_map(&o, &global).await.unwrap();

        let ids: Vec<&str> = tm.keys().map(String::as_str).collect();
        assert_eq!(
            ids,
            vec![
                "wl_east_backend_ratings-v1",
                "wl_east_bookinfo_productpage-v1",
                "wl_east_bookinfo_reviews-v1",
            ]
        );
        let reviews = &tm["wl_east_bookinfo_reviews-v1"];
        assert_eq!(reviews.edges.len(), 1);
        assert_eq!(reviews.metadata.rates.value(RateKey::HttpOut), 4.0);
        assert_eq!(reviews.metadata.rates.value(RateKey::HttpIn), 10.0);
        assert!(tm["wl_east_bookinfo_productpage-v1"].metadata.is_root);
        assert!(tm.values().all(|n| !n.metadata.is_outside));
    }

    #[tokio::test]
    async fn test_service_graph_is_reduced() {
        let metrics = MockMetrics::new().on(
            &["istio_requests_total", r#"source_workload_namespace="bookinfo""#],
            vec![
                request(PRODUCTPAGE, "reviews", REVIEWS, "http", "200", 10.0),
                request(REVIEWS, "ratings", ("bookinfo", "ratings-v1", "ratings", "v1"), "http", "200", 4.0),
            ],
        );
        let global = global_info(metrics, MockInventory::new());
        let o = options(GraphType::Service, &["bookinfo"]);

        let tm = build_namespaces_traffic_map(&o, &global).await.unwrap();

        let ids: Vec<&str> = tm.keys().map(String::as_str).collect();
        assert_eq!(
            ids,
            vec![
                "svc_east_bookinfo_ratings",
                "svc_east_bookinfo_reviews",
                "wl_east_bookinfo_productpage-v1",
            ]
        );
        let reviews = &tm["svc_east_bookinfo_reviews"];
        assert_eq!(reviews.edges[0].dest, "svc_east_bookinfo_ratings");
        assert_eq!(reviews.edges[0].metadata.rates.value(RateKey::Http), 4.0);
    }

    #[tokio::test]
    async fn test_node_graph_keeps_requested_node() {
        let metrics = Arc::new(MockMetrics::new());
        let global = global_with(metrics.clone(), Arc::new(MockInventory::new()));
        let mut o = options(GraphType::Workload, &[]);
        o.node = Some(NodeOptions {
            namespace: "bookinfo".to_string(),
            workload: "details-v1".to_string(),
            ..NodeOptions::default()
        });

        let tm = build_node_traffic_map(&o, &global).await.unwrap();

        assert_eq!(tm.len(), 1);
        let details = &tm["wl_east_bookinfo_details-v1"];
        assert!(details.metadata.is_idle);
        assert!(!details.metadata.is_outside);
        assert!(!metrics.queries().is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_aborts() {
        let global = global_info(MockMetrics::failing("connection refused"), MockInventory::new());
        let o = options(GraphType::App, &["bookinfo"]);
        let err = build_namespaces_traffic_map(&o, &global).await.unwrap_err();
        assert!(err.is_upstream());

        let mut o = options(GraphType::App, &["bookinfo"]);
        o.appenders = RequestedAppenders::named(&["bogus"]);
        let err = build_namespaces_traffic_map(&o, &global).await.unwrap_err();
        assert!(matches!(err, GraphError::BadRequest(_)));
    }
}
