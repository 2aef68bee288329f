//! Resolves the appenders a request asks for into configured passes.

use lazy_static::lazy_static;
use regex::Regex;

use crate::appender::{
    aggregate_node, ambient, dead_node, health, idle_node, istio_details, labeler, mesh_check,
    outsider, response_time, security_policy, service_entry, throughput, traffic_generator,
    workload_entry, AggregateNodeAppender, AmbientAppender, Appender, DeadNodeAppender,
    HealthAppender, IdleNodeAppender, IstioAppender, LabelerAppender, MeshCheckAppender,
    OutsiderAppender, ResponseTimeAppender, SecurityPolicyAppender, ServiceEntryAppender,
    ThroughputAppender, TrafficGeneratorAppender, WorkloadEntryAppender,
};
use crate::appender::throughput::ThroughputType;
use crate::error::{GraphError, Result};
use crate::payloads::TelemetryOptions;

lazy_static! {
    static ref LABEL_NAME: Regex = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap();
}

const KNOWN: [&str; 15] = [
    aggregate_node::NAME,
    ambient::NAME,
    dead_node::NAME,
    health::NAME,
    idle_node::NAME,
    istio_details::NAME,
    labeler::NAME,
    mesh_check::NAME,
    mesh_check::SIDECARS_CHECK_NAME,
    outsider::NAME,
    response_time::NAME,
    security_policy::NAME,
    service_entry::NAME,
    throughput::NAME,
    traffic_generator::NAME,
];

/// The named appenders of a request, or every default one when `all` is set.
struct Requested<'a> {
    all: bool,
    names: Vec<&'a str>,
}

impl Requested<'_> {
    fn wants(&self, name: &str) -> bool {
        self.all || self.explicit(name)
    }

    fn explicit(&self, name: &str) -> bool {
        self.names.contains(&name)
    }
}

fn quantile(param: Option<&str>) -> Result<f64> {
    match param {
        None => Ok(response_time::DEFAULT_QUANTILE),
        Some("avg") => Ok(0.0),
        Some("50") => Ok(0.5),
        Some("95") => Ok(0.95),
        Some("99") => Ok(0.99),
        Some(other) => Err(GraphError::BadRequest(format!(
            "invalid responseTime [{}], expecting one of avg, 50, 95, 99",
            other
        ))),
    }
}

fn aggregate(o: &TelemetryOptions) -> Result<String> {
    let from_node = o
        .node
        .as_ref()
        .map(|n| n.aggregate.as_str())
        .filter(|a| !a.is_empty());
    let aggregate = from_node
        .or_else(|| o.param("aggregate"))
        .unwrap_or(aggregate_node::DEFAULT_AGGREGATE);
    if !LABEL_NAME.is_match(aggregate) {
        return Err(GraphError::BadRequest(format!(
            "invalid aggregate [{}]",
            aggregate
        )));
    }
    Ok(aggregate.to_string())
}

/// Builds the per-namespace appenders and the finalizers, each in run order.
pub fn parse_appenders(o: &TelemetryOptions) -> Result<(Vec<Appender>, Vec<Appender>)> {
    let requested = Requested {
        all: o.appenders.all,
        names: o
            .appenders
            .names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .collect(),
    };
    if let Some(unknown) = requested.names.iter().find(|n| !KNOWN.contains(*n)) {
        return Err(GraphError::BadRequest(format!(
            "appender [{}] is not supported",
            unknown
        )));
    }

    let mut appenders = Vec::new();
    if requested.wants(service_entry::NAME) {
        appenders.push(Appender::ServiceEntry(ServiceEntryAppender {
            accessible_namespaces: o.accessible_namespaces.clone(),
        }));
    }
    if requested.wants(dead_node::NAME) {
        appenders.push(Appender::DeadNode(DeadNodeAppender {
            accessible_namespaces: o.accessible_namespaces.clone(),
        }));
    }
    if requested.wants(workload_entry::NAME) {
        appenders.push(Appender::WorkloadEntry(WorkloadEntryAppender {
            accessible_namespaces: o.accessible_namespaces.clone(),
        }));
    }
    if requested.wants(response_time::NAME) {
        appenders.push(Appender::ResponseTime(ResponseTimeAppender {
            graph_type: o.graph_type,
            inject_service_nodes: o.inject_service_nodes,
            namespaces: o.namespaces.clone(),
            quantile: quantile(o.param("responseTime"))?,
            query_time: o.query_time,
            rates: o.rates,
        }));
    }
    if requested.wants(security_policy::NAME) {
        appenders.push(Appender::SecurityPolicy(SecurityPolicyAppender {
            graph_type: o.graph_type,
            inject_service_nodes: o.inject_service_nodes,
            namespaces: o.namespaces.clone(),
            query_time: o.query_time,
            rates: o.rates,
        }));
    }
    if requested.wants(throughput::NAME) {
        let throughput_type = match o.param("throughputType") {
            Some(value) => ThroughputType::parse(value)?,
            None => ThroughputType::Response,
        };
        appenders.push(Appender::Throughput(ThroughputAppender {
            graph_type: o.graph_type,
            inject_service_nodes: o.inject_service_nodes,
            namespaces: o.namespaces.clone(),
            query_time: o.query_time,
            rates: o.rates,
            throughput_type,
        }));
    }
    if requested.wants(aggregate_node::NAME) {
        let node = o.node.as_ref();
        let non_empty = |value: &str| Some(value.to_string()).filter(|v| !v.is_empty());
        appenders.push(Appender::AggregateNode(AggregateNodeAppender {
            aggregate: aggregate(o)?,
            aggregate_value: node.and_then(|n| non_empty(&n.aggregate_value)),
            graph_type: o.graph_type,
            inject_service_nodes: o.inject_service_nodes,
            namespaces: o.namespaces.clone(),
            query_time: o.query_time,
            rates: o.rates,
            service: node.and_then(|n| non_empty(&n.service)),
        }));
    }
    if requested.wants(idle_node::NAME) {
        let is_node_graph = o.node.as_ref().map_or(false, |n| {
            !n.app.is_empty() || !n.workload.is_empty() || !n.service.is_empty()
        });
        appenders.push(Appender::IdleNode(IdleNodeAppender {
            graph_type: o.graph_type,
            inject_service_nodes: o.inject_service_nodes,
            is_node_graph,
        }));
    }
    if requested.wants(mesh_check::NAME) || requested.wants(mesh_check::SIDECARS_CHECK_NAME) {
        appenders.push(Appender::MeshCheck(MeshCheckAppender {
            accessible_namespaces: o.accessible_namespaces.clone(),
        }));
    }

    let mut finalizers = vec![Appender::Outsider(OutsiderAppender {
        accessible_namespaces: o.accessible_namespaces.clone(),
        namespaces: o.namespaces.clone(),
    })];
    if requested.explicit(istio_details::NAME) {
        finalizers.push(Appender::Istio(IstioAppender {
            accessible_namespaces: o.accessible_namespaces.clone(),
            namespaces: o.namespaces.clone(),
        }));
    }
    if requested.wants(ambient::NAME) {
        let show_waypoints = match o.param("waypoints") {
            Some(value) => value.parse::<bool>().map_err(|_| {
                GraphError::BadRequest(format!("invalid waypoints [{}], expecting a bool", value))
            })?,
            None => ambient::DEFAULT_SHOW_WAYPOINTS,
        };
        finalizers.push(Appender::Ambient(AmbientAppender { show_waypoints }));
    }
    if requested.explicit(health::NAME) {
        finalizers.push(Appender::Health(HealthAppender {
            duration: o.duration,
            query_time: o.query_time,
        }));
    }
    if requested.explicit(labeler::NAME) {
        finalizers.push(Appender::Labeler(LabelerAppender));
    }
    finalizers.push(Appender::TrafficGenerator(TrafficGeneratorAppender));

    tracing::debug!(
        appenders = ?appenders.iter().map(Appender::name).collect::<Vec<_>>(),
        finalizers = ?finalizers.iter().map(Appender::name).collect::<Vec<_>>(),
        "appenders resolved"
    );
    Ok((appenders, finalizers))
}
