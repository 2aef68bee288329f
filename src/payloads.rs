use std::collections::BTreeMap;
use std::ops::Deref;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::graph::{GraphType, Protocol};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AmbientRate {
    None,
    Total,
    Waypoint,
    Ztunnel,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GrpcRate {
    None,
    Requests,
    Sent,
    Received,
    Total,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HttpRate {
    None,
    Requests,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TcpRate {
    None,
    Sent,
    Received,
    Total,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct RequestedRates {
    pub ambient: AmbientRate,
    pub grpc: GrpcRate,
    pub http: HttpRate,
    pub tcp: TcpRate,
}

impl Default for RequestedRates {
    fn default() -> Self {
        RequestedRates {
            ambient: AmbientRate::Total,
            grpc: GrpcRate::Requests,
            http: HttpRate::Requests,
            tcp: TcpRate::Sent,
        }
    }
}

impl RequestedRates {
    pub fn has_requests(&self) -> bool {
        self.grpc == GrpcRate::Requests || self.http == HttpRate::Requests
    }

    /// Whether request counts of the protocol are requested.
    pub fn wants_requests(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Grpc => self.grpc == GrpcRate::Requests,
            Protocol::Http => self.http == HttpRate::Requests,
            Protocol::Tcp => false,
        }
    }
}

/// Appenders named by the request; `all` selects the default set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestedAppenders {
    pub all: bool,
    pub names: Vec<String>,
}

impl Default for RequestedAppenders {
    fn default() -> Self {
        RequestedAppenders {
            all: true,
            names: Vec::new(),
        }
    }
}

impl RequestedAppenders {
    pub fn named(names: &[&str]) -> Self {
        RequestedAppenders {
            all: false,
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub name: String,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    #[serde(default)]
    pub is_ambient: bool,
    #[serde(default)]
    pub is_istio: bool,
}

impl NamespaceInfo {
    pub fn new(name: &str, duration: Duration) -> Self {
        NamespaceInfo {
            name: name.to_string(),
            duration,
            is_ambient: false,
            is_istio: false,
        }
    }
}

/// A namespace the requester may see, on one cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccessibleNamespace {
    pub cluster: String,
    pub name: String,
    pub creation_timestamp: Option<DateTime<Utc>>,
}

pub type AccessibleNamespaces = BTreeMap<String, AccessibleNamespace>;

pub fn cluster_sensitive_key(cluster: &str, namespace: &str) -> String {
    format!("{}:{}", cluster, namespace)
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct NodeOptions {
    pub aggregate: String,
    pub aggregate_value: String,
    pub app: String,
    pub cluster: String,
    pub namespace: String,
    pub service: String,
    pub version: String,
    pub workload: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommonOptions {
    pub graph_type: GraphType,
    pub query_time: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TelemetryOptions {
    #[serde(flatten)]
    pub common: CommonOptions,
    pub accessible_namespaces: AccessibleNamespaces,
    #[serde(default)]
    pub appenders: RequestedAppenders,
    /// Appender parameters such as `responseTime`, `throughputType`, `aggregate`, `waypoints`.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub include_idle_edges: bool,
    #[serde(default)]
    pub inject_service_nodes: bool,
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceInfo>,
    #[serde(default)]
    pub node: Option<NodeOptions>,
    #[serde(default)]
    pub rates: RequestedRates,
}

impl Deref for TelemetryOptions {
    type Target = CommonOptions;

    fn deref(&self) -> &Self::Target {
        &self.common
    }
}

impl TelemetryOptions {
    pub fn new(graph_type: GraphType, query_time: DateTime<Utc>, duration: Duration) -> Self {
        TelemetryOptions {
            common: CommonOptions {
                graph_type,
                query_time,
                duration,
            },
            accessible_namespaces: AccessibleNamespaces::new(),
            appenders: RequestedAppenders::default(),
            params: BTreeMap::new(),
            include_idle_edges: false,
            // service graphs are built from a workload graph with injected service nodes
            inject_service_nodes: graph_type == GraphType::Service,
            namespaces: BTreeMap::new(),
            node: None,
            rates: RequestedRates::default(),
        }
    }

    /// Requests the namespace and grants access to it on `cluster`.
    pub fn with_namespace(mut self, cluster: &str, namespace: &str) -> Self {
        let info = NamespaceInfo::new(namespace, self.common.duration);
        self.namespaces.insert(namespace.to_string(), info);
        self.with_access(cluster, namespace)
    }

    pub fn with_access(mut self, cluster: &str, namespace: &str) -> Self {
        self.accessible_namespaces.insert(
            cluster_sensitive_key(cluster, namespace),
            AccessibleNamespace {
                cluster: cluster.to_string(),
                name: namespace.to_string(),
                creation_timestamp: None,
            },
        );
        self
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn is_accessible(&self, cluster: &str, namespace: &str) -> bool {
        self.accessible_namespaces
            .contains_key(&cluster_sensitive_key(cluster, namespace))
    }

    pub fn is_node_graph(&self) -> bool {
        self.node.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.common.duration.as_secs() == 0 {
            return Err(GraphError::BadRequest(
                "duration must be at least one second".to_string(),
            ));
        }
        match &self.node {
            Some(node) => {
                if node.namespace.is_empty() {
                    return Err(GraphError::BadRequest(
                        "node graph requires a namespace".to_string(),
                    ));
                }
                if node.aggregate.is_empty() != node.aggregate_value.is_empty() {
                    return Err(GraphError::BadRequest(
                        "aggregate and aggregateValue must be set together".to_string(),
                    ));
                }
            }
            None => {
                if self.namespaces.is_empty() {
                    return Err(GraphError::BadRequest(
                        "at least one namespace is required".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
