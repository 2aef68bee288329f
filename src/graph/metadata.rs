use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::protocol::{Protocol, RateKey};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Rates(BTreeMap<RateKey, f64>);

impl Rates {
    /// Adds `value` to the rate. Non-positive values are ignored.
    pub fn add(&mut self, key: RateKey, value: f64) {
        if value <= 0.0 {
            return;
        }
        *self.0.entry(key).or_insert(0.0) += value;
    }

    pub fn set(&mut self, key: RateKey, value: f64) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: RateKey) -> Option<f64> {
        self.0.get(&key).copied()
    }

    /// The rate, or zero when it was never recorded.
    pub fn value(&self, key: RateKey) -> f64 {
        self.get(key).unwrap_or(0.0)
    }

    pub fn remove(&mut self, key: RateKey) -> Option<f64> {
        self.0.remove(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RateKey, f64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResponseDetail {
    pub flags: BTreeMap<String, f64>,
    pub hosts: BTreeMap<String, f64>,
}

/// Response code to its breakdown by flags and by host.
pub type Responses = BTreeMap<String, ResponseDetail>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
}

impl ServiceName {
    pub fn key(&self) -> String {
        format!("{} {} {}", self.cluster, self.namespace, self.name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SeInfo {
    pub hosts: Vec<String>,
    pub location: String,
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WeInfo {
    pub name: String,
}

/// Virtual service name to its hosts.
pub type VirtualServiceHosts = BTreeMap<String, Vec<String>>;

/// Gateway name to the hosts it exposes.
pub type GatewayHosts = BTreeMap<String, Vec<String>>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeMetadata {
    pub rates: Rates,
    pub dest_services: Option<BTreeMap<String, ServiceName>>,
    pub labels: Option<BTreeMap<String, String>>,
    pub aggregate: Option<String>,
    pub aggregate_value: Option<String>,
    pub is_dead: bool,
    pub is_egress_cluster: bool,
    pub is_idle: bool,
    pub is_inaccessible: bool,
    pub is_misconfigured: Option<String>,
    pub is_out_of_mesh: bool,
    pub is_outside: bool,
    pub is_root: bool,
    pub is_service_entry: Option<SeInfo>,
    pub is_waypoint: bool,
    pub is_ingress_gateway: Option<GatewayHosts>,
    pub is_egress_gateway: Option<GatewayHosts>,
    pub has_workload_entry: Option<Vec<WeInfo>>,
    #[serde(rename = "hasCB")]
    pub has_cb: bool,
    #[serde(rename = "hasVS")]
    pub has_vs: Option<VirtualServiceHosts>,
    pub has_fault_injection: bool,
    pub has_mirroring: bool,
    pub has_request_routing: bool,
    pub has_request_timeout: bool,
    pub has_tcp_traffic_shifting: bool,
    pub has_traffic_shifting: bool,
    pub has_health_config: Option<BTreeMap<String, String>>,
    pub health_data: Option<serde_json::Value>,
    pub health_data_app: Option<serde_json::Value>,
}

impl NodeMetadata {
    pub fn add_dest_service(&mut self, cluster: &str, namespace: &str, name: &str) {
        let service = ServiceName {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.dest_services
            .get_or_insert_with(BTreeMap::new)
            .insert(service.key(), service);
    }

    pub fn has_dest_service(&self, key: &str) -> bool {
        self.dest_services
            .as_ref()
            .map_or(false, |services| services.contains_key(key))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EdgeMetadata {
    pub protocol: Option<Protocol>,
    pub rates: Rates,
    pub responses: Responses,
    pub response_time: Option<f64>,
    pub throughput: Option<f64>,
    #[serde(rename = "isMTLS")]
    pub is_mtls: Option<f64>,
    pub source_principal: Option<String>,
    pub dest_principal: Option<String>,
    /// Time series already counted on this edge.
    #[serde(skip)]
    pub ts_hashes: HashSet<Uuid>,
}

impl EdgeMetadata {
    pub fn add_response(&mut self, code: &str, flags: &str, host: &str, value: f64) {
        let detail = self.responses.entry(code.to_string()).or_default();
        *detail.flags.entry(flags.to_string()).or_insert(0.0) += value;
        if super::is_ok(host) {
            *detail.hosts.entry(host.to_string()).or_insert(0.0) += value;
        }
    }

    pub fn add_responses(&mut self, responses: &Responses) {
        for (code, detail) in responses {
            let into = self.responses.entry(code.clone()).or_default();
            for (flags, value) in &detail.flags {
                *into.flags.entry(flags.clone()).or_insert(0.0) += value;
            }
            for (host, value) in &detail.hosts {
                *into.hosts.entry(host.clone()).or_insert(0.0) += value;
            }
        }
    }
}
