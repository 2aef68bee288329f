use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const MESH_EXTERNAL: &str = "MESH_EXTERNAL";
pub const MESH_INTERNAL: &str = "MESH_INTERNAL";

const GATEWAY_MANAGED_LABEL: &str = "gateway.istio.io/managed";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkloadListItem {
    pub name: String,
    pub namespace: String,
    pub cluster: String,
    pub labels: BTreeMap<String, String>,
    pub istio_sidecar: bool,
    pub is_ambient: bool,
    pub is_gateway: bool,
    pub pod_count: usize,
    pub health_annotations: BTreeMap<String, String>,
}

impl WorkloadListItem {
    pub fn is_waypoint(&self) -> bool {
        self.labels.get(GATEWAY_MANAGED_LABEL).map(String::as_str)
            == Some("istio.io-mesh-controller")
    }

    pub fn is_ingress_gateway(&self) -> bool {
        matches!(
            self.labels.get("operator.istio.io/component").map(String::as_str),
            Some("IngressGateways")
        ) || self.labels.get("istio").map(String::as_str) == Some("ingressgateway")
    }

    pub fn is_egress_gateway(&self) -> bool {
        matches!(
            self.labels.get("operator.istio.io/component").map(String::as_str),
            Some("EgressGateways")
        ) || self.labels.get("istio").map(String::as_str) == Some("egressgateway")
    }

    /// In the mesh: sidecar injected, ambient captured, or a mesh proxy itself.
    pub fn is_in_mesh(&self) -> bool {
        self.istio_sidecar || self.is_ambient || self.is_gateway || self.is_waypoint()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceOverview {
    pub name: String,
    pub namespace: String,
    pub cluster: String,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub health_annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceEntry {
    pub name: String,
    pub namespace: String,
    pub hosts: Vec<String>,
    pub location: String,
    pub export_to: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DestinationRuleSubset {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub has_circuit_breaker: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DestinationRule {
    pub name: String,
    pub namespace: String,
    pub host: String,
    /// Circuit breaking set on the top level traffic policy.
    pub has_circuit_breaker: bool,
    pub subsets: Vec<DestinationRuleSubset>,
}

impl DestinationRule {
    /// Whether the rule breaks circuits for the service, or for one version of it.
    pub fn has_circuit_breaker_for(
        &self,
        namespace: &str,
        service: &str,
        version: Option<(&str, &str)>,
    ) -> bool {
        if !host_matches(&self.host, &self.namespace, namespace, service) {
            return false;
        }
        if self.has_circuit_breaker {
            return true;
        }
        self.subsets.iter().any(|subset| {
            subset.has_circuit_breaker
                && match version {
                    None => true,
                    Some((label, value)) => {
                        subset.labels.get(label).map(String::as_str) == Some(value)
                    }
                }
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct VirtualService {
    pub name: String,
    pub namespace: String,
    pub hosts: Vec<String>,
    pub has_fault_injection: bool,
    pub has_mirroring: bool,
    pub has_request_routing: bool,
    pub has_request_timeout: bool,
    pub has_tcp_traffic_shifting: bool,
    pub has_traffic_shifting: bool,
}

impl VirtualService {
    pub fn applies_to(&self, namespace: &str, service: &str) -> bool {
        self.hosts
            .iter()
            .any(|host| host_matches(host, &self.namespace, namespace, service))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkloadEntry {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Gateway {
    pub name: String,
    pub namespace: String,
    pub selector: BTreeMap<String, String>,
    pub hosts: Vec<String>,
}

impl Gateway {
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct IstioConfigList {
    pub destination_rules: Vec<DestinationRule>,
    pub gateways: Vec<Gateway>,
    pub service_entries: Vec<ServiceEntry>,
    pub virtual_services: Vec<VirtualService>,
    pub workload_entries: Vec<WorkloadEntry>,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HealthKind {
    App,
    Service,
    Workload,
}

/// Short, namespace-relative or fully qualified host referring to `namespace`/`service`.
/// `definition_namespace` resolves short hosts.
fn host_matches(host: &str, definition_namespace: &str, namespace: &str, service: &str) -> bool {
    if host == "*" {
        return definition_namespace == namespace;
    }
    let parts: Vec<&str> = host.split('.').collect();
    match parts.as_slice() {
        [name] => *name == service && definition_namespace == namespace,
        [name, ns, ..] => *name == service && *ns == namespace,
        [] => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_flags() {
        let mut w = WorkloadListItem::default();
        assert!(!w.is_in_mesh());
        w.labels.insert(
            GATEWAY_MANAGED_LABEL.to_string(),
            "istio.io-mesh-controller".to_string(),
        );
        assert!(w.is_waypoint());
        assert!(w.is_in_mesh());

        let mut g = WorkloadListItem::default();
        g.labels.insert("istio".to_string(), "egressgateway".to_string());
        assert!(g.is_egress_gateway());
        assert!(!g.is_ingress_gateway());
    }

    #[test]
    fn test_destination_rule_hosts() {
        let dr = DestinationRule {
            name: "reviews".to_string(),
            namespace: "bookinfo".to_string(),
            host: "reviews".to_string(),
            has_circuit_breaker: false,
            subsets: vec![DestinationRuleSubset {
                name: "v2".to_string(),
                labels: [("version".to_string(), "v2".to_string())].into_iter().collect(),
                has_circuit_breaker: true,
            }],
        };
        assert!(dr.has_circuit_breaker_for("bookinfo", "reviews", None));
        assert!(dr.has_circuit_breaker_for("bookinfo", "reviews", Some(("version", "v2"))));
        assert!(!dr.has_circuit_breaker_for("bookinfo", "reviews", Some(("version", "v1"))));
        assert!(!dr.has_circuit_breaker_for("other", "reviews", None));

        let vs = VirtualService {
            namespace: "bookinfo".to_string(),
            hosts: vec!["ratings.bookinfo.svc.cluster.local".to_string()],
            ..VirtualService::default()
        };
        assert!(vs.applies_to("bookinfo", "ratings"));
        assert!(!vs.applies_to("bookinfo", "reviews"));
    }
}
