use std::collections::{BTreeMap, BTreeSet};

use super::GlobalInfo;
use crate::config::Config;
use crate::error::Result;
use crate::graph::{is_ok, GatewayHosts, Node, NodeType, TrafficMap};
use crate::models::{DestinationRule, Gateway, ServiceOverview, VirtualService, WorkloadListItem};
use crate::payloads::{cluster_sensitive_key, AccessibleNamespaces, NamespaceInfo};

pub const NAME: &str = "istio";

/// Badges nodes with the Istio configuration that applies to them: circuit breakers, virtual
/// services and gateway hosts. Service nodes missing an app also get it from the service.
#[derive(Debug, Clone, Default)]
pub struct IstioAppender {
    pub accessible_namespaces: AccessibleNamespaces,
    pub namespaces: BTreeMap<String, NamespaceInfo>,
}

fn has_circuit_breaker(node: &Node, rules: &[DestinationRule], conf: &Config) -> bool {
    let version_ok = is_ok(&node.version);
    let dest_services = || node.metadata.dest_services.iter().flat_map(|s| s.values());
    match node.node_type {
        NodeType::Service => rules
            .iter()
            .any(|dr| dr.has_circuit_breaker_for(&node.namespace, &node.service, None)),
        _ if version_ok => dest_services().any(|ds| {
            rules.iter().any(|dr| {
                conf.version_label_names.iter().any(|label| {
                    dr.has_circuit_breaker_for(&ds.namespace, &ds.name, Some((label, &node.version)))
                })
            })
        }),
        NodeType::App => dest_services().any(|ds| {
            rules
                .iter()
                .any(|dr| dr.has_circuit_breaker_for(&ds.namespace, &ds.name, None))
        }),
        _ => false,
    }
}

fn apply_virtual_service(node: &mut Node, services: &[VirtualService]) {
    let vs = match services
        .iter()
        .find(|vs| vs.applies_to(&node.namespace, &node.service))
    {
        Some(vs) => vs,
        None => return,
    };
    let md = &mut node.metadata;
    let hosts = md.has_vs.get_or_insert_with(BTreeMap::new);
    if !vs.hosts.is_empty() {
        hosts.insert(vs.name.clone(), vs.hosts.clone());
    }
    md.has_request_routing |= vs.has_request_routing;
    md.has_request_timeout |= vs.has_request_timeout;
    md.has_fault_injection |= vs.has_fault_injection;
    md.has_traffic_shifting |= vs.has_traffic_shifting;
    md.has_tcp_traffic_shifting |= vs.has_tcp_traffic_shifting;
    md.has_mirroring |= vs.has_mirroring;
}

/// The app label of the service behind a service node that has none.
fn service_app(node: &Node, services: &[ServiceOverview], conf: &Config) -> Option<String> {
    if node.node_type != NodeType::Service || !node.app.is_empty() {
        return None;
    }
    let app_of = |name: &str| {
        services
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| conf.app_label(&s.labels))
            .map(str::to_string)
    };
    if let Some(se) = &node.metadata.is_service_entry {
        return se.hosts.iter().find_map(|host| {
            let parts: Vec<&str> = host.split('.').collect();
            if parts.len() == 3 && parts[2] == conf.multicluster_host_suffix {
                app_of(host)
            } else {
                app_of(parts[0])
            }
        });
    }
    if node.metadata.is_egress_cluster {
        return None;
    }
    let app = app_of(&node.service);
    if app.is_none() {
        tracing::debug!(namespace = %node.namespace, service = %node.service, "service not found, app label not applied");
    }
    app
}

fn gateway_hosts(
    node: &Node,
    workloads: &[WorkloadListItem],
    gateways: &[Gateway],
    conf: &Config,
) -> Option<GatewayHosts> {
    if node.app.is_empty() {
        return None;
    }
    let workload = workloads.iter().find(|w| {
        w.cluster == node.cluster
            && w.namespace == node.namespace
            && conf.app_label(&w.labels) == Some(node.app.as_str())
    })?;
    Some(
        gateways
            .iter()
            .filter(|g| g.selects(&workload.labels))
            .map(|g| (g.name.clone(), g.hosts.clone()))
            .collect(),
    )
}

impl IstioAppender {
    pub async fn append_graph(&self, traffic_map: &mut TrafficMap, global: &GlobalInfo) -> Result<()> {
        if traffic_map.is_empty() {
            return Ok(());
        }

        let targets: BTreeSet<(String, String)> = traffic_map
            .values()
            .filter(|n| self.is_target(&n.cluster, &n.namespace))
            .map(|n| (n.cluster.clone(), n.namespace.clone()))
            .collect();
        let virtual_services = self.virtual_services(global).await?;

        for (cluster, namespace) in &targets {
            let config = global.istio_config(cluster, namespace).await?;
            let services = global.service_list(cluster, namespace).await?;
            let no_virtual_services = Vec::new();
            let cluster_services = virtual_services.get(cluster).unwrap_or(&no_virtual_services);

            for node in traffic_map
                .values_mut()
                .filter(|n| &n.cluster == cluster && &n.namespace == namespace)
            {
                if has_circuit_breaker(node, &config.destination_rules, &global.conf) {
                    node.metadata.has_cb = true;
                }
                if node.node_type == NodeType::Service {
                    apply_virtual_service(node, cluster_services);
                }
                if let Some(app) = service_app(node, &services, &global.conf) {
                    node.app = app;
                }
            }
        }

        self.decorate_gateways(traffic_map, global).await
    }

    fn is_target(&self, cluster: &str, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
            && self
                .accessible_namespaces
                .contains_key(&cluster_sensitive_key(cluster, namespace))
    }

    /// Virtual services of every accessible namespace, by cluster.
    async fn virtual_services(&self, global: &GlobalInfo) -> Result<BTreeMap<String, Vec<VirtualService>>> {
        let mut by_cluster: BTreeMap<String, Vec<VirtualService>> = BTreeMap::new();
        for ns in self.accessible_namespaces.values() {
            let config = global.istio_config(&ns.cluster, &ns.name).await?;
            by_cluster
                .entry(ns.cluster.clone())
                .or_default()
                .extend(config.virtual_services.iter().cloned());
        }
        Ok(by_cluster)
    }

    async fn decorate_gateways(&self, traffic_map: &mut TrafficMap, global: &GlobalInfo) -> Result<()> {
        let mut ingress = Vec::new();
        let mut egress = Vec::new();
        for ns in self.accessible_namespaces.values() {
            for w in global.workload_list(&ns.cluster, &ns.name).await?.iter() {
                if w.is_ingress_gateway() {
                    ingress.push(w.clone());
                } else if w.is_egress_gateway() {
                    egress.push(w.clone());
                }
            }
        }
        if ingress.is_empty() && egress.is_empty() {
            return Ok(());
        }

        let mut gateways = Vec::new();
        for ns in self.accessible_namespaces.values() {
            let config = global.istio_config(&ns.cluster, &ns.name).await?;
            gateways.extend(config.gateways.iter().cloned());
        }

        for node in traffic_map.values_mut() {
            if !matches!(node.node_type, NodeType::App | NodeType::Workload) {
                continue;
            }
            if let Some(hosts) = gateway_hosts(node, &ingress, &gateways, &global.conf) {
                node.metadata.is_ingress_gateway = Some(hosts);
            }
            if let Some(hosts) = gateway_hosts(node, &egress, &gateways, &global.conf) {
                node.metadata.is_egress_gateway = Some(hosts);
            }
        }
        Ok(())
    }
}
