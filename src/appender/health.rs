use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::GlobalInfo;
use crate::error::{GraphError, Result};
use crate::graph::{is_ok, Node, NodeType, TrafficMap, UNKNOWN};
use crate::models::HealthKind;

pub const NAME: &str = "health";

/// Annotations with this prefix configure health evaluation of a workload or service.
pub const HEALTH_ANNOTATION_PREFIX: &str = "health.kiali.io/";

type HealthKey = (String, HealthKind);

/// Attaches health payloads to nodes. Health is fetched once per namespace and entity kind, on
/// a bounded pool of workers.
#[derive(Debug, Clone)]
pub struct HealthAppender {
    pub duration: Duration,
    pub query_time: DateTime<Utc>,
}

/// Where a fetched payload lands on a node.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Data,
    AppData,
}

/// The (kind, entity name, slot) lookups a node needs.
fn lookups(node: &Node) -> Vec<(HealthKind, &str, Slot)> {
    match node.node_type {
        NodeType::App if is_ok(&node.workload) => vec![
            (HealthKind::Workload, node.workload.as_str(), Slot::Data),
            (HealthKind::App, node.app.as_str(), Slot::AppData),
        ],
        NodeType::App => vec![(HealthKind::App, node.app.as_str(), Slot::Data)],
        NodeType::Workload => vec![(HealthKind::Workload, node.workload.as_str(), Slot::Data)],
        NodeType::Service => vec![(HealthKind::Service, node.service.as_str(), Slot::Data)],
        NodeType::Aggregate | NodeType::Unknown => Vec::new(),
    }
}

fn is_candidate(node: &Node) -> bool {
    !node.metadata.is_inaccessible && node.namespace != UNKNOWN && !node.namespace.is_empty()
}

fn health_config(annotations: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    let config: BTreeMap<String, String> = annotations
        .iter()
        .filter(|(k, _)| k.starts_with(HEALTH_ANNOTATION_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if config.is_empty() {
        None
    } else {
        Some(config)
    }
}

impl HealthAppender {
    pub async fn append_graph(&self, traffic_map: &mut TrafficMap, global: &GlobalInfo) -> Result<()> {
        if traffic_map.is_empty() {
            return Ok(());
        }
        self.attach_health_config(traffic_map, global).await?;

        let requests: BTreeSet<HealthKey> = traffic_map
            .values()
            .filter(|n| is_candidate(n))
            .flat_map(|n| {
                lookups(n)
                    .into_iter()
                    .map(move |(kind, _, _)| (n.namespace.clone(), kind))
            })
            .collect();
        if requests.is_empty() {
            return Ok(());
        }

        let timeout = global.conf.health_timeout();
        let health = tokio::time::timeout(timeout, self.fetch_all(requests, global))
            .await
            .map_err(|_| GraphError::Timeout(timeout))??;

        let missing = Value::Array(Vec::new());
        for node in traffic_map.values_mut().filter(|n| is_candidate(n)) {
            let found: Vec<(Slot, Value)> = lookups(node)
                .into_iter()
                .map(|(kind, name, slot)| {
                    let value = health
                        .get(&(node.namespace.clone(), kind))
                        .and_then(|by_name| by_name.get(name))
                        .cloned()
                        .unwrap_or_else(|| missing.clone());
                    (slot, value)
                })
                .collect();
            for (slot, value) in found {
                match slot {
                    Slot::Data => node.metadata.health_data = Some(value),
                    Slot::AppData => node.metadata.health_data_app = Some(value),
                }
            }
        }
        Ok(())
    }

    async fn attach_health_config(&self, traffic_map: &mut TrafficMap, global: &GlobalInfo) -> Result<()> {
        for node in traffic_map.values_mut().filter(|n| is_candidate(n)) {
            let annotations = match node.node_type {
                NodeType::Service => global
                    .service_definition(&node.cluster, &node.namespace, &node.service)
                    .await?
                    .map(|s| s.health_annotations),
                NodeType::Workload => global
                    .workload(&node.cluster, &node.namespace, &node.workload)
                    .await?
                    .map(|w| w.health_annotations),
                _ => None,
            };
            if let Some(config) = annotations.as_ref().and_then(health_config) {
                node.metadata.has_health_config = Some(config);
            }
        }
        Ok(())
    }

    /// Runs every request, then fails with the first error if any request failed.
    async fn fetch_all(
        &self,
        requests: BTreeSet<HealthKey>,
        global: &GlobalInfo,
    ) -> Result<BTreeMap<HealthKey, BTreeMap<String, Value>>> {
        let workers = Arc::new(Semaphore::new(global.conf.health_workers.max(1)));
        let mut tasks = JoinSet::new();
        for (namespace, kind) in requests {
            let workers = workers.clone();
            let business = global.business.clone();
            let (duration, query_time) = (self.duration, self.query_time);
            tasks.spawn(async move {
                let _permit = workers.acquire_owned().await;
                let result = business
                    .namespace_health(&namespace, kind, duration, query_time)
                    .await;
                ((namespace, kind), result)
            });
        }

        let mut health = BTreeMap::new();
        let mut first_error: Option<GraphError> = None;
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok((key, Ok(by_name))) => {
                    health.insert(key, by_name);
                    continue;
                }
                Ok(((namespace, kind), Err(e))) => {
                    tracing::warn!(%namespace, ?kind, error = %e, "health fetch failed");
                    GraphError::Upstream(e)
                }
                Err(e) => GraphError::Internal(format!("health worker: {}", e)),
            };
            if first_error.is_none() {
                first_error = Some(error);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(health),
        }
    }
}
