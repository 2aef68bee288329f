use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

pub const DEFAULT_HOME_CLUSTER: &str = "Kubernetes";
pub const DEFAULT_ISTIO_NAMESPACE: &str = "istio-system";
pub const DEFAULT_MULTICLUSTER_SUFFIX: &str = "global";

/// Settings threaded through every builder and appender call.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    pub home_cluster: String,
    pub istio_namespace: String,
    pub multicluster_host_suffix: String,
    /// Label names consulted, in order, for a workload's app.
    pub app_label_names: Vec<String>,
    /// Label names consulted, in order, for a workload's version.
    pub version_label_names: Vec<String>,
    /// Label selectors injected into every metrics query.
    pub query_scope: BTreeMap<String, String>,
    pub namespace_concurrency: usize,
    pub health_workers: usize,
    pub health_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            home_cluster: DEFAULT_HOME_CLUSTER.to_string(),
            istio_namespace: DEFAULT_ISTIO_NAMESPACE.to_string(),
            multicluster_host_suffix: DEFAULT_MULTICLUSTER_SUFFIX.to_string(),
            app_label_names: vec![
                "service.istio.io/canonical-name".to_string(),
                "app.kubernetes.io/name".to_string(),
                "app".to_string(),
            ],
            version_label_names: vec![
                "service.istio.io/canonical-revision".to_string(),
                "app.kubernetes.io/version".to_string(),
                "version".to_string(),
            ],
            query_scope: BTreeMap::new(),
            namespace_concurrency: 4,
            health_workers: 20,
            health_timeout_secs: 30,
            request_timeout_secs: 60,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            home_cluster: env::var("SERVICEGRAPH_HOME_CLUSTER")
                .unwrap_or(defaults.home_cluster),
            istio_namespace: env::var("SERVICEGRAPH_ISTIO_NAMESPACE")
                .unwrap_or(defaults.istio_namespace),
            multicluster_host_suffix: env::var("SERVICEGRAPH_MULTICLUSTER_SUFFIX")
                .unwrap_or(defaults.multicluster_host_suffix),
            app_label_names: env::var("SERVICEGRAPH_APP_LABELS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.app_label_names),
            version_label_names: env::var("SERVICEGRAPH_VERSION_LABELS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.version_label_names),
            query_scope: env::var("SERVICEGRAPH_QUERY_SCOPE")
                .map(|v| parse_scope(&v))
                .unwrap_or(defaults.query_scope),
            namespace_concurrency: env_number("SERVICEGRAPH_NAMESPACE_CONCURRENCY")
                .unwrap_or(defaults.namespace_concurrency),
            health_workers: env_number("SERVICEGRAPH_HEALTH_WORKERS")
                .unwrap_or(defaults.health_workers),
            health_timeout_secs: env_number("SERVICEGRAPH_HEALTH_TIMEOUT_SECS")
                .unwrap_or(defaults.health_timeout_secs),
            request_timeout_secs: env_number("SERVICEGRAPH_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout_secs),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| GraphError::BadRequest(format!("config: {}", e)))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn is_istio_namespace(&self, namespace: &str) -> bool {
        namespace == self.istio_namespace
    }

    /// Host of the mesh egress gateway service in the control-plane namespace.
    pub fn egress_gateway_host(&self) -> String {
        format!(
            "istio-egressgateway.{}.svc.cluster.local",
            self.istio_namespace
        )
    }

    pub fn app_label<'a>(&self, labels: &'a BTreeMap<String, String>) -> Option<&'a str> {
        first_label(&self.app_label_names, labels)
    }

    pub fn version_label<'a>(&self, labels: &'a BTreeMap<String, String>) -> Option<&'a str> {
        first_label(&self.version_label_names, labels)
    }
}

fn first_label<'a>(names: &[String], labels: &'a BTreeMap<String, String>) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| labels.get(name))
        .map(String::as_str)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_scope(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_label_precedence() {
        let conf = Config::default();
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "reviews".to_string());
        assert_eq!(conf.app_label(&labels), Some("reviews"));

        labels.insert(
            "service.istio.io/canonical-name".to_string(),
            "reviews-canonical".to_string(),
        );
        assert_eq!(conf.app_label(&labels), Some("reviews-canonical"));
        assert_eq!(conf.version_label(&labels), None);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let conf = Config::from_json(r#"{"home_cluster": "east", "query_scope": {"mesh": "a"}}"#)
            .unwrap();
        assert_eq!(conf.home_cluster, "east");
        assert_eq!(conf.istio_namespace, DEFAULT_ISTIO_NAMESPACE);
        assert_eq!(conf.query_scope.get("mesh").map(String::as_str), Some("a"));
        assert_eq!(conf.health_workers, 20);

        assert!(Config::from_json("{").is_err());
    }

    #[test]
    fn test_parse_scope() {
        let scope = parse_scope("mesh=east, cluster = c1,broken");
        assert_eq!(scope.len(), 2);
        assert_eq!(scope["cluster"], "c1");
        assert_eq!(
            Config::default().egress_gateway_host(),
            "istio-egressgateway.istio-system.svc.cluster.local"
        );
    }
}
