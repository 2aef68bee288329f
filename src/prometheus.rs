use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type LabelSet = BTreeMap<String, String>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: LabelSet,
    pub value: f64,
}

impl Sample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.metric.get(name).map(String::as_str)
    }
}

pub type Vector = Vec<Sample>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub vector: Vector,
    pub warnings: Vec<String>,
}

/// Executes instant queries against the metrics backend.
#[async_trait]
pub trait MetricsClient: Send + Sync {
    async fn query(&self, query: &str, eval_time: DateTime<Utc>) -> anyhow::Result<QueryResult>;
}
