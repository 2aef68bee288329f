//! Service mesh traffic graphs built from Istio telemetry.

pub mod api;
pub mod appender;
pub mod business;
pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod models;
pub mod payloads;
pub mod prometheus;
pub mod registry;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use api::{graph_namespaces, graph_node};
pub use error::{GraphError, Result};
