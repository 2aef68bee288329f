mod metadata;
mod protocol;
mod types;

pub use metadata::{
    EdgeMetadata, GatewayHosts, NodeMetadata, Rates, ResponseDetail, Responses, SeInfo,
    ServiceName, VirtualServiceHosts, WeInfo,
};
pub use protocol::{
    add_outgoing_edge_to_metadata, add_to_metadata, aggregate_edge_traffic,
    aggregate_node_traffic, is_grpc_error, Protocol, ProtocolInfo, Rate, RateKey, GRPC, HTTP,
    PROTOCOLS, TCP,
};
pub use types::{
    aggregate_id, node_id, Edge, GraphType, Node, NodeType, TrafficMap,
};

pub const UNKNOWN: &str = "unknown";
pub const PASSTHROUGH_CLUSTER: &str = "PassthroughCluster";
pub const BLACK_HOLE_CLUSTER: &str = "BlackHoleCluster";

/// True when the label value names a real entity.
pub fn is_ok(name: &str) -> bool {
    !name.is_empty() && name != UNKNOWN
}

pub fn is_ok_version(version: &str) -> bool {
    is_ok(version) && version != "latest"
}

pub fn is_egress_cluster(service: &str) -> bool {
    service == PASSTHROUGH_CLUSTER || service == BLACK_HOLE_CLUSTER
}
