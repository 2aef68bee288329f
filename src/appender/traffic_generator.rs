use crate::graph::TrafficMap;

pub const NAME: &str = "trafficGenerator";

/// Marks nodes that only send traffic as roots.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficGeneratorAppender;

impl TrafficGeneratorAppender {
    pub fn append_graph(&self, traffic_map: &mut TrafficMap) {
        let dests = traffic_map.dest_ids();
        for node in traffic_map.values_mut() {
            if !node.edges.is_empty() && !dests.contains(&node.id) {
                node.metadata.is_root = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphType, Protocol};
    use crate::testing::{service_node, workload_node};

    #[test]
    fn test_roots() {
        let gt = GraphType::Workload;
        let mut tm: TrafficMap = vec![
            workload_node("bookinfo", "loadgen", "", "", gt),
            service_node("bookinfo", "productpage", gt),
            workload_node("bookinfo", "productpage-v1", "productpage", "v1", gt),
            workload_node("bookinfo", "idle-v1", "idle", "v1", gt),
        ]
        .into_iter()
        .collect();
        tm.get_mut("wl_east_bookinfo_loadgen")
            .unwrap()
            .find_or_add_edge("svc_east_bookinfo_productpage", Protocol::Http);
        tm.get_mut("svc_east_bookinfo_productpage")
            .unwrap()
            .find_or_add_edge("wl_east_bookinfo_productpage-v1", Protocol::Http);

        TrafficGeneratorAppender.append_graph(&mut tm);

        let roots: Vec<&str> = tm
            .values()
            .filter(|n| n.metadata.is_root)
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(roots, vec!["wl_east_bookinfo_loadgen"]);
    }
}
