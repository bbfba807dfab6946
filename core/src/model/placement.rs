use crate::model::{Device, GraphDef};

/// Tag every node of the graph for the first accelerator.
pub fn place_on_accelerator(graph: &mut GraphDef) {
    for node in &mut graph.nodes {
        node.device = Device::accelerator(0);
    }
}

/// Reset every node of the graph to the host.
pub fn place_on_host(graph: &mut GraphDef) {
    for node in &mut graph.nodes {
        node.device = Device::host();
    }
}
