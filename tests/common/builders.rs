//! Test data builders for creating test graphs

use flowgraph_rs::pipeline::{AttributeValue, Graph, NodeArgs, NodeId};
use flowgraph_rs::EngineSettings;
use std::collections::HashMap;

/// Builder for creating test graphs from registry node types
pub struct GraphBuilder {
    settings: EngineSettings,
    nodes: Vec<(String, String, NodeArgs)>,
    connections: Vec<(String, String, String, String)>,
}

impl GraphBuilder {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn node(self, type_key: &str, name: &str) -> Self {
        self.node_with(type_key, name, &[])
    }

    pub fn node_with(mut self, type_key: &str, name: &str, args: &[(&str, AttributeValue)]) -> Self {
        let args = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.nodes.push((type_key.to_string(), name.to_string(), args));
        self
    }

    /// Connect `from`'s `out` port to `to`'s `in` port
    pub fn link(self, from: &str, to: &str) -> Self {
        self.connect(from, "out", to, "in")
    }

    pub fn connect(mut self, from: &str, from_port: &str, to: &str, to_port: &str) -> Self {
        self.connections.push((
            from.to_string(),
            from_port.to_string(),
            to.to_string(),
            to_port.to_string(),
        ));
        self
    }

    /// Build the graph, returning node ids by name
    pub fn build(self) -> (Graph, HashMap<String, NodeId>) {
        let graph = Graph::with_settings(self.settings);
        let mut ids = HashMap::new();
        for (type_key, name, args) in &self.nodes {
            let id = graph
                .add_node_with(type_key, name, args)
                .unwrap_or_else(|e| panic!("failed to add '{}': {}", name, e));
            ids.insert(name.clone(), id);
        }
        for (from, from_port, to, to_port) in &self.connections {
            graph
                .connect_by_name(from, from_port, to, to_port)
                .unwrap_or_else(|e| panic!("failed to connect {} -> {}: {}", from, to, e));
        }
        (graph, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_builder() {
        let (graph, ids) = GraphBuilder::new(EngineSettings::default())
            .node_with("signal_source", "Source", &[("samplerate", AttributeValue::Int(250))])
            .node("collector_sink", "Sink")
            .link("Source", "Sink")
            .build();

        assert_eq!(graph.node_count(), 2);
        let sink = graph.node(ids["Sink"]).unwrap();
        assert_eq!(sink.inputs()[0].samplerate(), 250);
    }
}
