//! Node type registry for dynamic node creation.
//!
//! Graphs create nodes by type key, both from code and when loading a graph
//! document. The registry maps each key to a constructor and describes the
//! type for listings.

use crate::error::{EngineError, Result};
use crate::pipeline::attributes::AttributeValue;
use crate::pipeline::node::NodeBehavior;
use crate::pipeline::{nodes, read, write};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Construction arguments, by name.
pub type NodeArgs = BTreeMap<String, AttributeValue>;

/// Builds a behavior from construction arguments.
pub type NodeConstructor = Arc<dyn Fn(&NodeArgs) -> Result<Box<dyn NodeBehavior>> + Send + Sync>;

/// Where a node type sits in a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCategory {
    /// Produces data, has no inputs.
    Source,
    /// Consumes and produces data.
    Transform,
    /// Consumes data, has no outputs.
    Sink,
}

impl NodeCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            NodeCategory::Source => "Source",
            NodeCategory::Transform => "Transform",
            NodeCategory::Sink => "Sink",
        }
    }

    pub fn all() -> &'static [NodeCategory] {
        &[NodeCategory::Source, NodeCategory::Transform, NodeCategory::Sink]
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, NodeCategory::Sink)
    }

    pub fn is_source(&self) -> bool {
        matches!(self, NodeCategory::Source)
    }
}

impl std::fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A registered node type.
#[derive(Clone)]
pub struct RegistryEntry {
    pub key: String,
    pub category: NodeCategory,
    pub description: String,
    constructor: NodeConstructor,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("key", &self.key)
            .field("category", &self.category)
            .finish()
    }
}

#[derive(Default)]
pub struct NodeRegistry {
    entries: RwLock<BTreeMap<String, RegistryEntry>>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in node types.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        nodes::register_builtins(&registry);
        registry
    }

    /// Register a node type, replacing any previous entry with the same key.
    pub fn register<F>(
        &self,
        key: impl Into<String>,
        category: NodeCategory,
        description: impl Into<String>,
        constructor: F,
    ) where
        F: Fn(&NodeArgs) -> Result<Box<dyn NodeBehavior>> + Send + Sync + 'static,
    {
        let key = key.into();
        let entry = RegistryEntry {
            key: key.clone(),
            category,
            description: description.into(),
            constructor: Arc::new(constructor),
        };
        if write(&self.entries).insert(key.clone(), entry).is_some() {
            tracing::warn!("Node type '{}' registered twice, keeping the latest", key);
        }
    }

    pub fn create(&self, key: &str, args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
        let constructor = read(&self.entries)
            .get(key)
            .map(|e| Arc::clone(&e.constructor))
            .ok_or_else(|| EngineError::UnknownNodeType(key.to_string()))?;
        constructor(args)
    }

    pub fn contains(&self, key: &str) -> bool {
        read(&self.entries).contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        read(&self.entries).keys().cloned().collect()
    }

    pub fn entry(&self, key: &str) -> Option<RegistryEntry> {
        read(&self.entries).get(key).cloned()
    }

    pub fn entries_in(&self, category: NodeCategory) -> Vec<RegistryEntry> {
        read(&self.entries)
            .values()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_registered() {
        let registry = NodeRegistry::with_builtins();
        for key in [
            "signal_source",
            "device_source",
            "passthrough",
            "gain",
            "adder",
            "collector_sink",
            "threshold",
            "value_sink",
            "spectrum",
            "spectrum_sink",
            "recorder",
            "rms",
            "accumulator",
            "filter",
            "resample",
        ] {
            assert!(registry.contains(key), "missing {}", key);
        }
        let sinks: Vec<String> = registry
            .entries_in(NodeCategory::Sink)
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert!(sinks.contains(&"collector_sink".to_string()));
        assert!(sinks.contains(&"accumulator".to_string()));
        assert!(!sinks.contains(&"gain".to_string()));
    }

    #[test]
    fn test_create_unknown_type() {
        let registry = NodeRegistry::new();
        assert!(matches!(
            registry.create("nope", &NodeArgs::new()),
            Err(EngineError::UnknownNodeType(_))
        ));
    }

    #[test]
    fn test_create_passes_args() {
        let registry = NodeRegistry::with_builtins();
        let mut args = NodeArgs::new();
        args.insert("inputs".into(), AttributeValue::Int(3));
        let adder = registry.create("adder", &args).unwrap();
        let inputs = adder
            .ports()
            .iter()
            .filter(|p| p.direction == crate::pipeline::port::PortDirection::Input)
            .count();
        assert_eq!(inputs, 3);
    }
}
