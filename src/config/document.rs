//! Graph document persistence
//!
//! A [`GraphDocument`] describes a graph's nodes (type key, name, attribute
//! values) and its connections by node and port name. It never carries live
//! buffers or processing state; those belong to snapshots. Documents are
//! written as pretty JSON; TOML is accepted on load for hand-written graphs.

use crate::error::{EngineError, Result};
use crate::pipeline::attributes::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Document format version
pub const DOCUMENT_VERSION: u32 = 1;

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

/// One node of a graph document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDocument {
    /// Registry key of the node type
    pub node_type: String,

    /// Unique node name
    pub name: String,

    /// Attribute values by name
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// One output to input connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDocument {
    pub from_node: String,
    pub from_port: String,
    pub to_node: String,
    pub to_port: String,
}

/// Serializable graph configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub nodes: Vec<NodeDocument>,

    #[serde(default)]
    pub connections: Vec<ConnectionDocument>,
}

impl Default for GraphDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }
}

impl GraphDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a document, picking the format from the file extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read graph document {:?}: {}", path, e))
        })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let document: Self = if is_toml {
            toml::from_str(&content).map_err(|e| {
                EngineError::Config(format!("Failed to parse graph document {:?}: {}", path, e))
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                EngineError::Config(format!("Failed to parse graph document {:?}: {}", path, e))
            })?
        };

        if document.version > DOCUMENT_VERSION {
            return Err(EngineError::Config(format!(
                "Graph document version {} is newer than supported version {}",
                document.version, DOCUMENT_VERSION
            )));
        }
        Ok(document)
    }

    /// Save the document as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create document directory: {}", e))
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| {
            EngineError::Config(format!("Failed to write graph document {:?}: {}", path, e))
        })
    }

    pub fn node(&self, name: &str) -> Option<&NodeDocument> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GraphDocument {
        let mut gain = BTreeMap::new();
        gain.insert("factor".to_string(), AttributeValue::Double(2.0));
        GraphDocument {
            version: DOCUMENT_VERSION,
            nodes: vec![
                NodeDocument {
                    node_type: "signal_source".to_string(),
                    name: "Source".to_string(),
                    attributes: BTreeMap::new(),
                },
                NodeDocument {
                    node_type: "gain".to_string(),
                    name: "Gain".to_string(),
                    attributes: gain,
                },
            ],
            connections: vec![ConnectionDocument {
                from_node: "Source".to_string(),
                from_port: "out".to_string(),
                to_node: "Gain".to_string(),
                to_port: "in".to_string(),
            }],
        }
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let doc = sample();
        doc.save(&path).unwrap();
        assert_eq!(GraphDocument::load(&path).unwrap(), doc);
        assert_eq!(doc.node("Gain").unwrap().node_type, "gain");
    }

    #[test]
    fn test_toml_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.toml");
        std::fs::write(
            &path,
            r#"
[[nodes]]
node_type = "signal_source"
name = "Source"

[[nodes]]
node_type = "collector_sink"
name = "Sink"

[[connections]]
from_node = "Source"
from_port = "out"
to_node = "Sink"
to_port = "in"
"#,
        )
        .unwrap();
        let doc = GraphDocument::load(&path).unwrap();
        assert_eq!(doc.version, DOCUMENT_VERSION);
        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.connections[0].to_node, "Sink");
    }

    #[test]
    fn test_rejects_future_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();
        assert!(GraphDocument::load(&path).is_err());
    }
}
