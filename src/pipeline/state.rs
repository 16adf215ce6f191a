//! Node state snapshots.
//!
//! A [`NodeState`] captures what a node holds between dispatches: the queued
//! samples and values of its inputs plus whatever fields its behavior chooses
//! to persist. A [`GraphSnapshot`] bundles the states of all nodes with the
//! graph clock reading at capture time.

use crate::error::{EngineError, Result};
use crate::pipeline::id::NodeId;
use crate::pipeline::node::Node;
use crate::pipeline::ring_buffer::TimedRingBuffer;
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::TimeLocatedValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A persisted behavior field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedValue {
    Double(f64),
    Int(i64),
    Bool(bool),
    Text(String),
    Samples(Vec<f64>),
    Values(Vec<TimeLocatedValue>),
    Stamp(TimeStamp),
}

impl PersistedValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PersistedValue::Double(v) => Some(*v),
            PersistedValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PersistedValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PersistedValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PersistedValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_samples(&self) -> Option<&[f64]> {
        match self {
            PersistedValue::Samples(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_values(&self) -> Option<&[TimeLocatedValue]> {
        match self {
            PersistedValue::Values(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_stamp(&self) -> Option<TimeStamp> {
        match self {
            PersistedValue::Stamp(v) => Some(*v),
            _ => None,
        }
    }
}

/// Behavior fields by name.
pub type PersistedFields = BTreeMap<String, PersistedValue>;

/// Look up a field, failing with a message naming it.
pub fn field<'a>(fields: &'a PersistedFields, name: &str) -> Result<&'a PersistedValue> {
    fields
        .get(name)
        .ok_or_else(|| EngineError::InvalidArgument(format!("persisted field '{}' missing", name)))
}

/// Captured state of one node.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub node: NodeId,
    pub name: String,
    pub captured_at: TimeStamp,
    /// Queue of each input, by input index.
    pub queues: Vec<Option<TimedRingBuffer>>,
    /// Pending values of each input, by input index.
    pub values: Vec<Vec<TimeLocatedValue>>,
    pub fields: PersistedFields,
}

impl NodeState {
    pub fn capture(node: &Node, captured_at: TimeStamp) -> Self {
        Self {
            node: node.id(),
            name: node.name().to_string(),
            captured_at,
            queues: node.inputs().iter().map(|p| p.snapshot_queue()).collect(),
            values: node.inputs().iter().map(|p| p.snapshot_values()).collect(),
            fields: node.save_fields(),
        }
    }

    /// Whether this state fits `node`: same inputs, queues at the port rates.
    pub fn check(&self, node: &Node) -> Result<()> {
        if self.queues.len() != node.inputs().len() {
            return Err(EngineError::InvalidArgument(format!(
                "state of '{}' has {} inputs, node has {}",
                self.name,
                self.queues.len(),
                node.inputs().len()
            )));
        }
        for (input, queue) in node.inputs().iter().zip(&self.queues) {
            input.check_queue(queue.as_ref())?;
        }
        Ok(())
    }

    /// Install the captured queues, values and fields into `node`. Nothing is
    /// installed if the state doesn't fit.
    pub fn restore(&self, node: &Node) -> Result<()> {
        self.check(node)?;
        for (input, queue) in node.inputs().iter().zip(&self.queues) {
            input.restore_queue(queue.clone())?;
        }
        for (input, values) in node.inputs().iter().zip(&self.values) {
            input.restore_values(values.clone());
        }
        node.load_fields(&self.fields)
    }

    /// Total queued samples over all inputs.
    pub fn queued_samples(&self) -> usize {
        self.queues.iter().flatten().map(TimedRingBuffer::len).sum()
    }
}

/// States of all nodes of a graph.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub captured_at: TimeStamp,
    pub states: Vec<NodeState>,
}

impl GraphSnapshot {
    pub fn state(&self, node: NodeId) -> Option<&NodeState> {
        self.states.iter().find(|s| s.node == node)
    }

    pub fn state_by_name(&self, name: &str) -> Option<&NodeState> {
        self.states.iter().find(|s| s.name == name)
    }
}
