//! Identity types for graph members.
//!
//! Node ids are handed out by the graph from a counter and never reused, so a
//! stale id held by a snapshot or a UI simply stops resolving after the node
//! is removed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a node within its graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Compact port address. High 20 bits = node id, low 12 bits = port index.
/// Whether it names an input or an output follows from where it is used.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub u32);

impl PortId {
    const PORT_BITS: u32 = 12;
    const PORT_MASK: u32 = (1 << Self::PORT_BITS) - 1;

    pub fn new(node: NodeId, port_index: u16) -> Self {
        debug_assert!(port_index < (1 << Self::PORT_BITS) as u16);
        debug_assert!(node.0 < (1 << (32 - Self::PORT_BITS)));
        Self((node.0 << Self::PORT_BITS) | (port_index as u32 & Self::PORT_MASK))
    }

    #[inline]
    pub fn node(self) -> NodeId {
        NodeId(self.0 >> Self::PORT_BITS)
    }

    #[inline]
    pub fn port_index(self) -> usize {
        (self.0 & Self::PORT_MASK) as usize
    }
}

impl fmt::Debug for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PortId(node={}, port={})",
            self.node().0,
            self.port_index()
        )
    }
}
