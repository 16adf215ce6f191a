//! SignalSourceNode: samples pushed from code.
//!
//! The node has a single `out` port. Samples enter through an [`OutputFeed`]
//! obtained from [`feed`] (or `Graph::feed`), which stamps them on a
//! continuous sample clock that restarts at zero with every run.

use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::lock;
use crate::pipeline::node::{Node, NodeBehavior, NodeCore, ProcessingState};
use crate::pipeline::nodes::{arg, send_in_chunks};
use crate::pipeline::port::{PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::TimeLocatedBuffer;
use std::sync::{Arc, Mutex, Weak};

pub const TYPE_KEY: &str = "signal_source";

const DEFAULT_SAMPLERATE: u32 = 1000;

pub struct SignalSourceNode {
    samplerate: u32,
    /// Samples pushed since the node started.
    cursor: Arc<Mutex<i64>>,
}

impl SignalSourceNode {
    pub fn new(samplerate: u32) -> Self {
        Self {
            samplerate,
            cursor: Arc::new(Mutex::new(0)),
        }
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    /// Samples pushed in the current run.
    pub fn pushed(&self) -> i64 {
        *lock(&self.cursor)
    }
}

impl Default for SignalSourceNode {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLERATE)
    }
}

pub fn create(args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    let samplerate = match arg(args, "samplerate") {
        Some(value) => value.expect_positive("samplerate")?,
        None => DEFAULT_SAMPLERATE,
    };
    Ok(Box::new(SignalSourceNode::new(samplerate)))
}

impl NodeBehavior for SignalSourceNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::output("out", PortDataType::Array)]
    }

    fn initialize(&mut self, core: &NodeCore) -> Result<()> {
        core.output(0).set_samplerate(self.samplerate)
    }

    fn processing_started(&mut self, _core: &NodeCore) -> Result<()> {
        *lock(&self.cursor) = 0;
        Ok(())
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![Attribute::new("samplerate", AttributeValue::Int(self.samplerate as i64)).locked_while_running()]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "samplerate" => {
                let rate = value.expect_positive(name)?;
                core.output(0).set_samplerate(rate)?;
                self.samplerate = rate;
                Ok(())
            }
            _ => Err(EngineError::UnknownAttribute {
                node: core.name().to_string(),
                attribute: name.to_string(),
            }),
        }
    }
}

/// Pushes samples into a running signal source.
#[derive(Clone)]
pub struct OutputFeed {
    node: Weak<Node>,
    name: String,
    cursor: Arc<Mutex<i64>>,
}

impl OutputFeed {
    /// Send `samples` downstream, split to fit the consumers' buffers.
    ///
    /// Blocks while a consumer's queue is full. Fails unless the node runs.
    pub fn push(&self, samples: &[f64]) -> Result<()> {
        let node = self.node.upgrade().ok_or_else(|| {
            EngineError::InvalidArgument(format!("node '{}' no longer exists", self.name))
        })?;
        let pushed = node.run_exclusive(|core| {
            let output = core.output(0);
            let rate = output.samplerate();
            let mut cursor = lock(&self.cursor);
            let end = *cursor + samples.len() as i64;
            let buffer = TimeLocatedBuffer::from_samples(
                samples.to_vec(),
                rate,
                TimeStamp::from_samples(end, rate),
            );
            *cursor = end;
            drop(cursor);
            send_in_chunks(output, &buffer)
        });
        pushed.unwrap_or_else(|| {
            Err(EngineError::InvalidTransition {
                name: self.name.clone(),
                message: format!("can't push samples while {:?}", node.state()),
            })
        })
    }

    /// Whether the node is currently accepting samples.
    pub fn is_running(&self) -> bool {
        self.node
            .upgrade()
            .is_some_and(|node| node.state() == ProcessingState::Running)
    }

    /// Stamp just past the last pushed sample.
    pub fn position(&self) -> TimeStamp {
        let rate = self
            .node
            .upgrade()
            .map(|node| node.outputs()[0].samplerate())
            .unwrap_or(0);
        if rate == 0 {
            return TimeStamp::ZERO;
        }
        TimeStamp::from_samples(*lock(&self.cursor), rate)
    }
}

/// Feed handle of a signal source node.
pub fn feed(node: &Arc<Node>) -> Result<OutputFeed> {
    let cursor = node
        .with_behavior(|source: &SignalSourceNode| Arc::clone(&source.cursor))
        .ok_or_else(|| {
            EngineError::InvalidArgument(format!("node '{}' is not a signal source", node.name()))
        })?;
    Ok(OutputFeed {
        node: Arc::downgrade(node),
        name: node.name().to_string(),
        cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::pipeline::context::EngineContext;
    use crate::pipeline::id::NodeId;
    use crate::pipeline::nodes::collector_sink::CollectorSinkNode;
    use std::time::Duration;

    fn running_pair() -> (Arc<EngineContext>, Arc<Node>, Arc<Node>) {
        let engine = EngineContext::new(EngineSettings::default());
        let source = Node::new(NodeId(0), "Source", Box::new(SignalSourceNode::new(1000)), Arc::clone(&engine)).unwrap();
        let sink = Node::new(NodeId(1), "Sink", Box::new(CollectorSinkNode::new(true)), Arc::clone(&engine)).unwrap();
        source.outputs()[0].connect(&sink.inputs()[0]).unwrap();
        sink.prepare_processing().unwrap();
        sink.start().unwrap();
        source.start().unwrap();
        (engine, source, sink)
    }

    #[test]
    fn test_push_requires_running() {
        let engine = EngineContext::new(EngineSettings::default());
        let source = Node::new(NodeId(0), "Source", Box::new(SignalSourceNode::default()), engine).unwrap();
        let feed = feed(&source).unwrap();
        assert!(!feed.is_running());
        assert!(matches!(feed.push(&[1.0]), Err(EngineError::InvalidTransition { .. })));
    }

    #[test]
    fn test_push_splits_and_stamps_continuously() {
        let (engine, source, sink) = running_pair();
        let feed = feed(&source).unwrap();
        // 250 samples against a 100 sample dispatch buffer.
        feed.push(&[1.0; 250]).unwrap();
        feed.push(&[1.0; 50]).unwrap();
        assert!(engine.scheduler().wait_idle(Duration::from_secs(5)));

        assert_eq!(feed.position(), TimeStamp::from_seconds(0.3));
        assert_eq!(sink.inputs()[0].queue_end_time(), Some(TimeStamp::from_seconds(0.3)));
        let seen = sink.with_behavior(|c: &CollectorSinkNode| c.count()).unwrap();
        assert_eq!(seen, 300);

        source.stop().unwrap();
        sink.stop().unwrap();
    }

    #[test]
    fn test_feed_of_other_node_type_fails() {
        let engine = EngineContext::new(EngineSettings::default());
        let sink = Node::new(NodeId(1), "Sink", Box::new(CollectorSinkNode::new(false)), engine).unwrap();
        assert!(feed(&sink).is_err());
    }

    #[test]
    fn test_samplerate_attribute_sets_output_rate() {
        let engine = EngineContext::new(EngineSettings::default());
        let source = Node::new(NodeId(0), "Source", Box::new(SignalSourceNode::default()), engine).unwrap();
        assert_eq!(source.outputs()[0].samplerate(), 1000);
        source.set_attribute("samplerate", &AttributeValue::Int(48_000)).unwrap();
        assert_eq!(source.outputs()[0].samplerate(), 48_000);
        assert!(source.set_attribute("samplerate", &AttributeValue::Int(0)).is_err());
    }
}
