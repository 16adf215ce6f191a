//! # flowgraph-rs: real-time streaming dataflow engine
//!
//! Nodes connected through typed ports exchange time-stamped sample buffers.
//! Work is dispatched on a shared worker pool whenever a full buffer is
//! queued at an input. Stopping a graph drains every queue first: sources are
//! suspended in topological order, then nodes are flushed from the sinks
//! backwards until nothing moves anymore, so no accepted sample is lost.
//!
//! ## Architecture
//!
//! - **Pipeline**: graph, nodes, ports, queues, scheduler and the stop protocol
//! - **Backend**: devices producing sample buffers on their own threads
//! - **Analysis**: windowed FFT, biquad sections and samplerate conversion
//!   behind the spectrum, filter and resample nodes
//! - **Session**: record lines of recorded files and the `index.lst` format
//! - **Config**: engine settings (TOML) and graph documents (JSON)
//!
//! ## Example
//!
//! ```no_run
//! use flowgraph_rs::{pipeline::Graph, config::EngineSettings};
//!
//! fn main() -> flowgraph_rs::Result<()> {
//!     let graph = Graph::with_settings(EngineSettings::default());
//!     let source = graph.add_node("signal_source", "Source")?;
//!     let sink = graph.add_node("collector_sink", "Sink")?;
//!     graph.connect_by_name("Source", "out", "Sink", "in")?;
//!
//!     graph.run()?;
//!     graph.feed(source)?.push(&[0.0; 1000])?;
//!     graph.stop()?;
//!
//!     let attributes = graph.attributes(sink)?;
//!     println!("{:?}", attributes);
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod backend;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod session;

// Re-export commonly used types
pub use backend::{Device, SimulatedDevice};
pub use config::{EngineSettings, GraphDocument};
pub use error::{EngineError, Result};
pub use pipeline::{EngineContext, Graph, GraphState, NodeId, PortId, TimeStamp};
