//! Error handling for the flowgraph engine
//!
//! This module defines the engine's error type and a Result alias for use
//! throughout the crate. Configuration errors are returned synchronously at
//! the call site; capacity errors at an input queue are additionally turned
//! into an emergency stop of the owning graph by the port that detects them.

use crate::pipeline::id::NodeId;
use crate::pipeline::port::PortDataType;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Connecting ports that carry different data
    #[error("Incompatible port types: output carries {output:?}, input expects {input:?}")]
    IncompatibleType {
        output: PortDataType,
        input: PortDataType,
    },

    /// An input port accepts exactly one connection
    #[error("Input port '{port}' is already connected")]
    InputAlreadyConnected { port: String },

    /// Disconnecting ports that are not connected to each other
    #[error("Ports '{output}' and '{input}' are not connected")]
    NotConnected { output: String, input: String },

    /// Samplerate or FFT size changed while the owning node is processing
    #[error("Cannot change {what} of port '{port}' while processing")]
    RateChangeWhileRunning { port: String, what: &'static str },

    /// A saved queue doesn't match the port it would be restored into
    #[error("Saved queue of '{port}' runs at {saved} Hz, the port at {current} Hz")]
    StateRateMismatch {
        port: String,
        saved: u32,
        current: u32,
    },

    /// Topology or configuration change requested on a running graph
    #[error("Graph can't be changed while running: {0}")]
    GraphRunning(String),

    /// Node or graph lifecycle transition not allowed from the current state
    #[error("Invalid transition for '{name}': {message}")]
    InvalidTransition { name: String, message: String },

    /// Node names are unique within a graph
    #[error("A node named '{0}' already exists")]
    DuplicateNodeName(String),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Unknown port {index} on node '{node}'")]
    UnknownPort { node: String, index: usize },

    /// No constructor registered for a node type key
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Unknown attribute '{attribute}' on node '{node}'")]
    UnknownAttribute { node: String, attribute: String },

    #[error("Attribute '{0}' is read-only while the graph is running")]
    AttributeReadOnly(String),

    #[error("Invalid value for attribute '{attribute}': {message}")]
    InvalidAttribute { attribute: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Data arrived at an input whose queue was never prepared
    #[error("Input port '{port}': queue not initialized")]
    QueueNotInitialized { port: String },

    /// Data arrived at an input whose queue can't hold it
    #[error("Input port '{port}': queue full ({queued}/{capacity}), {incoming} samples rejected")]
    QueueOverflow {
        port: String,
        queued: usize,
        capacity: usize,
        incoming: usize,
    },

    /// A buffer was handed to a queue running at a different rate
    #[error("Samplerate mismatch: expected {expected} Hz, got {actual} Hz")]
    RateMismatch { expected: u32, actual: u32 },

    /// FFT data must consist of whole frames
    #[error("FFT data of {len} values is not a multiple of the frame length {frame}")]
    FftFrameLength { len: usize, frame: usize },

    /// A node failed to prepare, so the graph did not start
    #[error("Node '{node}' failed to prepare processing: {source}")]
    PrepareFailed {
        node: String,
        #[source]
        source: Box<EngineError>,
    },

    /// Errors reported by an external device
    #[error("Device '{device}': {message}")]
    Device { device: String, message: String },

    /// The scheduler could not reach quiescence in time
    #[error("Timed out waiting for {outstanding} running work units to finish")]
    QuiesceTimeout { outstanding: usize },

    #[error("Scheduler has shut down")]
    SchedulerShutdown,

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a device error
    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Device {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Whether the error is a queue capacity violation, which is fatal for the graph
    pub fn is_capacity_error(&self) -> bool {
        match self {
            EngineError::QueueNotInitialized { .. } | EngineError::QueueOverflow { .. } => true,
            EngineError::WithContext { source, .. } => source.is_capacity_error(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<EngineError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
