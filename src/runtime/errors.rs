//! Error types for the runtime system

/// Error type for graph editing operations
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("Node with name '{0}' already exists")]
    DuplicateNode(String),

    #[error("Unknown filter protocol '{0}'")]
    UnknownProtocol(String),

    #[error("Input {index} not found on node '{node}'")]
    InputNotFound { node: String, index: usize },

    #[error("Port '{port}' not found on node '{node}'")]
    PortNotFound { node: String, port: String },

    #[error("Stream {index} not found on node '{node}'")]
    StreamNotFound { node: String, index: usize },

    #[error("Stream {from_node}.{from_stream} rejected by {to_node} input {to_input}")]
    TypeMismatch {
        from_node: String,
        from_stream: usize,
        to_node: String,
        to_input: usize,
    },

    #[error("Node '{0}' cannot consume its own output")]
    SelfLoop(String),

    #[error("Connecting {from_node} -> {to_node} would create a cycle")]
    Cycle { from_node: String, to_node: String },

    #[error("Cannot bind instrument '{0}' while acquisition is running")]
    AcquisitionRunning(String),
}

/// Error type for buffer residency and device memory operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer has no accelerator device attached")]
    NoDevice,

    #[error("Device '{device}' out of memory: requested {requested} bytes, {available} available")]
    OutOfDeviceMemory {
        device: String,
        requested: usize,
        available: usize,
    },
}

/// Structural problems found when validating a waveform
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaveformError {
    #[error("Sparse arrays disagree in length: {offsets} offsets, {durations} durations, {samples} samples")]
    LengthMismatch {
        offsets: usize,
        durations: usize,
        samples: usize,
    },

    #[error("Offset at index {index} ({offset}) is before the previous offset ({previous})")]
    DecreasingOffset {
        index: usize,
        offset: i64,
        previous: i64,
    },
}
