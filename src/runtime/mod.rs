//! Runtime support for filter graphs

pub mod buffer;
pub mod device;
pub mod errors;
pub mod graph;
pub mod node;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod scratch;
pub mod stream;
pub mod units;
pub mod watchdog;
pub mod waveform;

pub use buffer::{AcceleratorBuffer, Residency, SampleType, TransferStats};
pub use device::{
    Accelerator, CommandBuffer, Device, MemoryPressureHandler, MemoryPressureLevel, MemoryType,
    Queue,
};
pub use errors::{BufferError, ConnectionError, WaveformError};
pub use graph::{FilterGraph, NodeId};
pub use node::{DataLocation, Filter, FlowGraphNode, NodeHandle, RefreshContext};
pub use pipeline::{Acquisition, Instrument, Pipeline, PipelineCycle};
pub use registry::FilterRegistry;
pub use scheduler::{CycleStats, FilterGraphExecutor};
pub use scratch::{ScratchBuffer, ScratchPool, ScratchPurpose};
pub use stream::{Stream, StreamDescriptor, StreamFlags, StreamType};
pub use units::Unit;
pub use watchdog::Watchdog;
pub use waveform::{
    ComplexSample, EyeWaveform, SparseWaveform, UniformWaveform, Waveform, WaveformBase,
    WaveformLayout,
};
