//! Filter-graph execution engine for instrument waveforms
//!
//! Waveforms acquired from test instruments flow through a directed graph of
//! processing nodes. Each acquisition cycle the whole node set is refreshed
//! once, in dependency order, on a bounded pool of worker threads.
//!
//! # Architecture
//!
//! - **FilterGraphExecutor**: runs a node set once per cycle, never starting a
//!   node before its upstream nodes finish
//! - **FlowGraphNode / Filter**: node identity, input edges and output streams
//!   around a pluggable processing step
//! - **AcceleratorBuffer**: sample storage with a host copy and an accelerator
//!   mirror, synchronized lazily
//! - **ScratchPool**: recycled working buffers, flushed under memory pressure
//! - **Pipeline**: instruments publishing into root nodes ahead of each cycle
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wavegraph::nodes::{InvertFilter, ThresholdFilter, WaveformSource};
//! use wavegraph::{Accelerator, FilterGraph, FilterGraphExecutor, UniformWaveform};
//!
//! let mut graph = FilterGraph::new();
//! let scope = graph.add_node("scope", WaveformSource::analog(&["ch1"]))?;
//! graph.add_node("thresh", ThresholdFilter::new(0.5, 0.1))?;
//! graph.add_node("inv", InvertFilter)?;
//! graph.connect("scope", "ch1", "thresh", "din")?;
//! graph.connect("thresh", "data", "inv", "din")?;
//!
//! let executor = FilterGraphExecutor::new(4, Arc::new(Accelerator::default()));
//! scope.set_stream_waveform(0, Box::new(UniformWaveform::from_samples(1000, &[0.0f32, 1.0])));
//! executor.run_blocking(graph.nodes());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::PathBuf;
use thiserror::Error;

pub mod config;
pub mod nodes;
pub mod runtime;

pub use config::{AcquisitionConfig, DeviceConfig, EngineConfig, WatchdogConfig};

pub use runtime::{
    Accelerator, AcceleratorBuffer, Acquisition, BufferError, CommandBuffer, ConnectionError,
    CycleStats, DataLocation, Device, Filter, FilterGraph, FilterGraphExecutor, FilterRegistry,
    FlowGraphNode, Instrument, MemoryPressureHandler, MemoryPressureLevel, MemoryType, NodeHandle,
    NodeId, Pipeline, PipelineCycle, Queue, RefreshContext, Residency, ScratchPool, ScratchPurpose,
    SparseWaveform, Stream, StreamDescriptor, StreamFlags, StreamType, UniformWaveform, Unit,
    Waveform, WaveformError,
};

#[derive(Error, Debug)]
pub enum WavegraphError {
    #[error("Failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Graph error: {0}")]
    Graph(#[from] ConnectionError),
}

impl WavegraphError {
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WavegraphError::ReadFile {
            path: path.into(),
            source,
        }
    }

    pub fn write_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WavegraphError::WriteFile {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, WavegraphError>;
