//! Filter contract and the graph node that hosts a filter
//!
//! A [`Filter`] is the concrete processing step: it declares its inputs and
//! output streams, decides which upstream streams it accepts, and computes new
//! output waveforms in [`Filter::refresh`]. A [`FlowGraphNode`] wraps a filter
//! with the state the engine needs: identity, input edges, output streams,
//! the last error message and a refresh counter.
//!
//! Nodes are shared as [`NodeHandle`]s. Each node's output streams sit behind
//! a read/write lock: the node's own refresh takes it exclusively, downstream
//! nodes read through shared guards. The executor guarantees a node is never
//! refreshed while one of its upstream nodes is still running.

use super::device::{Accelerator, Device, Queue};
use super::errors::{BufferError, ConnectionError};
use super::graph::NodeId;
use super::scratch::ScratchPool;
use super::stream::{Stream, StreamDescriptor};
use super::waveform::Waveform;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

/// Where a filter wants its input sample data before refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLocation {
    /// Host copies are made current
    Cpu,
    /// Device copies are made current
    Gpu,
    /// Inputs are passed as they are
    DontCare,
}

/// A processing step hosted by a [`FlowGraphNode`]
///
/// - Sources have no inputs and one or more streams
/// - Filters have N inputs and M streams
pub trait Filter: Send {
    /// Identifier used by the filter registry
    fn protocol_name(&self) -> &str;

    /// One name per input slot
    fn input_names(&self) -> Vec<String>;

    /// Output streams the node starts with
    fn create_streams(&self) -> Vec<Stream>;

    /// Whether input `index` accepts `stream`
    fn validate_channel(&self, index: usize, stream: &StreamDescriptor) -> bool;

    fn input_location(&self) -> DataLocation {
        DataLocation::Cpu
    }

    /// Recompute all outputs from the current inputs.
    ///
    /// Must not panic on bad input: clear the outputs and optionally record
    /// an error through the context instead.
    fn refresh(&mut self, ctx: &mut RefreshContext<'_>);
}

/// Shared handle to a node
pub type NodeHandle = Arc<FlowGraphNode>;

/// Unit of scheduling: a filter plus its edges and output streams
pub struct FlowGraphNode {
    id: NodeId,
    name: String,
    protocol: String,
    input_names: Vec<String>,
    inputs: RwLock<Vec<StreamDescriptor>>,
    streams: RwLock<Vec<Stream>>,
    filter: Mutex<Box<dyn Filter>>,
    last_error: Mutex<Option<String>>,
    refresh_count: AtomicU64,
}

impl FlowGraphNode {
    pub fn new<F: Filter + 'static>(name: impl Into<String>, filter: F) -> NodeHandle {
        Self::from_boxed(name, Box::new(filter))
    }

    pub fn from_boxed(name: impl Into<String>, filter: Box<dyn Filter>) -> NodeHandle {
        let name = name.into();
        let input_names = filter.input_names();
        let streams = filter.create_streams();
        let protocol = filter.protocol_name().to_string();
        let id = NodeId::next();

        debug!(
            "[{}] Created {} node {:?}: {} inputs, {} streams",
            name,
            protocol,
            id,
            input_names.len(),
            streams.len()
        );

        Arc::new(Self {
            id,
            inputs: RwLock::new(vec![StreamDescriptor::floating(); input_names.len()]),
            name,
            protocol,
            input_names,
            streams: RwLock::new(streams),
            filter: Mutex::new(filter),
            last_error: Mutex::new(None),
            refresh_count: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol
    }

    pub fn input_count(&self) -> usize {
        self.input_names.len()
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Index of the input slot called `name`
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.input_names.iter().position(|n| n == name)
    }

    /// Connect input `index` to `stream` after the filter accepts it
    pub fn set_input(&self, index: usize, stream: StreamDescriptor) -> Result<(), ConnectionError> {
        if index >= self.input_count() {
            return Err(ConnectionError::InputNotFound {
                node: self.name.clone(),
                index,
            });
        }

        let upstream = match stream.node() {
            Some(upstream) => upstream,
            None => {
                self.disconnect_input(index);
                return Ok(());
            }
        };

        if upstream.id() == self.id {
            return Err(ConnectionError::SelfLoop(self.name.clone()));
        }
        if stream.index() >= upstream.stream_count() {
            return Err(ConnectionError::StreamNotFound {
                node: upstream.name().to_string(),
                index: stream.index(),
            });
        }

        let accepted = self
            .filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .validate_channel(index, &stream);
        if !accepted {
            return Err(ConnectionError::TypeMismatch {
                from_node: upstream.name().to_string(),
                from_stream: stream.index(),
                to_node: self.name.clone(),
                to_input: index,
            });
        }

        debug!("[{}] Input {} <- {:?}", self.name, index, stream);
        self.inputs.write().unwrap_or_else(PoisonError::into_inner)[index] = stream;
        Ok(())
    }

    /// Leave input `index` floating
    pub fn disconnect_input(&self, index: usize) {
        let mut inputs = self.inputs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = inputs.get_mut(index) {
            *slot = StreamDescriptor::floating();
        }
    }

    /// Snapshot of the input descriptors
    pub fn inputs(&self) -> Vec<StreamDescriptor> {
        self.inputs.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn input(&self, index: usize) -> StreamDescriptor {
        self.inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// Ids of the nodes feeding this node's inputs
    pub fn upstream_ids(&self) -> Vec<NodeId> {
        let inputs = self.inputs.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<NodeId> = inputs.iter().filter_map(|d| d.node().map(|n| n.id())).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// True if any input reads from `upstream`
    pub fn depends_on(&self, upstream: NodeId) -> bool {
        self.inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|d| d.node().is_some_and(|n| n.id() == upstream))
    }

    pub fn streams(&self) -> RwLockReadGuard<'_, Vec<Stream>> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn streams_mut(&self) -> RwLockWriteGuard<'_, Vec<Stream>> {
        self.streams.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stream_count(&self) -> usize {
        self.streams().len()
    }

    /// Descriptor for this node's stream `index`
    pub fn stream(self: &Arc<Self>, index: usize) -> StreamDescriptor {
        StreamDescriptor::new(self, index)
    }

    /// Publish a waveform on stream `index` from outside the executor.
    ///
    /// Returns false if the node has no such stream.
    pub fn set_stream_waveform(&self, index: usize, waveform: Box<dyn Waveform>) -> bool {
        match self.streams_mut().get_mut(index) {
            Some(stream) => {
                stream.set_waveform(waveform);
                true
            }
            None => {
                warn!("[{}] No stream {} to publish to", self.name, index);
                false
            }
        }
    }

    /// Error recorded by the most recent refresh, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of times refresh has been called
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::Acquire)
    }

    /// Stage inputs and run the filter against this node's streams
    pub fn refresh(&self, accelerator: &Accelerator) {
        self.refresh_count.fetch_add(1, Ordering::AcqRel);

        let mut filter = self.filter.lock().unwrap_or_else(PoisonError::into_inner);
        let inputs = self.inputs();
        self.stage_inputs(&inputs, filter.input_location(), accelerator);

        // Stream types are checked before any guard is held; validate_channel
        // locks the upstream on its own.
        let accepted: Vec<bool> = inputs
            .iter()
            .enumerate()
            .map(|(index, descriptor)| filter.validate_channel(index, descriptor))
            .collect();

        // Each upstream lock is read once, in id order, so two nodes sharing
        // upstreams cannot block each other behind a waiting stager.
        let mut upstream: Vec<(NodeId, RwLockReadGuard<'_, Vec<Stream>>)> = Vec::new();
        let mut sources: Vec<&NodeHandle> = inputs.iter().filter_map(StreamDescriptor::node).collect();
        sources.sort_by_key(|node| node.id());
        sources.dedup_by_key(|node| node.id());
        for node in sources {
            upstream.push((node.id(), node.streams()));
        }

        let mut streams = self.streams_mut();
        let mut ctx = RefreshContext {
            node: self,
            inputs: &inputs,
            accepted: &accepted,
            upstream: &upstream,
            outputs: &mut *streams,
            accelerator,
            error: None,
        };
        filter.refresh(&mut ctx);
        let error = ctx.error.take();
        drop(streams);
        drop(upstream);

        if let Some(message) = &error {
            debug!("[{}] Refresh reported: {}", self.name, message);
        }
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Move upstream sample data to where the filter wants it
    fn stage_inputs(&self, inputs: &[StreamDescriptor], location: DataLocation, accelerator: &Accelerator) {
        if location == DataLocation::DontCare {
            return;
        }

        for descriptor in inputs {
            let Some(upstream) = descriptor.node() else {
                continue;
            };
            let mut streams = upstream.streams_mut();
            let Some(waveform) = streams
                .get_mut(descriptor.index())
                .and_then(Stream::waveform_mut)
            else {
                continue;
            };

            match location {
                DataLocation::Cpu => waveform.prepare_for_cpu_access(),
                DataLocation::Gpu => {
                    waveform.ensure_device(accelerator.device());
                    match waveform.prepare_for_gpu_access() {
                        Ok(()) => trace!("[{}] Staged {:?} on device", self.name, descriptor),
                        Err(BufferError::NoDevice) => {
                            debug!("[{}] {:?} has no device copy", self.name, descriptor)
                        }
                        Err(e) => warn!("[{}] Could not stage {:?}: {}", self.name, descriptor, e),
                    }
                }
                DataLocation::DontCare => {}
            }
        }
    }

    /// Put the node back into a usable state after its filter panicked
    pub(crate) fn recover_after_panic(&self, message: String) {
        self.filter.clear_poison();
        self.streams.clear_poison();
        for stream in self.streams_mut().iter_mut() {
            stream.clear();
        }
        self.last_error.clear_poison();
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }
}

impl fmt::Debug for FlowGraphNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FlowGraphNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Everything a filter can touch while refreshing
pub struct RefreshContext<'a> {
    node: &'a FlowGraphNode,
    inputs: &'a [StreamDescriptor],
    accepted: &'a [bool],
    upstream: &'a [(NodeId, RwLockReadGuard<'a, Vec<Stream>>)],
    outputs: &'a mut Vec<Stream>,
    accelerator: &'a Accelerator,
    error: Option<String>,
}

impl<'a> RefreshContext<'a> {
    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    pub fn node_name(&self) -> &str {
        self.node.name()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn input_descriptor(&self, index: usize) -> Option<&'a StreamDescriptor> {
        self.inputs.get(index)
    }

    /// Upstream stream connected to input `index`, or `None` if floating
    pub fn input(&self, index: usize) -> Option<&'a Stream> {
        let descriptor = self.inputs.get(index)?;
        let id = descriptor.node()?.id();
        let upstream: &'a [(NodeId, RwLockReadGuard<'a, Vec<Stream>>)] = self.upstream;
        let slot = upstream.binary_search_by_key(&id, |(id, _)| *id).ok()?;
        upstream[slot].1.get(descriptor.index())
    }

    /// Check every input is connected, accepted by the filter and carries data.
    ///
    /// Acceptance is the filter's `validate_channel` verdict taken just before
    /// the refresh started. On failure all outputs are cleared and an error is
    /// recorded.
    pub fn verify_all_inputs_ok(&mut self, allow_empty: bool) -> bool {
        for index in 0..self.inputs.len() {
            let problem = self.input_problem(index, allow_empty);
            if let Some(problem) = problem {
                let name = self
                    .node
                    .input_names()
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| index.to_string());
                self.clear_outputs();
                self.set_error(format!("Input '{}' {}", name, problem));
                return false;
            }
        }
        true
    }

    fn input_problem(&self, index: usize, allow_empty: bool) -> Option<&'static str> {
        let descriptor = &self.inputs[index];
        if descriptor.node().is_none() {
            return Some("is not connected");
        }
        if !self.accepted.get(index).copied().unwrap_or(false) {
            return Some("has an unsupported stream");
        }
        let Some(input) = self.input(index) else {
            return Some("is not connected");
        };
        match input.waveform() {
            None => Some("has no data"),
            Some(waveform) if waveform.is_empty() && !allow_empty => Some("is empty"),
            Some(_) => None,
        }
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn output(&self, index: usize) -> Option<&Stream> {
        self.outputs.get(index)
    }

    pub fn output_mut(&mut self, index: usize) -> Option<&mut Stream> {
        self.outputs.get_mut(index)
    }

    /// Publish `waveform` on output `index`
    pub fn set_output(&mut self, index: usize, waveform: Box<dyn Waveform>) {
        match self.outputs.get_mut(index) {
            Some(stream) => {
                stream.set_waveform(waveform);
            }
            None => warn!("[{}] No output stream {}", self.node.name(), index),
        }
    }

    /// Take output `index` for reuse if it already holds a `W`
    pub fn take_output<W: Waveform>(&mut self, index: usize) -> Option<Box<W>> {
        self.outputs.get_mut(index)?.take_waveform_as::<W>()
    }

    pub fn clear_output(&mut self, index: usize) {
        if let Some(stream) = self.outputs.get_mut(index) {
            stream.clear();
        }
    }

    /// Set every output to "no data"
    pub fn clear_outputs(&mut self) {
        for stream in self.outputs.iter_mut() {
            stream.clear();
        }
    }

    /// Drop all streams, and with them their waveforms
    pub fn clear_streams(&mut self) {
        self.outputs.clear();
    }

    pub fn add_stream(&mut self, stream: Stream) {
        self.outputs.push(stream);
    }

    pub fn streams_mut(&mut self) -> &mut [Stream] {
        self.outputs.as_mut_slice()
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn accelerator(&self) -> &'a Accelerator {
        self.accelerator
    }

    pub fn device(&self) -> &'a Arc<Device> {
        self.accelerator.device()
    }

    pub fn queue(&self) -> &'a Queue {
        self.accelerator.queue()
    }

    pub fn scratch(&self) -> &'a ScratchPool {
        self.accelerator.scratch()
    }
}
