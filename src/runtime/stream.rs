//! Output streams and the descriptors that connect them
//!
//! A [`Stream`] is one named output socket of a node and exclusively owns the
//! waveform currently published on it. A [`StreamDescriptor`] names a stream
//! by `(owner node, index)` and is used as the endpoint of a graph edge.

use super::buffer::SampleType;
use super::node::NodeHandle;
use super::units::Unit;
use super::waveform::{SparseWaveform, UniformWaveform, Waveform};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Kind of data carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Analog,
    /// Single value per acquisition, held in [`Stream::scalar_value`]
    AnalogScalar,
    Digital,
    Eye,
    Complex,
}

/// Display and processing hints attached to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamFlags(u8);

impl StreamFlags {
    pub const NONE: StreamFlags = StreamFlags(0);
    /// Samples are discrete symbols; never interpolate between them
    pub const DO_NOT_INTERPOLATE: StreamFlags = StreamFlags(1);
    /// Hidden unless explicitly requested
    pub const INFREQUENTLY_USED: StreamFlags = StreamFlags(2);
    /// Render filled down to the axis
    pub const FILL_UNDER: StreamFlags = StreamFlags(4);

    pub fn contains(self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for StreamFlags {
    type Output = StreamFlags;

    fn bitor(self, rhs: StreamFlags) -> StreamFlags {
        StreamFlags(self.0 | rhs.0)
    }
}

/// Named output socket of a node
pub struct Stream {
    name: String,
    unit: Unit,
    stream_type: StreamType,
    flags: StreamFlags,
    waveform: Option<Box<dyn Waveform>>,
    scalar: f64,
}

impl Stream {
    pub fn new(name: impl Into<String>, unit: Unit, stream_type: StreamType) -> Self {
        Self {
            name: name.into(),
            unit,
            stream_type,
            flags: StreamFlags::NONE,
            waveform: None,
            scalar: 0.0,
        }
    }

    pub fn with_flags(mut self, flags: StreamFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub fn waveform(&self) -> Option<&(dyn Waveform + 'static)> {
        self.waveform.as_deref()
    }

    pub fn waveform_mut(&mut self) -> Option<&mut (dyn Waveform + 'static)> {
        self.waveform.as_deref_mut()
    }

    /// True when a waveform is published, even a zero-length one
    pub fn has_data(&self) -> bool {
        self.waveform.is_some()
    }

    /// Publish `waveform`, returning the one it replaces
    pub fn set_waveform(&mut self, waveform: Box<dyn Waveform>) -> Option<Box<dyn Waveform>> {
        self.waveform.replace(waveform)
    }

    pub fn take_waveform(&mut self) -> Option<Box<dyn Waveform>> {
        self.waveform.take()
    }

    /// Take the current waveform if it is a `W`, for reuse as the next output.
    ///
    /// A waveform of any other type is dropped and `None` returned.
    pub fn take_waveform_as<W: Waveform>(&mut self) -> Option<Box<W>> {
        self.waveform.take()?.into_any().downcast::<W>().ok()
    }

    /// Drop the current waveform; the stream then carries no data
    pub fn clear(&mut self) {
        self.waveform = None;
    }

    pub fn uniform<T: SampleType>(&self) -> Option<&UniformWaveform<T>> {
        self.waveform()?.as_uniform()
    }

    pub fn sparse<T: SampleType>(&self) -> Option<&SparseWaveform<T>> {
        self.waveform()?.as_sparse()
    }

    pub fn scalar_value(&self) -> f64 {
        self.scalar
    }

    pub fn set_scalar_value(&mut self, value: f64) {
        self.scalar = value;
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("type", &self.stream_type)
            .field("waveform", &self.waveform)
            .finish()
    }
}

/// Edge endpoint: stream `index` of `node`.
///
/// A descriptor without an owner, or whose index is out of range, is floating.
/// Consumers treat a floating input as "no data".
#[derive(Clone, Default)]
pub struct StreamDescriptor {
    node: Option<NodeHandle>,
    index: usize,
}

impl StreamDescriptor {
    pub fn new(node: &NodeHandle, index: usize) -> Self {
        Self {
            node: Some(Arc::clone(node)),
            index,
        }
    }

    /// Unconnected input
    pub fn floating() -> Self {
        Self::default()
    }

    pub fn node(&self) -> Option<&NodeHandle> {
        self.node.as_ref()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// True when there is no owner or the owner has no stream at `index`
    pub fn is_floating(&self) -> bool {
        self.stream_type().is_none()
    }

    /// Type of the referenced stream, if it exists
    pub fn stream_type(&self) -> Option<StreamType> {
        self.with_stream(Stream::stream_type)
    }

    pub fn y_axis_unit(&self) -> Option<Unit> {
        self.with_stream(Stream::unit)
    }

    /// Run `f` against the referenced stream under its owner's read lock
    pub fn with_stream<R>(&self, f: impl FnOnce(&Stream) -> R) -> Option<R> {
        let node = self.node.as_ref()?;
        node.streams().get(self.index).map(f)
    }
}

impl PartialEq for StreamDescriptor {
    fn eq(&self, other: &Self) -> bool {
        let same_node = match (&self.node, &other.node) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_node && self.index == other.index
    }
}

impl fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{}.{}", node.name(), self.index),
            None => write!(f, "<floating>"),
        }
    }
}
