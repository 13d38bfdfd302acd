//! Graph root fed from outside the executor
//!
//! Instruments publish acquired waveforms straight into the source's streams
//! (see [`FlowGraphNode::set_stream_waveform`](crate::runtime::node::FlowGraphNode::set_stream_waveform))
//! before the node set is run. Refresh leaves them untouched.

use crate::runtime::node::{DataLocation, Filter, RefreshContext};
use crate::runtime::stream::{Stream, StreamDescriptor, StreamFlags, StreamType};
use crate::runtime::units::Unit;
use tracing::trace;

struct StreamSpec {
    name: String,
    unit: Unit,
    stream_type: StreamType,
    flags: StreamFlags,
}

/// Root node whose streams are populated by an instrument
#[derive(Default)]
pub struct WaveformSource {
    streams: Vec<StreamSpec>,
}

impl WaveformSource {
    /// Source without streams; add them with [`with_stream`](Self::with_stream)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, name: impl Into<String>, unit: Unit, stream_type: StreamType) -> Self {
        self.streams.push(StreamSpec {
            name: name.into(),
            unit,
            stream_type,
            flags: StreamFlags::NONE,
        });
        self
    }

    /// Same names, units, types and flags as `streams`
    pub fn from_streams(streams: &[Stream]) -> Self {
        Self {
            streams: streams
                .iter()
                .map(|stream| StreamSpec {
                    name: stream.name().to_string(),
                    unit: stream.unit(),
                    stream_type: stream.stream_type(),
                    flags: stream.flags(),
                })
                .collect(),
        }
    }

    /// One analog stream in volts per name
    pub fn analog(names: &[&str]) -> Self {
        Self::uniform_streams(names, Unit::Volts, StreamType::Analog, StreamFlags::NONE)
    }

    /// One digital stream per name
    pub fn digital(names: &[&str]) -> Self {
        Self::uniform_streams(names, Unit::Counts, StreamType::Digital, StreamFlags::DO_NOT_INTERPOLATE)
    }

    fn uniform_streams(names: &[&str], unit: Unit, stream_type: StreamType, flags: StreamFlags) -> Self {
        Self {
            streams: names
                .iter()
                .map(|name| StreamSpec {
                    name: name.to_string(),
                    unit,
                    stream_type,
                    flags,
                })
                .collect(),
        }
    }
}

impl Filter for WaveformSource {
    fn protocol_name(&self) -> &str {
        "Source"
    }

    fn input_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn create_streams(&self) -> Vec<Stream> {
        self.streams
            .iter()
            .map(|spec| Stream::new(spec.name.clone(), spec.unit, spec.stream_type).with_flags(spec.flags))
            .collect()
    }

    fn validate_channel(&self, _index: usize, _stream: &StreamDescriptor) -> bool {
        false
    }

    fn input_location(&self) -> DataLocation {
        DataLocation::DontCare
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) {
        let populated = ctx.streams_mut().iter().filter(|s| s.has_data()).count();
        trace!(
            "[{}] Source holds {} of {} streams",
            ctx.node_name(),
            populated,
            ctx.output_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::device::Accelerator;
    use crate::runtime::node::FlowGraphNode;
    use crate::runtime::waveform::UniformWaveform;

    #[test]
    fn test_stream_layout() {
        let node = FlowGraphNode::new(
            "scope",
            WaveformSource::analog(&["ch1", "ch2"]).with_stream("trig", Unit::Counts, StreamType::Digital),
        );
        let streams = node.streams();
        assert_eq!(streams.len(), 3);
        assert_eq!(streams[0].name(), "ch1");
        assert_eq!(streams[1].unit(), Unit::Volts);
        assert_eq!(streams[2].stream_type(), StreamType::Digital);
        assert_eq!(node.input_count(), 0);
    }

    #[test]
    fn test_from_streams_copies_layout() {
        let layout = vec![
            Stream::new("ch1", Unit::Volts, StreamType::Analog),
            Stream::new("d0", Unit::Counts, StreamType::Digital).with_flags(StreamFlags::DO_NOT_INTERPOLATE),
        ];
        let node = FlowGraphNode::new("scope", WaveformSource::from_streams(&layout));
        let streams = node.streams();
        assert_eq!(streams[1].name(), "d0");
        assert!(streams[1].flags().contains(StreamFlags::DO_NOT_INTERPOLATE));
        assert!(!streams[0].has_data());
    }

    #[test]
    fn test_digital_streams_do_not_interpolate() {
        let node = FlowGraphNode::new("la", WaveformSource::digital(&["d0", "d1"]));
        let streams = node.streams();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[1].unit(), Unit::Counts);
        assert!(streams[1].flags().contains(StreamFlags::DO_NOT_INTERPOLATE));

        let scope = FlowGraphNode::new("scope", WaveformSource::analog(&["ch1"]));
        assert_eq!(scope.streams()[0].flags(), StreamFlags::NONE);
    }

    #[test]
    fn test_refresh_keeps_published_waveform() {
        let node = FlowGraphNode::new("scope", WaveformSource::analog(&["ch1"]));
        node.set_stream_waveform(0, Box::new(UniformWaveform::from_samples(10, &[1.0f32, 2.0])));
        node.refresh(&Accelerator::default());
        assert_eq!(node.streams()[0].uniform::<f32>().map(UniformWaveform::len), Some(2));
    }
}
