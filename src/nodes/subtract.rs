//! Difference of two analog streams

use super::{sparse_output, uniform_output};
use crate::runtime::node::{Filter, RefreshContext};
use crate::runtime::stream::{Stream, StreamDescriptor, StreamType};
use crate::runtime::units::Unit;
use crate::runtime::waveform::Waveform;

/// `a - b`, sample by sample.
///
/// Uniform inputs are truncated to the shorter one and take `a`'s timebase.
/// Sparse inputs must have the same sample count; the output reuses `a`'s
/// offsets and durations.
pub struct SubtractFilter;

fn subtract_into(a: &[f32], b: &[f32], out: &mut [f32]) {
    for ((dst, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *dst = x - y;
    }
}

impl Filter for SubtractFilter {
    fn protocol_name(&self) -> &str {
        "Subtract"
    }

    fn input_names(&self) -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn create_streams(&self) -> Vec<Stream> {
        vec![Stream::new("diff", Unit::Volts, StreamType::Analog)]
    }

    fn validate_channel(&self, index: usize, stream: &StreamDescriptor) -> bool {
        index < 2 && stream.stream_type() == Some(StreamType::Analog)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) {
        if !ctx.verify_all_inputs_ok(false) {
            return;
        }
        let (Some(a), Some(b)) = (ctx.input(0), ctx.input(1)) else {
            ctx.clear_outputs();
            return;
        };

        match (a.uniform::<f32>(), b.uniform::<f32>(), a.sparse::<f32>(), b.sparse::<f32>()) {
            (Some(ua), Some(ub), _, _) => {
                let len = ua.len().min(ub.len());
                let mut out = uniform_output::<f32>(ctx, 0);
                out.base.copy_timebase_from(&ua.base);
                out.resize(len);
                subtract_into(ua.samples.as_slice(), ub.samples.as_slice(), out.samples.as_mut_slice());
                out.mark_modified_from_cpu();
                ctx.set_output(0, out);
            }
            (_, _, Some(sa), Some(sb)) => {
                if sa.len() != sb.len() {
                    ctx.clear_outputs();
                    ctx.set_error(format!(
                        "Sparse inputs differ in length ({} vs {})",
                        sa.len(),
                        sb.len()
                    ));
                    return;
                }
                let mut out = sparse_output::<f32>(ctx, 0);
                out.copy_structure_from(sa);
                subtract_into(sa.samples.as_slice(), sb.samples.as_slice(), out.samples.as_mut_slice());
                out.mark_modified_from_cpu();
                ctx.set_output(0, out);
            }
            _ => {
                ctx.clear_outputs();
                ctx.set_error("Inputs must both be uniform or both be sparse f32 waveforms");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::WaveformSource;
    use crate::runtime::device::Accelerator;
    use crate::runtime::node::{FlowGraphNode, NodeHandle};
    use crate::runtime::waveform::{SparseWaveform, UniformWaveform};

    fn wired() -> (NodeHandle, NodeHandle) {
        let scope = FlowGraphNode::new("scope", WaveformSource::analog(&["ch1", "ch2"]));
        let sub = FlowGraphNode::new("sub", SubtractFilter);
        sub.set_input(0, scope.stream(0)).unwrap();
        sub.set_input(1, scope.stream(1)).unwrap();
        (scope, sub)
    }

    #[test]
    fn test_uniform_truncates_to_shorter_input() {
        let (scope, sub) = wired();
        let mut a = UniformWaveform::from_samples(100, &[5.0f32, 4.0, 3.0, 2.0]);
        a.base.trigger_phase = 9;
        scope.set_stream_waveform(0, Box::new(a));
        scope.set_stream_waveform(1, Box::new(UniformWaveform::from_samples(50, &[1.0f32, 1.0, 1.0])));

        sub.refresh(&Accelerator::default());

        let streams = sub.streams();
        let out = streams[0].uniform::<f32>().unwrap();
        assert_eq!(out.samples.as_slice(), &[4.0, 3.0, 2.0]);
        assert_eq!(out.base.timescale, 100);
        assert_eq!(out.base.trigger_phase, 9);
    }

    #[test]
    fn test_sparse_uses_first_input_timing() {
        let (scope, sub) = wired();
        let a = SparseWaveform::from_parts(10, &[0, 3], &[3, 7], &[1.0f32, 2.0]).unwrap();
        let b = SparseWaveform::from_parts(10, &[0, 5], &[5, 5], &[0.5f32, 0.5]).unwrap();
        scope.set_stream_waveform(0, Box::new(a));
        scope.set_stream_waveform(1, Box::new(b));

        sub.refresh(&Accelerator::default());

        let streams = sub.streams();
        let out = streams[0].sparse::<f32>().unwrap();
        assert_eq!(out.samples.as_slice(), &[0.5, 1.5]);
        assert_eq!(out.offsets.as_slice(), &[0, 3]);
    }

    #[test]
    fn test_sparse_length_mismatch_is_an_error() {
        let (scope, sub) = wired();
        let a = SparseWaveform::from_parts(10, &[0, 3], &[3, 7], &[1.0f32, 2.0]).unwrap();
        let b = SparseWaveform::from_parts(10, &[0], &[5], &[0.5f32]).unwrap();
        scope.set_stream_waveform(0, Box::new(a));
        scope.set_stream_waveform(1, Box::new(b));

        sub.refresh(&Accelerator::default());
        assert!(!sub.streams()[0].has_data());
        assert!(sub.last_error().unwrap().contains("differ in length"));
    }

    #[test]
    fn test_mixed_layouts_rejected() {
        let (scope, sub) = wired();
        scope.set_stream_waveform(0, Box::new(UniformWaveform::from_samples(10, &[1.0f32])));
        let b = SparseWaveform::from_parts(10, &[0], &[1], &[1.0f32]).unwrap();
        scope.set_stream_waveform(1, Box::new(b));

        sub.refresh(&Accelerator::default());
        assert!(!sub.streams()[0].has_data());
        assert!(sub.last_error().is_some());
    }

    #[test]
    fn test_missing_input_clears_output() {
        let (scope, sub) = wired();
        scope.set_stream_waveform(0, Box::new(UniformWaveform::from_samples(10, &[1.0f32])));
        scope.set_stream_waveform(1, Box::new(UniformWaveform::from_samples(10, &[1.0f32])));
        let accelerator = Accelerator::default();
        sub.refresh(&accelerator);
        assert!(sub.streams()[0].has_data());

        sub.disconnect_input(1);
        sub.refresh(&accelerator);
        assert!(!sub.streams()[0].has_data());
        assert_eq!(sub.last_error().as_deref(), Some("Input 'b' is not connected"));
    }
}
