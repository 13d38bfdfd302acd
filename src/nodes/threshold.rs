//! Analog to digital conversion with optional hysteresis

use super::{sparse_output, uniform_output};
use crate::runtime::node::{Filter, RefreshContext};
use crate::runtime::stream::{Stream, StreamDescriptor, StreamFlags, StreamType};
use crate::runtime::units::Unit;
use crate::runtime::waveform::Waveform;

/// Compares an analog stream against a level.
///
/// With zero hysteresis a sample is high when it is strictly above the
/// threshold. Otherwise the output only goes high above
/// `threshold + hysteresis / 2` and only goes low below
/// `threshold - hysteresis / 2`; the first sample is compared against the
/// plain threshold.
pub struct ThresholdFilter {
    threshold: f32,
    hysteresis: f32,
}

impl ThresholdFilter {
    pub fn new(threshold: f32, hysteresis: f32) -> Self {
        Self {
            threshold,
            hysteresis: hysteresis.abs(),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn hysteresis(&self) -> f32 {
        self.hysteresis
    }

    pub fn set_hysteresis(&mut self, hysteresis: f32) {
        self.hysteresis = hysteresis.abs();
    }

    fn convert(&self, input: &[f32], output: &mut [bool]) {
        if self.hysteresis == 0.0 {
            for (dst, &value) in output.iter_mut().zip(input) {
                *dst = value > self.threshold;
            }
            return;
        }

        let high = self.threshold + self.hysteresis / 2.0;
        let low = self.threshold - self.hysteresis / 2.0;
        let mut state = input.first().is_some_and(|&v| v > self.threshold);
        for (dst, &value) in output.iter_mut().zip(input) {
            if state && value < low {
                state = false;
            } else if !state && value > high {
                state = true;
            }
            *dst = state;
        }
    }
}

impl Filter for ThresholdFilter {
    fn protocol_name(&self) -> &str {
        "Threshold"
    }

    fn input_names(&self) -> Vec<String> {
        vec!["din".to_string()]
    }

    fn create_streams(&self) -> Vec<Stream> {
        vec![Stream::new("data", Unit::Counts, StreamType::Digital).with_flags(StreamFlags::DO_NOT_INTERPOLATE)]
    }

    fn validate_channel(&self, index: usize, stream: &StreamDescriptor) -> bool {
        index == 0 && stream.stream_type() == Some(StreamType::Analog)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) {
        if !ctx.verify_all_inputs_ok(false) {
            return;
        }
        let Some(input) = ctx.input(0) else {
            ctx.clear_outputs();
            return;
        };

        if let Some(src) = input.uniform::<f32>() {
            let mut out = uniform_output::<bool>(ctx, 0);
            out.base.copy_timebase_from(&src.base);
            out.resize(src.len());
            self.convert(src.samples.as_slice(), out.samples.as_mut_slice());
            out.mark_modified_from_cpu();
            ctx.set_output(0, out);
        } else if let Some(src) = input.sparse::<f32>() {
            let mut out = sparse_output::<bool>(ctx, 0);
            out.copy_structure_from(src);
            self.convert(src.samples.as_slice(), out.samples.as_mut_slice());
            out.mark_modified_from_cpu();
            ctx.set_output(0, out);
        } else {
            ctx.clear_outputs();
            ctx.set_error("Input 'din' is not f32 sample data");
        }
    }
}
