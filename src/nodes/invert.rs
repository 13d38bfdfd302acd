//! Digital inversion

use super::{sparse_output, uniform_output};
use crate::runtime::node::{Filter, RefreshContext};
use crate::runtime::stream::{Stream, StreamDescriptor, StreamFlags, StreamType};
use crate::runtime::units::Unit;
use crate::runtime::waveform::Waveform;

/// Logical NOT of a digital stream, keeping its layout and timing
pub struct InvertFilter;

impl Filter for InvertFilter {
    fn protocol_name(&self) -> &str {
        "Invert"
    }

    fn input_names(&self) -> Vec<String> {
        vec!["din".to_string()]
    }

    fn create_streams(&self) -> Vec<Stream> {
        vec![Stream::new("data", Unit::Counts, StreamType::Digital).with_flags(StreamFlags::DO_NOT_INTERPOLATE)]
    }

    fn validate_channel(&self, index: usize, stream: &StreamDescriptor) -> bool {
        index == 0 && stream.stream_type() == Some(StreamType::Digital)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) {
        if !ctx.verify_all_inputs_ok(false) {
            return;
        }
        let Some(input) = ctx.input(0) else {
            ctx.clear_outputs();
            return;
        };

        if let Some(src) = input.uniform::<bool>() {
            let mut out = uniform_output::<bool>(ctx, 0);
            out.base.copy_timebase_from(&src.base);
            out.resize(src.len());
            for (dst, &value) in out.samples.as_mut_slice().iter_mut().zip(src.samples.iter()) {
                *dst = !value;
            }
            out.mark_modified_from_cpu();
            ctx.set_output(0, out);
        } else if let Some(src) = input.sparse::<bool>() {
            let mut out = sparse_output::<bool>(ctx, 0);
            out.copy_structure_from(src);
            for (dst, &value) in out.samples.as_mut_slice().iter_mut().zip(src.samples.iter()) {
                *dst = !value;
            }
            out.mark_modified_from_cpu();
            ctx.set_output(0, out);
        } else {
            ctx.clear_outputs();
            ctx.set_error("Input 'din' is not boolean sample data");
        }
    }
}
