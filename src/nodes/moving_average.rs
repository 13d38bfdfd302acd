//! Boxcar moving average computed on the accelerator
//!
//! The average is built from a running sum: one dispatch writes the
//! prefix sum of the input into a scratch buffer, a second turns adjacent
//! prefix differences into window means. Both run as separate submissions,
//! so the prefix buffer is complete before the second pass reads it.
//!
//! If the input could not be staged on the device, or the device cannot hold
//! the scratch or output buffers, the same arithmetic runs on the host.

use super::uniform_output;
use crate::runtime::buffer::AcceleratorBuffer;
use crate::runtime::device::CommandBuffer;
use crate::runtime::node::{DataLocation, Filter, RefreshContext};
use crate::runtime::scratch::ScratchPurpose;
use crate::runtime::stream::{Stream, StreamDescriptor, StreamType};
use crate::runtime::units::Unit;
use crate::runtime::waveform::{UniformWaveform, Waveform};
use tracing::{debug, trace};

pub struct MovingAverageFilter {
    window: usize,
}

impl MovingAverageFilter {
    pub const DEFAULT_WINDOW: usize = 8;

    /// Average over `window` samples; a zero window is treated as one
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn set_window(&mut self, window: usize) {
        self.window = window.max(1);
    }

    /// Run both passes on the device. Returns false if a buffer could not be
    /// placed there, leaving `out` untouched apart from its size.
    fn refresh_on_device(
        &self,
        ctx: &RefreshContext<'_>,
        input: &[f32],
        out: &mut UniformWaveform<f32>,
    ) -> bool {
        let window = self.window;
        let mut prefix = ctx.scratch().scoped::<f64>(ScratchPurpose::PrefixSum);
        prefix.ensure_device(ctx.device());
        prefix.resize(input.len() + 1);
        if let Err(e) = prefix.prepare_for_gpu_access() {
            debug!("[{}] Prefix buffer not placed on device: {}", ctx.node_name(), e);
            return false;
        }
        out.samples.ensure_device(ctx.device());
        if let Err(e) = out.samples.prepare_for_gpu_access() {
            debug!("[{}] Output not placed on device: {}", ctx.node_name(), e);
            return false;
        }

        {
            let Some(prefix_dev) = prefix.device_slice_mut() else {
                return false;
            };
            let mut commands = CommandBuffer::new();
            commands.dispatch("prefix_sum", move || prefix_sum(input, prefix_dev));
            ctx.queue().submit_and_block(commands);
        }
        prefix.mark_modified_from_gpu();

        let (Some(prefix_dev), Some(out_dev)) = (prefix.device_slice(), out.samples.device_slice_mut()) else {
            return false;
        };
        let mut commands = CommandBuffer::new();
        commands.dispatch("window_mean", move || window_mean(prefix_dev, window, out_dev));
        ctx.queue().submit_and_block(commands);

        out.mark_modified_from_gpu();
        true
    }

    fn refresh_on_host(&self, input: &[f32], out: &mut UniformWaveform<f32>) {
        let mut prefix = vec![0.0f64; input.len() + 1];
        prefix_sum(input, &mut prefix);
        window_mean(&prefix, self.window, out.samples.as_mut_slice());
        out.mark_modified_from_cpu();
    }
}

fn prefix_sum(input: &[f32], prefix: &mut [f64]) {
    let mut sum = 0.0f64;
    prefix[0] = 0.0;
    for (dst, &value) in prefix[1..].iter_mut().zip(input) {
        sum += f64::from(value);
        *dst = sum;
    }
}

fn window_mean(prefix: &[f64], window: usize, out: &mut [f32]) {
    let scale = 1.0 / window as f64;
    for (i, dst) in out.iter_mut().enumerate() {
        *dst = ((prefix[i + window] - prefix[i]) * scale) as f32;
    }
}

/// Newest copy of a buffer's samples without mutating it
fn current_samples(buffer: &AcceleratorBuffer<f32>) -> &[f32] {
    if buffer.is_cpu_current() {
        buffer.as_slice()
    } else {
        buffer.device_slice().unwrap_or(buffer.as_slice())
    }
}

impl Filter for MovingAverageFilter {
    fn protocol_name(&self) -> &str {
        "Moving Average"
    }

    fn input_names(&self) -> Vec<String> {
        vec!["din".to_string()]
    }

    fn create_streams(&self) -> Vec<Stream> {
        vec![Stream::new("avg", Unit::Volts, StreamType::Analog)]
    }

    fn validate_channel(&self, index: usize, stream: &StreamDescriptor) -> bool {
        index == 0 && stream.stream_type() == Some(StreamType::Analog)
    }

    fn input_location(&self) -> DataLocation {
        DataLocation::Gpu
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) {
        if !ctx.verify_all_inputs_ok(false) {
            return;
        }
        let Some(src) = ctx.input(0).and_then(Stream::uniform::<f32>) else {
            ctx.clear_outputs();
            ctx.set_error("Input 'din' is not a uniform f32 waveform");
            return;
        };

        let len = src.len();
        if len < self.window {
            ctx.clear_outputs();
            ctx.set_error(format!(
                "Input 'din' has {} samples, fewer than the window of {}",
                len, self.window
            ));
            return;
        }

        let mut out = uniform_output::<f32>(ctx, 0);
        out.base.copy_timebase_from(&src.base);
        out.base.trigger_phase += (self.window as i64 - 1) * src.base.timescale / 2;
        out.resize(len - self.window + 1);

        let on_device = match src.samples.device_slice() {
            Some(input) if src.samples.is_gpu_current() => self.refresh_on_device(ctx, input, &mut out),
            _ => false,
        };
        if on_device {
            trace!("[{}] Averaged {} samples on device", ctx.node_name(), len);
        } else {
            debug!("[{}] Averaging {} samples on host", ctx.node_name(), len);
            self.refresh_on_host(current_samples(&src.samples), &mut out);
        }
        ctx.set_output(0, out);
    }
}
