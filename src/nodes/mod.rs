//! Built-in filters
//!
//! A small set of nodes that exercise the engine end to end:
//! - **WaveformSource**: graph root fed by an instrument
//! - **ThresholdFilter**: analog to digital with hysteresis
//! - **InvertFilter**: digital inversion, uniform or sparse
//! - **SubtractFilter**: difference of two analog streams
//! - **MovingAverageFilter**: device-side boxcar average using scratch buffers
//!
//! Every filter preserves the layout of its driving input and copies its
//! timebase, so a sparse protocol stream stays sparse downstream.

mod invert;
mod moving_average;
mod source;
mod subtract;
mod threshold;

pub use invert::InvertFilter;
pub use moving_average::MovingAverageFilter;
pub use source::WaveformSource;
pub use subtract::SubtractFilter;
pub use threshold::ThresholdFilter;

use crate::runtime::buffer::SampleType;
use crate::runtime::node::RefreshContext;
use crate::runtime::registry::FilterRegistry;
use crate::runtime::waveform::{SparseWaveform, UniformWaveform};

/// Register every built-in filter with default settings
pub fn register_builtin_filters(registry: &mut FilterRegistry) {
    registry.register(WaveformSource::new);
    registry.register(|| ThresholdFilter::new(0.0, 0.0));
    registry.register(|| InvertFilter);
    registry.register(|| SubtractFilter);
    registry.register(|| MovingAverageFilter::new(MovingAverageFilter::DEFAULT_WINDOW));
}

/// Output `index` as a uniform waveform, reusing the previous one if it fits
fn uniform_output<T: SampleType>(
    ctx: &mut RefreshContext<'_>,
    index: usize,
) -> Box<UniformWaveform<T>> {
    ctx.take_output::<UniformWaveform<T>>(index)
        .unwrap_or_else(|| Box::new(UniformWaveform::new(0)))
}

/// Output `index` as a sparse waveform, reusing the previous one if it fits
fn sparse_output<T: SampleType>(
    ctx: &mut RefreshContext<'_>,
    index: usize,
) -> Box<SparseWaveform<T>> {
    ctx.take_output::<SparseWaveform<T>>(index)
        .unwrap_or_else(|| Box::new(SparseWaveform::new(0)))
}
