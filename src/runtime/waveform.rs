//! Waveform sample containers
//!
//! Two physically different layouts flow along graph edges:
//!
//! - [`UniformWaveform`]: fixed sample rate, sample `i` sits at
//!   `i * timescale + trigger_phase` femtoseconds.
//! - [`SparseWaveform`]: explicit `offsets[i]` / `durations[i]` (in timebase
//!   ticks) next to `samples[i]`, for protocol symbols and run-length encoded
//!   logic data.
//!
//! [`EyeWaveform`] carries an accumulated eye-pattern histogram. All sample
//! arrays are [`AcceleratorBuffer`]s, so either layout can be produced or
//! consumed on the host or the accelerator.

use super::buffer::{AcceleratorBuffer, SampleType};
use super::device::Device;
use super::errors::{BufferError, WaveformError};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Femtoseconds per second
pub const FS_PER_SECOND: i64 = 1_000_000_000_000_000;

/// Timing metadata shared by every waveform layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaveformBase {
    /// Femtoseconds per timebase tick
    pub timescale: i64,
    /// Sub-tick offset of the first sample, in femtoseconds
    pub trigger_phase: i64,
    /// Wall-clock acquisition time, whole seconds since the UNIX epoch
    pub start_timestamp: i64,
    /// Fractional part of the acquisition time, in femtoseconds
    pub start_femtoseconds: i64,
    /// At least one sample hit the instrument's ADC limits
    pub clipping: bool,
    revision: u64,
}

impl WaveformBase {
    pub fn new(timescale: i64) -> Self {
        Self {
            timescale,
            ..Self::default()
        }
    }

    /// Incremented on every structural or content change
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn bump_revision(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    /// Copy timebase, trigger phase, start time and flags. The revision is not copied.
    pub fn copy_timebase_from(&mut self, other: &WaveformBase) {
        self.timescale = other.timescale;
        self.trigger_phase = other.trigger_phase;
        self.start_timestamp = other.start_timestamp;
        self.start_femtoseconds = other.start_femtoseconds;
        self.clipping = other.clipping;
    }
}

/// Physical layout of a waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformLayout {
    Uniform,
    Sparse,
    Eye,
}

/// Type-erased waveform held by a stream
pub trait Waveform: Any + Send + Sync {
    fn base(&self) -> &WaveformBase;
    fn base_mut(&mut self) -> &mut WaveformBase;
    fn layout(&self) -> WaveformLayout;

    /// Number of samples (histogram bins for eye patterns)
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    /// Attach `device` to any sample array created host-only
    fn ensure_device(&mut self, device: &Arc<Device>);

    fn prepare_for_cpu_access(&mut self);
    fn prepare_for_gpu_access(&mut self) -> Result<(), BufferError>;
    fn mark_modified_from_cpu(&mut self);
    fn mark_modified_from_gpu(&mut self);
}

impl dyn Waveform {
    pub fn downcast_ref<W: Waveform>(&self) -> Option<&W> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<W: Waveform>(&mut self) -> Option<&mut W> {
        self.as_any_mut().downcast_mut()
    }

    pub fn as_uniform<T: SampleType>(&self) -> Option<&UniformWaveform<T>> {
        self.downcast_ref()
    }

    pub fn as_sparse<T: SampleType>(&self) -> Option<&SparseWaveform<T>> {
        self.downcast_ref()
    }

    pub fn as_uniform_mut<T: SampleType>(&mut self) -> Option<&mut UniformWaveform<T>> {
        self.downcast_mut()
    }

    pub fn as_sparse_mut<T: SampleType>(&mut self) -> Option<&mut SparseWaveform<T>> {
        self.downcast_mut()
    }

    pub fn as_eye(&self) -> Option<&EyeWaveform> {
        self.downcast_ref()
    }
}

impl fmt::Debug for dyn Waveform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Waveform")
            .field("layout", &self.layout())
            .field("len", &self.len())
            .field("timescale", &self.base().timescale)
            .field("revision", &self.base().revision())
            .finish()
    }
}

/// Complex-valued sample (I/Q data, spectra)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ComplexSample {
    pub re: f32,
    pub im: f32,
}

impl ComplexSample {
    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    pub fn magnitude(&self) -> f32 {
        self.re.hypot(self.im)
    }

    /// Phase in radians
    pub fn phase(&self) -> f32 {
        self.im.atan2(self.re)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Uniform layout
// ────────────────────────────────────────────────────────────────────────────

/// Fixed-rate waveform
pub struct UniformWaveform<T> {
    pub base: WaveformBase,
    pub samples: AcceleratorBuffer<T>,
}

impl<T: SampleType> UniformWaveform<T> {
    pub fn new(timescale: i64) -> Self {
        Self {
            base: WaveformBase::new(timescale),
            samples: AcceleratorBuffer::new(),
        }
    }

    /// Empty waveform whose samples can be mirrored onto `device`
    pub fn on_device(device: Arc<Device>, timescale: i64) -> Self {
        Self {
            base: WaveformBase::new(timescale),
            samples: AcceleratorBuffer::on_device(device),
        }
    }

    pub fn from_samples(timescale: i64, samples: &[T]) -> Self {
        Self {
            base: WaveformBase::new(timescale),
            samples: AcceleratorBuffer::from_slice(samples),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn resize(&mut self, len: usize) {
        self.samples.resize(len);
        self.base.bump_revision();
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.base.bump_revision();
    }

    /// Absolute time of sample `index`, in femtoseconds
    pub fn time_of(&self, index: usize) -> i64 {
        index as i64 * self.base.timescale + self.base.trigger_phase
    }

    /// Time covered by the whole record, in femtoseconds
    pub fn duration(&self) -> i64 {
        self.len() as i64 * self.base.timescale
    }

    /// Index of the sample covering time `t` (femtoseconds)
    pub fn index_at_time(&self, t: i64) -> Option<usize> {
        if self.base.timescale <= 0 || t < self.base.trigger_phase {
            return None;
        }
        let index = ((t - self.base.trigger_phase) / self.base.timescale) as usize;
        (index < self.len()).then_some(index)
    }
}

impl<T: SampleType> Waveform for UniformWaveform<T> {
    fn base(&self) -> &WaveformBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WaveformBase {
        &mut self.base
    }

    fn layout(&self) -> WaveformLayout {
        WaveformLayout::Uniform
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn ensure_device(&mut self, device: &Arc<Device>) {
        self.samples.ensure_device(device);
    }

    fn prepare_for_cpu_access(&mut self) {
        self.samples.prepare_for_cpu_access();
    }

    fn prepare_for_gpu_access(&mut self) -> Result<(), BufferError> {
        self.samples.prepare_for_gpu_access()
    }

    fn mark_modified_from_cpu(&mut self) {
        self.samples.mark_modified_from_cpu();
        self.base.bump_revision();
    }

    fn mark_modified_from_gpu(&mut self) {
        self.samples.mark_modified_from_gpu();
        self.base.bump_revision();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sparse layout
// ────────────────────────────────────────────────────────────────────────────

/// Irregularly spaced waveform with explicit per-sample offset and duration
///
/// Offsets and durations are in timebase ticks. Offsets must be
/// non-decreasing; samples are expected, but not required, not to overlap.
pub struct SparseWaveform<T> {
    pub base: WaveformBase,
    pub offsets: AcceleratorBuffer<i64>,
    pub durations: AcceleratorBuffer<i64>,
    pub samples: AcceleratorBuffer<T>,
}

impl<T: SampleType> SparseWaveform<T> {
    pub fn new(timescale: i64) -> Self {
        Self {
            base: WaveformBase::new(timescale),
            offsets: AcceleratorBuffer::new(),
            durations: AcceleratorBuffer::new(),
            samples: AcceleratorBuffer::new(),
        }
    }

    pub fn on_device(device: Arc<Device>, timescale: i64) -> Self {
        Self {
            base: WaveformBase::new(timescale),
            offsets: AcceleratorBuffer::on_device(Arc::clone(&device)),
            durations: AcceleratorBuffer::on_device(Arc::clone(&device)),
            samples: AcceleratorBuffer::on_device(device),
        }
    }

    /// Build from parallel arrays. Fails if the arrays disagree in length or
    /// offsets decrease.
    pub fn from_parts(
        timescale: i64,
        offsets: &[i64],
        durations: &[i64],
        samples: &[T],
    ) -> Result<Self, WaveformError> {
        let waveform = Self {
            base: WaveformBase::new(timescale),
            offsets: AcceleratorBuffer::from_slice(offsets),
            durations: AcceleratorBuffer::from_slice(durations),
            samples: AcceleratorBuffer::from_slice(samples),
        };
        waveform.validate()?;
        Ok(waveform)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn resize(&mut self, len: usize) {
        self.offsets.resize(len);
        self.durations.resize(len);
        self.samples.resize(len);
        self.base.bump_revision();
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.durations.clear();
        self.samples.clear();
        self.base.bump_revision();
    }

    /// Append one sample
    pub fn push(&mut self, offset: i64, duration: i64, value: T) {
        self.offsets.push(offset);
        self.durations.push(duration);
        self.samples.push(value);
        self.base.bump_revision();
    }

    /// Start of sample `index`, in femtoseconds
    pub fn offset_scaled(&self, index: usize) -> i64 {
        self.offsets[index] * self.base.timescale + self.base.trigger_phase
    }

    /// Duration of sample `index`, in femtoseconds
    pub fn duration_scaled(&self, index: usize) -> i64 {
        self.durations[index] * self.base.timescale
    }

    /// End of sample `index`, in femtoseconds
    pub fn end_scaled(&self, index: usize) -> i64 {
        self.offset_scaled(index) + self.duration_scaled(index)
    }

    /// Index of the sample covering time `t` (femtoseconds), or None if `t`
    /// falls before the first sample, after the last, or in a gap
    pub fn index_at_time(&self, t: i64) -> Option<usize> {
        if self.base.timescale <= 0 || t < self.base.trigger_phase {
            return None;
        }
        let ticks = (t - self.base.trigger_phase) / self.base.timescale;
        let offsets = self.offsets.as_slice();
        let after = offsets.partition_point(|&o| o <= ticks);
        let index = after.checked_sub(1)?;
        (ticks < offsets[index] + self.durations[index]).then_some(index)
    }

    /// Reuse another sparse waveform's timing: copies timebase, offsets and
    /// durations, and sizes the sample array to match
    pub fn copy_structure_from<U: SampleType>(&mut self, other: &SparseWaveform<U>) {
        self.base.copy_timebase_from(&other.base);
        self.offsets.copy_from(&other.offsets);
        self.durations.copy_from(&other.durations);
        self.samples.resize(other.len());
        self.base.bump_revision();
    }

    /// Check array lengths and offset ordering
    pub fn validate(&self) -> Result<(), WaveformError> {
        let (offsets, durations, samples) =
            (self.offsets.len(), self.durations.len(), self.samples.len());
        if offsets != samples || durations != samples {
            return Err(WaveformError::LengthMismatch {
                offsets,
                durations,
                samples,
            });
        }
        for (index, pair) in self.offsets.as_slice().windows(2).enumerate() {
            if pair[1] < pair[0] {
                return Err(WaveformError::DecreasingOffset {
                    index: index + 1,
                    offset: pair[1],
                    previous: pair[0],
                });
            }
        }
        Ok(())
    }

    /// True if any sample extends past the start of the next one
    pub fn is_overlapping(&self) -> bool {
        let offsets = self.offsets.as_slice();
        let durations = self.durations.as_slice();
        offsets
            .windows(2)
            .zip(durations)
            .any(|(pair, &duration)| pair[0] + duration > pair[1])
    }

    /// Iterate `(offset, duration, sample)` triples
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, T)> + '_ {
        self.offsets
            .iter()
            .zip(self.durations.iter())
            .zip(self.samples.iter())
            .map(|((&o, &d), &s)| (o, d, s))
    }
}

impl<T: SampleType> Waveform for SparseWaveform<T> {
    fn base(&self) -> &WaveformBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WaveformBase {
        &mut self.base
    }

    fn layout(&self) -> WaveformLayout {
        WaveformLayout::Sparse
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn ensure_device(&mut self, device: &Arc<Device>) {
        self.offsets.ensure_device(device);
        self.durations.ensure_device(device);
        self.samples.ensure_device(device);
    }

    fn prepare_for_cpu_access(&mut self) {
        self.offsets.prepare_for_cpu_access();
        self.durations.prepare_for_cpu_access();
        self.samples.prepare_for_cpu_access();
    }

    fn prepare_for_gpu_access(&mut self) -> Result<(), BufferError> {
        self.offsets.prepare_for_gpu_access()?;
        self.durations.prepare_for_gpu_access()?;
        self.samples.prepare_for_gpu_access()
    }

    fn mark_modified_from_cpu(&mut self) {
        self.offsets.mark_modified_from_cpu();
        self.durations.mark_modified_from_cpu();
        self.samples.mark_modified_from_cpu();
        self.base.bump_revision();
    }

    fn mark_modified_from_gpu(&mut self) {
        self.offsets.mark_modified_from_gpu();
        self.durations.mark_modified_from_gpu();
        self.samples.mark_modified_from_gpu();
        self.base.bump_revision();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Eye pattern
// ────────────────────────────────────────────────────────────────────────────

/// Accumulated eye-pattern histogram, `width` time bins by `height` voltage bins
pub struct EyeWaveform {
    pub base: WaveformBase,
    pub accumulations: AcceleratorBuffer<i64>,
    width: usize,
    height: usize,
    /// Voltage at the vertical centre of the histogram
    pub center_voltage: f32,
    /// Unit interval width, in femtoseconds
    pub ui_width: i64,
    total_uis: u64,
}

impl EyeWaveform {
    pub fn new(width: usize, height: usize, center_voltage: f32, ui_width: i64) -> Self {
        let mut accumulations = AcceleratorBuffer::new();
        accumulations.resize(width * height);
        Self {
            base: WaveformBase::new(ui_width / width.max(1) as i64),
            accumulations,
            width,
            height,
            center_voltage,
            ui_width,
            total_uis: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Unit intervals integrated so far
    pub fn total_uis(&self) -> u64 {
        self.total_uis
    }

    pub fn add_uis(&mut self, count: u64) {
        self.total_uis += count;
    }

    pub fn bin(&self, x: usize, y: usize) -> Option<i64> {
        (x < self.width && y < self.height).then(|| self.accumulations[y * self.width + x])
    }

    /// Count one hit in bin (x, y). Returns false if out of range.
    pub fn accumulate(&mut self, x: usize, y: usize) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.accumulations[y * self.width + x] += 1;
        true
    }

    pub fn max_count(&self) -> i64 {
        self.accumulations.iter().copied().max().unwrap_or(0)
    }
}

impl Waveform for EyeWaveform {
    fn base(&self) -> &WaveformBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WaveformBase {
        &mut self.base
    }

    fn layout(&self) -> WaveformLayout {
        WaveformLayout::Eye
    }

    fn len(&self) -> usize {
        self.accumulations.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn ensure_device(&mut self, device: &Arc<Device>) {
        self.accumulations.ensure_device(device);
    }

    fn prepare_for_cpu_access(&mut self) {
        self.accumulations.prepare_for_cpu_access();
    }

    fn prepare_for_gpu_access(&mut self) -> Result<(), BufferError> {
        self.accumulations.prepare_for_gpu_access()
    }

    fn mark_modified_from_cpu(&mut self) {
        self.accumulations.mark_modified_from_cpu();
        self.base.bump_revision();
    }

    fn mark_modified_from_gpu(&mut self) {
        self.accumulations.mark_modified_from_gpu();
        self.base.bump_revision();
    }
}
